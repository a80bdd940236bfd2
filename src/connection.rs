//! External collaborators the core consumes but does not define the wire
//! format for (§6): a framed connection and the [`Upgrader`] that produces
//! one from an HTTP upgrade request.
//!
//! The distilled spec describes `Connection` as one `Read`/`Write`/`Close`
//! interface. Invariant I1 (§3) requires exactly one reader task and one
//! writer task running *concurrently* against it; a single `&mut self`
//! interface shared behind one lock would let a blocking `read` (which can
//! wait indefinitely on an idle connection) starve the writer's ping cadence.
//! So a [`Connection`] here is handed to [`Client::connect`](crate::client::Client::connect)
//! and immediately [`split`](Connection::split) into an owned read half and
//! an owned write half, mirroring how `tokio-tungstenite`'s `WebSocketStream`
//! itself splits into an independent `SplitStream`/`SplitSink` pair.

use async_trait::async_trait;

use crate::error::ConnectionClosed;
use crate::message::Message;

/// The read half of a connection, owned exclusively by the reader task.
#[async_trait]
pub trait ConnectionRead: Send {
    async fn read(&mut self) -> Result<Message, ConnectionClosed>;
}

/// The write half of a connection, owned exclusively by the writer task.
#[async_trait]
pub trait ConnectionWrite: Send {
    async fn write(&mut self, message: Message) -> Result<(), ConnectionClosed>;
    async fn close(&mut self) -> Result<(), ConnectionClosed>;
}

/// A framed, bidirectional WebSocket connection, splittable into independent
/// read/write halves.
pub trait Connection: Send {
    fn split(self: Box<Self>) -> (Box<dyn ConnectionRead>, Box<dyn ConnectionWrite>);
}

/// Turns an HTTP upgrade request into a [`Connection`]. Responsible for the
/// WebSocket handshake, deadline configuration, message-size limiting, and
/// Pong-handler wiring (a Pong resets the read deadline).
#[async_trait]
pub trait Upgrader: Send {
    async fn upgrade(&mut self) -> anyhow::Result<Box<dyn Connection>>;
}

pub mod axum_upgrade {
    //! The one shipped [`Upgrader`](super::Upgrader), backed by `axum` +
    //! `tokio-tungstenite` + `hyper-util`, grounded on
    //! `spacetimedb-client-api::util::websocket` (`WebSocketUpgrade`,
    //! `PendingWebSocket`, `WebSocketResponse`) and
    //! `spacetimedb-client-api::routes::subscribe::handle_websocket`.

    use std::time::Duration;

    use async_trait::async_trait;
    use axum::extract::FromRequestParts;
    use axum::response::{IntoResponse, Response};
    use axum_extra::TypedHeader;
    use futures::stream::{SplitSink, SplitStream};
    use futures::{SinkExt, StreamExt};
    use headers::{
        Connection as ConnectionHeader, HeaderMapExt, SecWebsocketAccept, SecWebsocketKey, SecWebsocketVersion, Upgrade,
    };
    use http::{Method, StatusCode};
    use hyper::upgrade::{OnUpgrade, Upgraded};
    use hyper_util::rt::TokioIo;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::protocol::{Message as WsMessage, WebSocketConfig};
    use tokio_tungstenite::WebSocketStream;

    use super::{Connection, ConnectionRead, ConnectionWrite, Upgrader};
    use crate::error::ConnectionClosed;
    use crate::message::{Message, MessageKind};

    type InnerStream = WebSocketStream<TokioIo<Upgraded>>;

    /// Extracted from the request parts of a GET request carrying the
    /// WebSocket upgrade headers. Construction fails (via
    /// [`WebSocketUpgradeRejection`]) for anything that isn't a valid upgrade
    /// request, mirroring the teacher's `FromRequestParts` impl.
    pub struct WebSocketUpgrade {
        key: SecWebsocketKey,
        upgrade: OnUpgrade,
    }

    pub enum WebSocketUpgradeRejection {
        MethodNotGet,
        BadUpgrade,
        BadVersion,
        KeyMissing,
    }

    impl IntoResponse for WebSocketUpgradeRejection {
        fn into_response(self) -> Response {
            match self {
                Self::MethodNotGet => {
                    (StatusCode::METHOD_NOT_ALLOWED, "request method must be GET").into_response()
                }
                Self::BadUpgrade => (
                    StatusCode::UPGRADE_REQUIRED,
                    TypedHeader(ConnectionHeader::upgrade()),
                    TypedHeader(Upgrade::websocket()),
                    "this endpoint requires the websocket protocol",
                )
                    .into_response(),
                Self::BadVersion => (StatusCode::BAD_REQUEST, "Sec-WebSocket-Version must be 13").into_response(),
                Self::KeyMissing => {
                    (StatusCode::BAD_REQUEST, "Sec-WebSocket-Key header missing").into_response()
                }
            }
        }
    }

    #[async_trait]
    impl<S: Send + Sync> FromRequestParts<S> for WebSocketUpgrade {
        type Rejection = WebSocketUpgradeRejection;

        async fn from_request_parts(parts: &mut http::request::Parts, _state: &S) -> Result<Self, Self::Rejection> {
            use WebSocketUpgradeRejection::*;

            if parts.method != Method::GET {
                return Err(MethodNotGet);
            }

            let upgrade = parts
                .extensions
                .remove::<OnUpgrade>()
                .filter(|_| {
                    parts
                        .headers
                        .typed_get::<ConnectionHeader>()
                        .is_some_and(|conn| conn.contains("upgrade"))
                        && parts.headers.typed_get::<Upgrade>() == Some(Upgrade::websocket())
                })
                .ok_or(BadUpgrade)?;

            if parts.headers.typed_get::<SecWebsocketVersion>() != Some(SecWebsocketVersion::V13) {
                return Err(BadVersion);
            }

            let key = parts.headers.typed_get::<SecWebsocketKey>().ok_or(KeyMissing)?;

            Ok(Self { key, upgrade })
        }
    }

    /// An HTTP 101 response that must be returned to the client for
    /// [`PendingWebSocket::upgrade`] to succeed.
    pub struct WebSocketResponse {
        accept: SecWebsocketAccept,
    }

    impl IntoResponse for WebSocketResponse {
        fn into_response(self) -> Response {
            (
                StatusCode::SWITCHING_PROTOCOLS,
                TypedHeader(ConnectionHeader::upgrade()),
                TypedHeader(Upgrade::websocket()),
                TypedHeader(self.accept),
                (),
            )
                .into_response()
        }
    }

    pub struct PendingWebSocket(OnUpgrade);

    impl PendingWebSocket {
        pub async fn upgrade(self, config: WebSocketConfig) -> hyper::Result<InnerStream> {
            let stream = TokioIo::new(self.0.await?);
            Ok(WebSocketStream::from_raw_socket(
                stream,
                tokio_tungstenite::tungstenite::protocol::Role::Server,
                Some(config),
            )
            .await)
        }
    }

    impl WebSocketUpgrade {
        /// Prepares the switching-protocols response; the accompanying
        /// [`PendingWebSocket`] becomes a live stream once the response above
        /// has actually been written back to the client.
        pub fn into_response(self) -> (WebSocketResponse, PendingWebSocket) {
            let accept = SecWebsocketAccept::from(self.key);
            (WebSocketResponse { accept }, PendingWebSocket(self.upgrade))
        }
    }

    pub struct TungsteniteRead {
        inner: SplitStream<InnerStream>,
        read_timeout: Duration,
    }

    #[async_trait]
    impl ConnectionRead for TungsteniteRead {
        async fn read(&mut self) -> Result<Message, ConnectionClosed> {
            let frame = timeout(self.read_timeout, self.inner.next())
                .await
                .map_err(|_| ConnectionClosed::new(anyhow::anyhow!("read deadline exceeded")))?;

            match frame {
                Some(Ok(WsMessage::Text(text))) => Ok(Message::text(text.into_bytes())),
                Some(Ok(WsMessage::Binary(bytes))) => Ok(Message::binary(bytes)),
                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => Ok(Message::ping()),
                Some(Ok(WsMessage::Close(frame))) => {
                    Err(ConnectionClosed::new(anyhow::anyhow!("peer closed: {:?}", frame)))
                }
                Some(Ok(WsMessage::Frame(_))) => Err(ConnectionClosed::new(anyhow::anyhow!("unexpected raw frame"))),
                Some(Err(err)) => Err(ConnectionClosed::new(err)),
                None => Err(ConnectionClosed::new(anyhow::anyhow!("stream ended"))),
            }
        }
    }

    pub struct TungsteniteWrite {
        inner: SplitSink<InnerStream, WsMessage>,
        write_timeout: Duration,
    }

    #[async_trait]
    impl ConnectionWrite for TungsteniteWrite {
        async fn write(&mut self, message: Message) -> Result<(), ConnectionClosed> {
            let ws_message = match message.kind() {
                MessageKind::Text => WsMessage::Text(String::from_utf8_lossy(message.payload()).into_owned()),
                MessageKind::Binary => WsMessage::Binary(message.payload().to_vec()),
                MessageKind::Ping => WsMessage::Ping(Vec::new()),
            };

            timeout(self.write_timeout, self.inner.send(ws_message))
                .await
                .map_err(|_| ConnectionClosed::new(anyhow::anyhow!("write deadline exceeded")))?
                .map_err(ConnectionClosed::new)
        }

        async fn close(&mut self) -> Result<(), ConnectionClosed> {
            self.inner.close().await.map_err(ConnectionClosed::new)
        }
    }

    pub struct TungsteniteConnection {
        inner: InnerStream,
        read_timeout: Duration,
        write_timeout: Duration,
    }

    impl TungsteniteConnection {
        pub fn new(inner: InnerStream, read_timeout: Duration, write_timeout: Duration) -> Self {
            Self {
                inner,
                read_timeout,
                write_timeout,
            }
        }
    }

    impl Connection for TungsteniteConnection {
        fn split(self: Box<Self>) -> (Box<dyn ConnectionRead>, Box<dyn ConnectionWrite>) {
            let (sink, stream) = self.inner.split();
            (
                Box::new(TungsteniteRead {
                    inner: stream,
                    read_timeout: self.read_timeout,
                }),
                Box::new(TungsteniteWrite {
                    inner: sink,
                    write_timeout: self.write_timeout,
                }),
            )
        }
    }

    /// The shipped [`Upgrader`] for a single already-negotiated
    /// [`WebSocketUpgrade`]. One instance is created per incoming HTTP
    /// request by the `axum` route handler (see `crate::hub::Hub::serve_http`)
    /// and used exactly once: `upgrade` takes the pending handshake out of
    /// `self`, mirroring the teacher's single-use `OnUpgrade` future.
    pub struct AxumUpgrader {
        pending: Option<PendingWebSocket>,
        config: WebSocketConfig,
        read_timeout: Duration,
        write_timeout: Duration,
    }

    impl AxumUpgrader {
        pub fn new(
            pending: PendingWebSocket,
            config: WebSocketConfig,
            read_timeout: Duration,
            write_timeout: Duration,
        ) -> Self {
            Self {
                pending: Some(pending),
                config,
                read_timeout,
                write_timeout,
            }
        }
    }

    #[async_trait]
    impl Upgrader for AxumUpgrader {
        async fn upgrade(&mut self) -> anyhow::Result<Box<dyn Connection>> {
            let pending = self
                .pending
                .take()
                .ok_or_else(|| anyhow::anyhow!("AxumUpgrader::upgrade called more than once"))?;
            let stream = pending.upgrade(self.config).await?;
            Ok(Box::new(TungsteniteConnection::new(
                stream,
                self.read_timeout,
                self.write_timeout,
            )))
        }
    }
}
