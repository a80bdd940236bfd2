//! The top-level façade: composes a [`ClientStore`], mints [`Client`]s on
//! every HTTP upgrade, and exposes the publish/subscribe surface applications
//! call into.
//!
//! Grounded on `spacetimedb-core`'s `client_connection_index.rs` (the
//! connect/disconnect bookkeeping and `CONNECTED_CLIENTS`/`ws_clients_aborted`
//! gauge pattern) and `spacetimedb-client-api`'s `routes::subscribe` module
//! (the axum route handler shape, `ServeHTTP`-equivalent).

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig as TlsServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use crate::channel::ChannelName;
use crate::client::{Client, ErrorHandler, ReceiveHandler};
use crate::config::HubConfig;
use crate::connection::axum_upgrade::{AxumUpgrader, WebSocketUpgrade};
use crate::error::{ClientError, HubError};
use crate::identity::{ClientId, ClientIdGenerator, UuidV4Generator};
use crate::message::Message;
use crate::metrics::{ClientMetrics, HubMetrics};
use crate::store::ClientStore;

/// Invoked once a client has been registered and `Connect` has succeeded.
pub type ConnectHandler = Arc<dyn Fn(ClientId) + Send + Sync>;
/// Invoked once a client has been removed from the store and its connection
/// closed.
pub type DisconnectHandler = Arc<dyn Fn(ClientId) + Send + Sync>;

struct Callbacks {
    on_connect: ArcSwapOption<dyn Fn(ClientId) + Send + Sync>,
    on_disconnect: ArcSwapOption<dyn Fn(ClientId) + Send + Sync>,
    on_receive: ArcSwapOption<dyn Fn(ClientId, Message) + Send + Sync>,
    on_error: ArcSwapOption<dyn Fn(ClientId, ClientError) + Send + Sync>,
}

/// The embeddable publish/subscribe hub.
///
/// Cheap to clone (an `Arc` inside), so the same `Hub` can be captured by an
/// axum handler closure and held by the owning application.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    store: ClientStore,
    config: HubConfig,
    id_generator: Box<dyn ClientIdGenerator>,
    callbacks: Callbacks,
    registry: prometheus::Registry,
    metrics: HubMetrics,
    ws_path: String,
}

impl Hub {
    /// Builds a hub with a freshly-minted `prometheus::Registry` and the
    /// default `UuidV4Generator`.
    pub fn new(config: HubConfig, ws_path: impl Into<String>) -> Self {
        Self::with_registry(config, ws_path, prometheus::Registry::new())
    }

    /// Builds a hub that registers its metrics against a caller-supplied
    /// registry, for embedders that already run one process-wide registry.
    pub fn with_registry(config: HubConfig, ws_path: impl Into<String>, registry: prometheus::Registry) -> Self {
        let metrics = HubMetrics::new(&registry);
        Self {
            inner: Arc::new(HubInner {
                store: ClientStore::new(config.client_shards, config.channel_shards),
                id_generator: Box::new(UuidV4Generator),
                callbacks: Callbacks {
                    on_connect: ArcSwapOption::empty(),
                    on_disconnect: ArcSwapOption::empty(),
                    on_receive: ArcSwapOption::empty(),
                    on_error: ArcSwapOption::empty(),
                },
                registry,
                metrics,
                ws_path: ws_path.into(),
                config,
            }),
        }
    }

    /// The registry this hub's metrics are registered against — the one
    /// passed to `with_registry`, or a hub-private registry for `new`. Lets
    /// an embedder register additional collectors alongside this hub's own.
    pub fn registry(&self) -> &prometheus::Registry {
        &self.inner.registry
    }

    /// Replaces the connect handler atomically; the next successful connect
    /// sees the new value.
    pub fn on_connect(&self, handler: ConnectHandler) {
        self.inner.callbacks.on_connect.store(Some(handler));
    }

    /// Replaces the disconnect handler atomically.
    pub fn on_disconnect(&self, handler: DisconnectHandler) {
        self.inner.callbacks.on_disconnect.store(Some(handler));
    }

    /// Replaces the receive handler atomically. Wired onto every client
    /// connected from this point forward (already-connected clients keep
    /// whichever handler was current at their own `Connect` time — see
    /// `serve_http`, which snapshots the current handlers per connection).
    pub fn on_receive(&self, handler: ReceiveHandler) {
        self.inner.callbacks.on_receive.store(Some(handler));
    }

    /// Replaces the error handler. Every invocation first calls `handler`,
    /// then unconditionally disconnects the client: any reported
    /// read/write/ping failure tears the client down. Re-wrapped each time a
    /// new handler is registered.
    pub fn on_error(&self, handler: ErrorHandler) {
        self.inner.callbacks.on_error.store(Some(handler));
    }

    fn invoke_connect(&self, id: ClientId) {
        if let Some(handler) = self.inner.callbacks.on_connect.load_full() {
            handler(id);
        }
    }

    fn invoke_disconnect(&self, id: ClientId) {
        if let Some(handler) = self.inner.callbacks.on_disconnect.load_full() {
            handler(id);
        }
    }

    /// Adds `channels` to a client's subscriptions. `SubscriptionChannelRequired`
    /// if the list is empty.
    pub fn subscribe(&self, id: ClientId, channels: &[ChannelName]) -> Result<(), HubError> {
        if channels.is_empty() {
            return Err(HubError::SubscriptionChannelRequired);
        }
        self.inner.store.set_channels(id, channels)?;
        Ok(())
    }

    /// Removes `channels` from a client's subscriptions, or every
    /// subscription when `channels` is empty. Does not disconnect the client.
    pub fn unsubscribe(&self, id: ClientId, channels: &[ChannelName]) -> Result<(), HubError> {
        self.inner.store.unset_channels(id, channels)?;
        Ok(())
    }

    /// Whether a client has at least one channel subscription; unknown
    /// clients read as `false`.
    pub fn is_subscribed(&self, id: ClientId) -> bool {
        self.inner.store.is_subscribed(id)
    }

    /// The channel names a client is subscribed to.
    pub fn channels(&self, id: ClientId) -> Result<Vec<ChannelName>, HubError> {
        Ok(self.inner.store.channels(id)?)
    }

    /// Global client count when `channels` is empty, else the sum of
    /// per-channel counts (no deduplication).
    pub fn count(&self, channels: &[ChannelName]) -> usize {
        self.inner.store.count(channels)
    }

    /// Fans `message` out to every client subscribed to any of `channels`
    /// (or every connected client when `channels` is empty). Any client whose
    /// `Send` fails is disconnected and not counted. Returns the number of
    /// successful enqueues.
    pub fn publish(&self, message: Message, channels: &[ChannelName]) -> usize {
        let mut delivered = 0usize;
        let mut failed = Vec::new();

        self.inner.store.find(channels, |client| match client.send(message.clone()) {
            Ok(()) => {
                delivered += 1;
                self.inner.metrics.publish_by_outcome.with_label_values(&["delivered"]).inc();
            }
            Err(_) => {
                self.inner.metrics.publish_by_outcome.with_label_values(&["overflow"]).inc();
                failed.push(client.clone());
            }
        });

        for client in failed {
            self.disconnect_client(client);
        }

        self.inner.metrics.messages_published.inc_by(delivered as u64);
        delivered
    }

    /// Sends `message` to exactly one client. Overflow surfaces to the
    /// caller rather than disconnecting (unlike `Publish`, a single-target
    /// send is explicit about failure).
    pub fn send(&self, id: ClientId, message: Message) -> Result<(), HubError> {
        let client = self.inner.store.get(id)?;
        client.send(message)?;
        Ok(())
    }

    /// Removes a client from the store and closes its connection.
    /// A no-op on an already-removed client, by design.
    pub fn disconnect(&self, id: ClientId) {
        if let Ok(client) = self.inner.store.get(id) {
            let _ = self.disconnect_client(client);
        }
    }

    /// Unsets `client` from the store and closes its connection on a
    /// separate task. Spawning (rather than closing inline) matters when the
    /// caller is the client's own writer task invoking this through the
    /// error-handler wrapper: `Client::close` awaits that same writer's join
    /// handle, which would deadlock if run on the writer task itself.
    fn disconnect_client(&self, client: Client) -> tokio::task::JoinHandle<()> {
        let id = client.id();
        self.inner.store.unset(id);
        self.inner.metrics.clients_disconnected.inc();
        let hub = self.clone();
        tokio::spawn(async move {
            let _ = client.close().await;
            hub.invoke_disconnect(id);
        })
    }

    /// Wraps the user error handler so that every invocation disconnects the
    /// client after the user handler runs.
    fn wrapped_error_handler(&self) -> ErrorHandler {
        let hub = self.clone();
        Arc::new(move |id, err| {
            if let Some(handler) = hub.inner.callbacks.on_error.load_full() {
                handler(id, err);
            }
            hub.disconnect(id);
        })
    }

    /// Mints a client via the id generator, wires the currently-registered
    /// receive/error handlers onto it, registers it in the store, and starts
    /// it. On upgrade failure the partially-registered client is removed.
    async fn connect(&self, upgrader: Box<dyn crate::connection::Upgrader>) -> Result<ClientId, ClientError> {
        let id = self.inner.id_generator.generate();
        let metrics = ClientMetrics::new(&self.inner.metrics.total_outbound_queue_depth);
        let client = Client::new(id, self.inner.config.send_buffer_capacity, self.inner.config.ping_interval, metrics);

        if let Some(handler) = self.inner.callbacks.on_receive.load_full() {
            client.on_receive(handler);
        }
        client.on_error(self.wrapped_error_handler());

        self.inner.store.set(client.clone());

        if let Err(err) = client.connect(upgrader).await {
            self.inner.store.unset(id);
            return Err(err);
        }

        self.inner.metrics.connected_clients.inc();
        self.invoke_connect(id);
        Ok(id)
    }

    /// Bounds graceful shutdown by `HubConfig::shutdown_timeout`: disconnects
    /// every remaining client, then returns (the caller is responsible for
    /// stopping whatever HTTP server it bound separately via
    /// `listen_and_serve`/`axum::serve`).
    pub async fn close(&self) {
        let mut clients = Vec::new();
        self.inner.store.find(&[], |client| clients.push(client.clone()));
        let count = clients.len();

        let handles: Vec<_> = clients.into_iter().map(|client| self.disconnect_client(client)).collect();
        let wait_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };

        if tokio::time::timeout(self.inner.config.shutdown_timeout, wait_all).await.is_err() {
            tracing::warn!("hub close exceeded shutdown timeout; some clients may not have finished disconnecting");
        }

        tracing::info!(disconnected = count, "hub closed");
    }

    /// An `axum::Router` exposing the WebSocket endpoint at the configured
    /// path, suitable for embedding into a larger application router.
    pub fn router(&self) -> Router {
        Router::new()
            .route(self.inner.ws_path.as_str(), get(serve_upgrade))
            .with_state(self.clone())
    }

    /// Binds a plain-HTTP listener and serves the router until `close` is
    /// called or the process exits.
    pub async fn listen_and_serve(&self, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, path = %self.inner.ws_path, "hub listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    /// Binds a TLS listener (certificate and key read from PEM files) and
    /// serves the router until the process exits. One `tokio::spawn`ed task
    /// per accepted connection, since `axum::serve`'s `Listener` abstraction
    /// only covers plain TCP/Unix sockets — the same low-level
    /// `hyper_util::server::conn::auto` + `tokio_rustls` pattern axum's own
    /// rustls example uses for a listener `axum::serve` doesn't support
    /// natively.
    pub async fn listen_and_serve_tls(&self, addr: SocketAddr, cert_path: &Path, key_path: &Path) -> anyhow::Result<()> {
        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;
        let mut tls_config = TlsServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, path = %self.inner.ws_path, "hub listening (tls)");

        loop {
            let (stream, peer) = listener.accept().await?;
            let acceptor = acceptor.clone();
            let service = TowerToHyperService::new(self.router());

            tokio::spawn(async move {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(stream) => stream,
                    Err(err) => {
                        tracing::warn!(%err, %peer, "tls handshake failed");
                        return;
                    }
                };
                let io = TokioIo::new(tls_stream);
                if let Err(err) = auto::Builder::new(TokioExecutor::new())
                    .serve_connection_with_upgrades(io, service)
                    .await
                {
                    tracing::warn!(%err, %peer, "connection error");
                }
            });
        }
    }
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(Into::into)
}

fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| anyhow::anyhow!("no private key found in {path:?}"))
}

async fn serve_upgrade(State(hub): State<Hub>, upgrade: WebSocketUpgrade) -> impl IntoResponse {
    let (response, pending) = upgrade.into_response();

    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(hub.inner.config.max_message_size);
    let upgrader = AxumUpgrader::new(
        pending,
        config,
        hub.inner.config.read_timeout,
        hub.inner.config.write_timeout,
    );

    // The 101 response below must reach the client before `PendingWebSocket`'s
    // inner `OnUpgrade` future can resolve (see `connection::axum_upgrade`'s
    // doc comment), so the handshake itself runs on a spawned task rather
    // than being awaited inline here, mirroring the teacher's
    // `handle_websocket`/`execute_upgrade` split.
    tokio::spawn(async move {
        if let Err(err) = hub.connect(Box::new(upgrader)).await {
            tracing::warn!(%err, "client failed to connect");
        }
    });

    response
}
