//! The per-connection [`Client`] state machine: `New -> Connecting ->
//! Connected -> Closing -> Closed`. One reader task and one writer task run
//! concurrently against a connected client's split halves (§3 invariant I1).
//!
//! Grounded on `spacetimedb-core`'s `client_connection.rs`
//! (`ClientConnectionSender`'s bounded-`mpsc` `try_send`, abort-on-overflow
//! policy, and the `MeteredReceiver`/gauge-wrapped channel idiom) and
//! `client_connection_index.rs`'s ping-loop shape (`perform_liveliness_check`).
//! The hot-swappable callback cells use `arc_swap::ArcSwapOption`, the
//! idiomatic single-word-atomic-reference tool for exactly this job (seen
//! elsewhere in the retrieval pack, e.g. `graphql-hive-router`, for the same
//! swap-a-closure-under-traffic pattern); the teacher's own module callbacks
//! are registered once at startup and don't need this, so this is the one
//! place the crate reaches past the teacher into the wider pack.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;

use crate::connection::{Connection, ConnectionWrite};
use crate::error::ClientError;
use crate::identity::ClientId;
use crate::message::Message;
use crate::metrics::ClientMetrics;

/// Invoked on the reader task for every successfully-read inbound message.
pub type ReceiveHandler = Arc<dyn Fn(ClientId, Message) + Send + Sync>;
/// Invoked (on whichever task detected the failure) exactly once per failing
/// read/write/ping/connect operation.
pub type ErrorHandler = Arc<dyn Fn(ClientId, ClientError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    New = 0,
    Connecting = 1,
    Connected = 2,
    Closing = 3,
    Closed = 4,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => State::New,
            1 => State::Connecting,
            2 => State::Connected,
            3 => State::Closing,
            _ => State::Closed,
        }
    }
}

struct Inner {
    id: ClientId,
    state: AtomicU8,
    queue_tx: parking_lot::RwLock<mpsc::Sender<Message>>,
    send_buffer_capacity: usize,
    write_half: AsyncMutex<Option<Box<dyn ConnectionWrite>>>,
    quit: Notify,
    on_receive: ArcSwapOption<dyn Fn(ClientId, Message) + Send + Sync>,
    on_error: ArcSwapOption<dyn Fn(ClientId, ClientError) + Send + Sync>,
    writer_handle: AsyncMutex<Option<JoinHandle<()>>>,
    reader_handle: AsyncMutex<Option<JoinHandle<()>>>,
    metrics: ClientMetrics,
    ping_interval: Duration,
}

/// A connected (or not-yet-connected, or disconnected) client actor.
///
/// Cheap to clone: internally an `Arc`, like the teacher's
/// `ClientConnectionSender`.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    pub fn new(id: ClientId, send_buffer_capacity: usize, ping_interval: Duration, metrics: ClientMetrics) -> Self {
        let (tx, _rx) = mpsc::channel(send_buffer_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                id,
                state: AtomicU8::new(State::New as u8),
                queue_tx: parking_lot::RwLock::new(tx),
                send_buffer_capacity: send_buffer_capacity.max(1),
                write_half: AsyncMutex::new(None),
                quit: Notify::new(),
                on_receive: ArcSwapOption::empty(),
                on_error: ArcSwapOption::empty(),
                writer_handle: AsyncMutex::new(None),
                reader_handle: AsyncMutex::new(None),
                metrics,
                ping_interval,
            }),
        }
    }

    pub fn id(&self) -> ClientId {
        self.inner.id
    }

    fn state(&self) -> State {
        State::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: State) {
        self.inner.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.state() == State::Connected
    }

    /// Replaces the receive handler atomically. The next inbound message sees
    /// the new handler, even mid-traffic.
    pub fn on_receive(&self, handler: ReceiveHandler) {
        self.inner.on_receive.store(Some(handler));
    }

    /// Replaces the error handler atomically.
    pub fn on_error(&self, handler: ErrorHandler) {
        self.inner.on_error.store(Some(handler));
    }

    fn invoke_error(&self, err: ClientError) {
        if let Some(handler) = self.inner.on_error.load_full() {
            handler(self.inner.id, err);
        } else {
            tracing::warn!(client_id = %self.inner.id, %err, "client error with no registered handler");
        }
    }

    /// Upgrades `upgrader` into a live connection and starts the reader and
    /// writer tasks. Valid from `New` or `Closed`; any other state is a
    /// `RepeatConnect`.
    pub async fn connect(&self, mut upgrader: Box<dyn crate::connection::Upgrader>) -> Result<(), ClientError> {
        let cur = self.state();
        if cur != State::New && cur != State::Closed {
            return Err(ClientError::RepeatConnect { id: self.inner.id });
        }
        self.set_state(State::Connecting);

        let connection = match upgrader.upgrade().await {
            Ok(connection) => connection,
            Err(cause) => {
                self.set_state(State::Closed);
                return Err(ClientError::ConnectFailure { id: self.inner.id, cause });
            }
        };
        let (read_half, write_half) = connection.split();

        let (tx, rx) = mpsc::channel(self.inner.send_buffer_capacity);
        *self.inner.queue_tx.write() = tx;
        *self.inner.write_half.lock().await = Some(write_half);

        self.set_state(State::Connected);
        self.inner.metrics.queue_depth.set(0);

        let reader = {
            let client = self.clone();
            tokio::spawn(async move { client.reader_loop(read_half).await })
        };
        let writer = {
            let client = self.clone();
            tokio::spawn(async move { client.writer_loop(rx).await })
        };

        *self.inner.reader_handle.lock().await = Some(reader);
        *self.inner.writer_handle.lock().await = Some(writer);

        Ok(())
    }

    async fn reader_loop(&self, mut read_half: Box<dyn crate::connection::ConnectionRead>) {
        loop {
            match read_half.read().await {
                Ok(message) => {
                    if let Some(handler) = self.inner.on_receive.load_full() {
                        handler(self.inner.id, message);
                    }
                }
                Err(closed) => {
                    self.invoke_error(ClientError::Receive {
                        id: self.inner.id,
                        cause: closed.cause,
                    });
                    return;
                }
            }
        }
    }

    async fn writer_loop(&self, mut queue_rx: mpsc::Receiver<Message>) {
        let mut ticker = tokio::time::interval(self.inner.ping_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut ping_disabled = false;
        let mut send_disabled = false;

        loop {
            if ping_disabled && send_disabled {
                self.inner.quit.notified().await;
                return;
            }

            let notified = self.inner.quit.notified();
            tokio::select! {
                biased;

                _ = notified => return,

                _ = ticker.tick(), if !ping_disabled => {
                    let mut guard = self.inner.write_half.lock().await;
                    if let Some(write_half) = guard.as_mut() {
                        if let Err(closed) = write_half.write(Message::ping()).await {
                            drop(guard);
                            self.invoke_error(ClientError::Ping { id: self.inner.id, cause: closed.cause });
                            ping_disabled = true;
                        }
                    }
                }

                maybe_message = queue_rx.recv(), if !send_disabled => {
                    match maybe_message {
                        Some(message) => {
                            self.inner.metrics.queue_depth.dec();
                            let mut guard = self.inner.write_half.lock().await;
                            if let Some(write_half) = guard.as_mut() {
                                if let Err(closed) = write_half.write(message).await {
                                    drop(guard);
                                    self.invoke_error(ClientError::Send { id: self.inner.id, cause: closed.cause });
                                    send_disabled = true;
                                }
                            }
                        }
                        None => send_disabled = true,
                    }
                }
            }
        }
    }

    /// Non-blocking enqueue. Returns `SendBufferOverflow` if the queue is
    /// full without ever blocking the caller (§4.1 Send semantics).
    pub fn send(&self, message: Message) -> Result<(), ClientError> {
        let tx = self.inner.queue_tx.read().clone();
        match tx.try_send(message) {
            Ok(()) => {
                self.inner.metrics.queue_depth.inc();
                Ok(())
            }
            Err(_) => Err(ClientError::SendBufferOverflow { id: self.inner.id }),
        }
    }

    /// Idempotent when not connected; otherwise signals the writer to exit
    /// and closes the connection, returning once the writer has stopped
    /// (§3 invariant I4).
    pub async fn close(&self) -> Result<(), ClientError> {
        let cur = self.state();
        if cur == State::Closed {
            return Ok(());
        }
        self.set_state(State::Closing);
        self.inner.quit.notify_one();

        if let Some(handle) = self.inner.writer_handle.lock().await.take() {
            let _ = handle.await;
        }

        let close_result = {
            let mut guard = self.inner.write_half.lock().await;
            if let Some(write_half) = guard.as_mut() {
                write_half.close().await
            } else {
                Ok(())
            }
        };
        *self.inner.write_half.lock().await = None;

        // Closing the write half sends a Close frame but does not promptly
        // unblock a reader parked in `SplitStream::next()` on the other half
        // of the same split connection; abort it directly rather than
        // leaving it to linger until its own read deadline.
        if let Some(handle) = self.inner.reader_handle.lock().await.take() {
            handle.abort();
        }

        self.set_state(State::Closed);

        // `Close`'s contract wraps the underlying close error; the flat
        // taxonomy (§7) has no distinct "close failed" tag, so this reuses
        // `ClientError::Send`, the other variant describing a failed write to
        // the wire.
        close_result.map_err(|closed| ClientError::Send {
            id: self.inner.id,
            cause: closed.cause,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionRead, ConnectionWrite};
    use crate::error::ConnectionClosed;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    struct MockRead {
        frames: StdMutex<std::collections::VecDeque<Result<Message, anyhow::Error>>>,
    }

    #[async_trait]
    impl ConnectionRead for MockRead {
        async fn read(&mut self) -> Result<Message, ConnectionClosed> {
            match self.frames.lock().unwrap().pop_front() {
                Some(Ok(msg)) => Ok(msg),
                Some(Err(err)) => Err(ConnectionClosed::new(err)),
                None => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    struct MockWrite {
        fail_after: Option<usize>,
        writes: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ConnectionWrite for MockWrite {
        async fn write(&mut self, _message: Message) -> Result<(), ConnectionClosed> {
            let n = self.writes.fetch_add(1, Ordering::SeqCst);
            if self.fail_after == Some(n) {
                return Err(ConnectionClosed::new(anyhow::anyhow!("mock write failure")));
            }
            Ok(())
        }

        async fn close(&mut self) -> Result<(), ConnectionClosed> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockConnection {
        read: MockRead,
        write: MockWrite,
    }

    impl Connection for MockConnection {
        fn split(self: Box<Self>) -> (Box<dyn ConnectionRead>, Box<dyn ConnectionWrite>) {
            (Box::new(self.read), Box::new(self.write))
        }
    }

    struct MockUpgrader(Option<Box<dyn Connection>>);

    #[async_trait]
    impl crate::connection::Upgrader for MockUpgrader {
        async fn upgrade(&mut self) -> anyhow::Result<Box<dyn Connection>> {
            self.0.take().ok_or_else(|| anyhow::anyhow!("used twice"))
        }
    }

    struct FailingUpgrader;

    #[async_trait]
    impl crate::connection::Upgrader for FailingUpgrader {
        async fn upgrade(&mut self) -> anyhow::Result<Box<dyn Connection>> {
            Err(anyhow::anyhow!("handshake rejected"))
        }
    }

    fn mock_connection(
        fail_after: Option<usize>,
    ) -> (Box<dyn crate::connection::Upgrader>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let writes = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let conn = MockConnection {
            read: MockRead {
                frames: StdMutex::new(std::collections::VecDeque::new()),
            },
            write: MockWrite {
                fail_after,
                writes: writes.clone(),
                closes: closes.clone(),
            },
        };
        (Box::new(MockUpgrader(Some(Box::new(conn)))), writes, closes)
    }

    #[tokio::test]
    async fn connect_twice_without_close_fails() {
        let client = Client::new(
            ClientId::from_bytes([1; 16]),
            8,
            Duration::from_secs(60),
            ClientMetrics::detached(),
        );
        let (conn1, ..) = mock_connection(None);
        client.connect(conn1).await.unwrap();

        let (conn2, ..) = mock_connection(None);
        let err = client.connect(conn2).await.unwrap_err();
        assert!(matches!(err, ClientError::RepeatConnect { .. }));

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let client = Client::new(
            ClientId::from_bytes([9; 16]),
            8,
            Duration::from_secs(60),
            ClientMetrics::detached(),
        );
        let err = client.connect(Box::new(FailingUpgrader)).await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectFailure { .. }));

        // A failed connect leaves the client reconnectable (not stuck).
        let (conn, ..) = mock_connection(None);
        client.connect(conn).await.unwrap();
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let client = Client::new(
            ClientId::from_bytes([2; 16]),
            8,
            Duration::from_secs(60),
            ClientMetrics::detached(),
        );
        let (conn, _writes, closes) = mock_connection(None);
        client.connect(conn).await.unwrap();

        client.close().await.unwrap();
        client.close().await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reconnect_after_close_succeeds() {
        let client = Client::new(
            ClientId::from_bytes([3; 16]),
            8,
            Duration::from_secs(60),
            ClientMetrics::detached(),
        );
        let (conn1, ..) = mock_connection(None);
        client.connect(conn1).await.unwrap();
        client.close().await.unwrap();

        let (conn2, ..) = mock_connection(None);
        client.connect(conn2).await.unwrap();
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn send_overflow_does_not_change_queue_size() {
        let client = Client::new(
            ClientId::from_bytes([4; 16]),
            1,
            Duration::from_secs(600),
            ClientMetrics::detached(),
        );
        // Not connected: nothing drains the queue, so the first send fills
        // it and the second overflows.
        assert!(client.send(Message::text("a")).is_ok());
        let err = client.send(Message::text("b")).unwrap_err();
        assert!(matches!(err, ClientError::SendBufferOverflow { .. }));
    }
}
