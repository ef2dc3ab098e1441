//! Upstream WebSocket connector with a published state machine and
//! acknowledged subscription commands.
//!
//! Each connector owns exactly one outbound connection. The socket lives in a
//! spawned task; the owner talks to it through a command channel and hears
//! back through a [`FeedEvent`] channel. There is no reconnect: once the
//! connection reaches `Closed` or `Failed` it stays there.

use crate::error::{Result, UpstreamError};
use crate::messages::{Ack, CommandKind, ConnectionState, ControlCommand, FeedEvent, ProductId};
use crate::ws_handler::WsHandler;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use metrics::counter;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::{
    client_async_tls_with_config,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message},
    Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};
use url::Url;

type UpstreamStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration for an upstream connector.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Upper bound for DNS + TCP + TLS + WebSocket handshake.
    pub connect_timeout: Duration,
    /// Timeout for each individual TCP connect attempt.
    pub tcp_connect_timeout: Duration,
    /// Interval between ping frames sent upstream.
    pub ping_interval: Duration,
    /// How long `close` waits for the task to finish before aborting it.
    pub close_timeout: Duration,
    /// Capacity of the command channel.
    pub command_buffer: usize,
    /// Label for logs and metrics (e.g. the owning session id).
    pub label: String,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            tcp_connect_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(30),
            close_timeout: Duration::from_secs(2),
            command_buffer: 64,
            label: "upstream".to_string(),
        }
    }
}

/// Owner-side view of an upstream connection.
///
/// The gateway session is written against this trait so its command and
/// filtering logic can run against an in-memory link in tests.
#[async_trait]
pub trait FeedLink: Send + Sync {
    /// Begin connecting. Returns immediately; progress is reported as
    /// [`FeedEvent::StateChanged`]. Calling it again is a no-op.
    fn open(&mut self);

    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// Send a subscription command.
    ///
    /// Fails with [`UpstreamError::NotReady`] without waiting when the
    /// connection is not `Open`.
    async fn send_command(&self, kind: CommandKind, products: &[ProductId]) -> Result<Ack>;

    /// Close the connection. Idempotent.
    async fn close(&mut self);
}

/// Inputs the connection task needs, held until `open` is called.
struct PendingOpen<H: WsHandler> {
    handler: H,
    events_tx: mpsc::UnboundedSender<FeedEvent<H::Event>>,
    command_rx: mpsc::Receiver<ControlCommand>,
}

/// One outbound WebSocket connection driven by a [`WsHandler`].
pub struct UpstreamConnector<H: WsHandler> {
    pending: Option<PendingOpen<H>>,
    command_tx: mpsc::Sender<ControlCommand>,
    state: Arc<watch::Sender<ConnectionState>>,
    next_request_id: AtomicU64,
    config: ConnectorConfig,
    task: Option<JoinHandle<()>>,
}

impl<H: WsHandler> UpstreamConnector<H> {
    /// Create a connector in the `Connecting` state. Nothing happens on the
    /// network until [`FeedLink::open`] is called.
    pub fn new(
        handler: H,
        config: ConnectorConfig,
        events_tx: mpsc::UnboundedSender<FeedEvent<H::Event>>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(config.command_buffer);
        let (state, _) = watch::channel(ConnectionState::Connecting);

        Self {
            pending: Some(PendingOpen {
                handler,
                events_tx,
                command_rx,
            }),
            command_tx,
            state: Arc::new(state),
            next_request_id: AtomicU64::new(0),
            config,
            task: None,
        }
    }

    /// Request ids are unique per connector and start at 1.
    fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[async_trait]
impl<H: WsHandler> FeedLink for UpstreamConnector<H> {
    fn open(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };

        let worker = ConnectionWorker {
            handler: pending.handler,
            config: self.config.clone(),
            state: self.state.clone(),
            events_tx: pending.events_tx,
            command_rx: pending.command_rx,
        };
        self.task = Some(tokio::spawn(worker.run()));
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    async fn send_command(&self, kind: CommandKind, products: &[ProductId]) -> Result<Ack> {
        if self.state() != ConnectionState::Open {
            return Err(UpstreamError::NotReady);
        }

        let request_id = self.next_request_id();
        let (ack_tx, ack_rx) = oneshot::channel();
        self.command_tx
            .send(ControlCommand::Send {
                kind,
                products: products.to_vec(),
                request_id,
                ack: ack_tx,
            })
            .await
            .map_err(|_| UpstreamError::Send("connection task stopped".to_string()))?;

        ack_rx
            .await
            .map_err(|_| UpstreamError::Send("connection task stopped".to_string()))?
    }

    async fn close(&mut self) {
        // Never opened: nothing to tear down.
        self.pending = None;

        if let Some(mut task) = self.task.take() {
            let _ = self.command_tx.try_send(ControlCommand::Shutdown);
            if tokio::time::timeout(self.config.close_timeout, &mut task)
                .await
                .is_err()
            {
                warn!(
                    "[{}] Upstream task did not stop within {:?}, aborting",
                    self.config.label, self.config.close_timeout
                );
                task.abort();
            }
        }

        transition(&self.state, ConnectionState::Closed);
    }
}

impl<H: WsHandler> Drop for UpstreamConnector<H> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Apply a state transition unless the current state is terminal.
/// Returns true when the state changed.
fn transition(state: &watch::Sender<ConnectionState>, next: ConnectionState) -> bool {
    state.send_if_modified(|current| {
        if current.is_terminal() || *current == next {
            false
        } else {
            *current = next;
            true
        }
    })
}

/// Task side of a connector: owns the socket.
struct ConnectionWorker<H: WsHandler> {
    handler: H,
    config: ConnectorConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    events_tx: mpsc::UnboundedSender<FeedEvent<H::Event>>,
    command_rx: mpsc::Receiver<ControlCommand>,
}

impl<H: WsHandler> ConnectionWorker<H> {
    fn set_state(&self, next: ConnectionState) {
        if transition(&self.state, next) {
            debug!("[{}] Upstream state -> {:?}", self.config.label, next);
            let _ = self.events_tx.send(FeedEvent::StateChanged(next));
        }
    }

    async fn run(mut self) {
        let url = self.handler.url().to_string();
        info!("[{}] Connecting to upstream feed: {}", self.config.label, url);

        let connect = tokio::time::timeout(
            self.config.connect_timeout,
            connect_upstream(url, self.config.clone()),
        );
        tokio::pin!(connect);

        let ws_stream = loop {
            tokio::select! {
                res = &mut connect => match res {
                    Ok(Ok(ws)) => break ws,
                    Ok(Err(e)) => {
                        self.fail(e);
                        return;
                    }
                    Err(_) => {
                        self.fail(UpstreamError::Connect(format!(
                            "handshake timed out after {:?}",
                            self.config.connect_timeout
                        )));
                        return;
                    }
                },
                cmd = self.command_rx.recv() => match cmd {
                    Some(ControlCommand::Send { ack, .. }) => {
                        let _ = ack.send(Err(UpstreamError::NotReady));
                    }
                    Some(ControlCommand::Shutdown) | None => {
                        info!("[{}] Closed while connecting", self.config.label);
                        self.set_state(ConnectionState::Closed);
                        return;
                    }
                },
            }
        };

        info!("[{}] Upstream feed connected", self.config.label);
        self.set_state(ConnectionState::Open);

        match self.run_open(ws_stream).await {
            Ok(()) => {
                info!("[{}] Upstream feed closed", self.config.label);
                self.set_state(ConnectionState::Closed);
            }
            Err(e) => self.fail(e),
        }
    }

    fn fail(&self, e: UpstreamError) {
        error!("[{}] Upstream feed failed: {}", self.config.label, e);
        counter!("upstream_errors_total", "feed" => self.config.label.clone()).increment(1);
        self.set_state(ConnectionState::Failed);
    }

    /// Pump frames and commands until the connection ends.
    /// `Ok` is a graceful close from either side.
    async fn run_open(&mut self, ws_stream: UpstreamStream) -> Result<()> {
        let (mut write, mut read) = ws_stream.split();

        let mut ping_interval = interval(self.config.ping_interval);
        ping_interval.reset(); // Don't fire immediately

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            counter!("upstream_messages_received_total", "feed" => self.config.label.clone()).increment(1);
                            match self.handler.decode(&text) {
                                Some(event) => {
                                    if self.events_tx.send(FeedEvent::Event(event)).is_err() {
                                        debug!("[{}] Owner gone, closing upstream", self.config.label);
                                        let _ = write.send(Message::Close(None)).await;
                                        return Ok(());
                                    }
                                }
                                None => debug!("[{}] Ignored upstream payload", self.config.label),
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            debug!("[{}] Ignored binary frame", self.config.label);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            debug!("[{}] Received pong", self.config.label);
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!("[{}] Received close frame: {:?}", self.config.label, frame);
                            return Ok(());
                        }
                        Some(Ok(Message::Frame(_))) => {
                            // Raw frame, ignore
                        }
                        Some(Err(e)) => return Err(UpstreamError::WebSocket(e)),
                        None => {
                            return Err(UpstreamError::Protocol(
                                "stream ended without close frame".to_string(),
                            ));
                        }
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(ControlCommand::Send { kind, products, request_id, ack }) => {
                            let frame = match self.handler.encode_command(kind, &products, request_id) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    let _ = ack.send(Err(UpstreamError::Send(e.to_string())));
                                    continue;
                                }
                            };
                            debug!("[{}] Sending command: {}", self.config.label, frame);
                            match write.send(Message::Text(frame)).await {
                                Ok(()) => {
                                    let _ = ack.send(Ok(Ack { request_id }));
                                }
                                Err(e) => {
                                    let _ = ack.send(Err(UpstreamError::Send(e.to_string())));
                                    return Err(UpstreamError::WebSocket(e));
                                }
                            }
                        }
                        Some(ControlCommand::Shutdown) | None => {
                            let close_frame = CloseFrame {
                                code: CloseCode::Normal,
                                reason: "Shutdown".into(),
                            };
                            let _ = write.send(Message::Close(Some(close_frame))).await;
                            return Ok(());
                        }
                    }
                }

                _ = ping_interval.tick() => {
                    write.send(Message::Ping(Vec::new())).await?;
                }
            }
        }
    }
}

/// Resolve, connect and perform the WebSocket handshake (TLS for `wss://`).
async fn connect_upstream(url_str: String, config: ConnectorConfig) -> Result<UpstreamStream> {
    let url = Url::parse(&url_str)?;
    let host = url
        .host_str()
        .ok_or_else(|| UpstreamError::Connect("No host in URL".to_string()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| UpstreamError::Connect("No port in URL".to_string()))?;

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| UpstreamError::Connect(format!("DNS resolution failed: {}", e)))?
        .collect();

    // Try IPv4 addresses first, then IPv6
    let mut sorted_addrs: Vec<SocketAddr> =
        addrs.iter().filter(|a| a.is_ipv4()).copied().collect();
    sorted_addrs.extend(addrs.iter().filter(|a| a.is_ipv6()).copied());

    let mut tcp_stream = None;
    for addr in &sorted_addrs {
        match tokio::time::timeout(config.tcp_connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                debug!("[{}] TCP connected to {}", config.label, addr);
                tcp_stream = Some(stream);
                break;
            }
            Ok(Err(e)) => debug!("[{}] TCP connect to {} failed: {}", config.label, addr, e),
            Err(_) => debug!("[{}] TCP connect to {} timed out", config.label, addr),
        }
    }
    let tcp_stream = tcp_stream
        .ok_or_else(|| UpstreamError::Connect("All connection attempts failed".to_string()))?;

    let connector = if url.scheme() == "wss" {
        Some(tls_connector()?)
    } else {
        None
    };

    let (ws_stream, response) =
        client_async_tls_with_config(url_str.as_str(), tcp_stream, None, connector)
            .await
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;

    debug!(
        "[{}] WebSocket handshake complete, status: {:?}",
        config.label,
        response.status()
    );
    Ok(ws_stream)
}

fn tls_connector() -> Result<Connector> {
    let mut root_store = rustls::RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs();
    for cert in certs.certs {
        let _ = root_store.add(cert);
    }

    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| UpstreamError::Connect(format!("TLS config error: {}", e)))?
    .with_root_certificates(root_store)
    .with_no_client_auth();

    Ok(Connector::Rustls(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Line-oriented test dialect: commands are `METHOD products id`,
    /// events are any frame starting with `evt:`.
    struct LineHandler {
        url: String,
    }

    impl WsHandler for LineHandler {
        type Event = String;

        fn url(&self) -> &str {
            &self.url
        }

        fn encode_command(
            &self,
            kind: CommandKind,
            products: &[ProductId],
            request_id: u64,
        ) -> Result<String> {
            Ok(format!("{} {} {}", kind.method(), products.join(","), request_id))
        }

        fn decode(&self, text: &str) -> Option<String> {
            text.strip_prefix("evt:").map(str::to_string)
        }
    }

    fn test_config() -> ConnectorConfig {
        ConnectorConfig {
            connect_timeout: Duration::from_secs(2),
            close_timeout: Duration::from_millis(500),
            label: "test".to_string(),
            ..Default::default()
        }
    }

    /// Accept one WebSocket client, push `frames`, then forward every
    /// received text frame to the returned channel.
    async fn spawn_upstream(frames: Vec<&'static str>) -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            for frame in frames {
                ws.send(Message::Text(frame.to_string())).await.unwrap();
            }
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Text(text) => {
                        let _ = seen_tx.send(text);
                    }
                    Message::Close(_) => {
                        let _ = seen_tx.send("<close>".to_string());
                        break;
                    }
                    _ => {}
                }
            }
        });

        (format!("ws://{}", addr), seen_rx)
    }

    async fn wait_for_state(
        events: &mut mpsc::UnboundedReceiver<FeedEvent<String>>,
        wanted: ConnectionState,
    ) {
        while let Some(event) = events.recv().await {
            if event == FeedEvent::StateChanged(wanted) {
                return;
            }
        }
        panic!("event channel closed before {:?}", wanted);
    }

    #[tokio::test]
    async fn test_send_before_open_is_not_ready() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let connector = UpstreamConnector::new(
            LineHandler {
                url: "ws://127.0.0.1:1".to_string(),
            },
            test_config(),
            events_tx,
        );

        assert_eq!(connector.state(), ConnectionState::Connecting);
        let err = connector
            .send_command(CommandKind::Subscribe, &["btcusdt@trade".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::NotReady));
    }

    #[tokio::test]
    async fn test_commands_get_monotonic_ids() {
        let (url, mut seen) = spawn_upstream(vec![]).await;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut connector = UpstreamConnector::new(LineHandler { url }, test_config(), events_tx);

        connector.open();
        wait_for_state(&mut events_rx, ConnectionState::Open).await;

        let products = vec!["btcusdt@trade".to_string(), "ethusdt@trade".to_string()];
        let first = connector
            .send_command(CommandKind::Subscribe, &products)
            .await
            .unwrap();
        let second = connector
            .send_command(CommandKind::Unsubscribe, &products[..1])
            .await
            .unwrap();

        assert_eq!(first.request_id, 1);
        assert_eq!(second.request_id, 2);
        assert_eq!(
            seen.recv().await.unwrap(),
            "SUBSCRIBE btcusdt@trade,ethusdt@trade 1"
        );
        assert_eq!(seen.recv().await.unwrap(), "UNSUBSCRIBE btcusdt@trade 2");

        connector.close().await;
        assert_eq!(connector.state(), ConnectionState::Closed);
        assert_eq!(seen.recv().await.unwrap(), "<close>");
    }

    #[tokio::test]
    async fn test_unrecognised_payloads_are_dropped() {
        let (url, _seen) = spawn_upstream(vec!["heartbeat", "evt:one", "{\"result\":null}", "evt:two"]).await;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut connector = UpstreamConnector::new(LineHandler { url }, test_config(), events_tx);

        connector.open();
        wait_for_state(&mut events_rx, ConnectionState::Open).await;

        assert_eq!(
            events_rx.recv().await.unwrap(),
            FeedEvent::Event("one".to_string())
        );
        assert_eq!(
            events_rx.recv().await.unwrap(),
            FeedEvent::Event("two".to_string())
        );

        connector.close().await;
    }

    #[tokio::test]
    async fn test_connect_refused_fails() {
        // Reserve a port, then free it so nothing is listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut connector = UpstreamConnector::new(
            LineHandler {
                url: format!("ws://{}", addr),
            },
            test_config(),
            events_tx,
        );

        connector.open();
        wait_for_state(&mut events_rx, ConnectionState::Failed).await;
        assert_eq!(connector.state(), ConnectionState::Failed);

        // Terminal states are sticky.
        connector.close().await;
        assert_eq!(connector.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_handshake_timeout_fails() {
        // Accepts TCP but never answers the WebSocket handshake.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let config = ConnectorConfig {
            connect_timeout: Duration::from_millis(300),
            ..test_config()
        };
        let mut connector = UpstreamConnector::new(
            LineHandler {
                url: format!("ws://{}", addr),
            },
            config,
            events_tx,
        );

        connector.open();
        let err = connector
            .send_command(CommandKind::Subscribe, &["btcusdt@trade".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::NotReady));

        tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_state(&mut events_rx, ConnectionState::Failed),
        )
        .await
        .expect("handshake timeout was not reported");
        assert_eq!(connector.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_transport_loss_fails() {
        // Completes the handshake, then drops the socket without a close frame.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (drop_tx, drop_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            let _ = drop_rx.await;
            drop(ws);
        });

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut connector = UpstreamConnector::new(
            LineHandler {
                url: format!("ws://{}", addr),
            },
            test_config(),
            events_tx,
        );

        connector.open();
        wait_for_state(&mut events_rx, ConnectionState::Open).await;
        drop_tx.send(()).unwrap();

        tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_state(&mut events_rx, ConnectionState::Failed),
        )
        .await
        .expect("transport loss was not reported");
        assert_eq!(connector.state(), ConnectionState::Failed);

        // Commands after a failure are never handed to the dead socket.
        let err = connector
            .send_command(CommandKind::Subscribe, &["btcusdt@trade".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::NotReady));

        connector.close().await;
        assert_eq!(connector.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_close_without_open() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let mut connector = UpstreamConnector::new(
            LineHandler {
                url: "ws://127.0.0.1:1".to_string(),
            },
            test_config(),
            events_tx,
        );

        connector.close().await;
        connector.close().await;
        assert_eq!(connector.state(), ConnectionState::Closed);

        // A closed connector never opens.
        connector.open();
        assert_eq!(connector.state(), ConnectionState::Closed);
    }
}
