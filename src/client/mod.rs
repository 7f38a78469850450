use crate::config::RemoteConfig;
use crate::connection::{ConnectionManager, Connector, LinkState, WsConnector};
use crate::diagnostics::{Diagnostics, DiagnosticsReport};
use crate::dispatch::{CommandDispatcher, DispatchError};
use crate::model::{Command, Snapshot};
use crate::store::{StateStore, Subscription};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Front-end facing surface of the link: connectivity, the latest snapshot,
/// snapshot notifications and command dispatch.
pub struct TelemetryClient<C: Connector = WsConnector> {
    manager: ConnectionManager<C>,
    store: StateStore,
    dispatcher: CommandDispatcher,
    diagnostics: Arc<Diagnostics>,
}

impl TelemetryClient {
    pub fn new(remote: &RemoteConfig) -> Self {
        Self::with_connector(
            remote.url.clone(),
            remote.reconnect_delay(),
            WsConnector::new(remote.open_timeout()),
        )
    }
}

impl<C: Connector> TelemetryClient<C> {
    pub fn with_connector(endpoint: impl Into<String>, reconnect_delay: Duration, connector: C) -> Self {
        let diagnostics = Arc::new(Diagnostics::default());
        let store = StateStore::new(diagnostics.clone());
        let manager = ConnectionManager::new(
            endpoint,
            reconnect_delay,
            connector,
            store.clone(),
            diagnostics.clone(),
        );
        let dispatcher = CommandDispatcher::new(manager.handle());
        Self {
            manager,
            store,
            dispatcher,
            diagnostics,
        }
    }

    pub fn start(&self) {
        self.manager.start();
    }

    pub async fn stop(&self) {
        self.manager.stop().await;
    }

    /// Last snapshot received, kept across disconnects.
    pub fn current_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.store.current()
    }

    /// Snapshot received over the connection that is open right now.
    pub fn live_snapshot(&self) -> Option<Arc<Snapshot>> {
        if self.is_connected() {
            self.store.live()
        } else {
            None
        }
    }

    pub fn is_connected(&self) -> bool {
        self.manager.handle().is_connected()
    }

    pub fn link_state(&self) -> LinkState {
        self.manager.handle().state()
    }

    pub fn watch_link(&self) -> watch::Receiver<LinkState> {
        self.manager.handle().watch_state()
    }

    /// Waits up to `within` for the link to be open.
    pub async fn wait_connected(&self, within: Duration) -> bool {
        let mut rx = self.watch_link();
        let connected = tokio::time::timeout(within, rx.wait_for(LinkState::is_connected)).await;
        matches!(connected, Ok(Ok(_)))
    }

    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&Arc<Snapshot>) + Send + Sync + 'static,
    {
        self.store.subscribe(observer)
    }

    pub fn send_command(&self, command: Command) -> Result<(), DispatchError> {
        self.dispatcher.send(command)
    }

    pub fn diagnostics(&self) -> DiagnosticsReport {
        self.diagnostics.report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures;
    use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
    use axum::extract::State;
    use axum::response::Response;
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, Instant};

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Clone)]
    struct Remote {
        connections: Arc<AtomicUsize>,
        received: mpsc::UnboundedSender<String>,
    }

    async fn remote_ws(ws: WebSocketUpgrade, State(remote): State<Remote>) -> Response {
        ws.on_upgrade(move |socket| serve_remote(socket, remote))
    }

    // First connection sends one snapshot then closes; later ones send one
    // snapshot and record whatever the client writes.
    async fn serve_remote(mut socket: WebSocket, remote: Remote) {
        let n = remote.connections.fetch_add(1, Ordering::SeqCst);
        let road_a = if n == 0 { 3 } else { 4 };
        if socket
            .send(Message::Text(fixtures::snapshot_json(road_a, 5)))
            .await
            .is_err()
        {
            return;
        }
        if n == 0 {
            sleep(Duration::from_millis(150)).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
        while let Some(Ok(msg)) = socket.recv().await {
            if let Message::Text(text) = msg {
                let _ = remote.received.send(text);
            }
        }
    }

    async fn spawn_remote() -> (String, mpsc::UnboundedReceiver<String>) {
        let (received, rx) = mpsc::unbounded_channel();
        let remote = Remote {
            connections: Arc::new(AtomicUsize::new(0)),
            received,
        };
        let app = Router::new().route("/ws", get(remote_ws)).with_state(remote);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("ws://{addr}/ws"), rx)
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn survives_remote_close_and_resumes() {
        let (url, mut received) = spawn_remote().await;
        let client = TelemetryClient::with_connector(
            url,
            Duration::from_millis(100),
            WsConnector::new(Duration::from_secs(2)),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = client.subscribe(move |s| sink.lock().unwrap().push(s.road_a));

        assert!(client.current_snapshot().is_none());
        client.start();
        eventually(|| *seen.lock().unwrap() == vec![3]).await;
        assert!(client.is_connected());
        assert_eq!(client.live_snapshot().unwrap().road_a, 3);

        eventually(|| !client.is_connected()).await;
        assert_eq!(client.current_snapshot().unwrap().road_a, 3);
        assert!(client.live_snapshot().is_none());
        assert_eq!(
            client.send_command(Command::Reset),
            Err(DispatchError::NotConnected)
        );

        eventually(|| *seen.lock().unwrap() == vec![3, 4]).await;
        assert!(client.is_connected());
        assert_eq!(client.current_snapshot().unwrap().road_a, 4);

        client.send_command(Command::AddVehicleA).unwrap();
        let command = tokio::time::timeout(WAIT, received.recv()).await.unwrap();
        assert_eq!(command.as_deref(), Some(r#"{"command":"ADD_VEHICLE_A"}"#));

        client.stop().await;
        assert!(!client.is_connected());
        assert_eq!(client.link_state(), LinkState::Disconnected);

        let report = client.diagnostics();
        assert_eq!(report.opens, 2);
        assert_eq!(report.snapshots_accepted, 2);
        assert_eq!(report.commands_sent, 1);
        assert_eq!(report.commands_rejected, 1);
        assert_eq!(report.decode_failures, 0);
    }

    #[tokio::test]
    async fn unreachable_remote_keeps_retrying() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = TelemetryClient::with_connector(
            format!("ws://{addr}/ws"),
            Duration::from_millis(100),
            WsConnector::new(Duration::from_secs(1)),
        );
        client.start();
        eventually(|| client.diagnostics().connect_attempts >= 3).await;
        assert!(!client.is_connected());
        assert!(!client.wait_connected(Duration::from_millis(20)).await);

        client.stop().await;
        let attempts = client.diagnostics().connect_attempts;
        sleep(Duration::from_millis(300)).await;
        assert_eq!(client.diagnostics().connect_attempts, attempts);
    }
}
