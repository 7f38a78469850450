use crate::client::TelemetryClient;
use crate::connection::{Connector, LinkState};
use crate::diagnostics::DiagnosticsReport;
use crate::dispatch::DispatchError;
use crate::model::{Command, Snapshot, UnknownCommand};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{fmt, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

pub async fn start<C: Connector>(
    addr: SocketAddr,
    client: Arc<TelemetryClient<C>>,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "bridge listening");
    serve(listener, client, shutdown_rx).await?;
    Ok(())
}

pub async fn serve<C: Connector>(
    listener: TcpListener,
    client: Arc<TelemetryClient<C>>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> std::io::Result<()> {
    axum::serve(listener, router(client))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await
}

fn router<C: Connector>(client: Arc<TelemetryClient<C>>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status::<C>))
        .route("/snapshot", get(snapshot::<C>))
        .route("/command", post(command::<C>))
        .route("/ws", get(ws_handler::<C>))
        .with_state(client)
}

async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "healthy",
            "timestamp": std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
        })),
    )
}

#[derive(Debug, Serialize)]
struct StatusBody {
    connected: bool,
    state: LinkState,
    diagnostics: DiagnosticsReport,
}

async fn status<C: Connector>(State(client): State<Arc<TelemetryClient<C>>>) -> Json<StatusBody> {
    Json(StatusBody {
        connected: client.is_connected(),
        state: client.link_state(),
        diagnostics: client.diagnostics(),
    })
}

async fn snapshot<C: Connector>(State(client): State<Arc<TelemetryClient<C>>>) -> Response {
    match client.current_snapshot() {
        Some(snapshot) => Json(Snapshot::clone(&snapshot)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    command: String,
}

#[derive(Debug, Serialize)]
struct CommandReply {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

enum Rejected {
    Unknown(UnknownCommand),
    Dispatch(DispatchError),
}

impl Rejected {
    fn status(&self) -> StatusCode {
        match self {
            Self::Unknown(_) => StatusCode::BAD_REQUEST,
            Self::Dispatch(DispatchError::NotConnected) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(err) => write!(f, "{err}"),
            Self::Dispatch(err) => write!(f, "{err}"),
        }
    }
}

fn submit<C: Connector>(client: &TelemetryClient<C>, name: &str) -> Result<Command, Rejected> {
    let command: Command = name.parse().map_err(Rejected::Unknown)?;
    client.send_command(command).map_err(Rejected::Dispatch)?;
    Ok(command)
}

fn reply(result: &Result<Command, Rejected>) -> CommandReply {
    match result {
        Ok(_) => CommandReply {
            ok: true,
            error: None,
        },
        Err(err) => CommandReply {
            ok: false,
            error: Some(err.to_string()),
        },
    }
}

async fn command<C: Connector>(
    State(client): State<Arc<TelemetryClient<C>>>,
    Json(payload): Json<CommandRequest>,
) -> Response {
    let result = submit(&client, &payload.command);
    let status = match &result {
        Ok(_) => StatusCode::ACCEPTED,
        Err(err) => err.status(),
    };
    (status, Json(reply(&result))).into_response()
}

async fn ws_handler<C: Connector>(
    State(client): State<Arc<TelemetryClient<C>>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, client))
}

fn frame(connected: bool, snapshot: Option<&Snapshot>) -> String {
    serde_json::json!({
        "connected": connected,
        "snapshot": snapshot,
    })
    .to_string()
}

fn link_frame<C: Connector>(client: &TelemetryClient<C>) -> String {
    frame(client.is_connected(), client.live_snapshot().as_deref())
}

async fn handle_socket<C: Connector>(mut socket: WebSocket, client: Arc<TelemetryClient<C>>) {
    // Each push carries the snapshot that triggered it, not a re-read of the store.
    let (tx, mut snapshots) = mpsc::unbounded_channel::<Arc<Snapshot>>();
    let subscription = client.subscribe(move |snapshot| {
        let _ = tx.send(snapshot.clone());
    });
    let mut link = client.watch_link();

    if socket.send(Message::Text(link_frame(&client))).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            Some(snapshot) = snapshots.recv() => {
                let body = frame(client.is_connected(), Some(&*snapshot));
                if socket.send(Message::Text(body)).await.is_err() {
                    break;
                }
            }
            changed = link.changed() => {
                if changed.is_err() {
                    break;
                }
                if socket.send(Message::Text(link_frame(&client))).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let result = match serde_json::from_str::<CommandRequest>(&text) {
                            Ok(request) => submit(&client, &request.command),
                            Err(err) => {
                                tracing::debug!(error = %err, "ignoring malformed bridge message");
                                continue;
                            }
                        };
                        let body = serde_json::to_string(&reply(&result)).unwrap_or_default();
                        if socket.send(Message::Text(body)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
    subscription.unsubscribe();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::{Peer, Script, ScriptedConnector};
    use crate::model::fixtures;
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_tungstenite::{connect_async, tungstenite};

    const WAIT: Duration = Duration::from_secs(2);

    fn client() -> (Arc<TelemetryClient<ScriptedConnector>>, Script) {
        let (connector, script) = ScriptedConnector::new();
        let client = TelemetryClient::with_connector(
            "ws://remote.test/ws",
            Duration::from_millis(50),
            connector,
        );
        (Arc::new(client), script)
    }

    async fn connected_client() -> (Arc<TelemetryClient<ScriptedConnector>>, Script, Peer) {
        let (client, script) = client();
        let peer = script.accept();
        client.start();
        assert!(client.wait_connected(WAIT).await);
        (client, script, peer)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn next_json<S>(ws: &mut S) -> serde_json::Value
    where
        S: futures_util::Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
            if let tungstenite::Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn snapshot_is_no_content_until_first_message() {
        let (client, _script, peer) = connected_client().await;
        let response = snapshot(State(client.clone())).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        peer.send_text(fixtures::snapshot_json(3, 5));
        let deadline = tokio::time::Instant::now() + WAIT;
        while client.current_snapshot().is_none() {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let response = snapshot(State(client.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["roadA"], 3);
        assert_eq!(body["roadB"], 5);

        client.stop().await;
    }

    #[tokio::test]
    async fn status_reports_link_state() {
        let (client, script) = client();
        let Json(body) = status(State(client.clone())).await;
        assert!(!body.connected);
        assert_eq!(body.state, LinkState::Disconnected);

        let _peer = script.accept();
        client.start();
        assert!(client.wait_connected(WAIT).await);
        let Json(body) = status(State(client.clone())).await;
        assert!(body.connected);
        assert_eq!(body.diagnostics.opens, 1);

        client.stop().await;
    }

    #[tokio::test]
    async fn command_endpoint_maps_outcomes_to_status_codes() {
        let (client, _script, mut peer) = connected_client().await;

        let request = |name: &str| {
            Json(CommandRequest {
                command: name.to_string(),
            })
        };

        let response = command(State(client.clone()), request("pause")).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["ok"], true);
        assert_eq!(
            peer.from_client.recv().await.as_deref(),
            Some(r#"{"command":"PAUSE"}"#)
        );

        let response = command(State(client.clone()), request("LAUNCH")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["ok"], false);
        assert!(body["error"].as_str().unwrap().contains("LAUNCH"));

        client.stop().await;
        let response = command(State(client.clone()), request("RESET")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(peer.from_client.recv().await.is_none());
    }

    #[tokio::test]
    async fn websocket_pushes_frames_and_forwards_commands() {
        let (client, _script, mut peer) = connected_client().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, client.clone(), shutdown_rx));

        let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();

        let first = next_json(&mut ws).await;
        assert_eq!(first["connected"], true);
        assert!(first["snapshot"].is_null());

        peer.send_text(fixtures::snapshot_json(6, 2));
        let pushed = next_json(&mut ws).await;
        assert_eq!(pushed["snapshot"]["roadA"], 6);

        for road_a in 7..=9 {
            peer.send_text(fixtures::snapshot_json(road_a, 2));
        }
        for road_a in 7..=9 {
            let pushed = next_json(&mut ws).await;
            assert_eq!(pushed["connected"], true);
            assert_eq!(pushed["snapshot"]["roadA"], road_a);
        }

        ws.send(tungstenite::Message::Text(
            r#"{"command":"FORCE_GREEN_A"}"#.into(),
        ))
        .await
        .unwrap();
        assert_eq!(
            timeout(WAIT, peer.from_client.recv()).await.unwrap().as_deref(),
            Some(r#"{"command":"FORCE_GREEN_A"}"#)
        );
        let replied = next_json(&mut ws).await;
        assert_eq!(replied["ok"], true);

        let _ = ws.close(None).await;
        client.stop().await;
        let _ = shutdown_tx.send(true);
        timeout(WAIT, server).await.unwrap().unwrap().unwrap();
    }
}
