//! Connection manager for the remote controller link.
//!
//! One tokio task owns the link and processes every transition in turn:
//! open, inbound message, close, reconnect timer, outbound write and stop.
//! Nothing else touches the socket; consumers talk to the task through
//! [`LinkHandle`] and read state from the [`StateStore`].

mod lifecycle;
mod transport;

pub use lifecycle::{Lifecycle, LinkAction, LinkEvent, LinkState};
pub use transport::{Connector, Frame, Link, TransportError, WsConnector};

#[cfg(test)]
pub(crate) use transport::testing;

use crate::codec::{self, DecodeError};
use crate::diagnostics::Diagnostics;
use crate::model::Snapshot;
use crate::store::StateStore;
use std::future::pending;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Sleep};
use uuid::Uuid;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

struct Shared {
    state: watch::Sender<LinkState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    store: StateStore,
    diagnostics: Arc<Diagnostics>,
}

/// Cheap handle onto the link for dispatching and observing connectivity.
#[derive(Clone)]
pub struct LinkHandle {
    shared: Arc<Shared>,
}

impl LinkHandle {
    pub fn state(&self) -> LinkState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.shared.state.subscribe()
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.shared.diagnostics
    }

    /// Queues one text message on the open connection. Never waits for I/O.
    pub fn write(&self, text: String) -> Result<(), TransportError> {
        match lock(&self.shared.outbound).as_ref() {
            Some(tx) => tx.send(text).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct ConnectionManager<C: Connector = WsConnector> {
    endpoint: String,
    reconnect_delay: Duration,
    connector: Arc<C>,
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(
        endpoint: impl Into<String>,
        reconnect_delay: Duration,
        connector: C,
        store: StateStore,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            endpoint: endpoint.into(),
            reconnect_delay,
            connector: Arc::new(connector),
            shared: Arc::new(Shared {
                state,
                outbound: Mutex::new(None),
                store,
                diagnostics,
            }),
            running: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> LinkHandle {
        LinkHandle {
            shared: self.shared.clone(),
        }
    }

    /// Spawns the link task. Must be called inside a tokio runtime; a second
    /// call while running does nothing.
    pub fn start(&self) {
        let mut running = lock(&self.running);
        if running.is_some() {
            return;
        }
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_link(
            self.connector.clone(),
            self.endpoint.clone(),
            self.reconnect_delay,
            self.shared.clone(),
            shutdown_rx,
        ));
        *running = Some(Running { shutdown, task });
    }

    /// Closes the connection and cancels any pending reconnect. When this
    /// returns the link task has exited. Safe to call repeatedly.
    pub async fn stop(&self) {
        let running = lock(&self.running).take();
        let Some(running) = running else {
            return;
        };
        let _ = running.shutdown.send(true);
        if let Err(err) = running.task.await {
            tracing::warn!(error = %err, "link task ended abnormally");
        }
        *lock(&self.shared.outbound) = None;
        publish_state(&self.shared, LinkState::Disconnected);
    }
}

impl<C: Connector> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        if let Some(running) = lock(&self.running).take() {
            running.task.abort();
        }
    }
}

struct Session {
    id: Uuid,
    link: Link,
    outbound: mpsc::UnboundedReceiver<String>,
}

enum Wake {
    Shutdown,
    TimerFired,
    Inbound(Option<Result<Frame, TransportError>>),
    Outbound(Option<String>),
}

async fn run_link<C: Connector>(
    connector: Arc<C>,
    endpoint: String,
    reconnect_delay: Duration,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut lifecycle = Lifecycle::new(reconnect_delay);
    let mut action = lifecycle.handle(LinkEvent::Start);
    let mut session: Option<Session> = None;
    let mut timer: Option<Pin<Box<Sleep>>> = None;

    loop {
        match action.take() {
            Some(LinkAction::Connect) => {
                publish_state(&shared, lifecycle.state());
                shared.diagnostics.connect_attempted();
                tracing::debug!(endpoint = %endpoint, "connecting");

                let outcome = tokio::select! {
                    res = connector.connect(&endpoint) => Some(res),
                    _ = shutdown.changed() => None,
                };
                action = match outcome {
                    Some(Ok(link)) => {
                        session = Some(open_session(&shared, link, &endpoint));
                        lifecycle.handle(LinkEvent::Opened)
                    }
                    Some(Err(err)) => {
                        tracing::warn!(
                            endpoint = %endpoint,
                            error = %err,
                            "connection attempt failed"
                        );
                        lifecycle.handle(LinkEvent::OpenFailed)
                    }
                    None => lifecycle.handle(LinkEvent::Stop),
                };
                publish_state(&shared, lifecycle.state());
                continue;
            }
            Some(LinkAction::ScheduleReconnect(delay)) => {
                tracing::info!(delay_ms = delay.as_millis() as u64, "reconnect scheduled");
                timer = Some(Box::pin(sleep(delay)));
            }
            Some(LinkAction::CancelReconnect) => {
                timer = None;
            }
            Some(LinkAction::Disconnect) => {
                if let Some(session) = session.take() {
                    close_session(&shared, session).await;
                }
            }
            None => {}
        }
        publish_state(&shared, lifecycle.state());

        if lifecycle.state() == LinkState::Disconnected {
            return;
        }

        let wake = tokio::select! {
            _ = shutdown.changed() => Wake::Shutdown,
            _ = fire(&mut timer) => Wake::TimerFired,
            io = next_io(&mut session) => io,
        };

        let event = match wake {
            Wake::Shutdown => Some(LinkEvent::Stop),
            Wake::TimerFired => {
                timer = None;
                Some(LinkEvent::TimerFired)
            }
            Wake::Inbound(Some(Ok(Frame::Text(text)))) => {
                accept(&shared, &session, codec::decode(&text));
                None
            }
            Wake::Inbound(Some(Ok(Frame::Binary(data)))) => {
                accept(&shared, &session, codec::decode_bytes(&data));
                None
            }
            Wake::Inbound(Some(Ok(Frame::Control))) => None,
            Wake::Inbound(Some(Ok(Frame::Close))) | Wake::Inbound(None) => {
                Some(drop_session(&shared, &mut session, None))
            }
            Wake::Inbound(Some(Err(err))) => Some(drop_session(&shared, &mut session, Some(err))),
            Wake::Outbound(Some(text)) => {
                let written = tokio::select! {
                    res = write(&mut session, text) => Some(res),
                    _ = shutdown.changed() => None,
                };
                match written {
                    Some(Ok(())) => None,
                    Some(Err(err)) => Some(drop_session(&shared, &mut session, Some(err))),
                    None => Some(LinkEvent::Stop),
                }
            }
            Wake::Outbound(None) => None,
        };

        if let Some(event) = event {
            action = lifecycle.handle(event);
        }
    }
}

/// Notifies state watchers only on an actual transition.
fn publish_state(shared: &Shared, next: LinkState) {
    shared.state.send_if_modified(|state| {
        let changed = *state != next;
        *state = next;
        changed
    });
}

fn open_session(shared: &Shared, link: Link, endpoint: &str) -> Session {
    let id = Uuid::new_v4();
    let (tx, rx) = mpsc::unbounded_channel();
    *lock(&shared.outbound) = Some(tx);
    shared.store.begin_session();
    shared.diagnostics.opened();
    tracing::info!(session = %id, endpoint = %endpoint, "connected to remote controller");
    Session {
        id,
        link,
        outbound: rx,
    }
}

/// Tears down a session the remote (or the network) ended.
fn drop_session(
    shared: &Shared,
    session: &mut Option<Session>,
    err: Option<TransportError>,
) -> LinkEvent {
    *lock(&shared.outbound) = None;
    shared.store.end_session();
    shared.diagnostics.closed();
    let id = session.take().map(|s| s.id).unwrap_or_default();
    match err {
        Some(err) => tracing::warn!(session = %id, error = %err, "connection lost"),
        None => tracing::info!(session = %id, "connection closed by remote"),
    }
    LinkEvent::Closed
}

/// Flushes commands already accepted for this session, then closes it.
/// Flush and close handshake together are bounded by [`CLOSE_TIMEOUT`].
async fn close_session(shared: &Shared, mut session: Session) {
    *lock(&shared.outbound) = None;
    shared.store.end_session();
    let Session { link, outbound, .. } = &mut session;
    let flushed = timeout(CLOSE_TIMEOUT, async {
        while let Ok(text) = outbound.try_recv() {
            link.send(text).await?;
        }
        link.close().await
    })
    .await
    .unwrap_or(Err(TransportError::Timeout));
    if let Err(err) = flushed {
        tracing::debug!(session = %session.id, error = %err, "close handshake incomplete");
    }
    shared.diagnostics.closed();
    tracing::info!(session = %session.id, "connection closed");
}

fn accept(shared: &Shared, session: &Option<Session>, decoded: Result<Snapshot, DecodeError>) {
    let id = session.as_ref().map(|s| s.id).unwrap_or_default();
    match decoded {
        Ok(snapshot) => {
            tracing::debug!(
                session = %id,
                road_a = snapshot.road_a,
                road_b = snapshot.road_b,
                "snapshot accepted"
            );
            shared.diagnostics.snapshot_accepted();
            shared.store.publish(snapshot);
        }
        Err(err) => {
            tracing::warn!(session = %id, error = %err, "dropping malformed snapshot");
            shared.diagnostics.decode_failed(&err);
        }
    }
}

async fn write(session: &mut Option<Session>, text: String) -> Result<(), TransportError> {
    match session.as_mut() {
        Some(session) => {
            tracing::debug!(session = %session.id, payload = %text, "sending");
            timeout(WRITE_TIMEOUT, session.link.send(text))
                .await
                .unwrap_or(Err(TransportError::Timeout))
        }
        None => Err(TransportError::Closed),
    }
}

async fn fire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer.as_mut() {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

async fn next_io(session: &mut Option<Session>) -> Wake {
    match session.as_mut() {
        Some(Session { link, outbound, .. }) => tokio::select! {
            frame = link.next() => Wake::Inbound(frame),
            text = outbound.recv() => Wake::Outbound(text),
        },
        None => pending().await,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
