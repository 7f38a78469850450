use futures_util::future;
use futures_util::sink::{Sink, SinkExt};
use futures_util::stream::{BoxStream, Stream, StreamExt};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Timeout,
    Open(String),
    Io(String),
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timed out"),
            Self::Open(err) => write!(f, "connection failed: {err}"),
            Self::Io(err) => write!(f, "transport error: {err}"),
            Self::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for TransportError {}

/// One inbound transport message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Control,
    Close,
}

/// An open bidirectional link. Outbound items are complete text messages.
pub struct Link {
    inbound: BoxStream<'static, Result<Frame, TransportError>>,
    outbound: Pin<Box<dyn Sink<String, Error = TransportError> + Send>>,
}

impl Link {
    pub fn new<R, W>(inbound: R, outbound: W) -> Self
    where
        R: Stream<Item = Result<Frame, TransportError>> + Send + 'static,
        W: Sink<String, Error = TransportError> + Send + 'static,
    {
        Self {
            inbound: inbound.boxed(),
            outbound: Box::pin(outbound),
        }
    }

    pub async fn next(&mut self) -> Option<Result<Frame, TransportError>> {
        self.inbound.next().await
    }

    pub async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.outbound.send(text).await
    }

    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.outbound.close().await
    }
}

pub trait Connector: Send + Sync + 'static {
    fn connect(&self, endpoint: &str) -> impl Future<Output = Result<Link, TransportError>> + Send;
}

/// WebSocket connector backed by tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WsConnector {
    open_timeout: Duration,
}

impl WsConnector {
    pub fn new(open_timeout: Duration) -> Self {
        Self { open_timeout }
    }
}

impl Connector for WsConnector {
    fn connect(&self, endpoint: &str) -> impl Future<Output = Result<Link, TransportError>> + Send {
        let endpoint = endpoint.to_string();
        let open_timeout = self.open_timeout;
        async move {
            let (ws, _response) = tokio::time::timeout(open_timeout, connect_async(endpoint.as_str()))
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|err| TransportError::Open(err.to_string()))?;

            let (sink, stream) = ws.split();
            let inbound = stream.map(|msg| match msg {
                Ok(tungstenite::Message::Text(text)) => Ok(Frame::Text(text.as_str().to_owned())),
                Ok(tungstenite::Message::Binary(data)) => Ok(Frame::Binary(data.to_vec())),
                Ok(tungstenite::Message::Close(_)) => Ok(Frame::Close),
                Ok(_) => Ok(Frame::Control),
                Err(err) => Err(TransportError::Io(err.to_string())),
            });
            let outbound = sink
                .with(|text: String| {
                    future::ready(Ok::<_, tungstenite::Error>(tungstenite::Message::Text(
                        text.into(),
                    )))
                })
                .sink_map_err(|err| TransportError::Io(err.to_string()));

            Ok(Link::new(inbound, outbound))
        }
    }
}

/// In-memory links and a scripted connector for exercising the link task.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use futures_util::{sink, stream};
    use std::future::pending;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{mpsc, Mutex};

    /// The remote side of an in-memory [`Link`].
    pub struct Peer {
        pub to_client: mpsc::UnboundedSender<Result<Frame, TransportError>>,
        pub from_client: mpsc::UnboundedReceiver<String>,
    }

    impl Peer {
        pub fn send_text(&self, text: impl Into<String>) {
            let _ = self.to_client.send(Ok(Frame::Text(text.into())));
        }
    }

    pub fn link_pair() -> (Link, Peer) {
        let (to_client, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, from_client) = mpsc::unbounded_channel::<String>();

        let inbound = stream::unfold(inbound_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        let outbound = sink::unfold(outbound_tx, |tx, text: String| async move {
            tx.send(text).map_err(|_| TransportError::Closed)?;
            Ok::<_, TransportError>(tx)
        });

        (
            Link::new(inbound, outbound),
            Peer {
                to_client,
                from_client,
            },
        )
    }

    /// Hands out scripted connection outcomes in order; once the script is
    /// empty, attempts stay pending until more are pushed.
    pub struct ScriptedConnector {
        attempts: AtomicUsize,
        script: Mutex<mpsc::UnboundedReceiver<Result<Link, TransportError>>>,
    }

    #[derive(Clone)]
    pub struct Script(mpsc::UnboundedSender<Result<Link, TransportError>>);

    impl Script {
        pub fn accept(&self) -> Peer {
            let (link, peer) = link_pair();
            let _ = self.0.send(Ok(link));
            peer
        }

        /// Opens a link whose remote never reads: every send stays pending.
        pub fn accept_stalled(&self) {
            let inbound = stream::pending::<Result<Frame, TransportError>>();
            let outbound = sink::unfold((), |(), _text: String| {
                pending::<Result<(), TransportError>>()
            });
            let _ = self.0.send(Ok(Link::new(inbound, outbound)));
        }

        pub fn refuse(&self) {
            let _ = self.0.send(Err(TransportError::Open("refused".to_string())));
        }
    }

    impl ScriptedConnector {
        pub fn new() -> (Self, Script) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Self {
                    attempts: AtomicUsize::new(0),
                    script: Mutex::new(rx),
                },
                Script(tx),
            )
        }

        pub fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    impl Connector for ScriptedConnector {
        fn connect(&self, _endpoint: &str) -> impl Future<Output = Result<Link, TransportError>> + Send {
            async move {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                let next = self.script.lock().await.recv().await;
                match next {
                    Some(outcome) => outcome,
                    None => pending().await,
                }
            }
        }
    }
}
