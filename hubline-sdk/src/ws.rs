//! WebSocket transport for [`ReconnectingClient`](crate::client::ReconnectingClient).
//!
//! Each session runs one task that owns both halves of the socket. Outbound
//! invocations go through a bounded channel; completions are matched to
//! waiters by invocation id, and pushed events are forwarded to the receiver
//! returned by [`WsTransport::new`]. The receiver outlives sessions, so a
//! consumer sees one continuous event stream across reconnects.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::client::{ConnectError, Session, Transport};
use crate::protocol::{
    ClientFrame, ErrorBody, GroupId, HubCall, MessageId, ServerEvent, ServerFrame,
};

const OUTBOUND_BUFFER: usize = 64;
const INVOKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("not connected")]
    NotConnected,
    #[error("connection lost before the hub answered")]
    ConnectionLost,
    #[error("no completion within {0:?}")]
    Timeout(Duration),
    #[error("rejected by hub: {0}")]
    Rejected(ErrorBody),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
}

type Waiter = oneshot::Sender<Result<(), ErrorBody>>;

struct Link {
    generation: u64,
    out: mpsc::Sender<Message>,
    pending: HashMap<u64, Waiter>,
}

struct Shared {
    next_id: AtomicU64,
    generation: AtomicU64,
    link: Mutex<Option<Link>>,
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl Shared {
    fn dispatch(&self, generation: u64, text: &str) {
        match serde_json::from_str::<ServerFrame>(text) {
            Ok(ServerFrame::Completion { id, error }) => {
                let waiter = self
                    .link
                    .lock()
                    .as_mut()
                    .filter(|link| link.generation == generation)
                    .and_then(|link| link.pending.remove(&id));
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(error.map_or(Ok(()), Err));
                    }
                    None => tracing::debug!(id, "completion for unknown invocation"),
                }
            }
            Ok(ServerFrame::Event { event }) => {
                let _ = self.events.send(event);
            }
            Err(e) => tracing::warn!(error = %e, "ignoring malformed server frame"),
        }
    }

    /// Forget the link for `generation`. Dropping its waiters fails any
    /// in-flight invocations with `ConnectionLost`.
    fn detach(&self, generation: u64) {
        let mut link = self.link.lock();
        if link.as_ref().is_some_and(|l| l.generation == generation) {
            *link = None;
        }
    }
}

/// Hub transport over `ws://` or `wss://`.
///
/// The credential is sent as the `access_token` query parameter, since
/// browsers and most WebSocket clients cannot set headers on the upgrade.
#[derive(Clone)]
pub struct WsTransport {
    url: Url,
    shared: Arc<Shared>,
}

impl WsTransport {
    /// `url` is the hub endpoint, e.g. `ws://127.0.0.1:8080/hub`.
    pub fn new(url: &str) -> Result<(Self, mpsc::UnboundedReceiver<ServerEvent>), url::ParseError> {
        let url = Url::parse(url)?;
        let (events, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            next_id: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            link: Mutex::new(None),
            events,
        });
        Ok((Self { url, shared }, events_rx))
    }

    pub fn is_connected(&self) -> bool {
        self.shared.link.lock().is_some()
    }

    /// Invoke a hub operation and wait for its completion.
    pub async fn invoke(&self, call: HubCall) -> Result<(), InvokeError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let target = call.target();
        let text = serde_json::to_string(&ClientFrame::Invoke { id, call })?;

        let (tx, rx) = oneshot::channel();
        let (generation, out) = {
            let mut link = self.shared.link.lock();
            let link = link.as_mut().ok_or(InvokeError::NotConnected)?;
            link.pending.insert(id, tx);
            (link.generation, link.out.clone())
        };

        tracing::debug!(id, target, "invoke");
        out.send(Message::Text(text.into()))
            .await
            .map_err(|_| InvokeError::ConnectionLost)?;

        match tokio::time::timeout(INVOKE_TIMEOUT, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(body))) => Err(InvokeError::Rejected(body)),
            Ok(Err(_)) => Err(InvokeError::ConnectionLost),
            Err(_) => {
                if let Some(link) = self.shared.link.lock().as_mut()
                    && link.generation == generation
                {
                    link.pending.remove(&id);
                }
                Err(InvokeError::Timeout(INVOKE_TIMEOUT))
            }
        }
    }

    pub async fn send_group_message(
        &self,
        group_id: &GroupId,
        message: &str,
    ) -> Result<(), InvokeError> {
        self.invoke(HubCall::SendGroupChatMessage {
            group_id: group_id.clone(),
            message: message.to_string(),
        })
        .await
    }

    pub async fn edit_group_message(
        &self,
        group_id: &GroupId,
        message_id: &MessageId,
        new_content: &str,
    ) -> Result<(), InvokeError> {
        self.invoke(HubCall::EditGroupChatMessage {
            group_id: group_id.clone(),
            message_id: message_id.clone(),
            new_content: new_content.to_string(),
        })
        .await
    }

    pub async fn delete_group_message(
        &self,
        group_id: &GroupId,
        message_id: &MessageId,
    ) -> Result<(), InvokeError> {
        self.invoke(HubCall::DeleteGroupChatMessage {
            group_id: group_id.clone(),
            message_id: message_id.clone(),
        })
        .await
    }

    pub async fn leave_group(&self, group_id: &GroupId) -> Result<(), InvokeError> {
        self.invoke(HubCall::LeaveGroupChat {
            group_id: group_id.clone(),
        })
        .await
    }

    /// Turn roster and visitor-count pushes on or off for this connection.
    pub async fn set_presence_interest(&self, enabled: bool) -> Result<(), InvokeError> {
        self.invoke(HubCall::SetPresenceInterest { enabled }).await
    }
}

fn classify(error: tungstenite::Error) -> ConnectError {
    match error {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                ConnectError::Unauthorized(format!("hub answered {status}"))
            } else {
                ConnectError::Transport(format!("unexpected handshake status {status}"))
            }
        }
        other => ConnectError::Transport(other.to_string()),
    }
}

impl Transport for WsTransport {
    type Session = WsSession;

    async fn connect(&self, credential: Option<String>) -> Result<WsSession, ConnectError> {
        let mut url = self.url.clone();
        if let Some(token) = credential {
            url.query_pairs_mut().append_pair("access_token", &token);
        }

        let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(classify)?;
        let (mut sink, mut stream) = socket.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
        let generation = self.shared.generation.fetch_add(1, Ordering::Relaxed) + 1;
        *self.shared.link.lock() = Some(Link {
            generation,
            out: out_tx,
            pending: HashMap::new(),
        });

        let (closed_tx, closed_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break "closed by client".to_string();
                    }
                    Some(msg) = out_rx.recv() => {
                        if let Err(e) = sink.send(msg).await {
                            break format!("write failed: {e}");
                        }
                    }
                    frame = stream.next() => match frame {
                        Some(Ok(Message::Text(text))) => shared.dispatch(generation, text.as_str()),
                        Some(Ok(Message::Close(frame))) => {
                            break frame
                                .map(|f| f.reason.to_string())
                                .filter(|r| !r.is_empty())
                                .unwrap_or_else(|| "server closed the connection".to_string());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break format!("read failed: {e}"),
                        None => break "connection reset".to_string(),
                    },
                }
            };
            shared.detach(generation);
            tracing::debug!(generation, %reason, "websocket session ended");
            let _ = closed_tx.send(reason);
        });

        Ok(WsSession {
            closed: closed_rx,
            cancel,
            task,
        })
    }
}

pub struct WsSession {
    closed: oneshot::Receiver<String>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Session for WsSession {
    async fn closed(&mut self) -> String {
        (&mut self.closed)
            .await
            .unwrap_or_else(|_| "session task ended".to_string())
    }

    async fn close(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}
