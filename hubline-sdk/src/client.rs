//! Connection lifecycle state machine with fixed-interval reconnection.
//!
//! [`ReconnectingClient`] owns a [`Transport`] and keeps one session open for
//! as long as the host process wants it:
//!
//! ```text
//!  Disconnected ──start──▶ Connecting ──ok──▶ Connected
//!                           ▲    │ fail           │ unsolicited close
//!                           │    ▼                ▼
//!                           └── sleep(interval) ◀─ Reconnecting
//! ```
//!
//! ## Retry policy
//!
//! Every failed handshake and every unsolicited close schedules the next
//! attempt after the same fixed interval ([`DEFAULT_RETRY_INTERVAL`] unless
//! configured). There is no backoff and no attempt cap; the client never gives
//! up on its own. The only exception is an explicit authorization rejection
//! ([`ConnectError::Unauthorized`]), which is surfaced as
//! [`ClientEvent::AuthRejected`] and leaves the client `Disconnected`.
//!
//! ## Credentials
//!
//! The current credential is read at every attempt. Changing it through
//! [`ReconnectingClient::set_credential`] stops the client; the caller
//! restarts it so the server sees a fresh connection under the new identity.
//!
//! ## Cancellation
//!
//! The retry loop is a task owned by the client. [`ReconnectingClient::stop`]
//! cancels it and waits for it to exit, so no pending timer can revive a
//! stopped session.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::event::ClientEvent;

/// Delay between connection attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(10_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    /// Just lost an established connection; the next attempt is scheduled.
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// The server refused the credential. Not retried.
    #[error("authorization rejected: {0}")]
    Unauthorized(String),
    /// Network or protocol failure. Retried at the fixed interval.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Something that can open sessions to the hub.
pub trait Transport: Send + Sync + 'static {
    type Session: Session;

    /// Perform one handshake, attaching `credential` when present.
    fn connect(
        &self,
        credential: Option<String>,
    ) -> impl Future<Output = Result<Self::Session, ConnectError>> + Send;
}

/// One established transport session.
pub trait Session: Send + 'static {
    /// Resolves with a reason once the session is closed by the remote side
    /// or the network.
    fn closed(&mut self) -> impl Future<Output = String> + Send;

    /// Close the session from this side.
    fn close(self) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Fixed delay before every retry.
    pub retry_interval: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

struct Run {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

struct Inner<T: Transport> {
    transport: T,
    config: ReconnectConfig,
    credential: Mutex<Option<String>>,
    state: watch::Sender<ClientState>,
    events: mpsc::UnboundedSender<ClientEvent>,
    /// The active run, if started. Task-side state transitions check the
    /// run's token under this lock so a stopped run can never overwrite
    /// `Disconnected`.
    run: Mutex<Option<Run>>,
}

/// Client-side connection state machine. See the module docs.
pub struct ReconnectingClient<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> ReconnectingClient<T> {
    /// Create a stopped client. Lifecycle events are delivered on the
    /// returned receiver.
    pub fn new(
        transport: T,
        credential: Option<String>,
        config: ReconnectConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ClientState::Disconnected);
        let inner = Arc::new(Inner {
            transport,
            config,
            credential: Mutex::new(credential),
            state,
            events,
            run: Mutex::new(None),
        });
        (Self { inner }, events_rx)
    }

    pub fn state(&self) -> ClientState {
        *self.inner.state.borrow()
    }

    /// Subscribe to state changes.
    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn credential(&self) -> Option<String> {
        self.inner.credential.lock().clone()
    }

    /// Start connecting. Awaits the first handshake only; later attempts run
    /// in a background task. Does nothing if the client is already running.
    pub async fn start(&self) {
        let cancel = CancellationToken::new();
        {
            let mut run = self.inner.run.lock();
            if run.is_some() {
                tracing::debug!("start ignored, client already running");
                return;
            }
            *run = Some(Run {
                cancel: cancel.clone(),
                task: None,
            });
        }

        let Some(first) = self.inner.attempt(1, &cancel).await else {
            return;
        };

        let task = tokio::spawn(Arc::clone(&self.inner).supervise(first, cancel.clone()));
        let mut run = self.inner.run.lock();
        if !cancel.is_cancelled()
            && let Some(current) = run.as_mut()
        {
            current.task = Some(task);
        }
    }

    /// Stop the client, cancelling any pending retry, and close the session.
    pub async fn stop(&self) {
        let run = {
            let mut slot = self.inner.run.lock();
            let run = slot.take();
            if let Some(ref run) = run {
                run.cancel.cancel();
            }
            run
        };
        if let Some(task) = run.and_then(|r| r.task) {
            let _ = task.await;
        }
        self.inner.set_state(ClientState::Disconnected);
    }

    /// Replace the credential (login/logout). A change stops the transport;
    /// call [`start`](Self::start) again to reconnect under the new credential.
    pub async fn set_credential(&self, credential: Option<String>) {
        {
            let mut current = self.inner.credential.lock();
            if *current == credential {
                return;
            }
            *current = credential;
        }
        tracing::info!("credential changed, stopping transport");
        self.stop().await;
    }
}

impl<T: Transport> Drop for ReconnectingClient<T> {
    fn drop(&mut self) {
        if let Some(run) = self.inner.run.lock().take() {
            run.cancel.cancel();
        }
    }
}

impl<T: Transport> Inner<T> {
    fn set_state(&self, next: ClientState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            self.emit(ClientEvent::StateChanged(next));
        }
    }

    /// Apply a transition on behalf of the run owning `cancel`. Returns false
    /// (and changes nothing) if that run has been stopped.
    fn transition(&self, next: ClientState, cancel: &CancellationToken) -> bool {
        let _run = self.run.lock();
        if cancel.is_cancelled() {
            return false;
        }
        self.set_state(next);
        true
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    /// One handshake with the current credential. `None` if the run was
    /// stopped while it was in flight.
    async fn attempt(
        &self,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Option<Result<T::Session, ConnectError>> {
        if !self.transition(ClientState::Connecting, cancel) {
            return None;
        }
        let credential = self.credential.lock().clone();
        tracing::debug!(attempt, authenticated = credential.is_some(), "connecting");

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            outcome = self.transport.connect(credential) => outcome,
        };

        match outcome {
            Ok(session) => {
                if !self.transition(ClientState::Connected, cancel) {
                    session.close().await;
                    return None;
                }
                tracing::info!(attempt, "connected");
                self.emit(ClientEvent::Connected { attempt });
                Some(Ok(session))
            }
            Err(e) => Some(Err(e)),
        }
    }

    /// Retry loop for one run. Exits only when cancelled or when the
    /// credential is rejected.
    async fn supervise(
        self: Arc<Self>,
        first: Result<T::Session, ConnectError>,
        cancel: CancellationToken,
    ) {
        let interval = self.config.retry_interval;
        let mut outcome = first;
        let mut attempt = 1u32;

        loop {
            match outcome {
                Ok(mut session) => {
                    let closed = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        reason = session.closed() => Some(reason),
                    };
                    let Some(reason) = closed else {
                        session.close().await;
                        return;
                    };
                    tracing::warn!(
                        %reason,
                        retry_ms = interval.as_millis() as u64,
                        "connection lost, will reconnect"
                    );
                    self.emit(ClientEvent::Disconnected { reason });
                    if !self.transition(ClientState::Reconnecting, &cancel) {
                        return;
                    }
                    attempt = 0;
                }
                Err(ConnectError::Unauthorized(reason)) => {
                    tracing::warn!(%reason, "credential rejected, not retrying");
                    self.reject(&cancel, reason);
                    return;
                }
                Err(ConnectError::Transport(error)) => {
                    tracing::warn!(
                        attempt,
                        %error,
                        retry_ms = interval.as_millis() as u64,
                        "connection failed, retrying"
                    );
                    self.emit(ClientEvent::ConnectFailed {
                        attempt,
                        error,
                        retry_in: interval,
                    });
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            attempt += 1;
            outcome = match self.attempt(attempt, &cancel).await {
                Some(outcome) => outcome,
                None => return,
            };
        }
    }

    fn reject(&self, cancel: &CancellationToken, reason: String) {
        let mut run = self.run.lock();
        if cancel.is_cancelled() {
            return;
        }
        run.take();
        self.set_state(ClientState::Disconnected);
        self.emit(ClientEvent::AuthRejected { reason });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::oneshot;
    use tokio::time::Instant;

    #[derive(Default)]
    struct MockShared {
        script: Mutex<VecDeque<Result<(), ConnectError>>>,
        fail_by_default: AtomicBool,
        attempts: Mutex<Vec<(Instant, Option<String>)>>,
        closers: Mutex<Vec<oneshot::Sender<String>>>,
        closes: AtomicUsize,
    }

    #[derive(Clone, Default)]
    struct MockTransport {
        shared: Arc<MockShared>,
    }

    impl MockTransport {
        fn scripted(outcomes: Vec<Result<(), ConnectError>>) -> Self {
            let transport = Self::default();
            *transport.shared.script.lock() = outcomes.into();
            transport
        }

        fn failing() -> Self {
            let transport = Self::default();
            transport.shared.fail_by_default.store(true, Ordering::SeqCst);
            transport
        }

        fn attempts(&self) -> Vec<(Instant, Option<String>)> {
            self.shared.attempts.lock().clone()
        }

        fn drop_latest(&self, reason: &str) {
            let closer = self.shared.closers.lock().pop().expect("no open session");
            let _ = closer.send(reason.to_string());
        }

        fn closes(&self) -> usize {
            self.shared.closes.load(Ordering::SeqCst)
        }
    }

    struct MockSession {
        closed: oneshot::Receiver<String>,
        shared: Arc<MockShared>,
    }

    impl Transport for MockTransport {
        type Session = MockSession;

        async fn connect(&self, credential: Option<String>) -> Result<MockSession, ConnectError> {
            self.shared.attempts.lock().push((Instant::now(), credential));
            let scripted = self.shared.script.lock().pop_front();
            let outcome = scripted.unwrap_or_else(|| {
                if self.shared.fail_by_default.load(Ordering::SeqCst) {
                    Err(ConnectError::Transport("connection refused".into()))
                } else {
                    Ok(())
                }
            });
            outcome?;
            let (tx, rx) = oneshot::channel();
            self.shared.closers.lock().push(tx);
            Ok(MockSession {
                closed: rx,
                shared: Arc::clone(&self.shared),
            })
        }
    }

    impl Session for MockSession {
        async fn closed(&mut self) -> String {
            (&mut self.closed)
                .await
                .unwrap_or_else(|_| "transport dropped".to_string())
        }

        async fn close(self) {
            self.shared.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    const INTERVAL: Duration = Duration::from_millis(10_000);

    fn client(
        transport: &MockTransport,
        credential: Option<&str>,
    ) -> (ReconnectingClient<MockTransport>, mpsc::UnboundedReceiver<ClientEvent>) {
        ReconnectingClient::new(
            transport.clone(),
            credential.map(str::to_string),
            ReconnectConfig {
                retry_interval: INTERVAL,
            },
        )
    }

    async fn wait_for_state(client: &ReconnectingClient<MockTransport>, want: ClientState) {
        let mut rx = client.watch_state();
        tokio::time::timeout(Duration::from_secs(3600), rx.wait_for(|s| *s == want))
            .await
            .expect("timed out waiting for state")
            .expect("state channel closed");
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> Vec<ClientEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn first_attempt_attaches_credential() {
        let transport = MockTransport::default();
        let (client, mut events) = client(&transport, Some("token-a"));
        assert_eq!(client.state(), ClientState::Disconnected);

        client.start().await;

        assert_eq!(client.state(), ClientState::Connected);
        let attempts = transport.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].1.as_deref(), Some("token-a"));
        let events = drain(&mut events);
        assert_eq!(
            events,
            vec![
                ClientEvent::StateChanged(ClientState::Connecting),
                ClientEvent::StateChanged(ClientState::Connected),
                ClientEvent::Connected { attempt: 1 },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn start_twice_is_a_noop() {
        let transport = MockTransport::default();
        let (client, _events) = client(&transport, None);
        client.start().await;
        client.start().await;
        assert_eq!(transport.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_close_no_sooner_than_interval() {
        let transport = MockTransport::default();
        let (client, mut events) = client(&transport, Some("token-a"));
        client.start().await;

        let dropped_at = Instant::now();
        transport.drop_latest("server restart");
        wait_for_state(&client, ClientState::Reconnecting).await;

        tokio::time::sleep(INTERVAL - Duration::from_millis(1)).await;
        assert_eq!(transport.attempts().len(), 1, "retried before the interval elapsed");

        wait_for_state(&client, ClientState::Connected).await;
        let attempts = transport.attempts();
        assert_eq!(attempts.len(), 2);
        assert!(attempts[1].0 - dropped_at >= INTERVAL);
        assert_eq!(attempts[1].1.as_deref(), Some("token-a"));

        let events = drain(&mut events);
        assert!(events.contains(&ClientEvent::Disconnected {
            reason: "server restart".into()
        }));
        assert!(events.contains(&ClientEvent::StateChanged(ClientState::Reconnecting)));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_handshakes_retry_at_constant_interval() {
        let transport = MockTransport::scripted(vec![
            Err(ConnectError::Transport("refused".into())),
            Err(ConnectError::Transport("refused".into())),
            Err(ConnectError::Transport("refused".into())),
            Err(ConnectError::Transport("refused".into())),
            Ok(()),
        ]);
        let (client, mut events) = client(&transport, None);

        client.start().await;
        assert_eq!(client.state(), ClientState::Connecting);

        wait_for_state(&client, ClientState::Connected).await;
        let attempts = transport.attempts();
        assert_eq!(attempts.len(), 5);
        for pair in attempts.windows(2) {
            assert_eq!(pair[1].0 - pair[0].0, INTERVAL);
        }

        let failures = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, ClientEvent::ConnectFailed { .. }))
            .count();
        assert_eq!(failures, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn never_gives_up_while_running() {
        let transport = MockTransport::failing();
        let (client, _events) = client(&transport, None);
        client.start().await;

        tokio::time::sleep(INTERVAL * 50 + Duration::from_millis(1)).await;

        assert_eq!(transport.attempts().len(), 51);
        assert_eq!(client.state(), ClientState::Connecting);
        client.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_retry() {
        let transport = MockTransport::failing();
        let (client, _events) = client(&transport, None);
        client.start().await;
        assert_eq!(transport.attempts().len(), 1);

        client.stop().await;
        assert_eq!(client.state(), ClientState::Disconnected);

        tokio::time::sleep(INTERVAL * 5).await;
        assert_eq!(transport.attempts().len(), 1);
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_closes_open_session() {
        let transport = MockTransport::default();
        let (client, _events) = client(&transport, None);
        client.start().await;

        client.stop().await;

        assert_eq!(transport.closes(), 1);
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn credential_change_stops_and_restart_uses_new_credential() {
        let transport = MockTransport::default();
        let (client, _events) = client(&transport, None);
        client.start().await;
        assert_eq!(client.state(), ClientState::Connected);

        client.set_credential(Some("after-login".into())).await;
        assert_eq!(client.state(), ClientState::Disconnected);
        assert_eq!(transport.closes(), 1);

        client.start().await;
        let attempts = transport.attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].1, None);
        assert_eq!(attempts[1].1.as_deref(), Some("after-login"));
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_credential_keeps_connection() {
        let transport = MockTransport::default();
        let (client, _events) = client(&transport, Some("same"));
        client.start().await;

        client.set_credential(Some("same".into())).await;

        assert_eq!(client.state(), ClientState::Connected);
        assert_eq!(transport.closes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn authorization_rejection_is_surfaced_and_not_retried() {
        let transport =
            MockTransport::scripted(vec![Err(ConnectError::Unauthorized("expired token".into()))]);
        let (client, mut events) = client(&transport, Some("stale"));

        client.start().await;
        wait_for_state(&client, ClientState::Disconnected).await;
        tokio::time::sleep(INTERVAL * 3).await;

        assert_eq!(transport.attempts().len(), 1);
        assert!(drain(&mut events).contains(&ClientEvent::AuthRejected {
            reason: "expired token".into()
        }));

        // The run slot is free again, so a restart with a new credential works.
        client.set_credential(Some("fresh".into())).await;
        client.start().await;
        assert_eq!(client.state(), ClientState::Connected);
    }
}
