//! Event stream client.
//!
//! Owns the live channel for one run: connect, receive, reconnect with
//! bounded exponential backoff, close. Every frame is decoded, checked
//! against the tracked execution id, and handed to the store, which does
//! dedup and reduction under its own lock.
//!
//! Events are processed strictly in arrival order; the client makes no
//! attempt to resequence by timestamp. Gaps across reconnects are healed by
//! replay catch-up plus dedup instead.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::ConnectionState;
use crate::client::ControlPlaneClient;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::event::decode_frame;
use crate::store::WorkflowStateStore;

type Channel = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Delay before reconnect attempt `attempt` (1-based): `min(base * 2^(k-1), cap)`.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    std::cmp::min(base.saturating_mul(2u32.saturating_pow(exponent)), cap)
}

struct Session {
    execution_id: String,
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// Owns the live channel for at most one run at a time.
///
/// Not cloneable: the owning host context holds it and calls
/// [`EventStreamClient::disconnect`] exactly once on teardown.
pub struct EventStreamClient {
    config: SyncConfig,
    store: WorkflowStateStore,
    api: ControlPlaneClient,
    session: Mutex<Option<Session>>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl EventStreamClient {
    pub fn new(config: SyncConfig, store: WorkflowStateStore, api: ControlPlaneClient) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            store,
            api,
            session: Mutex::new(None),
            state: Arc::new(state),
        }
    }

    /// Open the channel for a run.
    ///
    /// Connecting to the id already being tracked is a no-op; a different id
    /// closes the previous channel first.
    pub async fn connect(&self, execution_id: &str) {
        let mut session = self.session.lock().await;

        if let Some(current) = session.as_ref() {
            if current.execution_id == execution_id && !current.handle.is_finished() {
                tracing::debug!(execution_id = %execution_id, "Already connected, ignoring");
                return;
            }
        }
        if let Some(previous) = session.take() {
            tracing::info!(
                execution_id = %previous.execution_id,
                "Closing channel before switching runs"
            );
            end_session(previous).await;
            self.store.set_connected(false).await;
        }

        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(run_loop(
            self.config.clone(),
            self.store.clone(),
            self.api.clone(),
            self.state.clone(),
            execution_id.to_string(),
            shutdown.clone(),
        ));

        *session = Some(Session {
            execution_id: execution_id.to_string(),
            shutdown,
            handle,
        });
    }

    /// Close the channel with a normal close code. Idempotent; awaits the
    /// receive task so no socket or timer survives.
    pub async fn disconnect(&self) {
        let mut session = self.session.lock().await;
        if let Some(current) = session.take() {
            tracing::info!(execution_id = %current.execution_id, "Disconnecting channel");
            end_session(current).await;
        }
        self.store.set_connected(false).await;
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Current connectivity.
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribe to connectivity changes.
    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Execution id currently tracked, if any.
    pub async fn current_execution(&self) -> Option<String> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.execution_id.clone())
    }
}

impl Drop for EventStreamClient {
    fn drop(&mut self) {
        // Disconnect was the owner's job; if it never happened, at least do
        // not leak the receive task.
        if let Ok(mut session) = self.session.try_lock() {
            if let Some(session) = session.take() {
                session.handle.abort();
            }
        }
    }
}

async fn end_session(session: Session) {
    session.shutdown.notify_one();
    let _ = session.handle.await;
}

enum CloseOutcome {
    /// The owner asked for teardown.
    Requested,
    /// A workflow-terminal event ended the run.
    RunFinished,
    /// The peer closed with a normal code.
    PeerNormal,
    /// Anything else; feeds the retry path.
    Unexpected,
}

async fn run_loop(
    config: SyncConfig,
    store: WorkflowStateStore,
    api: ControlPlaneClient,
    state: Arc<watch::Sender<ConnectionState>>,
    execution_id: String,
    shutdown: Arc<Notify>,
) {
    let url = format!(
        "{}/events/ws/executions/{}",
        config.ws_url.trim_end_matches('/'),
        execution_id
    );

    let mut attempts: u32 = 0;
    let mut connected_before = false;

    loop {
        state.send_replace(if connected_before {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        });

        let connect = tokio::select! {
            _ = shutdown.notified() => {
                state.send_replace(ConnectionState::Disconnected);
                break;
            }
            result = connect_async(url.as_str()) => result,
        };

        let mut ws = match connect {
            Ok((ws, _)) => ws,
            Err(err) => {
                tracing::warn!(execution_id = %execution_id, error = %err, "Channel connect failed");
                attempts += 1;
                if !wait_before_retry(attempts, &config, &shutdown, &state, &execution_id).await {
                    break;
                }
                continue;
            }
        };

        tracing::info!(
            execution_id = %execution_id,
            client_id = %config.client_id,
            "Channel connected"
        );
        attempts = 0;
        state.send_replace(ConnectionState::Connected);
        store.set_connected(true).await;

        if connected_before {
            catch_up(&api, &store, &execution_id).await;
        }
        connected_before = true;

        let outcome = read_frames(&mut ws, &store, &execution_id, &shutdown).await;
        store.set_connected(false).await;

        match outcome {
            CloseOutcome::Requested | CloseOutcome::RunFinished | CloseOutcome::PeerNormal => {
                state.send_replace(ConnectionState::Disconnected);
                break;
            }
            CloseOutcome::Unexpected => {
                attempts += 1;
                if !wait_before_retry(attempts, &config, &shutdown, &state, &execution_id).await {
                    break;
                }
            }
        }
    }
}

/// Sleep out the backoff delay, or give up when the attempt budget is spent.
/// Returns false when the loop should stop.
async fn wait_before_retry(
    attempts: u32,
    config: &SyncConfig,
    shutdown: &Notify,
    state: &watch::Sender<ConnectionState>,
    execution_id: &str,
) -> bool {
    if attempts > config.max_reconnect_attempts {
        let err = SyncError::MaxReconnectExceeded {
            attempts: attempts - 1,
        };
        tracing::error!(execution_id = %execution_id, error = %err, "Giving up on the channel");
        state.send_replace(ConnectionState::Disconnected);
        return false;
    }

    let delay = backoff_delay(attempts, config.reconnect_base, config.reconnect_cap);
    tracing::info!(
        execution_id = %execution_id,
        attempt = attempts,
        delay_ms = delay.as_millis() as u64,
        "Scheduling reconnect"
    );

    tokio::select! {
        _ = shutdown.notified() => {
            state.send_replace(ConnectionState::Disconnected);
            false
        }
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn read_frames(
    ws: &mut Channel,
    store: &WorkflowStateStore,
    execution_id: &str,
    shutdown: &Notify,
) -> CloseOutcome {
    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                let _ = ws
                    .close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "client disconnect".into(),
                    }))
                    .await;
                return CloseOutcome::Requested;
            }
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if ingest_frame(store, execution_id, &text).await {
                        let _ = ws
                            .close(Some(CloseFrame {
                                code: CloseCode::Normal,
                                reason: "run finished".into(),
                            }))
                            .await;
                        return CloseOutcome::RunFinished;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.as_ref().map(|f| f.code);
                    tracing::info!(execution_id = %execution_id, code = ?code, "Channel closed by peer");
                    return if code == Some(CloseCode::Normal) {
                        CloseOutcome::PeerNormal
                    } else {
                        CloseOutcome::Unexpected
                    };
                }
                // Ping/pong keepalive and binary frames carry no events.
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    // Transport error: record it and let the close path
                    // drive reconnection, never reconnect from here.
                    let err = SyncError::Transport(err.to_string());
                    tracing::warn!(execution_id = %execution_id, error = %err, "Channel transport error");
                    return CloseOutcome::Unexpected;
                }
                None => {
                    tracing::warn!(execution_id = %execution_id, "Channel ended without close handshake");
                    return CloseOutcome::Unexpected;
                }
            }
        }
    }
}

/// Decode and apply one frame. Returns true when the event ended the run.
async fn ingest_frame(store: &WorkflowStateStore, execution_id: &str, text: &str) -> bool {
    let event = match decode_frame(text) {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!(execution_id = %execution_id, error = %err, "Dropping undecodable frame");
            return false;
        }
    };

    // A late frame for a previously tracked run must not touch the store.
    if event.execution_id != execution_id {
        tracing::debug!(
            tracked = %execution_id,
            received = %event.execution_id,
            "Dropping frame for a different run"
        );
        return false;
    }

    store.apply_event(event).await.workflow_terminal
}

/// Heal the gap after a reconnect by replaying persisted events from the
/// last one seen. Dedup makes the overlap with the live feed idempotent.
async fn catch_up(api: &ControlPlaneClient, store: &WorkflowStateStore, execution_id: &str) {
    let from = store.last_event_seconds().await;

    match api.replay_events(execution_id, from).await {
        Ok(events) => {
            let fetched = events.len();
            let mut applied = 0usize;
            for replay in events {
                match replay.into_event() {
                    Ok(event) => {
                        if event.execution_id != execution_id {
                            continue;
                        }
                        if !store.apply_event(event).await.duplicate {
                            applied += 1;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            execution_id = %execution_id,
                            error = %err,
                            "Dropping undecodable replay event"
                        );
                    }
                }
            }
            tracing::info!(
                execution_id = %execution_id,
                fetched,
                applied,
                "Replay catch-up finished"
            );
        }
        Err(err) => {
            tracing::warn!(execution_id = %execution_id, error = %err, "Replay catch-up failed");
        }
    }
}
