// ============================
// crates/backend-lib/src/relay.rs
// ============================
//! Signaling relay: per-connection frame handling and fan-out.
use dashmap::DashMap;
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::metric_keys;
use crate::store::Store;
use crate::AppState;
use parley_common::{ClientFrame, ServerFrame, UserId};
use std::sync::Arc;

/// Live connections: one sender per connected user, plus a topic map
/// from meeting code to its subscribed users.
#[derive(Default)]
pub struct ConnectionRegistry {
    by_user: DashMap<UserId, mpsc::Sender<ServerFrame>>,
    topics: DashMap<String, Vec<UserId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user's outbound channel. A reconnect replaces the
    /// previous sender; frames queued on the old channel are dropped
    /// with it.
    pub fn register(&self, user_id: UserId, tx: mpsc::Sender<ServerFrame>) {
        self.by_user.insert(user_id, tx);
    }

    pub fn unregister(&self, user_id: UserId) {
        self.by_user.remove(&user_id);
    }

    pub fn subscribe(&self, code: &str, user_id: UserId) {
        let mut subscribers = self.topics.entry(code.to_string()).or_default();
        if !subscribers.contains(&user_id) {
            subscribers.push(user_id);
        }
    }

    pub fn unsubscribe(&self, code: &str, user_id: UserId) {
        if let Some(mut subscribers) = self.topics.get_mut(code) {
            subscribers.retain(|id| *id != user_id);
        }
        self.topics.remove_if(code, |_, subscribers| subscribers.is_empty());
    }

    /// Deliver a frame to one user. `NotFound` when the user has no
    /// live connection.
    pub async fn send_to_user(&self, user_id: UserId, frame: ServerFrame) -> Result<(), AppError> {
        // Clone the sender out so no map guard is held across the await
        let tx = self
            .by_user
            .get(&user_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| AppError::NotFound("target user is not connected".to_string()))?;
        tx.send(frame).await?;
        Ok(())
    }

    /// Deliver a frame to every subscriber of a meeting topic. Slow or
    /// closed peers are skipped, never propagated as errors.
    pub async fn broadcast(&self, code: &str, frame: ServerFrame) {
        let targets: Vec<mpsc::Sender<ServerFrame>> = {
            let Some(subscribers) = self.topics.get(code) else {
                return;
            };
            subscribers
                .iter()
                .filter_map(|user_id| self.by_user.get(user_id).map(|entry| entry.clone()))
                .collect()
        };
        counter!(metric_keys::RELAY_BROADCAST).increment(1);
        for tx in targets {
            let _ = tx.send(frame.clone()).await;
        }
    }
}

/// Identity a connection acquired by joining a meeting. Captured once
/// at `Join` and consumed at disconnect.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub user_id: UserId,
    pub meeting_code: String,
}

/// Per-connection frame handler. Owns the connection's relay context;
/// errors become frames on the originating connection, never faults of
/// the shared state.
pub struct RelayHandler<S> {
    state: Arc<AppState<S>>,
    tx: mpsc::Sender<ServerFrame>,
    ctx: Option<ConnectionContext>,
}

impl<S: Store + Clone> RelayHandler<S> {
    pub fn new(state: Arc<AppState<S>>, tx: mpsc::Sender<ServerFrame>) -> Self {
        Self {
            state,
            tx,
            ctx: None,
        }
    }

    pub fn context(&self) -> Option<&ConnectionContext> {
        self.ctx.as_ref()
    }

    pub async fn handle_frame(&mut self, frame: ClientFrame) {
        match frame {
            ClientFrame::Join { meeting_code, user_id } => {
                self.handle_join(meeting_code, user_id).await;
            },
            ClientFrame::Leave { meeting_code, user_id } => {
                // A connection may only announce its own leave; a frame
                // naming another user or meeting must not touch their
                // live connection, so it is dropped.
                let matches_ctx = self
                    .ctx
                    .as_ref()
                    .is_some_and(|ctx| ctx.user_id == user_id && ctx.meeting_code == meeting_code);
                if !matches_ctx {
                    debug!(%meeting_code, user_id, "dropping leave frame for another connection");
                    return;
                }
                self.state
                    .connections
                    .broadcast(&meeting_code, ServerFrame::UserLeft {
                        meeting_code: meeting_code.clone(),
                        user_id,
                    })
                    .await;
                self.state.connections.unsubscribe(&meeting_code, user_id);
                self.state.connections.unregister(user_id);
                self.ctx = None;
            },
            ClientFrame::Signal {
                meeting_code,
                from,
                target_user_id,
                kind,
                payload,
            } => {
                if let Err(e) = self.state.participants.require_member(&meeting_code, from).await {
                    self.send_error(&e).await;
                    return;
                }
                let forwarded = ServerFrame::Signal {
                    meeting_code: meeting_code.clone(),
                    from,
                    target_user_id,
                    kind,
                    payload,
                };
                match self.state.connections.send_to_user(target_user_id, forwarded).await {
                    Ok(()) => {
                        counter!(metric_keys::SIGNAL_FORWARDED).increment(1);
                        debug!(%meeting_code, from, target_user_id, "signal forwarded");
                    },
                    Err(e) => self.send_error(&e).await,
                }
            },
            ClientFrame::Chat {
                meeting_code,
                sender_id,
                sender_name,
                text,
                timestamp,
                kind,
            } => {
                self.state
                    .connections
                    .broadcast(&meeting_code, ServerFrame::Chat {
                        meeting_code: meeting_code.clone(),
                        sender_id,
                        sender_name,
                        text,
                        timestamp,
                        kind,
                    })
                    .await;
                // Counter maintenance must not take the chat down
                if let Err(e) = self.state.meetings.increment_chat_count(&meeting_code).await {
                    warn!(%meeting_code, error = %e, "chat counter update failed");
                }
            },
            ClientFrame::File {
                meeting_code,
                sender_id,
                sender_name,
                file_name,
                file_type,
                file_size,
                file_data,
                timestamp,
            } => {
                self.state
                    .connections
                    .broadcast(&meeting_code, ServerFrame::File {
                        meeting_code: meeting_code.clone(),
                        sender_id,
                        sender_name,
                        file_name,
                        file_type,
                        file_size,
                        file_data,
                        timestamp,
                    })
                    .await;
            },
            ClientFrame::MediaState {
                meeting_code,
                user_id,
                media_type,
                enabled,
            } => {
                match self
                    .state
                    .participants
                    .update_media_state(&meeting_code, user_id, media_type, enabled)
                    .await
                {
                    Ok(_) => {
                        self.state
                            .connections
                            .broadcast(&meeting_code, ServerFrame::MediaState {
                                meeting_code: meeting_code.clone(),
                                user_id,
                                media_type,
                                enabled,
                            })
                            .await;
                    },
                    Err(e) => self.send_error(&e).await,
                }
            },
        }
    }

    async fn handle_join(&mut self, meeting_code: String, user_id: Option<UserId>) {
        let Some(user_id) = user_id else {
            let frame = ServerFrame::Error {
                code: "VAL_001".to_string(),
                message: "join requires a user id".to_string(),
            };
            let _ = self.tx.send(frame).await;
            return;
        };

        // The REST join must have created the membership row first
        if let Err(e) = self.state.participants.require_member(&meeting_code, user_id).await {
            self.send_error(&e).await;
            return;
        }

        // A join on an already-joined connection moves it: drop the
        // previous topic subscription before taking the new one.
        if let Some(prev) = self.ctx.take() {
            self.state.connections.unsubscribe(&prev.meeting_code, prev.user_id);
            if prev.user_id != user_id {
                self.state.connections.unregister(prev.user_id);
            }
        }

        self.state.connections.register(user_id, self.tx.clone());
        self.state.connections.subscribe(&meeting_code, user_id);
        self.ctx = Some(ConnectionContext {
            user_id,
            meeting_code: meeting_code.clone(),
        });
        counter!(metric_keys::RELAY_JOIN).increment(1);
        let frame = ServerFrame::UserJoined {
            meeting_code: meeting_code.clone(),
            user_id,
        };
        self.state.connections.broadcast(&meeting_code, frame).await;
    }

    /// Transport-level disconnect. Treated as a leave, driven entirely
    /// off the captured context; runs at most once per connection.
    pub async fn handle_disconnect(&mut self) {
        let Some(ctx) = self.ctx.take() else {
            return;
        };
        self.state.connections.unsubscribe(&ctx.meeting_code, ctx.user_id);
        self.state.connections.unregister(ctx.user_id);

        match self.state.participants.leave(&ctx.meeting_code, ctx.user_id).await {
            Ok(()) => {},
            // Already removed through the REST endpoint
            Err(AppError::NotFound(_)) => {},
            Err(e) => {
                warn!(
                    meeting_code = %ctx.meeting_code,
                    user_id = ctx.user_id,
                    error = %e,
                    "registry cleanup on disconnect failed"
                );
            },
        }

        self.state
            .connections
            .broadcast(&ctx.meeting_code, ServerFrame::UserLeft {
                meeting_code: ctx.meeting_code.clone(),
                user_id: ctx.user_id,
            })
            .await;
    }

    /// Surface an error to this connection only. Infrastructure errors
    /// are logged and sanitized; domain errors pass their code through.
    async fn send_error(&self, err: &AppError) {
        if !err.is_domain() {
            warn!(error = %err, "relay operation failed");
        }
        let frame = ServerFrame::Error {
            code: err.error_code().to_string(),
            message: err.sanitized_message(),
        };
        let _ = self.tx.send(frame).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::meeting::NewMeeting;
    use crate::participant::JoinOptions;
    use crate::store::MemStore;
    use parley_common::{ChatKind, MediaType, SignalKind};

    struct Peer {
        handler: RelayHandler<MemStore>,
        rx: mpsc::Receiver<ServerFrame>,
    }

    async fn setup() -> (Arc<AppState<MemStore>>, String) {
        let state = Arc::new(AppState::new(MemStore::default(), Settings::default()));
        let new = NewMeeting {
            title: "relay".to_string(),
            ..NewMeeting::default()
        };
        let code = state.meetings.create(1, new).await.unwrap().code;
        (state, code)
    }

    /// REST-join the meeting, then send the relay Join frame.
    async fn connect(state: &Arc<AppState<MemStore>>, code: &str, user_id: UserId) -> Peer {
        state
            .participants
            .join(code, user_id, JoinOptions::default())
            .await
            .unwrap();
        let (tx, rx) = mpsc::channel(32);
        let mut handler = RelayHandler::new(state.clone(), tx);
        handler
            .handle_frame(ClientFrame::Join {
                meeting_code: code.to_string(),
                user_id: Some(user_id),
            })
            .await;
        Peer { handler, rx }
    }

    fn drain(rx: &mut mpsc::Receiver<ServerFrame>) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_join_broadcasts_to_topic() {
        let (state, code) = setup().await;
        let mut a = connect(&state, &code, 1).await;
        let mut b = connect(&state, &code, 2).await;

        // A saw its own join and B's join
        let frames = drain(&mut a.rx);
        assert_eq!(frames.len(), 2);
        assert!(frames
            .iter()
            .all(|f| matches!(f, ServerFrame::UserJoined { .. })));

        // B only saw its own join
        let frames = drain(&mut b.rx);
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            &frames[0],
            ServerFrame::UserJoined { user_id: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_join_without_user_id_errors_origin_only() {
        let (state, code) = setup().await;
        let mut a = connect(&state, &code, 1).await;
        drain(&mut a.rx);

        let (tx, mut rx) = mpsc::channel(32);
        let mut anon = RelayHandler::new(state.clone(), tx);
        anon.handle_frame(ClientFrame::Join {
            meeting_code: code.clone(),
            user_id: None,
        })
        .await;

        let frames = drain(&mut rx);
        assert!(matches!(&frames[0], ServerFrame::Error { code, .. } if code == "VAL_001"));
        assert!(anon.context().is_none());
        assert!(drain(&mut a.rx).is_empty());
    }

    #[tokio::test]
    async fn test_join_without_membership_rejected() {
        let (state, code) = setup().await;
        let (tx, mut rx) = mpsc::channel(32);
        let mut handler = RelayHandler::new(state.clone(), tx);
        handler
            .handle_frame(ClientFrame::Join {
                meeting_code: code.clone(),
                user_id: Some(99),
            })
            .await;

        let frames = drain(&mut rx);
        assert!(matches!(&frames[0], ServerFrame::Error { code, .. } if code == "NF_001"));
        assert!(handler.context().is_none());
    }

    #[tokio::test]
    async fn test_signal_is_unicast() {
        let (state, code) = setup().await;
        let mut a = connect(&state, &code, 1).await;
        let mut b = connect(&state, &code, 2).await;
        let mut c = connect(&state, &code, 3).await;
        drain(&mut a.rx);
        drain(&mut b.rx);
        drain(&mut c.rx);

        b.handler
            .handle_frame(ClientFrame::Signal {
                meeting_code: code.clone(),
                from: 2,
                target_user_id: 1,
                kind: SignalKind::Offer,
                payload: "sdp-offer".to_string(),
            })
            .await;

        let frames = drain(&mut a.rx);
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            &frames[0],
            ServerFrame::Signal { from: 2, target_user_id: 1, kind: SignalKind::Offer, .. }
        ));
        assert!(drain(&mut b.rx).is_empty());
        assert!(drain(&mut c.rx).is_empty());
    }

    #[tokio::test]
    async fn test_signal_to_offline_target_errors_sender_only() {
        let (state, code) = setup().await;
        let mut a = connect(&state, &code, 1).await;
        let mut b = connect(&state, &code, 2).await;
        drain(&mut a.rx);
        drain(&mut b.rx);

        a.handler
            .handle_frame(ClientFrame::Signal {
                meeting_code: code.clone(),
                from: 1,
                target_user_id: 42,
                kind: SignalKind::IceCandidate,
                payload: "candidate".to_string(),
            })
            .await;

        let frames = drain(&mut a.rx);
        assert!(matches!(&frames[0], ServerFrame::Error { code, .. } if code == "NF_001"));
        assert!(drain(&mut b.rx).is_empty());
    }

    #[tokio::test]
    async fn test_chat_broadcasts_and_counts() {
        let (state, code) = setup().await;
        let mut a = connect(&state, &code, 1).await;
        let mut b = connect(&state, &code, 2).await;
        drain(&mut a.rx);
        drain(&mut b.rx);

        a.handler
            .handle_frame(ClientFrame::Chat {
                meeting_code: code.clone(),
                sender_id: 1,
                sender_name: "host".to_string(),
                text: "hello".to_string(),
                timestamp: chrono::Utc::now(),
                kind: ChatKind::User,
            })
            .await;

        assert!(matches!(drain(&mut a.rx)[0], ServerFrame::Chat { .. }));
        assert!(matches!(drain(&mut b.rx)[0], ServerFrame::Chat { .. }));

        let meeting = state.meetings.get_by_code(&code).await.unwrap();
        assert_eq!(meeting.chat_message_count, 1);
    }

    #[tokio::test]
    async fn test_media_state_updates_registry_then_broadcasts() {
        let (state, code) = setup().await;
        let mut a = connect(&state, &code, 1).await;
        let mut b = connect(&state, &code, 2).await;
        drain(&mut a.rx);
        drain(&mut b.rx);

        b.handler
            .handle_frame(ClientFrame::MediaState {
                meeting_code: code.clone(),
                user_id: 2,
                media_type: MediaType::Video,
                enabled: false,
            })
            .await;

        assert!(matches!(
            drain(&mut a.rx)[0],
            ServerFrame::MediaState { user_id: 2, media_type: MediaType::Video, enabled: false, .. }
        ));
        let row = state.participants.require_member(&code, 2).await.unwrap();
        assert!(!row.is_camera_on);
    }

    #[tokio::test]
    async fn test_media_state_without_membership_errors() {
        let (state, code) = setup().await;
        let mut a = connect(&state, &code, 1).await;
        drain(&mut a.rx);

        let (tx, mut rx) = mpsc::channel(32);
        let mut stranger = RelayHandler::new(state.clone(), tx);
        stranger
            .handle_frame(ClientFrame::MediaState {
                meeting_code: code.clone(),
                user_id: 99,
                media_type: MediaType::Audio,
                enabled: true,
            })
            .await;

        let frames = drain(&mut rx);
        assert!(matches!(&frames[0], ServerFrame::Error { code, .. } if code == "NF_001"));
        assert!(drain(&mut a.rx).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_acts_as_leave_exactly_once() {
        let (state, code) = setup().await;
        let mut a = connect(&state, &code, 1).await;
        let mut b = connect(&state, &code, 2).await;
        drain(&mut a.rx);
        drain(&mut b.rx);

        b.handler.handle_disconnect().await;

        // B's row is gone and A heard about it once
        let active = state.participants.list_active(&code).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].user_id, 1);
        let frames = drain(&mut a.rx);
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], ServerFrame::UserLeft { user_id: 2, .. }));

        // A second disconnect of the same handler is a no-op
        b.handler.handle_disconnect().await;
        assert!(drain(&mut a.rx).is_empty());

        let meeting = state.meetings.get_by_code(&code).await.unwrap();
        assert_eq!(meeting.current_participant_count, 1);
    }

    #[tokio::test]
    async fn test_disconnect_without_join_is_noop() {
        let (state, code) = setup().await;
        let mut a = connect(&state, &code, 1).await;
        drain(&mut a.rx);

        let (tx, _rx) = mpsc::channel(32);
        let mut idle = RelayHandler::new(state.clone(), tx);
        idle.handle_disconnect().await;
        assert!(drain(&mut a.rx).is_empty());
    }

    #[tokio::test]
    async fn test_leave_for_another_user_is_ignored() {
        let (state, code) = setup().await;
        let mut a = connect(&state, &code, 1).await;
        let mut b = connect(&state, &code, 2).await;
        drain(&mut a.rx);
        drain(&mut b.rx);

        // B names A in its leave frame; nothing may happen
        b.handler
            .handle_frame(ClientFrame::Leave {
                meeting_code: code.clone(),
                user_id: 1,
            })
            .await;
        assert!(drain(&mut a.rx).is_empty());
        assert!(b.handler.context().is_some());

        // A's connection is untouched: signals still reach it
        b.handler
            .handle_frame(ClientFrame::Signal {
                meeting_code: code.clone(),
                from: 2,
                target_user_id: 1,
                kind: SignalKind::Answer,
                payload: "sdp-answer".to_string(),
            })
            .await;
        let frames = drain(&mut a.rx);
        assert!(matches!(&frames[0], ServerFrame::Signal { from: 2, .. }));

        // B's own disconnect still soft-deletes its row, exactly once
        b.handler.handle_disconnect().await;
        let active = state.participants.list_active(&code).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].user_id, 1);
        assert!(matches!(drain(&mut a.rx)[0], ServerFrame::UserLeft { user_id: 2, .. }));
    }

    #[tokio::test]
    async fn test_leave_for_another_meeting_is_ignored() {
        let (state, code) = setup().await;
        let mut a = connect(&state, &code, 1).await;
        drain(&mut a.rx);

        a.handler
            .handle_frame(ClientFrame::Leave {
                meeting_code: "ELSEWHERE0".to_string(),
                user_id: 1,
            })
            .await;
        assert!(a.handler.context().is_some());
    }

    #[tokio::test]
    async fn test_rejoin_moves_topic_subscription() {
        let (state, first) = setup().await;
        let second = {
            let new = NewMeeting {
                title: "second".to_string(),
                ..NewMeeting::default()
            };
            state.meetings.create(1, new).await.unwrap().code
        };

        let mut host = connect(&state, &first, 1).await;
        let mut observer = connect(&state, &first, 2).await;
        drain(&mut host.rx);
        drain(&mut observer.rx);

        // Host's connection moves to the second meeting
        state
            .participants
            .join(&second, 1, JoinOptions::default())
            .await
            .unwrap();
        host.handler
            .handle_frame(ClientFrame::Join {
                meeting_code: second.clone(),
                user_id: Some(1),
            })
            .await;
        drain(&mut host.rx);

        // Old-topic traffic no longer reaches the moved connection
        state
            .connections
            .broadcast(&first, ServerFrame::UserJoined {
                meeting_code: first.clone(),
                user_id: 99,
            })
            .await;
        assert!(drain(&mut host.rx).is_empty());
        assert_eq!(drain(&mut observer.rx).len(), 1);

        // New-topic traffic does
        state
            .connections
            .broadcast(&second, ServerFrame::UserJoined {
                meeting_code: second.clone(),
                user_id: 99,
            })
            .await;
        assert_eq!(drain(&mut host.rx).len(), 1);
    }

    #[tokio::test]
    async fn test_explicit_leave_clears_context() {
        let (state, code) = setup().await;
        let mut a = connect(&state, &code, 1).await;
        let mut b = connect(&state, &code, 2).await;
        drain(&mut a.rx);
        drain(&mut b.rx);

        // The REST leave runs first, then the relay frame
        state.participants.leave(&code, 2).await.unwrap();
        b.handler
            .handle_frame(ClientFrame::Leave {
                meeting_code: code.clone(),
                user_id: 2,
            })
            .await;

        let frames = drain(&mut a.rx);
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], ServerFrame::UserLeft { user_id: 2, .. }));

        // Context is gone, so the eventual socket close adds nothing
        b.handler.handle_disconnect().await;
        assert!(drain(&mut a.rx).is_empty());
    }
}
