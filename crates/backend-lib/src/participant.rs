// ============================
// crates/backend-lib/src/participant.rs
// ============================
//! Participant registry: membership rows, state patches, media toggles.
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::verify_password;
use crate::error::AppError;
use crate::meeting::Meeting;
use crate::metric_keys;
use crate::store::Store;
use parley_common::{MediaType, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Host,
    Participant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Declined,
}

/// One membership row. Soft-deleted rows stay in the store as history;
/// at most one non-deleted row exists per (meeting, user).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub meeting_code: String,
    pub user_id: UserId,
    pub role: Role,
    pub invitation_status: InvitationStatus,
    pub is_online: bool,
    pub is_muted: bool,
    pub is_camera_on: bool,
    pub is_screen_sharing: bool,
    pub is_speaking: bool,
    pub join_time: Option<DateTime<Utc>>,
    pub leave_time: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_deleted: bool,
}

impl Participant {
    /// Fresh membership with the standard media defaults: online, camera
    /// on, unmuted, not sharing, not speaking.
    fn new(
        meeting_code: &str,
        user_id: UserId,
        role: Role,
        invitation_status: InvitationStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            meeting_code: meeting_code.to_string(),
            user_id,
            role,
            invitation_status,
            is_online: true,
            is_muted: false,
            is_camera_on: true,
            is_screen_sharing: false,
            is_speaking: false,
            join_time: Some(now),
            leave_time: None,
            last_heartbeat: Some(now),
            is_deleted: false,
        }
    }
}

/// Partial update applied by `PATCH`; absent fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParticipantPatch {
    pub role: Option<Role>,
    pub invitation_status: Option<InvitationStatus>,
    pub is_online: Option<bool>,
    pub is_muted: Option<bool>,
    pub is_camera_on: Option<bool>,
    pub is_screen_sharing: Option<bool>,
    pub is_speaking: Option<bool>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Options supplied alongside a join request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JoinOptions {
    pub invitation_status: Option<InvitationStatus>,
    /// Plaintext meeting password, checked against the meeting's hash
    /// when one is set.
    pub password: Option<String>,
}

/// Tracks who belongs to which meeting and keeps the meeting aggregate
/// counters in step.
#[derive(Clone)]
pub struct ParticipantRegistry<S> {
    store: S,
}

impl<S: Store + Clone> ParticipantRegistry<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Add `user_id` to the meeting. The host gets the `Host` role; a
    /// second active row for the same user is rejected with
    /// `AlreadyMember`. Bumps both participant counters on success.
    pub async fn join(
        &self,
        code: &str,
        user_id: UserId,
        opts: JoinOptions,
    ) -> Result<Participant, AppError> {
        let meeting = self.require_meeting(code).await?;

        if let Some(hash) = meeting.password_hash.as_deref() {
            let supplied = opts.password.as_deref().unwrap_or_default();
            if !verify_password(supplied, hash)? {
                return Err(AppError::Unauthorized(
                    "invalid meeting password".to_string(),
                ));
            }
        }

        let role = if user_id == meeting.host_id {
            Role::Host
        } else {
            Role::Participant
        };
        let invitation_status = opts.invitation_status.unwrap_or(InvitationStatus::Pending);

        let now = Utc::now();
        let row = self
            .store
            .insert_participant(Participant::new(code, user_id, role, invitation_status, now))
            .await?;

        let bump = |m: &mut Meeting| -> Result<(), AppError> {
            m.current_participant_count += 1;
            m.total_participant_count += 1;
            Ok(())
        };
        self.store.update_meeting(code, &bump).await?;

        counter!(metric_keys::PARTICIPANT_JOINED).increment(1);
        info!(code, user_id, ?role, "participant joined");
        Ok(row)
    }

    /// Apply a patch to the active membership row. A transition into
    /// `Accepted` re-arms the media defaults and stamps join/heartbeat,
    /// since acceptance is the moment the user actually enters the room.
    pub async fn update_state(
        &self,
        code: &str,
        user_id: UserId,
        patch: ParticipantPatch,
    ) -> Result<Participant, AppError> {
        let now = Utc::now();
        let mutate = move |p: &mut Participant| -> Result<(), AppError> {
            let was_accepted = p.invitation_status == InvitationStatus::Accepted;

            if let Some(role) = patch.role {
                p.role = role;
            }
            if let Some(status) = patch.invitation_status {
                p.invitation_status = status;
            }
            if let Some(v) = patch.is_online {
                p.is_online = v;
            }
            if let Some(v) = patch.is_muted {
                p.is_muted = v;
            }
            if let Some(v) = patch.is_camera_on {
                p.is_camera_on = v;
            }
            if let Some(v) = patch.is_screen_sharing {
                p.is_screen_sharing = v;
            }
            if let Some(v) = patch.is_speaking {
                p.is_speaking = v;
            }
            if let Some(ts) = patch.last_heartbeat {
                p.last_heartbeat = Some(ts);
            }

            if !was_accepted && p.invitation_status == InvitationStatus::Accepted {
                p.is_online = true;
                p.is_muted = false;
                p.is_camera_on = true;
                p.is_screen_sharing = false;
                p.is_speaking = false;
                p.join_time = Some(now);
                p.last_heartbeat = Some(now);
            }
            Ok(())
        };
        self.store.update_participant(code, user_id, &mutate).await
    }

    /// Toggle a single media flag. Video drives the camera flag; audio
    /// drives the muted flag directly (enabled == muted on the wire).
    pub async fn update_media_state(
        &self,
        code: &str,
        user_id: UserId,
        media_type: MediaType,
        enabled: bool,
    ) -> Result<Participant, AppError> {
        let mutate = move |p: &mut Participant| -> Result<(), AppError> {
            match media_type {
                MediaType::Video => p.is_camera_on = enabled,
                MediaType::Audio => p.is_muted = enabled,
            }
            Ok(())
        };
        self.store.update_participant(code, user_id, &mutate).await
    }

    /// Soft-delete the membership and decrement the live counter. The
    /// row (with its `leave_time`) is retained as history, so the same
    /// user may join again afterwards.
    pub async fn leave(&self, code: &str, user_id: UserId) -> Result<(), AppError> {
        self.store
            .soft_delete_participant(code, user_id, Utc::now())
            .await?;

        let drop_one = |m: &mut Meeting| -> Result<(), AppError> {
            m.current_participant_count = m.current_participant_count.saturating_sub(1);
            Ok(())
        };
        self.store.update_meeting(code, &drop_one).await?;

        counter!(metric_keys::PARTICIPANT_LEFT).increment(1);
        info!(code, user_id, "participant left");
        Ok(())
    }

    /// Active (non-deleted) members of a meeting.
    pub async fn list_active(&self, code: &str) -> Result<Vec<Participant>, AppError> {
        self.require_meeting(code).await?;
        self.store.list_active_participants(code).await
    }

    /// The caller's active membership row, or `NotFound`.
    pub async fn require_member(
        &self,
        code: &str,
        user_id: UserId,
    ) -> Result<Participant, AppError> {
        self.store
            .get_active_participant(code, user_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Participant not found in meeting".to_string()))
    }

    async fn require_meeting(&self, code: &str) -> Result<Meeting, AppError> {
        self.store
            .get_meeting(code)
            .await?
            .filter(|m| !m.is_deleted)
            .ok_or_else(|| AppError::NotFound("Meeting not found".to_string()))
    }
}
