// ============================
// crates/backend-lib/src/meeting.rs
// ============================
//! Meeting lifecycle state machine and unique code allocation.
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::hash_password;
use crate::config::Settings;
use crate::error::AppError;
use crate::metric_keys;
use crate::store::Store;
use parley_common::UserId;

/// Meeting codes are drawn from this alphabet by rejection sampling
/// against the store's uniqueness constraint.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Upper bound on collision retries before giving up. With a 10-char
/// code the chance of hitting this is negligible; a store that keeps
/// reporting collisions is broken, not unlucky.
const MAX_CODE_ATTEMPTS: usize = 64;

/// Lifecycle states. `Scheduled -> Ongoing -> Ended` is the happy path;
/// the remaining states are absorbing alternates reachable from
/// `Scheduled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MeetingStatus {
    Scheduled,
    Ongoing,
    Ended,
    Cancelled,
    Expired,
    Failed,
}

impl MeetingStatus {
    /// True once no further transition is possible.
    pub fn is_terminal(self) -> bool {
        !matches!(self, MeetingStatus::Scheduled | MeetingStatus::Ongoing)
    }
}

/// A meeting session, keyed by its human-shareable code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meeting {
    pub code: String,
    pub title: String,
    pub description: Option<String>,
    /// Scrypt hash of the optional meeting password; never serialized.
    #[serde(skip_serializing, default)]
    pub password_hash: Option<String>,
    pub host_id: UserId,
    pub scheduled_start: Option<DateTime<Utc>>,
    pub actual_start: Option<DateTime<Utc>>,
    pub actual_end: Option<DateTime<Utc>>,
    pub status: MeetingStatus,
    pub current_participant_count: u32,
    pub total_participant_count: u32,
    pub chat_message_count: u64,
    #[serde(default)]
    pub is_deleted: bool,
}

/// Parameters for creating a meeting.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewMeeting {
    pub title: String,
    pub description: Option<String>,
    pub password: Option<String>,
    pub scheduled_start: Option<DateTime<Utc>>,
}

/// Owns the meeting state machine on top of the store.
#[derive(Clone)]
pub struct MeetingLifecycle<S> {
    store: S,
    code_length: usize,
    default_window: Duration,
}

impl<S: Store + Clone> MeetingLifecycle<S> {
    pub fn new(store: S, settings: &Settings) -> Self {
        Self {
            store,
            code_length: settings.meeting_code_length,
            default_window: Duration::minutes(settings.meeting_default_duration_mins),
        }
    }

    /// Create a meeting under a freshly allocated unique code.
    ///
    /// A `scheduled_start` in the future leaves the meeting `Scheduled`;
    /// anything else (including no schedule at all) starts it
    /// immediately with the default window.
    pub async fn create(&self, host_id: UserId, new: NewMeeting) -> Result<Meeting, AppError> {
        if new.title.trim().is_empty() {
            return Err(AppError::InvalidInput("title must not be empty".to_string()));
        }

        let password_hash = match new.password.as_deref() {
            Some(plain) => Some(hash_password(plain)?),
            None => None,
        };

        let now = Utc::now();
        let (status, actual_start, actual_end) = match new.scheduled_start {
            Some(ts) if ts > now => (MeetingStatus::Scheduled, None, None),
            _ => (
                MeetingStatus::Ongoing,
                Some(now),
                Some(now + self.default_window),
            ),
        };

        for _ in 0..MAX_CODE_ATTEMPTS {
            let meeting = Meeting {
                code: generate_code(self.code_length),
                title: new.title.clone(),
                description: new.description.clone(),
                password_hash: password_hash.clone(),
                host_id,
                scheduled_start: new.scheduled_start,
                actual_start,
                actual_end,
                status,
                current_participant_count: 0,
                total_participant_count: 0,
                chat_message_count: 0,
                is_deleted: false,
            };

            // Uniqueness is enforced by the store at insert time, so a
            // concurrent creator racing us on the same code loses with
            // DuplicateCode and we sample again.
            match self.store.insert_meeting(meeting.clone()).await {
                Ok(()) => {
                    counter!(metric_keys::MEETING_CREATED).increment(1);
                    info!(code = %meeting.code, host_id, status = ?meeting.status, "meeting created");
                    return Ok(meeting);
                },
                Err(AppError::DuplicateCode) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(AppError::Internal(
            "exhausted meeting code allocation attempts".to_string(),
        ))
    }

    /// Fetch a meeting by code. Soft-deleted meetings are invisible.
    pub async fn get_by_code(&self, code: &str) -> Result<Meeting, AppError> {
        self.store
            .get_meeting(code)
            .await?
            .filter(|m| !m.is_deleted)
            .ok_or_else(|| AppError::NotFound("Meeting not found".to_string()))
    }

    /// Move a `Scheduled` meeting to `Ongoing`. Only the host may start
    /// it. A late start re-anchors the window to now.
    pub async fn start(&self, code: &str, caller: UserId) -> Result<Meeting, AppError> {
        let now = Utc::now();
        let window = self.default_window;
        let mutate = move |m: &mut Meeting| -> Result<(), AppError> {
            if m.host_id != caller {
                return Err(AppError::Unauthorized(
                    "only the host can start a meeting".to_string(),
                ));
            }
            if m.status != MeetingStatus::Scheduled {
                return Err(AppError::IllegalTransition {
                    action: "start",
                    status: m.status,
                });
            }
            m.status = MeetingStatus::Ongoing;
            m.actual_start = Some(now);
            m.actual_end = Some(now + window);
            Ok(())
        };
        let meeting = self.store.update_meeting(code, &mutate).await?;
        counter!(metric_keys::MEETING_STARTED).increment(1);
        info!(code, caller, "meeting started");
        Ok(meeting)
    }

    /// Move an `Ongoing` meeting to `Ended`, stamping the actual end and
    /// zeroing the live participant count. Participant rows survive.
    pub async fn end(&self, code: &str, caller: UserId) -> Result<Meeting, AppError> {
        let now = Utc::now();
        let mutate = move |m: &mut Meeting| -> Result<(), AppError> {
            if m.host_id != caller {
                return Err(AppError::Unauthorized(
                    "only the host can end a meeting".to_string(),
                ));
            }
            if m.status != MeetingStatus::Ongoing {
                return Err(AppError::IllegalTransition {
                    action: "end",
                    status: m.status,
                });
            }
            m.status = MeetingStatus::Ended;
            m.actual_end = Some(now);
            m.current_participant_count = 0;
            Ok(())
        };
        let meeting = self.store.update_meeting(code, &mutate).await?;
        counter!(metric_keys::MEETING_ENDED).increment(1);
        info!(code, caller, "meeting ended");
        Ok(meeting)
    }

    /// Bump the chat counter for a meeting; called by the relay on every
    /// chat broadcast.
    pub async fn increment_chat_count(&self, code: &str) -> Result<(), AppError> {
        let mutate = |m: &mut Meeting| -> Result<(), AppError> {
            m.chat_message_count += 1;
            Ok(())
        };
        self.store.update_meeting(code, &mutate).await?;
        Ok(())
    }
}

/// Fixed-length random alphanumeric code.
fn generate_code(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| {
            let idx = rng.gen_range(0..CODE_ALPHABET.len());
            CODE_ALPHABET[idx] as char
        })
        .collect()
}
