// ============================
// crates/backend-lib/src/store.rs
// ============================
//! Storage abstraction with an in-memory implementation.
//!
//! Mutations go through closures executed under the store's per-key
//! lock, which is what makes read-modify-write on a single meeting or
//! participant row atomic. A closure may return a domain error to abort
//! the update without changing anything.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::AppError;
use crate::meeting::Meeting;
use crate::participant::Participant;
use parley_common::UserId;

pub type MeetingMutation<'a> = &'a (dyn Fn(&mut Meeting) -> Result<(), AppError> + Send + Sync);
pub type ParticipantMutation<'a> =
    &'a (dyn Fn(&mut Participant) -> Result<(), AppError> + Send + Sync);

/// Trait for storage backends
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Insert a meeting under its code. Fails with `DuplicateCode` if
    /// the code is already taken; callers retry with a fresh code.
    async fn insert_meeting(&self, meeting: Meeting) -> Result<(), AppError>;

    /// Fetch a meeting by code, soft-deleted rows included.
    async fn get_meeting(&self, code: &str) -> Result<Option<Meeting>, AppError>;

    /// Run `mutate` against the meeting under its per-key lock and
    /// return the updated row. `NotFound` if the code is unknown or the
    /// meeting is soft-deleted.
    async fn update_meeting(
        &self,
        code: &str,
        mutate: MeetingMutation<'_>,
    ) -> Result<Meeting, AppError>;

    /// Insert a membership row. At most one active row may exist per
    /// (meeting, user); a second one fails with `AlreadyMember`.
    async fn insert_participant(&self, participant: Participant) -> Result<Participant, AppError>;

    /// The active membership row for a user, if any.
    async fn get_active_participant(
        &self,
        code: &str,
        user_id: UserId,
    ) -> Result<Option<Participant>, AppError>;

    /// Run `mutate` against the active membership row under the lock.
    async fn update_participant(
        &self,
        code: &str,
        user_id: UserId,
        mutate: ParticipantMutation<'_>,
    ) -> Result<Participant, AppError>;

    /// Soft-delete the active membership row, stamping `leave_time`.
    /// The row is retained as history.
    async fn soft_delete_participant(
        &self,
        code: &str,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Participant, AppError>;

    /// All active membership rows for a meeting.
    async fn list_active_participants(&self, code: &str) -> Result<Vec<Participant>, AppError>;

    /// Record a revoked token id until its expiry.
    async fn insert_revocation(&self, jti: &str, expires_at: DateTime<Utc>)
        -> Result<(), AppError>;

    /// Whether a token id has been revoked. Read-after-write consistent
    /// with `insert_revocation`.
    async fn is_revoked(&self, jti: &str) -> Result<bool, AppError>;

    /// Drop revocation entries whose token has expired anyway. Returns
    /// the number of entries removed.
    async fn purge_expired_revocations(&self, now: DateTime<Utc>) -> Result<usize, AppError>;
}

/// In-memory implementation backed by `DashMap`. Participant rows are
/// grouped per meeting code; soft-deleted rows stay in the vector.
#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<MemStoreInner>,
}

#[derive(Default)]
struct MemStoreInner {
    meetings: DashMap<String, Meeting>,
    participants: DashMap<String, Vec<Participant>>,
    revocations: DashMap<String, DateTime<Utc>>,
}

#[async_trait]
impl Store for MemStore {
    async fn insert_meeting(&self, meeting: Meeting) -> Result<(), AppError> {
        match self.inner.meetings.entry(meeting.code.clone()) {
            Entry::Occupied(_) => Err(AppError::DuplicateCode),
            Entry::Vacant(slot) => {
                slot.insert(meeting);
                Ok(())
            },
        }
    }

    async fn get_meeting(&self, code: &str) -> Result<Option<Meeting>, AppError> {
        Ok(self.inner.meetings.get(code).map(|m| m.clone()))
    }

    async fn update_meeting(
        &self,
        code: &str,
        mutate: MeetingMutation<'_>,
    ) -> Result<Meeting, AppError> {
        let mut entry = self
            .inner
            .meetings
            .get_mut(code)
            .filter(|m| !m.is_deleted)
            .ok_or_else(|| AppError::NotFound("Meeting not found".to_string()))?;
        // Mutate a copy and commit on success, so a closure that aborts
        // leaves the row untouched.
        let mut updated = entry.clone();
        mutate(&mut updated)?;
        *entry.value_mut() = updated.clone();
        Ok(updated)
    }

    async fn insert_participant(&self, participant: Participant) -> Result<Participant, AppError> {
        let mut rows = self
            .inner
            .participants
            .entry(participant.meeting_code.clone())
            .or_default();
        if rows
            .iter()
            .any(|p| p.user_id == participant.user_id && !p.is_deleted)
        {
            return Err(AppError::AlreadyMember);
        }
        rows.push(participant.clone());
        Ok(participant)
    }

    async fn get_active_participant(
        &self,
        code: &str,
        user_id: UserId,
    ) -> Result<Option<Participant>, AppError> {
        Ok(self.inner.participants.get(code).and_then(|rows| {
            rows.iter()
                .find(|p| p.user_id == user_id && !p.is_deleted)
                .cloned()
        }))
    }

    async fn update_participant(
        &self,
        code: &str,
        user_id: UserId,
        mutate: ParticipantMutation<'_>,
    ) -> Result<Participant, AppError> {
        let mut rows = self
            .inner
            .participants
            .get_mut(code)
            .ok_or_else(|| AppError::NotFound("Participant not found in meeting".to_string()))?;
        let row = rows
            .iter_mut()
            .find(|p| p.user_id == user_id && !p.is_deleted)
            .ok_or_else(|| AppError::NotFound("Participant not found in meeting".to_string()))?;
        let mut updated = row.clone();
        mutate(&mut updated)?;
        *row = updated.clone();
        Ok(updated)
    }

    async fn soft_delete_participant(
        &self,
        code: &str,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Participant, AppError> {
        let mutate = move |p: &mut Participant| -> Result<(), AppError> {
            p.is_deleted = true;
            p.is_online = false;
            p.leave_time = Some(now);
            Ok(())
        };
        self.update_participant(code, user_id, &mutate).await
    }

    async fn list_active_participants(&self, code: &str) -> Result<Vec<Participant>, AppError> {
        Ok(self
            .inner
            .participants
            .get(code)
            .map(|rows| rows.iter().filter(|p| !p.is_deleted).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert_revocation(
        &self,
        jti: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        self.inner.revocations.insert(jti.to_string(), expires_at);
        Ok(())
    }

    async fn is_revoked(&self, jti: &str) -> Result<bool, AppError> {
        Ok(self.inner.revocations.contains_key(jti))
    }

    async fn purge_expired_revocations(&self, now: DateTime<Utc>) -> Result<usize, AppError> {
        // Count inside retain: a before/after length diff would race
        // with concurrent inserts.
        let removed = AtomicUsize::new(0);
        self.inner.revocations.retain(|_, expires_at| {
            if *expires_at > now {
                true
            } else {
                removed.fetch_add(1, Ordering::Relaxed);
                false
            }
        });
        Ok(removed.into_inner())
    }
}
