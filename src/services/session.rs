use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OwnedMutexGuard;
use utoipa::ToSchema;

use crate::utils::keyed_mutex::KeyedMutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    Accumulating,
    Merging,
    Classifying,
    /// Carries the catalog id of the committed record
    Committed(i32),
    Aborted,
}

#[derive(Debug, Clone)]
pub struct UploadSession {
    pub file_id: String,
    pub owner_id: String,
    pub file_size: u64,
    pub final_name: String,
    /// order -> (offset, limit)
    pub received: BTreeMap<u64, (u64, u64)>,
    pub phase: UploadPhase,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub last_activity: Instant,
}

impl UploadSession {
    /// True once the received ranges tile `[0, file_size)` exactly. Orders
    /// form a dense run starting at 0 or 1 (clients number either way),
    /// offsets are contiguous and the last range ends at the declared size.
    pub fn is_complete(&self) -> bool {
        let base = match self.received.keys().next() {
            Some(first) if *first <= 1 => *first,
            _ => return false,
        };
        let mut expected_offset = 0u64;
        for (index, (order, (offset, limit))) in self.received.iter().enumerate() {
            if *order != base + index as u64 || *offset != expected_offset || limit <= offset {
                return false;
            }
            expected_offset = *limit;
        }
        !self.received.is_empty() && expected_offset == self.file_size
    }

    pub fn received_bytes(&self) -> u64 {
        self.received.values().map(|(offset, limit)| limit - offset).sum()
    }
}

/// What a new chunk finds when it arrives for a file id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    New,
    Open,
    Committed(i32),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("upload belongs to another user")]
    OwnerMismatch,
    #[error("declared file size {declared} differs from {expected} given earlier")]
    SizeMismatch { expected: u64, declared: u64 },
}

/// Snapshot of progress after a chunk was recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub received_chunks: usize,
    pub received_bytes: u64,
    pub complete: bool,
}

/// In-flight upload, as reported to its owner.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub received_chunks: usize,
    pub received_bytes: u64,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// In-memory upload progress plus the per-file-id lock registry.
///
/// Callers hold the lock from [`SessionTracker::lock`] around every mutation
/// for that file id; reads go straight to the map.
#[derive(Debug, Clone, Default)]
pub struct SessionTracker {
    sessions: Arc<DashMap<String, UploadSession>>,
    locks: KeyedMutex,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, file_id: &str) -> OwnedMutexGuard<()> {
        self.locks.lock(file_id).await
    }

    pub fn get(&self, file_id: &str) -> Option<UploadSession> {
        self.sessions.get(file_id).map(|s| s.clone())
    }

    /// Checks ownership and size consistency before a chunk is stored.
    pub fn observe(
        &self,
        file_id: &str,
        owner_id: &str,
        file_size: u64,
    ) -> Result<SessionState, SessionError> {
        let Some(session) = self.sessions.get(file_id) else {
            return Ok(SessionState::New);
        };
        if session.owner_id != owner_id {
            return Err(SessionError::OwnerMismatch);
        }
        if let UploadPhase::Committed(record_id) = session.phase {
            return Ok(SessionState::Committed(record_id));
        }
        if session.file_size != file_size {
            return Err(SessionError::SizeMismatch {
                expected: session.file_size,
                declared: file_size,
            });
        }
        Ok(SessionState::Open)
    }

    /// Records a stored chunk, creating the session on first sight.
    pub fn record_chunk(
        &self,
        file_id: &str,
        owner_id: &str,
        file_size: u64,
        final_name: &str,
        order: u64,
        range: (u64, u64),
    ) -> Progress {
        let mut session = self
            .sessions
            .entry(file_id.to_string())
            .or_insert_with(|| UploadSession {
                file_id: file_id.to_string(),
                owner_id: owner_id.to_string(),
                file_size,
                final_name: final_name.to_string(),
                received: BTreeMap::new(),
                phase: UploadPhase::Accumulating,
                started_at: chrono::Utc::now(),
                last_activity: Instant::now(),
            });

        session.final_name = final_name.to_string();
        session.received.insert(order, range);
        session.phase = UploadPhase::Accumulating;
        session.last_activity = Instant::now();

        Progress {
            received_chunks: session.received.len(),
            received_bytes: session.received_bytes(),
            complete: session.is_complete(),
        }
    }

    pub fn set_phase(&self, file_id: &str, phase: UploadPhase) {
        if let Some(mut session) = self.sessions.get_mut(file_id) {
            session.phase = phase;
            session.last_activity = Instant::now();
        }
    }

    /// Leaves a tombstone so a replayed final chunk resolves to the same record.
    pub fn commit(&self, file_id: &str, record_id: i32) {
        if let Some(mut session) = self.sessions.get_mut(file_id) {
            session.phase = UploadPhase::Committed(record_id);
            session.received.clear();
            session.last_activity = Instant::now();
        }
    }

    pub fn abort(&self, file_id: &str) -> Option<UploadSession> {
        self.sessions.remove(file_id).map(|(_, mut session)| {
            session.phase = UploadPhase::Aborted;
            session
        })
    }

    /// Drops a tombstone whose record no longer exists.
    pub fn forget(&self, file_id: &str) {
        self.sessions.remove(file_id);
    }

    pub fn in_progress_for(&self, owner_id: &str) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .filter(|s| s.owner_id == owner_id && !matches!(s.phase, UploadPhase::Committed(_)))
            .map(|s| SessionSummary {
                file_id: s.file_id.clone(),
                file_name: s.final_name.clone(),
                file_size: s.file_size,
                received_chunks: s.received.len(),
                received_bytes: s.received_bytes(),
                started_at: s.started_at,
            })
            .collect();
        summaries.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        summaries
    }

    pub fn is_active(&self, file_id: &str) -> bool {
        self.sessions
            .get(file_id)
            .is_some_and(|s| !matches!(s.phase, UploadPhase::Committed(_)))
    }

    /// Removes sessions idle for longer than `max_idle`. Returns the ids of the
    /// removed sessions that never committed, whose chunks are now orphaned.
    pub fn expire_idle(&self, max_idle: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut abandoned = Vec::new();
        self.sessions.retain(|file_id, session| {
            let idle = now.saturating_duration_since(session.last_activity) >= max_idle;
            if idle && !matches!(session.phase, UploadPhase::Committed(_)) {
                abandoned.push(file_id.clone());
            }
            !idle
        });
        abandoned
    }

    /// Prunes lock entries nobody holds. Returns how many were dropped.
    pub fn prune_locks(&self) -> usize {
        self.locks.cleanup()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
