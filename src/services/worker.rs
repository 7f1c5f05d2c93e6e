use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::watch;
use tokio::time::{Duration, sleep};

use crate::services::chunk_store::ChunkStore;
use crate::services::session::SessionTracker;

/// Totals from one sweep, mostly for logs and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_sessions: usize,
    pub removed_chunks: usize,
    pub removed_orphans: usize,
    pub pruned_locks: usize,
}

/// Which half of the sweep a worker runs.
///
/// Session state is in-memory, so only the process serving uploads can expire
/// it. A standalone worker process shares nothing but the staging directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepScope {
    /// Idle sessions, committed tombstones and lock entries
    Sessions,
    /// Stale files left in the staging directory
    Staging,
    Both,
}

impl SweepScope {
    fn sessions(self) -> bool {
        matches!(self, SweepScope::Sessions | SweepScope::Both)
    }

    fn staging(self) -> bool {
        matches!(self, SweepScope::Staging | SweepScope::Both)
    }
}

pub struct BackgroundWorker {
    chunks: Arc<dyn ChunkStore>,
    sessions: SessionTracker,
    max_idle: Duration,
    interval: Duration,
    scope: SweepScope,
    shutdown: watch::Receiver<bool>,
}

impl BackgroundWorker {
    pub fn new(
        chunks: Arc<dyn ChunkStore>,
        sessions: SessionTracker,
        max_idle: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            chunks,
            sessions,
            max_idle,
            interval: Duration::from_secs(3600),
            scope: SweepScope::Both,
            shutdown,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_scope(mut self, scope: SweepScope) -> Self {
        self.scope = scope;
        self
    }

    pub async fn run(mut self) {
        tracing::info!(scope = ?self.scope, "🚀 Background worker started");

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    tracing::info!("🛑 Background worker shutting down");
                    break;
                }
                _ = sleep(self.interval) => {
                    self.sweep().await;
                }
            }
        }
    }

    pub async fn sweep(&self) -> SweepReport {
        tracing::info!("🧹 Sweeping stale upload state...");
        let mut report = SweepReport::default();

        if self.scope.sessions() {
            self.sweep_sessions(&mut report).await;
        }
        if self.scope.staging() {
            self.sweep_staging(&mut report).await;
        }
        if self.scope.sessions() {
            // Lock entries for ids nobody is working on
            report.pruned_locks = self.sessions.prune_locks();
        }

        tracing::info!(
            expired = report.expired_sessions,
            chunks = report.removed_chunks,
            orphans = report.removed_orphans,
            locks = report.pruned_locks,
            "✅ Sweep completed"
        );
        report
    }

    /// Idle sessions and their chunks
    async fn sweep_sessions(&self, report: &mut SweepReport) {
        let abandoned = self.sessions.expire_idle(self.max_idle);
        report.expired_sessions = abandoned.len();
        for file_id in &abandoned {
            let _guard = self.sessions.lock(file_id).await;
            // A new chunk may have revived the id while we waited
            if self.sessions.is_active(file_id) {
                continue;
            }
            report.removed_chunks += self.chunks.discard(file_id).await;
        }
    }

    /// Staged files nobody tracks any more (restarts, crashed merges)
    async fn sweep_staging(&self, report: &mut SweepReport) {
        match self.chunks.list_all().await {
            Ok(entries) => {
                let now = SystemTime::now();
                for entry in entries {
                    let age = now.duration_since(entry.modified).unwrap_or_default();
                    if age < self.max_idle {
                        continue;
                    }
                    let tracked = entry
                        .handle
                        .file_id()
                        .is_some_and(|id| self.sessions.is_active(id));
                    if tracked {
                        continue;
                    }
                    match self.chunks.remove(&entry.handle).await {
                        Ok(()) => report.removed_orphans += 1,
                        Err(e) => tracing::warn!(
                            chunk = %entry.handle.name,
                            "Failed to remove orphaned staging file: {}",
                            e
                        ),
                    }
                }
            }
            Err(e) => tracing::error!("Failed to list staging area: {}", e),
        }
    }
}
