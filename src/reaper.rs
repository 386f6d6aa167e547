use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::{Engine, EngineError};
use crate::model::{Actor, OutboxStats};

/// Expire lapsed holds, then overdue packages. Returns how many of each.
pub async fn reap_once(engine: &Engine) -> Result<(usize, usize), EngineError> {
    let operator = Actor::operator();
    let holds = engine.expire_holds(&operator).await?;
    let packages = engine.expire_packages(&operator).await?;
    Ok((holds.len(), packages.len()))
}

/// Background task that periodically expires lapsed holds and overdue packages.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if let Err(e) = reap_once(&engine).await {
            tracing::warn!("reaper cycle failed: {e}");
        }
    }
}

/// Drains the outbox into user notifications.
pub struct OutboxWorker {
    engine: Arc<Engine>,
}

impl OutboxWorker {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub async fn run_once(&self) -> Result<OutboxStats, EngineError> {
        self.engine.run_outbox_cycle().await
    }

    pub async fn run(self, every: Duration) {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match self.run_once().await {
                Ok(_) => self.engine.notify.prune(),
                Err(e) => tracing::warn!("outbox cycle failed: {e}"),
            }
        }
    }
}

/// Compact the WAL if enough appends have accumulated. Returns whether it ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    engine.compact_wal().await?;
    metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
    info!("compacted WAL after {appends} appends");
    Ok(true)
}

/// Background task that compacts the WAL once it crosses `threshold` appends.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&engine, threshold).await {
            tracing::error!("WAL compaction failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::config::Policy;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    const T0: Ms = 1_800_000_000_000;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("lessonbook_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn engine_with_hold(name: &str) -> (Arc<Engine>, Clock, Ulid, Ulid) {
        let clock = Clock::manual(T0);
        let engine = Arc::new(
            Engine::new(test_wal_path(name), Arc::new(NotifyHub::new()), clock.clone(), Policy::default()).unwrap(),
        );
        let admin = Actor::operator();
        let student = Ulid::new();
        let teacher = Ulid::new();
        engine
            .register_user(None, student, "s@example.com", Role::Student, "S", "lesson-pass")
            .await
            .unwrap();
        engine
            .register_user(Some(&admin), teacher, "t@example.com", Role::Teacher, "T", "lesson-pass")
            .await
            .unwrap();
        let package = Ulid::new();
        engine
            .create_package(&admin, package, student, 2, T0 + DAY_MS)
            .await
            .unwrap();
        let slot = Ulid::new();
        engine
            .create_slot(&admin, slot, teacher, T0 + HOUR_MS, T0 + 2 * HOUR_MS)
            .await
            .unwrap();
        let booking = Ulid::new();
        engine
            .hold_booking(&Actor::new(student, Role::Student), booking, slot, package)
            .await
            .unwrap();
        (engine, clock, booking, package)
    }

    #[tokio::test]
    async fn reaper_expires_holds_and_packages() {
        let (engine, clock, _booking, _package) = engine_with_hold("reap.wal").await;
        assert_eq!(reap_once(&engine).await.unwrap(), (0, 0));

        clock.advance(10 * MINUTE_MS);
        assert_eq!(reap_once(&engine).await.unwrap(), (1, 0));

        clock.advance(DAY_MS);
        assert_eq!(reap_once(&engine).await.unwrap(), (0, 1));
        assert_eq!(reap_once(&engine).await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn outbox_worker_drains_pending_rows() {
        let (engine, _clock, _booking, _package) = engine_with_hold("outbox_worker.wal").await;
        let worker = OutboxWorker::new(engine.clone());

        let stats = worker.run_once().await.unwrap();
        // package.created notifies the student, hold.created nobody.
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.dispatched, 1);
        assert_eq!(worker.run_once().await.unwrap(), OutboxStats::default());
    }

    #[tokio::test]
    async fn compactor_respects_threshold() {
        let (engine, _clock, _booking, _package) = engine_with_hold("compactor.wal").await;
        let appends = engine.wal_appends_since_compact().await;
        assert!(appends >= 5);

        assert!(!compact_if_due(&engine, appends + 1).await.unwrap());
        assert!(compact_if_due(&engine, appends).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }
}
