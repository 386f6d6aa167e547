use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::{Config, Policy};
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::reaper::{self, OutboxWorker};

/// Tenant for connections that name no database.
pub const DEFAULT_TENANT: &str = "default";

/// Manages per-tenant engines. Each tenant is one marketplace with its own
/// Engine, WAL and background workers. Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    worker_interval: Duration,
    policy: Policy,
    clock: Clock,
    shutdown: CancellationToken,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            worker_interval: Duration::from_secs(5),
            policy: Policy::default(),
            clock: Clock::system(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.data_dir.clone(), config.compact_threshold)
            .with_policy(config.policy)
            .with_worker_interval(config.worker_interval)
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_worker_interval(mut self, every: Duration) -> Self {
        self.worker_interval = every;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Get or lazily create an engine for the given tenant.
    ///
    /// The tenant name is also its WAL file name, so it is limited to ASCII
    /// letters, digits, `_` and `-`, and compared case-insensitively. Two
    /// names that map to the same file always share one engine.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        let key = tenant_key(tenant)?;
        if let Some(engine) = self.engines.get(&key) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Two connections may race to open the same tenant; only one engine may own its WAL.
        let entry = self.engines.entry(key.clone());
        if let Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{key}.wal"));
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(wal_path, notify, self.clock.clone(), self.policy)?);
        entry.or_insert(engine.clone());

        let every = self.worker_interval;
        self.spawn_worker(reaper::run_reaper(engine.clone(), every));
        self.spawn_worker(OutboxWorker::new(engine.clone()).run(every));
        self.spawn_worker(reaper::run_compactor(engine.clone(), self.compact_threshold, every));

        tracing::info!("opened tenant {key}");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    fn spawn_worker(&self, task: impl Future<Output = ()> + Send + 'static) {
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = task => {}
            }
        });
    }

    /// Stop every tenant's background workers. Engines stay usable.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        tracing::info!("stopped background workers for {} tenants", self.engines.len());
    }
}

fn tenant_key(tenant: &str) -> std::io::Result<String> {
    let invalid = |msg: &str| std::io::Error::new(std::io::ErrorKind::InvalidInput, msg.to_string());
    if tenant.is_empty() {
        return Err(invalid("empty tenant name"));
    }
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(invalid("tenant name too long"));
    }
    if !tenant.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(invalid("tenant names may only contain ASCII letters, digits, '_' and '-'"));
    }
    Ok(tenant.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("lessonbook_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = TenantManager::new(dir, 1000);

        let eng_a = tm.get_or_create("studio_a").unwrap();
        let eng_b = tm.get_or_create("studio_b").unwrap();

        // Same user id and e-mail in both tenants.
        let uid = Ulid::new();
        eng_a
            .register_user(None, uid, "ana@example.com", Role::Student, "Ana", "lesson-pass")
            .await
            .unwrap();
        eng_b
            .register_user(None, uid, "ana@example.com", Role::Student, "Ana", "lesson-pass")
            .await
            .unwrap();

        eng_a.set_user_active(&Actor::operator(), uid, false).await.unwrap();
        assert!(eng_a.resolve_actor(uid).await.is_err());
        assert!(eng_b.resolve_actor(uid).await.is_ok());
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = TenantManager::new(dir.clone(), 1000);

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = TenantManager::new(dir, 1000);

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_settings_reach_engine() {
        let dir = test_data_dir("settings");
        let mut policy = Policy::default();
        policy.booking.hold_ms = 2 * MINUTE_MS;
        let clock = Clock::manual(1_800_000_000_000);
        let tm = TenantManager::new(dir, 1000)
            .with_policy(policy)
            .with_clock(clock.clone());

        let engine = tm.get_or_create("settings").unwrap();
        assert_eq!(engine.policy().booking.hold_ms, 2 * MINUTE_MS);
        assert_eq!(engine.now(), 1_800_000_000_000);
        clock.advance(1);
        assert_eq!(engine.now(), 1_800_000_000_001);
    }

    #[tokio::test]
    async fn shutdown_stops_workers() {
        let dir = test_data_dir("shutdown");
        let clock = Clock::manual(1_800_000_000_000);
        let tm = TenantManager::new(dir, 1000)
            .with_clock(clock.clone())
            .with_worker_interval(Duration::from_millis(10));
        let engine = tm.get_or_create("studio").unwrap();
        tm.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // With the reaper gone, a lapsed hold stays until someone sweeps it.
        let admin = Actor::operator();
        let student = Ulid::new();
        let teacher = Ulid::new();
        engine.register_user(None, student, "s@example.com", Role::Student, "S", "lesson-pass").await.unwrap();
        engine
            .register_user(Some(&admin), teacher, "t@example.com", Role::Teacher, "T", "lesson-pass")
            .await
            .unwrap();
        let package = Ulid::new();
        engine
            .create_package(&admin, package, student, 1, clock.now() + DAY_MS)
            .await
            .unwrap();
        let slot = Ulid::new();
        engine
            .create_slot(&admin, slot, teacher, clock.now() + DAY_MS, clock.now() + DAY_MS + HOUR_MS)
            .await
            .unwrap();
        engine
            .hold_booking(&Actor::new(student, Role::Student), Ulid::new(), slot, package)
            .await
            .unwrap();
        clock.advance(HOUR_MS);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.expire_holds(&admin).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tenant_names_must_be_file_names() {
        let dir = test_data_dir("names");
        let tm = TenantManager::new(dir.clone(), 1000);

        for bad in ["../evil", "../..", "studio.one", "stu dio", ""] {
            let err = tm.get_or_create(bad).err().unwrap();
            assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput, "{bad:?}");
        }
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn names_sharing_a_wal_file_share_an_engine() {
        let dir = test_data_dir("aliases");
        let tm = TenantManager::new(dir.clone(), 1000);

        let upper = tm.get_or_create("StudioOne").unwrap();
        let lower = tm.get_or_create("studioone").unwrap();
        assert!(Arc::ptr_eq(&upper, &lower));

        let files: Vec<_> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(files, vec!["studioone.wal".to_string()]);
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = TenantManager::new(dir, 1000);

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let dir = test_data_dir("count_limit");
        let tm = TenantManager::new(dir, 1000);

        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }
}
