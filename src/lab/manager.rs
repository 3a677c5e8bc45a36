//! Lab instance lifecycle management

use super::config::{LabConfig, LOGS_NOT_AVAILABLE};
use super::locks::PairLocks;
use crate::compose::{ComposeParser, PrimaryService};
use crate::container::{ContainerRuntime, ContainerSpec, Protocol, StatsSnapshot, Teardown};
use crate::error::{LabError, Result};
use crate::store::{InstanceStore, Lab, LabInstance, NewLabInstance};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const NAME_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Label keys set on every instance container
pub const LABEL_LAB: &str = "labrune.lab";
pub const LABEL_USER: &str = "labrune.user";

/// Outcome of an expiry sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Instances torn down and deactivated
    pub stopped: Vec<i64>,
    /// Instances whose teardown failed, with the reason; they stay active
    pub failed: Vec<(i64, String)>,
}

/// Provisions, tracks and reclaims per-user lab containers.
///
/// At most one active instance exists per `(lab_id, user_id)`: acquisitions
/// for the same pair are serialized in this process, and a live instance is
/// handed back instead of creating a second container.
pub struct LabManager {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn InstanceStore>,
    config: LabConfig,
    locks: PairLocks,
}

/// Unique container name for a lab/user pair
pub fn container_name(lab_id: i64, user_id: i64) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8)
        .map(|_| NAME_ALPHABET[rng.gen_range(0..NAME_ALPHABET.len())] as char)
        .collect();
    format!("lab_{}_{}_{}", lab_id, user_id, suffix)
}

fn teardown_error(container_id: &str, e: LabError) -> LabError {
    match e {
        LabError::RuntimeUnavailable | LabError::TeardownFailed { .. } => e,
        other => LabError::TeardownFailed {
            container: container_id.to_string(),
            message: other.to_string(),
        },
    }
}

impl LabManager {
    /// Create a new lab manager
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn InstanceStore>,
        config: LabConfig,
    ) -> Self {
        if !runtime.is_available() {
            warn!("Container runtime unavailable; only read operations will succeed");
        }

        Self {
            runtime,
            store,
            config,
            locks: PairLocks::new(),
        }
    }

    /// Provisioning settings
    pub fn config(&self) -> &LabConfig {
        &self.config
    }

    /// Whether the container runtime is connected
    pub fn runtime_available(&self) -> bool {
        self.runtime.is_available()
    }

    /// Get an instance by ID
    pub fn instance(&self, instance_id: i64) -> Result<LabInstance> {
        self.store
            .instance(instance_id)?
            .ok_or(LabError::InstanceNotFound(instance_id))
    }

    /// Return the user's live instance of a lab, creating one if needed
    pub async fn acquire(&self, lab_id: i64, user_id: i64) -> Result<LabInstance> {
        self.acquire_at(lab_id, user_id, Utc::now()).await
    }

    /// [`acquire`](Self::acquire) against an explicit clock reading
    pub async fn acquire_at(
        &self,
        lab_id: i64,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<LabInstance> {
        let lab = self
            .store
            .lab(lab_id)?
            .ok_or(LabError::LabNotFound(lab_id))?;
        let user = self
            .store
            .user(user_id)?
            .ok_or(LabError::UserNotFound(user_id))?;

        let pair = self.locks.get(lab_id, user_id)?;
        let _held = pair.lock().await;

        if let Some(existing) = self.store.active_instance(lab_id, user_id)? {
            if !existing.is_expired(now) {
                debug!(
                    "Reusing instance {} of lab {} for user {}",
                    existing.id, lab_id, user.username
                );
                return Ok(existing);
            }

            info!("Instance {} expired, replacing it", existing.id);
            self.store.deactivate(existing.id)?;
            if let Some(container_id) = existing.container_id.as_deref() {
                // The row is already inactive, so no sweep will retry this
                if let Err(e) = self.teardown(container_id).await {
                    error!(
                        "Failed to remove expired container {} of instance {}, it must be removed manually: {}",
                        container_id, existing.id, e
                    );
                }
            }
        }

        let spec = self.container_spec(&lab, user_id).await?;

        let handle = self
            .runtime
            .create_container(&spec)
            .await
            .map_err(|e| match e {
                LabError::RuntimeUnavailable | LabError::InstanceCreationFailed(_) => e,
                other => LabError::InstanceCreationFailed(other.to_string()),
            })
            .inspect_err(|e| error!("Failed to create lab instance: {}", e))?;

        let (container_ip, container_port) =
            self.resolve_address(&handle.id, lab.target_port).await;

        let record = NewLabInstance {
            lab_id,
            user_id,
            container_id: handle.id.clone(),
            container_name: handle.name.clone(),
            container_ip,
            container_port,
            expires_at: lab.time_limit.then(|| now + self.config.lifetime()),
            created_at: now,
        };

        match self.store.insert_instance(record) {
            Ok(instance) => {
                info!(
                    "Created lab instance: {} for user {}",
                    handle.name, user.username
                );
                Ok(instance)
            }
            Err(e) => {
                error!("Failed to record instance {}: {}", handle.name, e);
                if let Err(cleanup) = self.teardown(&handle.id).await {
                    warn!("Failed to remove unrecorded container {}: {}", handle.id, cleanup);
                }
                Err(e)
            }
        }
    }

    /// Stop and remove an instance's container and deactivate it.
    ///
    /// A container the runtime no longer knows counts as stopped. On any
    /// other runtime failure the instance stays active so it can be retried.
    pub async fn stop(&self, instance_id: i64) -> Result<LabInstance> {
        let instance = self.instance(instance_id)?;

        if let Some(container_id) = instance.container_id.as_deref() {
            self.teardown(container_id)
                .await
                .inspect_err(|e| error!("Failed to stop lab instance {}: {}", instance_id, e))?;
        }

        self.store.deactivate(instance.id)?;

        Ok(LabInstance {
            is_active: false,
            ..instance
        })
    }

    /// Replace an instance with a fresh one for the same lab and user
    pub async fn reset(&self, instance_id: i64) -> Result<LabInstance> {
        let stopped = self.stop(instance_id).await?;
        self.acquire(stopped.lab_id, stopped.user_id).await
    }

    /// Stop every active instance whose expiry has passed
    pub async fn sweep_expired(&self) -> Result<SweepReport> {
        self.sweep_expired_at(Utc::now()).await
    }

    /// [`sweep_expired`](Self::sweep_expired) against an explicit clock reading
    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let expired = self.store.expired_instances(now)?;
        let mut report = SweepReport::default();

        for instance in expired {
            match self.stop(instance.id).await {
                Ok(_) => {
                    info!("Cleaned up expired instance: {}", instance.id);
                    report.stopped.push(instance.id);
                }
                Err(e) => {
                    error!("Failed to cleanup instance {}: {}", instance.id, e);
                    report.failed.push((instance.id, e.to_string()));
                }
            }
        }

        Ok(report)
    }

    /// Recent container output, or a placeholder when it cannot be read
    pub async fn logs(&self, instance_id: i64, tail: Option<usize>) -> Result<String> {
        let instance = self.instance(instance_id)?;
        let Some(container_id) = instance.container_id.as_deref() else {
            return Ok(LOGS_NOT_AVAILABLE.to_string());
        };

        let tail = tail.unwrap_or(self.config.log_tail);
        match self.runtime.logs(container_id, tail).await {
            Ok(logs) => Ok(logs),
            Err(e) => {
                error!("Failed to get instance logs: {}", e);
                Ok(LOGS_NOT_AVAILABLE.to_string())
            }
        }
    }

    /// One resource-usage sample, `None` when the runtime cannot provide it
    pub async fn stats(&self, instance_id: i64) -> Result<Option<StatsSnapshot>> {
        let instance = self.instance(instance_id)?;
        let Some(container_id) = instance.container_id.as_deref() else {
            return Ok(None);
        };

        match self.runtime.stats(container_id).await {
            Ok(stats) => Ok(Some(stats)),
            Err(e) => {
                error!("Failed to get container stats: {}", e);
                Ok(None)
            }
        }
    }

    /// Number of active instances
    pub fn active_count(&self) -> Result<usize> {
        self.store.active_count()
    }

    /// Every active instance
    pub fn active_instances(&self) -> Result<Vec<LabInstance>> {
        self.store.active_instances()
    }

    /// Active instances of one user
    pub fn user_active_instances(&self, user_id: i64) -> Result<Vec<LabInstance>> {
        self.store.user_active_instances(user_id)
    }

    async fn teardown(&self, container_id: &str) -> Result<()> {
        let stopped = self
            .runtime
            .stop(container_id)
            .await
            .map_err(|e| teardown_error(container_id, e))?;
        if stopped == Teardown::AlreadyGone {
            warn!("Container {} not found", container_id);
            return Ok(());
        }

        let removed = self
            .runtime
            .remove(container_id)
            .await
            .map_err(|e| teardown_error(container_id, e))?;
        if removed == Teardown::AlreadyGone {
            warn!("Container {} vanished before removal", container_id);
        }

        info!("Stopped container: {}", container_id);
        Ok(())
    }

    async fn container_spec(&self, lab: &Lab, user_id: i64) -> Result<ContainerSpec> {
        let name = container_name(lab.id, user_id);

        let mut spec = match lab.docker_compose.as_deref() {
            Some(definition) => self.compose_spec(lab, definition, &name)?,
            None => {
                let image = lab
                    .docker_image
                    .as_deref()
                    .filter(|i| !i.trim().is_empty())
                    .unwrap_or(self.config.base_image.as_str());
                ContainerSpec::new(&name, image)
            }
        };

        let network = match self.runtime.network_exists(&self.config.network).await {
            Ok(true) => Some(self.config.network.clone()),
            Ok(false) => None,
            Err(LabError::RuntimeUnavailable) => return Err(LabError::RuntimeUnavailable),
            Err(e) => {
                warn!("Failed to look up network {}: {}", self.config.network, e);
                None
            }
        };

        spec = spec
            .env("LAB_ID", &lab.id.to_string())
            .env("USER_ID", &user_id.to_string())
            .env("FLAG", &lab.flag)
            .resources(self.config.resources())
            .network(network)
            .label(LABEL_LAB, &lab.id.to_string())
            .label(LABEL_USER, &user_id.to_string());

        if let Some(port) = lab.target_port {
            spec = spec.port(port);
        }

        Ok(spec)
    }

    fn compose_spec(&self, lab: &Lab, definition: &str, name: &str) -> Result<ContainerSpec> {
        let config = ComposeParser::parse_str(definition)
            .map_err(|e| LabError::InstanceCreationFailed(e.to_string()))?;
        let primary = PrimaryService::select(&config, lab.target_port)
            .map_err(|e| LabError::InstanceCreationFailed(e.to_string()))?;

        if !primary.dropped.is_empty() {
            warn!(
                "Lab {} defines {} services; only '{}' is provisioned, not starting: {}",
                lab.id,
                primary.dropped.len() + 1,
                primary.name,
                primary.dropped.join(", ")
            );
        }

        let image = match primary.service.image.as_deref() {
            Some(image) => image.to_string(),
            None => {
                warn!(
                    "Service '{}' of lab {} names no image, using {}",
                    primary.name, lab.id, self.config.base_image
                );
                self.config.base_image.clone()
            }
        };

        let mut spec = ContainerSpec::new(name, &image).cmd(primary.service.command_args());
        for (key, value) in primary.service.env_pairs() {
            spec = spec.env(&key, &value);
        }
        Ok(spec)
    }

    async fn resolve_address(
        &self,
        container_id: &str,
        target_port: Option<u16>,
    ) -> (Option<String>, Option<u16>) {
        match self.runtime.inspect(container_id).await {
            Ok(attrs) => {
                let port = target_port.and_then(|p| attrs.host_port(p, Protocol::Tcp));
                (attrs.primary_ip(), port)
            }
            Err(e) => {
                warn!("Failed to resolve address of container {}: {}", container_id, e);
                (None, None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::fake::FakeRuntime;
    use crate::store::{MemoryStore, NewLab, SqliteStore, User};
    use chrono::{Duration, TimeZone};

    /// Memory store whose instance inserts always fail
    struct FailingInserts(MemoryStore);

    impl InstanceStore for FailingInserts {
        fn lab(&self, lab_id: i64) -> Result<Option<Lab>> {
            self.0.lab(lab_id)
        }

        fn user(&self, user_id: i64) -> Result<Option<User>> {
            self.0.user(user_id)
        }

        fn instance(&self, instance_id: i64) -> Result<Option<LabInstance>> {
            self.0.instance(instance_id)
        }

        fn active_instance(&self, lab_id: i64, user_id: i64) -> Result<Option<LabInstance>> {
            self.0.active_instance(lab_id, user_id)
        }

        fn insert_instance(&self, _instance: NewLabInstance) -> Result<LabInstance> {
            Err(LabError::Store("disk full".to_string()))
        }

        fn deactivate(&self, instance_id: i64) -> Result<()> {
            self.0.deactivate(instance_id)
        }

        fn expired_instances(&self, now: DateTime<Utc>) -> Result<Vec<LabInstance>> {
            self.0.expired_instances(now)
        }

        fn active_count(&self) -> Result<usize> {
            self.0.active_count()
        }

        fn active_instances(&self) -> Result<Vec<LabInstance>> {
            self.0.active_instances()
        }

        fn user_active_instances(&self, user_id: i64) -> Result<Vec<LabInstance>> {
            self.0.user_active_instances(user_id)
        }

        fn insert_lab(&self, lab: NewLab) -> Result<Lab> {
            self.0.insert_lab(lab)
        }

        fn labs(&self) -> Result<Vec<Lab>> {
            self.0.labs()
        }

        fn insert_user(&self, username: &str) -> Result<User> {
            self.0.insert_user(username)
        }
    }

    struct Fixture {
        runtime: Arc<FakeRuntime>,
        store: Arc<dyn InstanceStore>,
        manager: LabManager,
    }

    fn fixture_with(runtime: FakeRuntime, store: Arc<dyn InstanceStore>) -> Fixture {
        let runtime = Arc::new(runtime);
        let manager = LabManager::new(runtime.clone(), store.clone(), LabConfig::default());
        Fixture {
            runtime,
            store,
            manager,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(FakeRuntime::new(), Arc::new(MemoryStore::new()))
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap()
    }

    fn web_lab(store: &dyn InstanceStore, time_limit: bool) -> Lab {
        store
            .insert_lab(
                NewLab::new("web-101", "CTF{web_101}")
                    .image("ctf/web:latest")
                    .target_port(8080)
                    .time_limit(time_limit),
            )
            .unwrap()
    }

    fn users(store: &dyn InstanceStore, n: usize) -> Vec<User> {
        (1..=n)
            .map(|i| store.insert_user(&format!("user{}", i)).unwrap())
            .collect()
    }

    #[test]
    fn test_container_name_format() {
        let a = container_name(3, 42);
        let b = container_name(3, 42);
        assert!(a.starts_with("lab_3_42_"));
        let suffix = &a["lab_3_42_".len()..];
        assert_eq!(suffix.len(), 8);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_acquire_creates_one_container() {
        let f = fixture();
        let lab = web_lab(f.store.as_ref(), true);
        let user = &users(f.store.as_ref(), 1)[0];

        let instance = f.manager.acquire_at(lab.id, user.id, t0()).await.unwrap();

        let created = f.runtime.created();
        assert_eq!(created.len(), 1);
        let (container_id, spec) = &created[0];
        assert_eq!(instance.container_id.as_deref(), Some(container_id.as_str()));
        assert_eq!(instance.container_name.as_deref(), Some(spec.name.as_str()));
        assert!(instance.is_active);
        assert_eq!(instance.container_ip.as_deref(), Some("172.20.0.2"));
        assert_eq!(instance.container_port, Some(49153));
        assert_eq!(instance.expires_at, Some(t0() + Duration::hours(4)));
        assert_eq!(f.manager.active_count().unwrap(), 1);

        assert_eq!(spec.image, "ctf/web:latest");
        assert_eq!(spec.env["LAB_ID"], lab.id.to_string());
        assert_eq!(spec.env["USER_ID"], user.id.to_string());
        assert_eq!(spec.env["FLAG"], "CTF{web_101}");
        assert_eq!(spec.ports.len(), 1);
        assert_eq!(spec.ports[0].key(), "8080/tcp");
        assert_eq!(spec.ports[0].host_port, None);
        assert_eq!(spec.resources.memory_limit, Some(512 * 1024 * 1024));
        assert_eq!(spec.resources.cpu_quota, Some(50000));
        assert_eq!(spec.network, None);
        assert_eq!(spec.labels[LABEL_LAB], lab.id.to_string());
    }

    #[tokio::test]
    async fn test_acquire_is_idempotent() {
        let f = fixture();
        let lab = web_lab(f.store.as_ref(), true);
        let user = &users(f.store.as_ref(), 1)[0];

        let first = f.manager.acquire_at(lab.id, user.id, t0()).await.unwrap();
        let second = f
            .manager
            .acquire_at(lab.id, user.id, t0() + Duration::minutes(30))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(f.runtime.created_count(), 1);
        assert_eq!(f.manager.active_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_untimed_lab_never_expires() {
        let f = fixture();
        let lab = web_lab(f.store.as_ref(), false);
        let user = &users(f.store.as_ref(), 1)[0];

        let first = f.manager.acquire_at(lab.id, user.id, t0()).await.unwrap();
        assert_eq!(first.expires_at, None);

        let later = f
            .manager
            .acquire_at(lab.id, user.id, t0() + Duration::days(100))
            .await
            .unwrap();
        assert_eq!(later.id, first.id);
        assert_eq!(f.runtime.created_count(), 1);

        let report = f
            .manager
            .sweep_expired_at(t0() + Duration::days(365))
            .await
            .unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test]
    async fn test_expired_instance_is_replaced() {
        let f = fixture();
        let lab = web_lab(f.store.as_ref(), true);
        let user = &users(f.store.as_ref(), 1)[0];

        let old = f.manager.acquire_at(lab.id, user.id, t0()).await.unwrap();
        let later = t0() + Duration::hours(5);
        let new = f.manager.acquire_at(lab.id, user.id, later).await.unwrap();

        assert_ne!(new.id, old.id);
        assert_ne!(new.container_id, old.container_id);
        assert_eq!(new.expires_at, Some(later + Duration::hours(4)));
        assert!(!f.manager.instance(old.id).unwrap().is_active);
        assert_eq!(f.runtime.created_count(), 2);

        let old_container = old.container_id.unwrap();
        assert_eq!(f.runtime.stops(), vec![old_container.clone()]);
        assert!(!f.runtime.is_running(&old_container));
        assert_eq!(f.manager.active_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_acquire_unknown_lab_or_user() {
        let f = fixture();
        let lab = web_lab(f.store.as_ref(), true);
        let user = &users(f.store.as_ref(), 1)[0];

        let err = f.manager.acquire_at(99, user.id, t0()).await.unwrap_err();
        assert!(matches!(err, LabError::LabNotFound(99)));
        let err = f.manager.acquire_at(lab.id, 99, t0()).await.unwrap_err();
        assert!(matches!(err, LabError::UserNotFound(99)));
        assert_eq!(f.runtime.created_count(), 0);
    }

    #[tokio::test]
    async fn test_creation_failure_persists_nothing() {
        let f = fixture();
        let lab = web_lab(f.store.as_ref(), true);
        let user = &users(f.store.as_ref(), 1)[0];
        f.runtime.set_fail_create(true);

        let err = f.manager.acquire_at(lab.id, user.id, t0()).await.unwrap_err();
        assert!(matches!(err, LabError::InstanceCreationFailed(_)));
        assert!(err.is_retryable());
        assert_eq!(f.manager.active_count().unwrap(), 0);

        f.runtime.set_fail_create(false);
        let instance = f.manager.acquire_at(lab.id, user.id, t0()).await.unwrap();
        assert!(instance.is_active);
    }

    #[tokio::test]
    async fn test_unavailable_runtime() {
        let f = fixture_with(FakeRuntime::unavailable(), Arc::new(MemoryStore::new()));
        let lab = web_lab(f.store.as_ref(), true);
        let user = &users(f.store.as_ref(), 1)[0];
        assert!(!f.manager.runtime_available());

        let err = f.manager.acquire_at(lab.id, user.id, t0()).await.unwrap_err();
        assert!(matches!(err, LabError::RuntimeUnavailable));
        assert_eq!(f.manager.active_count().unwrap(), 0);

        let row = f
            .store
            .insert_instance(NewLabInstance {
                lab_id: lab.id,
                user_id: user.id,
                container_id: "gone".to_string(),
                container_name: "lab_1_1_gone".to_string(),
                container_ip: None,
                container_port: None,
                expires_at: None,
                created_at: t0(),
            })
            .unwrap();
        assert_eq!(f.manager.logs(row.id, None).await.unwrap(), LOGS_NOT_AVAILABLE);
        assert_eq!(f.manager.stats(row.id).await.unwrap(), None);

        let err = f.manager.stop(row.id).await.unwrap_err();
        assert!(matches!(err, LabError::RuntimeUnavailable));
        assert!(f.manager.instance(row.id).unwrap().is_active);
    }

    #[tokio::test]
    async fn test_unresolved_address_is_tolerated() {
        let f = fixture();
        let lab = web_lab(f.store.as_ref(), true);
        let people = users(f.store.as_ref(), 2);

        f.runtime.set_fail_inspect(true);
        let first = f.manager.acquire_at(lab.id, people[0].id, t0()).await.unwrap();
        assert!(first.is_active);
        assert_eq!(first.container_ip, None);
        assert_eq!(first.container_port, None);

        f.runtime.set_fail_inspect(false);
        f.runtime.set_address(None, None);
        let second = f.manager.acquire_at(lab.id, people[1].id, t0()).await.unwrap();
        assert_eq!(second.container_ip, None);
        assert_eq!(second.container_port, None);
    }

    #[tokio::test]
    async fn test_joins_isolation_network_when_present() {
        let f = fixture_with(
            FakeRuntime::new().with_network("ctf-network"),
            Arc::new(MemoryStore::new()),
        );
        let lab = web_lab(f.store.as_ref(), true);
        let user = &users(f.store.as_ref(), 1)[0];

        f.manager.acquire_at(lab.id, user.id, t0()).await.unwrap();
        let (_, spec) = &f.runtime.created()[0];
        assert_eq!(spec.network.as_deref(), Some("ctf-network"));
    }

    #[tokio::test]
    async fn test_lab_without_image_uses_base_image() {
        let f = fixture();
        let lab = f
            .store
            .insert_lab(NewLab::new("bare", "CTF{bare}"))
            .unwrap();
        let user = &users(f.store.as_ref(), 1)[0];

        let instance = f.manager.acquire_at(lab.id, user.id, t0()).await.unwrap();
        let (_, spec) = &f.runtime.created()[0];
        assert_eq!(spec.image, "ctf/base:latest");
        assert!(spec.ports.is_empty());
        assert_eq!(instance.container_port, None);
    }

    #[tokio::test]
    async fn test_stop_deactivates_and_removes() {
        let f = fixture();
        let lab = web_lab(f.store.as_ref(), true);
        let user = &users(f.store.as_ref(), 1)[0];
        let instance = f.manager.acquire_at(lab.id, user.id, t0()).await.unwrap();
        let container_id = instance.container_id.clone().unwrap();

        let stopped = f.manager.stop(instance.id).await.unwrap();
        assert!(!stopped.is_active);
        assert!(!f.manager.instance(instance.id).unwrap().is_active);
        assert_eq!(f.runtime.stops(), vec![container_id.clone()]);
        assert_eq!(f.runtime.removes(), vec![container_id.clone()]);
        assert!(!f.runtime.is_running(&container_id));
        assert_eq!(f.manager.active_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stop_vanished_container() {
        let f = fixture();
        let lab = web_lab(f.store.as_ref(), true);
        let user = &users(f.store.as_ref(), 1)[0];
        let instance = f.manager.acquire_at(lab.id, user.id, t0()).await.unwrap();
        let container_id = instance.container_id.clone().unwrap();
        f.runtime.vanish(&container_id);

        let stopped = f.manager.stop(instance.id).await.unwrap();
        assert!(!stopped.is_active);
        assert!(!f.manager.instance(instance.id).unwrap().is_active);
        assert!(f.runtime.removes().is_empty());
    }

    #[tokio::test]
    async fn test_stop_failure_leaves_instance_active() {
        let f = fixture();
        let lab = web_lab(f.store.as_ref(), true);
        let user = &users(f.store.as_ref(), 1)[0];
        let instance = f.manager.acquire_at(lab.id, user.id, t0()).await.unwrap();
        f.runtime
            .fail_teardown(instance.container_id.as_deref().unwrap());

        let err = f.manager.stop(instance.id).await.unwrap_err();
        assert!(matches!(err, LabError::TeardownFailed { .. }));
        assert!(f.manager.instance(instance.id).unwrap().is_active);
    }

    #[tokio::test]
    async fn test_failed_insert_removes_new_container() {
        let f = fixture_with(
            FakeRuntime::new(),
            Arc::new(FailingInserts(MemoryStore::new())),
        );
        let lab = web_lab(f.store.as_ref(), true);
        let user = &users(f.store.as_ref(), 1)[0];

        let err = f.manager.acquire_at(lab.id, user.id, t0()).await.unwrap_err();
        assert!(matches!(err, LabError::Store(ref m) if m == "disk full"));

        let created = f.runtime.created();
        assert_eq!(created.len(), 1);
        let container_id = &created[0].0;
        assert_eq!(f.runtime.removes(), vec![container_id.clone()]);
        assert!(!f.runtime.is_running(container_id));
        assert_eq!(f.manager.active_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stop_twice_is_idempotent() {
        let f = fixture();
        let lab = web_lab(f.store.as_ref(), true);
        let user = &users(f.store.as_ref(), 1)[0];
        let instance = f.manager.acquire_at(lab.id, user.id, t0()).await.unwrap();

        let first = f.manager.stop(instance.id).await.unwrap();
        let second = f.manager.stop(instance.id).await.unwrap();

        assert!(!first.is_active);
        assert!(!second.is_active);
        assert!(!f.manager.instance(instance.id).unwrap().is_active);
        assert_eq!(f.runtime.removes().len(), 1);
        assert_eq!(f.manager.active_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expired_container_teardown_failure_does_not_block_acquire() {
        let f = fixture();
        let lab = web_lab(f.store.as_ref(), true);
        let user = &users(f.store.as_ref(), 1)[0];
        let old = f.manager.acquire_at(lab.id, user.id, t0()).await.unwrap();
        let old_container = old.container_id.clone().unwrap();
        f.runtime.fail_teardown(&old_container);

        let new = f
            .manager
            .acquire_at(lab.id, user.id, t0() + Duration::hours(5))
            .await
            .unwrap();

        assert_ne!(new.id, old.id);
        assert!(new.is_active);
        assert!(!f.manager.instance(old.id).unwrap().is_active);
        // Left running; only an operator can reclaim it now
        assert!(f.runtime.is_running(&old_container));
        let report = f
            .manager
            .sweep_expired_at(t0() + Duration::hours(6))
            .await
            .unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test]
    async fn test_stop_unknown_instance() {
        let f = fixture();
        let err = f.manager.stop(404).await.unwrap_err();
        assert!(matches!(err, LabError::InstanceNotFound(404)));
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_reset_replaces_instance() {
        let f = fixture();
        let lab = web_lab(f.store.as_ref(), true);
        let user = &users(f.store.as_ref(), 1)[0];
        let old = f.manager.acquire(lab.id, user.id).await.unwrap();

        let new = f.manager.reset(old.id).await.unwrap();

        assert_ne!(new.id, old.id);
        assert_ne!(new.container_id, old.container_id);
        assert!(new.is_active);
        assert!(!f.manager.instance(old.id).unwrap().is_active);
        assert_eq!(f.runtime.created_count(), 2);
        assert_eq!(f.manager.active_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sweep_expired_single_instance() {
        let f = fixture();
        let lab = web_lab(f.store.as_ref(), true);
        let people = users(f.store.as_ref(), 7);
        let user = &people[6];
        assert_eq!(user.id, 7);

        let instance = f.manager.acquire_at(lab.id, user.id, t0()).await.unwrap();
        assert_eq!(instance.expires_at, Some(t0() + Duration::hours(4)));
        let container_id = instance.container_id.clone().unwrap();

        let report = f
            .manager
            .sweep_expired_at(t0() + Duration::hours(5))
            .await
            .unwrap();

        assert_eq!(report.stopped, vec![instance.id]);
        assert!(report.failed.is_empty());
        assert!(!f.manager.instance(instance.id).unwrap().is_active);
        assert_eq!(f.runtime.stops(), vec![container_id.clone()]);
        assert_eq!(f.runtime.removes(), vec![container_id]);
    }

    #[tokio::test]
    async fn test_sweep_isolates_failures() {
        let f = fixture();
        let timed = web_lab(f.store.as_ref(), true);
        let untimed = web_lab(f.store.as_ref(), false);
        let people = users(f.store.as_ref(), 3);

        let mut expired = Vec::new();
        for user in &people {
            expired.push(f.manager.acquire_at(timed.id, user.id, t0()).await.unwrap());
        }
        let fresh = f
            .manager
            .acquire_at(timed.id, people[0].id, t0() + Duration::hours(10))
            .await
            .unwrap();
        let forever = f
            .manager
            .acquire_at(untimed.id, people[1].id, t0())
            .await
            .unwrap();

        // The replacement above already retired the first user's instance
        let broken = &expired[1];
        f.runtime
            .fail_teardown(broken.container_id.as_deref().unwrap());

        let report = f
            .manager
            .sweep_expired_at(t0() + Duration::hours(11))
            .await
            .unwrap();

        assert_eq!(report.stopped, vec![expired[2].id]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, broken.id);

        assert!(f.manager.instance(broken.id).unwrap().is_active);
        assert!(!f.manager.instance(expired[2].id).unwrap().is_active);
        assert!(f.manager.instance(fresh.id).unwrap().is_active);
        assert!(f.manager.instance(forever.id).unwrap().is_active);
    }

    #[tokio::test]
    async fn test_logs_and_stats() {
        let f = fixture();
        let lab = web_lab(f.store.as_ref(), true);
        let user = &users(f.store.as_ref(), 1)[0];
        let instance = f.manager.acquire_at(lab.id, user.id, t0()).await.unwrap();

        let logs = f.manager.logs(instance.id, None).await.unwrap();
        assert_eq!(logs.lines().count(), 3);
        let last = f.manager.logs(instance.id, Some(1)).await.unwrap();
        assert!(last.ends_with("line 3"));
        assert_eq!(last.lines().count(), 1);

        let stats = f.manager.stats(instance.id).await.unwrap().unwrap();
        assert_eq!(stats.memory_usage, Some(4096));

        f.runtime.vanish(instance.container_id.as_deref().unwrap());
        assert_eq!(
            f.manager.logs(instance.id, None).await.unwrap(),
            LOGS_NOT_AVAILABLE
        );
        assert_eq!(f.manager.stats(instance.id).await.unwrap(), None);
        assert!(f.manager.instance(instance.id).unwrap().is_active);

        assert!(matches!(
            f.manager.logs(999, None).await,
            Err(LabError::InstanceNotFound(999))
        ));
    }

    #[tokio::test]
    async fn test_user_active_instances() {
        let f = fixture();
        let first = web_lab(f.store.as_ref(), true);
        let second = web_lab(f.store.as_ref(), false);
        let people = users(f.store.as_ref(), 2);

        f.manager.acquire_at(first.id, people[0].id, t0()).await.unwrap();
        let b = f.manager.acquire_at(second.id, people[0].id, t0()).await.unwrap();
        f.manager.acquire_at(first.id, people[1].id, t0()).await.unwrap();

        assert_eq!(f.manager.user_active_instances(people[0].id).unwrap().len(), 2);
        assert_eq!(f.manager.active_count().unwrap(), 3);
        assert_eq!(f.manager.active_instances().unwrap().len(), 3);

        f.manager.stop(b.id).await.unwrap();
        let remaining = f.manager.user_active_instances(people[0].id).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].lab_id, first.id);
    }

    #[tokio::test]
    async fn test_compose_lab_provisions_primary_service() {
        let f = fixture();
        let definition = r#"
services:
  db:
    image: mysql:8
  web:
    image: ctf/sqli:latest
    command: ["python", "app.py"]
    ports:
      - "8000:80"
    environment:
      DB_HOST: db
      FLAG: overridden
"#;
        let lab = f
            .store
            .insert_lab(
                NewLab::new("sqli", "CTF{compose}")
                    .compose(definition)
                    .target_port(80),
            )
            .unwrap();
        let user = &users(f.store.as_ref(), 1)[0];

        f.manager.acquire_at(lab.id, user.id, t0()).await.unwrap();

        let created = f.runtime.created();
        assert_eq!(created.len(), 1);
        let (_, spec) = &created[0];
        assert_eq!(spec.image, "ctf/sqli:latest");
        assert_eq!(spec.cmd, vec!["python", "app.py"]);
        assert_eq!(spec.env["DB_HOST"], "db");
        assert_eq!(spec.env["FLAG"], "CTF{compose}");
        assert_eq!(spec.ports[0].key(), "80/tcp");
    }

    #[tokio::test]
    async fn test_invalid_compose_fails_creation() {
        let f = fixture();
        let lab = f
            .store
            .insert_lab(NewLab::new("broken", "CTF{x}").compose("services: ["))
            .unwrap();
        let user = &users(f.store.as_ref(), 1)[0];

        let err = f.manager.acquire_at(lab.id, user.id, t0()).await.unwrap_err();
        assert!(matches!(err, LabError::InstanceCreationFailed(_)));
        assert_eq!(f.runtime.created_count(), 0);
        assert_eq!(f.manager.active_count().unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_creates_single_container() {
        let f = fixture();
        let lab = web_lab(f.store.as_ref(), true);
        let user = users(f.store.as_ref(), 1).remove(0);
        let runtime = f.runtime.clone();
        let manager = Arc::new(f.manager);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let (lab_id, user_id) = (lab.id, user.id);
            handles.push(tokio::spawn(async move {
                manager.acquire(lab_id, user_id).await
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(runtime.created_count(), 1);
        assert_eq!(manager.active_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_lifecycle_on_sqlite_store() {
        let f = fixture_with(
            FakeRuntime::new(),
            Arc::new(SqliteStore::open_in_memory().unwrap()),
        );
        let lab = web_lab(f.store.as_ref(), true);
        let user = &users(f.store.as_ref(), 1)[0];

        let first = f.manager.acquire_at(lab.id, user.id, t0()).await.unwrap();
        let again = f.manager.acquire_at(lab.id, user.id, t0()).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(first.expires_at, Some(t0() + Duration::hours(4)));

        let report = f
            .manager
            .sweep_expired_at(t0() + Duration::hours(5))
            .await
            .unwrap();
        assert_eq!(report.stopped, vec![first.id]);
        assert_eq!(f.manager.active_count().unwrap(), 0);
    }
}
