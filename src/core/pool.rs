use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use dashmap::DashMap;
use futures::future::join_all;
use tokio::{sync::Mutex, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    config::SandboxConfig,
    core::traits::{
        executor::SandboxError,
        runtime::{RuntimeError, SandboxRuntime},
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolPhase {
    Uninitialized,
    Initializing,
    Ready,
}

impl PoolPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PoolPhase::Initializing,
            2 => PoolPhase::Ready,
            _ => PoolPhase::Uninitialized,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SandboxContainer {
    pub id: String,
    pub busy: bool,
    pub last_used_at: Instant,
}

/// Exclusive handle on a container, consumed by `release` or `discard`.
#[derive(Debug, PartialEq, Eq)]
pub struct ContainerLease {
    id: String,
    temporary: bool,
}

impl ContainerLease {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub phase: PoolPhase,
    pub tracked: usize,
    pub busy: usize,
}

/// Fixed-size set of pre-warmed sandbox containers.
///
/// Callers never wait for a slot: when every pooled container is busy,
/// `acquire` hands out a temporary container that lives for one lease.
#[derive(Debug)]
pub struct SandboxPool {
    runtime: Arc<dyn SandboxRuntime>,
    config: SandboxConfig,
    containers: DashMap<String, SandboxContainer>,
    phase: AtomicU8,
    init_lock: Mutex<()>,
    maintenance_lock: Mutex<()>,
}

impl SandboxPool {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, config: SandboxConfig) -> Self {
        Self {
            runtime,
            config,
            containers: DashMap::new(),
            phase: AtomicU8::new(PoolPhase::Uninitialized as u8),
            init_lock: Mutex::new(()),
            maintenance_lock: Mutex::new(()),
        }
    }

    pub fn phase(&self) -> PoolPhase {
        PoolPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: PoolPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            phase: self.phase(),
            tracked: self.containers.len(),
            busy: self.containers.iter().filter(|c| c.busy).count(),
        }
    }

    /// Ensures the sandbox image and warms up the pool. Idempotent; callers
    /// arriving while another initialization runs wait for it to finish.
    #[tracing::instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), SandboxError> {
        if self.phase() == PoolPhase::Ready {
            return Ok(());
        }

        let _guard = self.init_lock.lock().await;
        if self.phase() == PoolPhase::Ready {
            return Ok(());
        }
        self.set_phase(PoolPhase::Initializing);

        if let Err(e) = self.ensure_image().await {
            tracing::error!(image = %self.config.image, "Sandbox image unavailable: {}", e);
            self.set_phase(PoolPhase::Uninitialized);
            return Err(SandboxError::Provisioning(e));
        }

        let created = self.provision(self.config.pool_size).await;
        self.set_phase(PoolPhase::Ready);
        tracing::info!(
            created,
            configured = self.config.pool_size,
            "Container pool initialized"
        );

        Ok(())
    }

    async fn ensure_image(&self) -> Result<(), RuntimeError> {
        if self.runtime.image_exists(&self.config.image).await? {
            return Ok(());
        }

        tracing::info!(image = %self.config.image, "Building sandbox image");
        self.runtime
            .build_image(&self.config.image, &self.config.image_context)
            .await
    }

    /// Creates up to `count` tracked containers. Failures are logged, not returned.
    async fn provision(&self, count: usize) -> usize {
        let spec = self.config.container_spec();
        let results = join_all((0..count).map(|_| self.runtime.create(&spec))).await;

        let mut created = 0;
        for result in results {
            match result {
                Ok(id) => {
                    tracing::debug!(container = %id, "Pooled container created");
                    self.containers.insert(
                        id.clone(),
                        SandboxContainer {
                            id,
                            busy: false,
                            last_used_at: Instant::now(),
                        },
                    );
                    created += 1;
                }
                Err(e) => tracing::warn!("Failed to create pooled container: {}", e),
            }
        }

        created
    }

    pub async fn acquire(&self) -> Result<ContainerLease, SandboxError> {
        self.initialize().await?;

        if let Some(id) = self.try_lease() {
            tracing::debug!(container = %id, "Leased pooled container");
            return Ok(ContainerLease {
                id,
                temporary: false,
            });
        }

        let id = self
            .runtime
            .create(&self.config.container_spec())
            .await
            .map_err(SandboxError::Provisioning)?;
        tracing::info!(container = %id, "Pool exhausted, using temporary container");

        Ok(ContainerLease {
            id,
            temporary: true,
        })
    }

    fn try_lease(&self) -> Option<String> {
        for mut container in self.containers.iter_mut() {
            if !container.busy {
                container.busy = true;
                container.last_used_at = Instant::now();
                return Some(container.id.clone());
            }
        }
        None
    }

    pub async fn release(&self, lease: ContainerLease) {
        if !lease.temporary {
            if let Some(mut container) = self.containers.get_mut(&lease.id) {
                container.busy = false;
                container.last_used_at = Instant::now();
                return;
            }
            tracing::debug!(container = %lease.id, "Released container is no longer tracked");
        }

        self.teardown(&lease.id).await;
    }

    /// Untracks and destroys the leased container instead of recycling it.
    pub async fn discard(&self, lease: ContainerLease) {
        if !lease.temporary {
            self.containers.remove(&lease.id);
        }
        tracing::warn!(container = %lease.id, "Discarding container");
        self.teardown(&lease.id).await;
    }

    async fn teardown(&self, id: &str) {
        if let Err(e) = self.runtime.stop(id).await {
            tracing::warn!(container = %id, "Failed to stop container: {}", e);
        }
        if let Err(e) = self.runtime.remove(id).await {
            tracing::warn!(container = %id, "Failed to remove container: {}", e);
        }
    }

    /// Removes containers idle longer than the idle timeout, then tops the
    /// pool back up. Returns how many containers were recycled.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup_idle(&self) -> usize {
        let _guard = self.maintenance_lock.lock().await;
        let idle_timeout = self.config.idle_timeout;
        let now = Instant::now();
        let is_expired =
            |c: &SandboxContainer| !c.busy && now.duration_since(c.last_used_at) > idle_timeout;

        let candidates: Vec<String> = self
            .containers
            .iter()
            .filter(|c| is_expired(c))
            .map(|c| c.id.clone())
            .collect();

        // A candidate may have been leased since the scan.
        let expired: Vec<String> = candidates
            .into_iter()
            .filter(|id| self.containers.remove_if(id, |_, c| is_expired(c)).is_some())
            .collect();

        for id in &expired {
            tracing::debug!(container = %id, "Recycling idle container");
            self.teardown(id).await;
        }

        if self.phase() == PoolPhase::Ready {
            let missing = self.config.pool_size.saturating_sub(self.containers.len());
            if missing > 0 {
                let created = self.provision(missing).await;
                tracing::debug!(missing, created, "Pool topped up");
            }
        }

        expired.len()
    }

    pub fn spawn_maintenance(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.cleanup_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let recycled = pool.cleanup_idle().await;
                        tracing::debug!(recycled, stats = ?pool.stats(), "Idle cleanup finished");
                    }
                }
            }
        })
    }

    pub async fn shutdown(&self) {
        let _guard = self.init_lock.lock().await;
        self.set_phase(PoolPhase::Uninitialized);

        let ids: Vec<String> = self.containers.iter().map(|c| c.id.clone()).collect();
        for id in &ids {
            self.containers.remove(id);
        }
        join_all(ids.iter().map(|id| self.teardown(id))).await;
        tracing::info!(removed = ids.len(), "Container pool shut down");
    }
}
