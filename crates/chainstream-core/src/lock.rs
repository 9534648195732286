//! Named, leased locks that keep a single active consumer across replicas.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::StreamError;

/// Proof of a successful acquisition.
///
/// `token` is unique per acquisition; renew and release only succeed while
/// the registry still holds the same token for `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub name: String,
    pub owner: String,
    pub token: String,
    pub lease: Duration,
}

impl LockHandle {
    pub fn new(name: impl Into<String>, owner: impl Into<String>, lease: Duration) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            token: uuid::Uuid::new_v4().to_string(),
            lease,
        }
    }
}

/// Trait for lock backends.
///
/// Locks are non-reentrant: a second `try_acquire` for a held, unexpired name
/// returns `None` even for the same owner. An expired lease may be taken over
/// by anyone, so a crashed holder cannot wedge the stream.
#[async_trait]
pub trait LockRegistry: Send + Sync {
    /// Try to take `name` for `lease`. Never blocks waiting for the holder.
    async fn try_acquire(
        &self,
        name: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<Option<LockHandle>, StreamError>;

    /// Extend the lease. Returns `false` if the lock is no longer ours.
    async fn renew(&self, handle: &LockHandle) -> Result<bool, StreamError>;

    /// Give the lock up. Releasing a lock that was already lost is not an error.
    async fn release(&self, handle: &LockHandle) -> Result<(), StreamError>;
}

// ─── LockGuard ───────────────────────────────────────────────────────────────

/// Scoped ownership of a lock.
///
/// Call [`release`](Self::release) on every normal exit path. If the guard is
/// dropped without it (e.g. while unwinding), a release is spawned on the
/// current runtime.
pub struct LockGuard {
    registry: Arc<dyn LockRegistry>,
    handle: LockHandle,
    released: bool,
}

impl LockGuard {
    /// Try to acquire `name`; `Ok(None)` means another owner holds it.
    pub async fn try_acquire(
        registry: Arc<dyn LockRegistry>,
        name: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<Option<Self>, StreamError> {
        let handle = registry.try_acquire(name, owner, lease).await?;
        Ok(handle.map(|handle| Self {
            registry,
            handle,
            released: false,
        }))
    }

    pub fn handle(&self) -> &LockHandle {
        &self.handle
    }

    pub async fn renew(&self) -> Result<bool, StreamError> {
        self.registry.renew(&self.handle).await
    }

    pub async fn release(mut self) -> Result<(), StreamError> {
        self.released = true;
        self.registry.release(&self.handle).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let registry = Arc::clone(&self.registry);
        let handle = self.handle.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Err(e) = registry.release(&handle).await {
                        tracing::warn!(lock = %handle.name, error = %e, "deferred lock release failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    lock = %self.handle.name,
                    "lock guard dropped outside a runtime; lease will expire"
                );
            }
        }
    }
}

// ─── In-memory registry ──────────────────────────────────────────────────────

struct Lease {
    token: String,
    expires_at: Instant,
}

/// In-process lock registry for tests and single-replica deployments.
#[derive(Default)]
pub struct MemoryLockRegistry {
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `name` is held by an unexpired lease.
    pub fn is_held(&self, name: &str) -> bool {
        self.leases
            .lock()
            .map(|l| l.get(name).is_some_and(|lease| lease.expires_at > Instant::now()))
            .unwrap_or(false)
    }

    fn leases(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Lease>>, StreamError> {
        self.leases
            .lock()
            .map_err(|_| StreamError::Lock("lease map poisoned".into()))
    }
}

#[async_trait]
impl LockRegistry for MemoryLockRegistry {
    async fn try_acquire(
        &self,
        name: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<Option<LockHandle>, StreamError> {
        let mut leases = self.leases()?;
        let now = Instant::now();
        if leases.get(name).is_some_and(|l| l.expires_at > now) {
            return Ok(None);
        }
        let handle = LockHandle::new(name, owner, lease);
        leases.insert(
            name.to_string(),
            Lease {
                token: handle.token.clone(),
                expires_at: now + lease,
            },
        );
        Ok(Some(handle))
    }

    async fn renew(&self, handle: &LockHandle) -> Result<bool, StreamError> {
        let mut leases = self.leases()?;
        let now = Instant::now();
        match leases.get_mut(&handle.name) {
            Some(l) if l.token == handle.token && l.expires_at > now => {
                l.expires_at = now + handle.lease;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, handle: &LockHandle) -> Result<(), StreamError> {
        let mut leases = self.leases()?;
        if leases.get(&handle.name).is_some_and(|l| l.token == handle.token) {
            leases.remove(&handle.name);
        }
        Ok(())
    }
}
