use std::sync::Arc;

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Read/write gate between exclusive and ordinary providers.
///
/// Exclusive providers take the write side and run alone; ordinary
/// providers share the read side.
#[derive(Debug, Clone, Default)]
pub struct ExclusiveAccess {
    lock: Arc<RwLock<()>>,
}

/// Held for as long as the provider may touch the shared resource.
#[derive(Debug)]
pub enum AccessGuard {
    Shared(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
}

impl ExclusiveAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, exclusive: bool) -> AccessGuard {
        if exclusive {
            AccessGuard::Exclusive(self.lock.clone().write_owned().await)
        } else {
            AccessGuard::Shared(self.lock.clone().read_owned().await)
        }
    }
}
