//! Checkout/checkin pool of non-thread-safe pipeline resources.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::AppError;

/// A fixed set of reusable instances shared by all provider workers.
///
/// `checkout` waits until an instance is free. The semaphore holds one
/// permit per idle instance, so a granted permit always finds one.
#[derive(Debug)]
pub struct ResourcePool<T> {
    name: String,
    idle: Arc<Mutex<Vec<T>>>,
    permits: Arc<Semaphore>,
}

impl<T> ResourcePool<T> {
    pub fn new(name: impl Into<String>, items: Vec<T>) -> Self {
        Self {
            name: name.into(),
            permits: Arc::new(Semaphore::new(items.len())),
            idle: Arc::new(Mutex::new(items)),
        }
    }

    /// Builds a pool of `size` instances (at least one) from a factory.
    pub fn with_factory(name: impl Into<String>, size: usize, mut make: impl FnMut() -> T) -> Self {
        let items = (0..size.max(1)).map(|_| make()).collect();
        Self::new(name, items)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of instances currently checked in.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Checks an instance out; dropping the guard checks it back in.
    pub async fn checkout(&self) -> Result<PoolGuard<T>, AppError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| AppError::Generic(format!("pool {} closed: {e}", self.name)))?;
        let item = lock_idle(&self.idle, &self.name)
            .pop()
            .ok_or_else(|| AppError::Generic(format!("pool {} is empty", self.name)))?;
        Ok(PoolGuard {
            item: Some(item),
            idle: self.idle.clone(),
            name: self.name.clone(),
            _permit: permit,
        })
    }
}

fn lock_idle<'a, T>(idle: &'a Mutex<Vec<T>>, name: &str) -> MutexGuard<'a, Vec<T>> {
    idle.lock().unwrap_or_else(|poisoned| {
        tracing::warn!(pool = %name, "Recovered from poisoned mutex");
        poisoned.into_inner()
    })
}

/// A checked-out pool instance.
pub struct PoolGuard<T> {
    item: Option<T>,
    idle: Arc<Mutex<Vec<T>>>,
    name: String,
    // Released only after `drop` has pushed the item back.
    _permit: OwnedSemaphorePermit,
}

impl<T> Deref for PoolGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.item {
            Some(item) => item,
            None => unreachable!("pool guard holds its item until dropped"),
        }
    }
}

impl<T> DerefMut for PoolGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.item {
            Some(item) => item,
            None => unreachable!("pool guard holds its item until dropped"),
        }
    }
}

impl<T> Drop for PoolGuard<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            lock_idle(&self.idle, &self.name).push(item);
        }
    }
}
