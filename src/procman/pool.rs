//! Fixed-size pool of OS identities for isolated kernels.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::KnobooError;
use crate::kernel::IsolationSpec;
use crate::Result;

/// One OS identity a kernel can run as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IsolationSlot {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
}

impl IsolationSlot {
    pub fn isolation(&self) -> IsolationSpec {
        IsolationSpec::user(self.uid, self.gid)
    }
}

#[derive(Debug)]
struct PoolInner {
    slots: Vec<IsolationSlot>,
    free: VecDeque<usize>,
}

fn lock_or_recover(inner: &Mutex<PoolInner>) -> MutexGuard<'_, PoolInner> {
    inner.lock().unwrap_or_else(|poisoned| {
        warn!("recovering from poisoned user pool lock");
        poisoned.into_inner()
    })
}

/// Lease arena over a fixed set of [`IsolationSlot`]s.
///
/// A slot is handed out by [`UserPool::checkout`] and returns to the pool
/// when its [`Lease`] is dropped, so the pool size bounds the number of
/// concurrently isolated kernels.
#[derive(Debug, Clone)]
pub struct UserPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl UserPool {
    pub fn new(slots: Vec<IsolationSlot>) -> Self {
        let free = (0..slots.len()).collect();
        Self {
            inner: Arc::new(Mutex::new(PoolInner { slots, free })),
        }
    }

    /// `size` slots named `{prefix}{i}` with consecutive uids from `base_uid`.
    pub fn sequential(prefix: &str, base_uid: u32, gid: u32, size: usize) -> Self {
        let slots = (0..size)
            .map(|i| IsolationSlot {
                name: format!("{}{}", prefix, i),
                uid: base_uid.saturating_add(i as u32),
                gid,
            })
            .collect();
        Self::new(slots)
    }

    pub fn capacity(&self) -> usize {
        lock_or_recover(&self.inner).slots.len()
    }

    pub fn available(&self) -> usize {
        lock_or_recover(&self.inner).free.len()
    }

    /// Take a free slot.
    pub fn checkout(&self) -> Result<Lease> {
        let mut inner = lock_or_recover(&self.inner);
        let Some(index) = inner.free.pop_front() else {
            return Err(KnobooError::PoolExhausted(inner.slots.len()));
        };
        let slot = inner.slots[index].clone();
        debug!(slot = %slot.name, uid = slot.uid, "isolation slot leased");
        Ok(Lease {
            pool: Arc::clone(&self.inner),
            index,
            slot,
        })
    }
}

/// Exclusive use of one pool slot.
#[derive(Debug)]
pub struct Lease {
    pool: Arc<Mutex<PoolInner>>,
    index: usize,
    slot: IsolationSlot,
}

impl Lease {
    pub fn slot(&self) -> &IsolationSlot {
        &self.slot
    }

    pub fn isolation(&self) -> IsolationSpec {
        self.slot.isolation()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut inner = lock_or_recover(&self.pool);
        inner.free.push_back(self.index);
        debug!(slot = %self.slot.name, "isolation slot returned");
    }
}
