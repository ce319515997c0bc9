//! Kernel process manager.
//!
//! Owns every [`KernelProcess`](crate::kernel::KernelProcess), keeps at
//! most one per notebook, leases OS identities from an optional
//! [`UserPool`] and supervises liveness in the background.

mod manager;
mod pool;
mod supervisor;

pub use manager::{
    KernelLink, ProcessEvent, ProcessInfo, ProcessManager, ProcessManagerConfig,
};
pub(crate) use manager::EVENT_QUEUE;
pub use pool::{IsolationSlot, Lease, UserPool};
pub use supervisor::{spawn_supervisor, supervise_once, SupervisorConfig};
