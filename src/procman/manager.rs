//! Process table: one kernel per notebook.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, info_span, warn, Instrument};

use super::{Lease, UserPool};
use crate::error::KnobooError;
use crate::kernel::{
    Framing, IsolationSpec, KernelOutput, KernelProcess, KernelSpec, ProcessId, ProcessState,
};
use crate::notebook::NotebookId;
use crate::realm::UserId;
use crate::Result;

/// Capacity of the lifecycle event channel.
pub(crate) const EVENT_QUEUE: usize = 64;

/// Time the output pump gets to drain a dead kernel before the
/// supervisor reaps it.
const OUTPUT_DRAIN: Duration = Duration::from_secs(1);

/// Lifecycle notifications published by the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    Started {
        process: ProcessId,
        notebook: NotebookId,
    },
    /// Kernel died without being asked to.
    Crashed {
        process: ProcessId,
        notebook: NotebookId,
        reason: String,
    },
    /// Kernel was shut down on request or reclaimed while idle.
    Stopped {
        process: ProcessId,
        notebook: NotebookId,
    },
}

impl ProcessEvent {
    pub fn process(&self) -> ProcessId {
        match self {
            Self::Started { process, .. }
            | Self::Crashed { process, .. }
            | Self::Stopped { process, .. } => *process,
        }
    }
}

/// Process manager settings.
#[derive(Debug, Clone)]
pub struct ProcessManagerConfig {
    /// Time a kernel gets to exit after SIGTERM.
    pub grace: Duration,
    /// Identity used when no pool is configured.
    pub isolation: IsolationSpec,
    /// Pool of identities for multi-engine mode.
    pub pool: Option<UserPool>,
}

impl Default for ProcessManagerConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(5),
            isolation: IsolationSpec::none(),
            pool: None,
        }
    }
}

/// Snapshot of one kernel for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub id: ProcessId,
    pub notebook: NotebookId,
    pub owner: UserId,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub command: String,
    pub uptime_secs: f64,
    pub attached: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isolation_user: Option<String>,
}

/// Everything a session layer needs to talk to a kernel.
#[derive(Debug)]
pub struct KernelLink {
    pub process: ProcessId,
    pub input: mpsc::Sender<Vec<u8>>,
    pub framing: Framing,
    /// Output stream, handed out to the first caller only.
    pub output: Option<mpsc::Receiver<KernelOutput>>,
}

struct ProcessEntry {
    process: KernelProcess,
    notebook: NotebookId,
    owner: UserId,
    input: mpsc::Sender<Vec<u8>>,
    output: Mutex<Option<mpsc::Receiver<KernelOutput>>>,
    framing: Framing,
    lease: Mutex<Option<Lease>>,
    attached: AtomicUsize,
    idle_since: Mutex<Option<Instant>>,
    exited_at: Mutex<Option<Instant>>,
}

impl ProcessEntry {
    fn info(&self) -> ProcessInfo {
        ProcessInfo {
            id: self.process.id(),
            notebook: self.notebook.clone(),
            owner: self.owner.clone(),
            state: self.process.state(),
            pid: self.process.pid(),
            command: self.process.command().to_string(),
            uptime_secs: self.process.uptime().as_secs_f64(),
            attached: self.attached.load(Ordering::SeqCst),
            isolation_user: self
                .lease
                .lock()
                .ok()
                .and_then(|l| l.as_ref().map(|l| l.slot().name.clone())),
        }
    }

    /// No session attached for at least `timeout`.
    fn idle_for(&self, timeout: Duration) -> bool {
        self.attached.load(Ordering::SeqCst) == 0
            && self
                .idle_since
                .lock()
                .ok()
                .and_then(|since| *since)
                .is_some_and(|since| since.elapsed() >= timeout)
    }

    /// Whether a pump owns the output stream.
    fn output_claimed(&self) -> bool {
        self.output.lock().map(|o| o.is_none()).unwrap_or(false)
    }

    /// Record that the process was seen dead; true once the pump has had
    /// [`OUTPUT_DRAIN`] to finish.
    fn drain_expired(&self) -> bool {
        let Ok(mut exited) = self.exited_at.lock() else {
            return true;
        };
        match *exited {
            Some(at) => at.elapsed() >= OUTPUT_DRAIN,
            None => {
                *exited = Some(Instant::now());
                false
            }
        }
    }

    fn release_lease(&self) {
        if let Ok(mut lease) = self.lease.lock() {
            lease.take();
        }
    }
}

/// Owns every kernel process.
///
/// Sessions only ever hold a [`ProcessId`]. At most one running kernel
/// exists per notebook: starts are serialized by a per-notebook async lock.
pub struct ProcessManager {
    table: RwLock<HashMap<ProcessId, Arc<ProcessEntry>>>,
    notebooks: RwLock<HashMap<NotebookId, ProcessId>>,
    locks: Mutex<HashMap<NotebookId, Arc<tokio::sync::Mutex<()>>>>,
    events: broadcast::Sender<ProcessEvent>,
    config: ProcessManagerConfig,
}

impl ProcessManager {
    pub fn new(config: ProcessManagerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_QUEUE);
        Self {
            table: RwLock::new(HashMap::new()),
            notebooks: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            events,
            config,
        }
    }

    pub fn config(&self) -> &ProcessManagerConfig {
        &self.config
    }

    /// Receive lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.events.subscribe()
    }

    /// Start a kernel for `notebook`.
    ///
    /// Fails with [`KnobooError::NotebookBusy`] if one is already running.
    pub async fn add_process(
        &self,
        notebook: &NotebookId,
        owner: &UserId,
        spec: &KernelSpec,
    ) -> Result<ProcessId> {
        let lock = self.notebook_lock(notebook)?;
        let result = {
            let _guard = lock.lock().await;
            match self.get_process(notebook) {
                Some(id) => Err(KnobooError::NotebookBusy(format!(
                    "{} already runs {}",
                    notebook, id
                ))),
                None => self.start_locked(notebook, owner, spec),
            }
        };
        drop(lock);
        self.prune_lock(notebook);
        result
    }

    /// Running kernel of `notebook`, if any.
    pub fn get_process(&self, notebook: &NotebookId) -> Option<ProcessId> {
        let id = *self.notebooks.read().ok()?.get(notebook)?;
        let entry = self.entry(id).ok()?;
        (entry.process.state() == ProcessState::Running).then_some(id)
    }

    /// Return the running kernel of `notebook`, starting one if needed.
    ///
    /// Concurrent callers for the same notebook all get the same process.
    pub async fn ensure_process(
        &self,
        notebook: &NotebookId,
        owner: &UserId,
        spec: &KernelSpec,
    ) -> Result<ProcessId> {
        let lock = self.notebook_lock(notebook)?;
        let result = {
            let _guard = lock.lock().await;
            self.ensure_locked(notebook, owner, spec).await
        };
        drop(lock);
        self.prune_lock(notebook);
        result
    }

    /// Like [`ensure_process`](Self::ensure_process), and record one
    /// attached session before the notebook lock is released.
    ///
    /// Idle reclamation takes the same lock, so the returned kernel cannot
    /// be reclaimed before the caller binds to it. Callers that fail to
    /// bind must [`release`](Self::release) it.
    pub async fn acquire(
        &self,
        notebook: &NotebookId,
        owner: &UserId,
        spec: &KernelSpec,
    ) -> Result<ProcessId> {
        let lock = self.notebook_lock(notebook)?;
        let result = {
            let _guard = lock.lock().await;
            match self.ensure_locked(notebook, owner, spec).await {
                Ok(id) => self.retain(id).map(|_| id),
                Err(e) => Err(e),
            }
        };
        drop(lock);
        self.prune_lock(notebook);
        result
    }

    async fn ensure_locked(
        &self,
        notebook: &NotebookId,
        owner: &UserId,
        spec: &KernelSpec,
    ) -> Result<ProcessId> {
        if let Some(id) = self.get_process(notebook) {
            let entry = self.entry(id)?;
            if entry.process.is_alive().await {
                return Ok(id);
            }
            self.reap(id, "exited before attach").await;
        }
        self.start_locked(notebook, owner, spec)
    }

    fn start_locked(
        &self,
        notebook: &NotebookId,
        owner: &UserId,
        spec: &KernelSpec,
    ) -> Result<ProcessId> {
        let lease = match &self.config.pool {
            Some(pool) => Some(pool.checkout()?),
            None => None,
        };
        let isolation = lease
            .as_ref()
            .map(Lease::isolation)
            .unwrap_or(self.config.isolation);

        let span = info_span!("spawn", notebook = %notebook, owner = %owner);
        let _enter = span.enter();

        // On failure the lease drops here and goes back to the pool.
        let (process, io) = KernelProcess::start(spec, &isolation)?;
        let id = process.id();

        let entry = Arc::new(ProcessEntry {
            process,
            notebook: notebook.clone(),
            owner: owner.clone(),
            input: io.input,
            output: Mutex::new(Some(io.output)),
            framing: spec.framing,
            lease: Mutex::new(lease),
            attached: AtomicUsize::new(0),
            idle_since: Mutex::new(Some(Instant::now())),
            exited_at: Mutex::new(None),
        });

        self.table
            .write()
            .map_err(|_| KnobooError::LockPoisoned)?
            .insert(id, entry);
        self.notebooks
            .write()
            .map_err(|_| KnobooError::LockPoisoned)?
            .insert(notebook.clone(), id);

        info!(process = %id, "kernel registered");
        let _ = self.events.send(ProcessEvent::Started {
            process: id,
            notebook: notebook.clone(),
        });
        Ok(id)
    }

    /// Shut a kernel down and forget it.
    pub async fn stop_process(&self, id: ProcessId) -> Result<ProcessState> {
        let entry = self
            .remove_entry(id)?
            .ok_or_else(|| KnobooError::ProcessNotFound(id.to_string()))?;

        let state = entry
            .process
            .stop(self.config.grace)
            .instrument(info_span!("stop", process = %id))
            .await;
        entry.release_lease();

        info!(process = %id, ?state, "kernel stopped");
        let _ = self.events.send(ProcessEvent::Stopped {
            process: id,
            notebook: entry.notebook.clone(),
        });
        self.prune_lock(&entry.notebook);
        Ok(state)
    }

    /// Evict a kernel that died on its own and announce the crash.
    ///
    /// Returns `false` when the process was already gone, so each death
    /// is reported exactly once.
    pub async fn reap(&self, id: ProcessId, reason: &str) -> bool {
        let entry = match self.remove_entry(id) {
            Ok(Some(entry)) => entry,
            Ok(None) => return false,
            Err(e) => {
                warn!(process = %id, "failed to reap kernel: {}", e);
                return false;
            }
        };

        entry.process.kill().await;
        entry.release_lease();

        warn!(process = %id, notebook = %entry.notebook, reason, "kernel crashed");
        let _ = self.events.send(ProcessEvent::Crashed {
            process: id,
            notebook: entry.notebook.clone(),
            reason: reason.to_string(),
        });
        self.prune_lock(&entry.notebook);
        true
    }

    /// Poll every kernel and reap the ones that have exited.
    ///
    /// A kernel whose output is being pumped is left to the pump, which
    /// reaps it at end of stream, unless the stream is still open
    /// [`OUTPUT_DRAIN`] after the process died.
    pub async fn check_liveness(&self) -> Vec<ProcessId> {
        let mut dead = Vec::new();
        for entry in self.entries() {
            if entry.process.is_alive().await {
                continue;
            }
            if entry.output_claimed() && !entry.drain_expired() {
                continue;
            }
            let id = entry.process.id();
            if self.reap(id, "process exited").await {
                dead.push(id);
            }
        }
        dead
    }

    /// Connection details for `id`.
    ///
    /// The output receiver is only included the first time.
    pub fn link(&self, id: ProcessId) -> Result<KernelLink> {
        let entry = self.entry(id)?;
        let output = entry
            .output
            .lock()
            .map_err(|_| KnobooError::LockPoisoned)?
            .take();
        Ok(KernelLink {
            process: id,
            input: entry.input.clone(),
            framing: entry.framing,
            output,
        })
    }

    /// Record a session attaching to `id`.
    pub fn retain(&self, id: ProcessId) -> Result<usize> {
        let entry = self.entry(id)?;
        if let Ok(mut idle) = entry.idle_since.lock() {
            *idle = None;
        }
        Ok(entry.attached.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Record a session detaching from `id`.
    ///
    /// Unknown processes are ignored: the kernel may already be gone.
    pub fn release(&self, id: ProcessId) -> usize {
        let Ok(entry) = self.entry(id) else {
            return 0;
        };
        let previous = entry
            .attached
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        let remaining = previous.saturating_sub(1);
        if remaining == 0 {
            if let Ok(mut idle) = entry.idle_since.lock() {
                *idle = Some(Instant::now());
            }
        }
        remaining
    }

    /// Stop kernels that have had no session for at least `timeout`.
    ///
    /// Each candidate is checked again under its notebook lock, so a kernel
    /// handed out by [`acquire`](Self::acquire) is never stopped.
    pub async fn reclaim_idle(&self, timeout: Duration) -> Vec<ProcessId> {
        let idle: Vec<_> = self
            .entries()
            .into_iter()
            .filter(|entry| entry.idle_for(timeout))
            .collect();

        let mut reclaimed = Vec::new();
        for entry in idle {
            let id = entry.process.id();
            let Ok(lock) = self.notebook_lock(&entry.notebook) else {
                continue;
            };
            let stopped = {
                let _guard = lock.lock().await;
                entry.idle_for(timeout) && self.stop_process(id).await.is_ok()
            };
            drop(lock);
            self.prune_lock(&entry.notebook);
            if stopped {
                info!(process = %id, "idle kernel reclaimed");
                reclaimed.push(id);
            }
        }
        reclaimed
    }

    pub fn list_processes(&self) -> Vec<ProcessId> {
        self.table
            .read()
            .map(|t| t.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn process_info(&self, id: ProcessId) -> Result<ProcessInfo> {
        Ok(self.entry(id)?.info())
    }

    /// Snapshots of every kernel, oldest first.
    pub fn infos(&self) -> Vec<ProcessInfo> {
        let mut infos: Vec<_> = self.entries().iter().map(|e| e.info()).collect();
        infos.sort_by_key(|info| info.id.as_u64());
        infos
    }

    pub fn count(&self) -> usize {
        self.table.read().map(|t| t.len()).unwrap_or(0)
    }

    /// Stop every kernel.
    pub async fn shutdown(&self) {
        let ids = self.list_processes();
        if !ids.is_empty() {
            info!(count = ids.len(), "stopping all kernels");
        }
        for id in ids {
            if let Err(e) = self.stop_process(id).await {
                warn!(process = %id, "failed to stop kernel: {}", e);
            }
        }
    }

    fn entry(&self, id: ProcessId) -> Result<Arc<ProcessEntry>> {
        self.table
            .read()
            .map_err(|_| KnobooError::LockPoisoned)?
            .get(&id)
            .cloned()
            .ok_or_else(|| KnobooError::ProcessNotFound(id.to_string()))
    }

    fn entries(&self) -> Vec<Arc<ProcessEntry>> {
        self.table
            .read()
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    fn remove_entry(&self, id: ProcessId) -> Result<Option<Arc<ProcessEntry>>> {
        let removed = self
            .table
            .write()
            .map_err(|_| KnobooError::LockPoisoned)?
            .remove(&id);
        if let Some(entry) = &removed {
            let mut notebooks = self.notebooks.write().map_err(|_| KnobooError::LockPoisoned)?;
            if notebooks.get(&entry.notebook) == Some(&id) {
                notebooks.remove(&entry.notebook);
            }
        }
        Ok(removed)
    }

    fn notebook_lock(&self, notebook: &NotebookId) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self.locks.lock().map_err(|_| KnobooError::LockPoisoned)?;
        Ok(Arc::clone(locks.entry(notebook.clone()).or_default()))
    }

    /// Forget the lock of a notebook with no kernel and no waiters.
    fn prune_lock(&self, notebook: &NotebookId) {
        let Ok(mut locks) = self.locks.lock() else {
            return;
        };
        let unused = locks
            .get(notebook)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        let running = self
            .notebooks
            .read()
            .map(|n| n.contains_key(notebook))
            .unwrap_or(true);
        if unused && !running {
            locks.remove(notebook);
        }
    }

    #[cfg(test)]
    fn tracked_notebooks(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new(ProcessManagerConfig::default())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn cat() -> KernelSpec {
        KernelSpec::new("/bin/cat")
    }

    fn nb(id: &str) -> NotebookId {
        NotebookId::new(id)
    }

    fn alice() -> UserId {
        UserId::new("alice")
    }

    fn manager() -> ProcessManager {
        ProcessManager::new(ProcessManagerConfig {
            grace: Duration::from_millis(500),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let manager = manager();
        let first = manager.ensure_process(&nb("nb1"), &alice(), &cat()).await.unwrap();
        let second = manager.ensure_process(&nb("nb1"), &alice(), &cat()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(manager.count(), 1);
        assert_eq!(manager.get_process(&nb("nb1")), Some(first));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_ensure_starts_one_process() {
        let manager = Arc::new(manager());
        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    manager.ensure_process(&nb("shared"), &alice(), &cat()).await
                })
            })
            .collect();

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(manager.count(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_add_process_rejects_second() {
        let manager = manager();
        manager.add_process(&nb("nb1"), &alice(), &cat()).await.unwrap();
        let result = manager.add_process(&nb("nb1"), &alice(), &cat()).await;
        assert!(matches!(result, Err(KnobooError::NotebookBusy(_))));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_process_emits_event() {
        let manager = manager();
        let mut events = manager.subscribe();
        let id = manager.ensure_process(&nb("nb1"), &alice(), &cat()).await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), ProcessEvent::Started { .. }));

        let state = manager.stop_process(id).await.unwrap();
        assert_eq!(state, ProcessState::Stopped);
        assert_eq!(
            events.recv().await.unwrap(),
            ProcessEvent::Stopped {
                process: id,
                notebook: nb("nb1")
            }
        );
        assert!(manager.get_process(&nb("nb1")).is_none());
        assert!(matches!(
            manager.stop_process(id).await,
            Err(KnobooError::ProcessNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_crash_evicts_and_next_ensure_gets_new_id() {
        let manager = manager();
        let mut events = manager.subscribe();
        let spec = KernelSpec::new("/bin/sh").arg("-c").arg("exit 1");
        let first = manager.ensure_process(&nb("nb1"), &alice(), &spec).await.unwrap();
        let _ = events.recv().await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        let dead = manager.check_liveness().await;
        assert_eq!(dead, vec![first]);
        assert!(matches!(
            events.recv().await.unwrap(),
            ProcessEvent::Crashed { process, .. } if process == first
        ));
        assert!(manager.get_process(&nb("nb1")).is_none());
        assert!(!manager.reap(first, "again").await);

        let second = manager.ensure_process(&nb("nb1"), &alice(), &cat()).await.unwrap();
        assert_ne!(first, second);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_pool_exhaustion() {
        let manager = ProcessManager::new(ProcessManagerConfig {
            grace: Duration::from_millis(500),
            isolation: IsolationSpec::none(),
            pool: Some(UserPool::new(Vec::new())),
        });
        let result = manager.ensure_process(&nb("nb1"), &alice(), &cat()).await;
        assert!(matches!(result, Err(KnobooError::PoolExhausted(0))));
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_registers_nothing() {
        let manager = manager();
        let spec = KernelSpec::new("/nonexistent/kernel");
        let result = manager.ensure_process(&nb("nb1"), &alice(), &spec).await;
        assert!(matches!(result, Err(KnobooError::Spawn(_))));
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_link_hands_output_once() {
        let manager = manager();
        let id = manager.ensure_process(&nb("nb1"), &alice(), &cat()).await.unwrap();

        let mut link = manager.link(id).unwrap();
        assert_eq!(link.framing, Framing::Json);
        assert!(link.output.is_some());
        assert!(manager.link(id).unwrap().output.is_none());

        link.input.send(b"ping\n".to_vec()).await.unwrap();
        let mut output = link.output.take().unwrap();
        let line = tokio::time::timeout(Duration::from_secs(5), output.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.text(), "ping");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_idle_reclaim() {
        let manager = manager();
        let id = manager.ensure_process(&nb("nb1"), &alice(), &cat()).await.unwrap();

        assert_eq!(manager.retain(id).unwrap(), 1);
        assert!(manager.reclaim_idle(Duration::ZERO).await.is_empty());

        assert_eq!(manager.release(id), 0);
        let reclaimed = manager.reclaim_idle(Duration::ZERO).await;
        assert_eq!(reclaimed, vec![id]);
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_process_info() {
        let manager = manager();
        let id = manager.ensure_process(&nb("nb1"), &alice(), &cat()).await.unwrap();
        let info = manager.process_info(id).unwrap();
        assert_eq!(info.notebook, nb("nb1"));
        assert_eq!(info.owner, alice());
        assert_eq!(info.state, ProcessState::Running);
        assert_eq!(info.command, "/bin/cat");
        assert!(info.isolation_user.is_none());
        assert_eq!(manager.infos().len(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_acquire_retains_under_notebook_lock() {
        let manager = manager();
        let id = manager.acquire(&nb("nb1"), &alice(), &cat()).await.unwrap();
        assert_eq!(manager.process_info(id).unwrap().attached, 1);
        assert!(manager.reclaim_idle(Duration::ZERO).await.is_empty());

        assert_eq!(manager.acquire(&nb("nb1"), &alice(), &cat()).await.unwrap(), id);
        assert_eq!(manager.process_info(id).unwrap().attached, 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_acquired_kernel_survives_concurrent_reclaim() {
        let manager = manager();
        manager.ensure_process(&nb("nb1"), &alice(), &cat()).await.unwrap();

        for _ in 0..20 {
            let (nb1, owner, spec) = (nb("nb1"), alice(), cat());
            let (acquired, _) = tokio::join!(
                manager.acquire(&nb1, &owner, &spec),
                manager.reclaim_idle(Duration::ZERO),
            );
            let id = acquired.unwrap();
            let info = manager.process_info(id).unwrap();
            assert_eq!(info.state, ProcessState::Running);
            assert_eq!(info.attached, 1);
            assert_eq!(manager.release(id), 0);
        }
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_notebook_locks_are_pruned() {
        let manager = manager();
        let id = manager.ensure_process(&nb("nb1"), &alice(), &cat()).await.unwrap();
        assert_eq!(manager.tracked_notebooks(), 1);
        manager.stop_process(id).await.unwrap();
        assert_eq!(manager.tracked_notebooks(), 0);

        let missing = KernelSpec::new("/nonexistent/kernel");
        assert!(manager.ensure_process(&nb("nb2"), &alice(), &missing).await.is_err());
        assert_eq!(manager.tracked_notebooks(), 0);

        let id = manager.acquire(&nb("nb3"), &alice(), &cat()).await.unwrap();
        assert_eq!(manager.release(id), 0);
        assert_eq!(manager.reclaim_idle(Duration::ZERO).await, vec![id]);
        assert_eq!(manager.tracked_notebooks(), 0);
    }

    #[tokio::test]
    async fn test_liveness_leaves_pumped_kernel_to_drain() {
        let manager = manager();
        let spec = KernelSpec::new("/bin/sh").arg("-c").arg("echo last; exit 1");
        let id = manager.ensure_process(&nb("nb1"), &alice(), &spec).await.unwrap();
        let mut output = manager.link(id).unwrap().output.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(manager.check_liveness().await.is_empty());
        assert_eq!(manager.count(), 1);
        let line = tokio::time::timeout(Duration::from_secs(5), output.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.text(), "last");

        tokio::time::sleep(OUTPUT_DRAIN).await;
        assert_eq!(manager.check_liveness().await, vec![id]);
        assert_eq!(manager.count(), 0);
    }
}
