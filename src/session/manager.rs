//! Maps live client connections onto notebook kernels.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, info_span, warn, Instrument};

use super::route::{KernelRoute, Outbound};
use super::{Role, Session, SessionId, SessionState, SessionStore};
use crate::error::KnobooError;
use crate::kernel::{KernelOutput, ProcessId};
use crate::notebook::{NotebookDirectory, NotebookId};
use crate::procman::{ProcessEvent, ProcessManager};
use crate::protocol::{Envelope, PayloadKind, ServerMessage};
use crate::realm::{Credentials, Portal, UserId};
use crate::Result;

/// How writers share a notebook kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sharing {
    /// Every writer and viewer is fanned out from one kernel.
    #[default]
    Shared,
    /// One writer per kernel; further writers get `NOTEBOOK_BUSY`.
    Exclusive,
}

/// Session manager settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionManagerConfig {
    pub sharing: Sharing,
}

/// Result of a successful attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    pub session: SessionId,
    pub process: ProcessId,
    pub role: Role,
}

/// Snapshot of one session for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub notebook: NotebookId,
    pub user: UserId,
    pub role: Role,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessId>,
    pub sequence: u64,
    pub idle_secs: f64,
}

/// Creates, routes and destroys sessions.
///
/// Attaching authenticates through the portal, checks the notebook
/// directory, makes sure the notebook has a kernel and binds the session
/// to that kernel's route.
pub struct SessionManager {
    portal: Portal,
    directory: Arc<dyn NotebookDirectory>,
    procman: Arc<ProcessManager>,
    store: SessionStore,
    routes: RwLock<HashMap<ProcessId, Arc<KernelRoute>>>,
    config: SessionManagerConfig,
}

impl SessionManager {
    /// Build the manager and start listening for kernel lifecycle events.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        portal: Portal,
        directory: Arc<dyn NotebookDirectory>,
        procman: Arc<ProcessManager>,
        config: SessionManagerConfig,
    ) -> Arc<Self> {
        let events = procman.subscribe();
        let manager = Arc::new(Self {
            portal,
            directory,
            procman,
            store: SessionStore::new(),
            routes: RwLock::new(HashMap::new()),
            config,
        });
        tokio::spawn(listen_events(Arc::downgrade(&manager), events));
        manager
    }

    pub fn portal(&self) -> &Portal {
        &self.portal
    }

    pub fn processes(&self) -> &Arc<ProcessManager> {
        &self.procman
    }

    pub fn config(&self) -> SessionManagerConfig {
        self.config
    }

    fn exclusive(&self) -> bool {
        self.config.sharing == Sharing::Exclusive
    }

    /// Authenticate, authorize and bind a new session.
    ///
    /// Nothing is created when any step fails. On success an `attached`
    /// frame is queued on `outbound`.
    pub async fn attach(
        &self,
        outbound: Outbound,
        notebook: &NotebookId,
        credentials: &Credentials,
    ) -> Result<Attachment> {
        let span = info_span!("attach", notebook = %notebook, user = credentials.claimed_user().unwrap_or("-"));
        async move {
            let avatar = self.portal.authenticate(credentials)?;
            let record = self.directory.lookup(notebook)?;
            let access = record.access_for(avatar.user());
            let session = Session::open(notebook.clone(), avatar, access, outbound)?;

            let spec = self.directory.kernel_spec(&record.owner);
            let process = self.procman.acquire(notebook, &record.owner, &spec).await?;
            let attachment = Attachment {
                session: session.id(),
                process,
                role: session.role(),
            };
            if let Err(e) = self.bind(session, attachment) {
                self.abandon(attachment.session, process);
                return Err(e);
            }

            info!(
                session = %attachment.session,
                process = %process,
                role = ?attachment.role,
                "session attached"
            );
            Ok::<_, KnobooError>(attachment)
        }
        .instrument(span)
        .await
    }

    /// Subscribe a fresh session to its kernel and store it.
    fn bind(&self, mut session: Session, attachment: Attachment) -> Result<()> {
        let route = self.route_for(attachment.process)?;
        session.activate(route, self.exclusive())?;
        session.deliver(ServerMessage::Attached {
            session_id: attachment.session,
            process_id: attachment.process,
            role: attachment.role,
        })?;
        self.store.insert(session)?;
        Ok(())
    }

    /// Undo the subscription and attach count of a failed attach.
    fn abandon(&self, session: SessionId, process: ProcessId) {
        if let Ok(routes) = self.routes.read() {
            if let Some(route) = routes.get(&process) {
                route.unsubscribe(session);
            }
        }
        let remaining = self.procman.release(process);
        debug!(session = %session, process = %process, remaining, "attach abandoned");
    }

    /// Close a session. Its kernel keeps running.
    pub async fn detach(&self, id: SessionId) -> Result<()> {
        let handle = self
            .store
            .remove(&id)?
            .ok_or_else(|| KnobooError::SessionNotFound(id.to_string()))?;

        let mut session = handle.lock().await;
        if let Some(process) = session.close()? {
            let remaining = self.procman.release(process);
            debug!(session = %id, process = %process, remaining, "session released kernel");
        }
        info!(session = %id, "session closed");
        Ok(())
    }

    /// Forward one client request to the session's kernel.
    pub async fn route(&self, id: SessionId, payload: Value, sequence: Option<u64>) -> Result<u64> {
        let handle = self.store.get(&id)?;
        let mut session = handle.lock().await;
        session.send(payload, sequence).await
    }

    /// Queue a frame for one session.
    pub async fn deliver(&self, id: SessionId, message: ServerMessage) -> Result<()> {
        let handle = self.store.get(&id)?;
        let session = handle.lock().await;
        session.deliver(message)
    }

    /// Deliver `envelope` to every active session of `notebook`.
    ///
    /// Returns the number of sessions reached.
    pub async fn broadcast(&self, notebook: &NotebookId, envelope: Envelope) -> Result<usize> {
        let mut delivered = 0;
        for handle in self.store.notebook_sessions(notebook)? {
            let session = handle.lock().await;
            if session.state().is_active()
                && session
                    .deliver(ServerMessage::Envelope(envelope.clone()))
                    .is_ok()
            {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Give a session whose kernel died a fresh one.
    ///
    /// A session that is still attached just gets its current kernel back.
    pub async fn restart(&self, id: SessionId) -> Result<ProcessId> {
        let handle = self.store.get(&id)?;
        let mut session = handle.lock().await;

        // The kernel may already be gone from the table before the crash
        // notice has detached this session.
        let current = session
            .process()
            .filter(|process| self.procman.process_info(*process).is_ok());

        let process = match current {
            Some(process) => process,
            None => {
                session.detach_process();
                let notebook = session.notebook().clone();
                let record = self.directory.lookup(&notebook)?;
                let spec = self.directory.kernel_spec(&record.owner);
                let process = self.procman.acquire(&notebook, &record.owner, &spec).await?;
                let bound = self
                    .route_for(process)
                    .and_then(|route| session.reattach(route, self.exclusive()));
                if let Err(e) = bound {
                    self.abandon(id, process);
                    return Err(e);
                }
                info!(session = %id, process = %process, "session restarted");
                process
            }
        };

        session.deliver(ServerMessage::Attached {
            session_id: id,
            process_id: process,
            role: session.role(),
        })?;
        Ok(process)
    }

    pub fn session_count(&self) -> usize {
        self.store.count()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.store.contains(&id).unwrap_or(false)
    }

    /// Snapshots of every session.
    pub async fn sessions(&self) -> Result<Vec<SessionInfo>> {
        let mut infos = Vec::new();
        for handle in self.store.handles()? {
            let session = handle.lock().await;
            infos.push(SessionInfo {
                id: session.id(),
                notebook: session.notebook().clone(),
                user: session.avatar().user().clone(),
                role: session.role(),
                state: session.state(),
                process: session.process(),
                sequence: session.sequence(),
                idle_secs: session.idle_duration().as_secs_f64(),
            });
        }
        infos.sort_by_key(|info| info.id);
        Ok(infos)
    }

    /// Close every session.
    pub async fn shutdown(&self) {
        for id in self.store.list_ids().unwrap_or_default() {
            if let Err(e) = self.detach(id).await {
                debug!(session = %id, "detach during shutdown failed: {}", e);
            }
        }
    }

    fn route_for(&self, process: ProcessId) -> Result<Arc<KernelRoute>> {
        let mut routes = self.routes.write().map_err(|_| KnobooError::LockPoisoned)?;
        if let Some(route) = routes.get(&process) {
            return Ok(Arc::clone(route));
        }

        let link = self.procman.link(process)?;
        let info = self.procman.process_info(process)?;
        let route = Arc::new(KernelRoute::new(
            process,
            info.notebook,
            link.input,
            link.framing,
        ));
        match link.output {
            Some(output) => {
                tokio::spawn(pump_output(
                    Arc::downgrade(&self.procman),
                    Arc::clone(&route),
                    output,
                ));
            }
            None => warn!(process = %process, "kernel output already claimed"),
        }
        routes.insert(process, Arc::clone(&route));
        Ok(route)
    }

    fn take_route(&self, process: ProcessId) -> Option<Arc<KernelRoute>> {
        self.routes.write().ok()?.remove(&process)
    }

    /// Fail every route whose kernel is no longer tracked.
    ///
    /// Used after missing lifecycle events.
    async fn resync(&self) {
        let orphaned: Vec<ProcessId> = match self.routes.read() {
            Ok(routes) => routes
                .keys()
                .copied()
                .filter(|process| self.procman.process_info(*process).is_err())
                .collect(),
            Err(_) => return,
        };
        for process in orphaned {
            let error = KnobooError::ProcessCrashed(format!("{}: kernel exited", process));
            self.kernel_gone(process, |_| ServerMessage::error(&error)).await;
        }
    }

    async fn kernel_gone(&self, process: ProcessId, notice: impl Fn(SessionId) -> ServerMessage) {
        let Some(route) = self.take_route(process) else {
            return;
        };
        for id in route.fail(notice) {
            if let Ok(handle) = self.store.get(&id) {
                let mut session = handle.lock().await;
                if session.process() == Some(process) {
                    session.detach_process();
                }
            }
        }
    }
}

/// Copy kernel output into its route until the kernel closes stdout.
async fn pump_output(
    procman: Weak<ProcessManager>,
    route: Arc<KernelRoute>,
    mut output: mpsc::Receiver<KernelOutput>,
) {
    let process = route.process();
    while let Some(line) = output.recv().await {
        route.dispatch(&line);
    }
    debug!(process = %process, "kernel output closed");
    if let Some(procman) = procman.upgrade() {
        procman.reap(process, "kernel output closed").await;
    }
}

async fn listen_events(manager: Weak<SessionManager>, mut events: broadcast::Receiver<ProcessEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "session manager missed kernel events");
                match manager.upgrade() {
                    Some(manager) => manager.resync().await,
                    None => break,
                }
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(manager) = manager.upgrade() else {
            break;
        };

        match event {
            ProcessEvent::Started { .. } => {}
            ProcessEvent::Crashed {
                process, reason, ..
            } => {
                let error = KnobooError::ProcessCrashed(format!("{}: {}", process, reason));
                manager
                    .kernel_gone(process, |_| ServerMessage::error(&error))
                    .await;
            }
            ProcessEvent::Stopped { process, .. } => {
                manager
                    .kernel_gone(process, |session| {
                        Envelope::new(
                            session,
                            0,
                            PayloadKind::Status,
                            json!({"process_id": process, "state": "stopped"}),
                        )
                        .into()
                    })
                    .await;
            }
        }
    }
    debug!("kernel event listener finished");
}
