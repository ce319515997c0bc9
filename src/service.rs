//! Service assembly: builds the managers from configuration and runs the
//! listeners selected by the service mode.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::browser::{browser_url, open_browser};
use crate::config::{AuthSection, Config, ServiceMode};
use crate::error::KnobooError;
use crate::frontend::{self, AppState};
use crate::notebook::{InMemoryDirectory, NotebookId};
use crate::procman::{spawn_supervisor, ProcessManager, ProcessManagerConfig, UserPool};
use crate::realm::{PasswordChecker, Portal, Realm, TokenChecker, UserId};
use crate::session::SessionManager;
use crate::Result;

/// Portal with a password checker and a token checker from `auth`.
///
/// Checkers with no entries are not registered.
pub fn build_portal(auth: &AuthSection) -> Portal {
    let realm = auth
        .admins
        .iter()
        .fold(Realm::new(), |realm, admin| realm.admin(admin.as_str()));
    let mut portal = Portal::new(realm);

    if !auth.users.is_empty() {
        let checker = PasswordChecker::with_users(
            auth.users
                .iter()
                .map(|(user, secret)| (user.as_str(), secret.as_str())),
        );
        portal.register(Arc::new(checker));
    }

    if !auth.tokens.is_empty() {
        let checker = TokenChecker::new();
        for (token, user) in &auth.tokens {
            checker.add_token(token.as_str(), UserId::new(user.as_str()));
        }
        portal.register(Arc::new(checker));
    }

    portal
}

/// Notebook directory holding the configured notebooks.
pub fn build_directory(config: &Config) -> InMemoryDirectory {
    let directory = config.engines.owners.iter().fold(
        InMemoryDirectory::new(config.kernel_spec()),
        |directory, (owner, spec)| directory.with_spec(owner.as_str(), spec.clone()),
    );
    for (id, record) in &config.notebooks {
        directory.insert(NotebookId::new(id.as_str()), record.clone());
    }
    directory
}

/// Process manager with the user pool enabled when `engines.max > 1`.
pub fn build_process_manager(config: &Config) -> ProcessManager {
    let pool = config.uses_pool().then(|| {
        let (base_uid, gid) = config.pool_identity();
        UserPool::sequential(&config.engines.user_prefix, base_uid, gid, config.engines.max)
    });
    if let Some(ref pool) = pool {
        info!(capacity = pool.capacity(), "user pool enabled");
    }

    ProcessManager::new(ProcessManagerConfig {
        grace: config.grace(),
        isolation: config.isolation(),
        pool,
    })
}

/// A fully wired knoboo service.
pub struct Service {
    config: Config,
    sessions: Arc<SessionManager>,
    cancel: CancellationToken,
}

impl Service {
    /// Build every component from `config`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: Config) -> Self {
        let portal = build_portal(&config.auth);
        if portal.checker_count() == 0 {
            warn!("no credentials configured, every handshake will be rejected");
        }
        let directory = build_directory(&config);
        info!(notebooks = directory.count(), "notebook directory loaded");

        let procman = Arc::new(build_process_manager(&config));
        let sessions = SessionManager::new(
            portal,
            Arc::new(directory),
            procman,
            config.session_manager_config(),
        );

        Self {
            config,
            sessions,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Token that stops the service when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until Ctrl-C, cancellation, or a listener failure.
    ///
    /// On the way out every session is closed and every kernel stopped
    /// within the configured grace period.
    pub async fn run(self) -> Result<()> {
        let mode = self.config.mode;
        info!(%mode, "starting knoboo v{}", env!("CARGO_PKG_VERSION"));

        let server = if mode.serves_web() {
            Some(self.config.to_server_config()?)
        } else {
            None
        };

        let mut listeners = Vec::new();
        if mode.serves_direct() {
            let addr = self.config.kernel_address()?;
            let listener = TcpListener::bind(&addr).await.map_err(KnobooError::Io)?;
            listeners.push(self.watch(frontend::serve_direct(
                listener,
                Arc::clone(&self.sessions),
                self.config.connection_config(),
                self.cancel.clone(),
            )));
        }
        if let Some(server) = server {
            let state = AppState::new(Arc::clone(&self.sessions))
                .with_connection(self.config.connection_config());
            listeners.push(self.watch(frontend::serve(
                server,
                state,
                self.cancel.clone(),
            )));

            if mode == ServiceMode::Desktop && self.config.server.open_browser {
                let url = browser_url(&self.config.server);
                if let Err(e) = open_browser(&url) {
                    warn!(url, "failed to open browser: {}", e);
                }
            }
        }

        let supervisor = spawn_supervisor(
            Arc::clone(self.sessions.processes()),
            self.config.supervisor_config(),
            self.cancel.clone(),
        );

        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        error!("failed to listen for Ctrl-C: {}", e);
                    }
                    info!("shutdown requested");
                    cancel.cancel();
                }
                () = cancel.cancelled() => {}
            }
        });

        let mut result = Ok(());
        for listener in listeners {
            match listener.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => result = Err(e),
                Err(e) => {
                    error!("listener task failed: {}", e);
                    self.cancel.cancel();
                }
            }
        }

        if let Err(e) = supervisor.await {
            warn!("supervisor task failed: {}", e);
        }
        self.sessions.shutdown().await;
        self.sessions.processes().shutdown().await;
        info!("knoboo stopped");
        result
    }

    /// Spawn a listener that cancels the whole service if it fails.
    fn watch<F>(&self, listener: F) -> JoinHandle<Result<()>>
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let result = listener.await;
            if let Err(ref e) = result {
                error!("listener failed: {}", e);
                cancel.cancel();
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notebook::{NotebookDirectory, NotebookRecord};
    use crate::realm::Credentials;

    fn config() -> Config {
        let mut config = Config::default();
        config.auth.users.insert("alice".into(), "a".into());
        config.auth.tokens.insert("kb_admin".into(), "root".into());
        config.auth.admins.push("root".into());
        config
            .notebooks
            .insert("nb1".into(), NotebookRecord::new("alice").viewer("bob"));
        config
    }

    #[test]
    fn test_build_portal() {
        let portal = build_portal(&config().auth);
        assert_eq!(portal.checker_count(), 2);

        let alice = portal
            .authenticate(&Credentials::password("alice", "a"))
            .unwrap();
        assert!(!alice.can_manage_processes());

        let root = portal.authenticate(&Credentials::token("kb_admin")).unwrap();
        assert_eq!(root.user().as_str(), "root");
        assert!(root.can_manage_processes());
    }

    #[test]
    fn test_build_portal_empty() {
        assert_eq!(build_portal(&AuthSection::default()).checker_count(), 0);
    }

    #[test]
    fn test_build_directory() {
        let mut config = config();
        config
            .engines
            .owners
            .insert("alice".into(), crate::kernel::KernelSpec::new("/bin/cat"));
        let directory = build_directory(&config);

        assert_eq!(directory.count(), 1);
        let record = directory.lookup(&"nb1".into()).unwrap();
        assert_eq!(record.owner, UserId::new("alice"));
        assert_eq!(directory.kernel_spec(&UserId::new("alice")).command, "/bin/cat");
        assert_eq!(
            directory.kernel_spec(&UserId::new("bob")).command,
            config.engines.command
        );
    }

    #[test]
    fn test_pool_only_for_multiple_engines() {
        let mut config = config();
        assert!(build_process_manager(&config).config().pool.is_none());

        config.engines.max = 3;
        let procman = build_process_manager(&config);
        let pool = procman.config().pool.as_ref().unwrap();
        assert_eq!(pool.capacity(), 3);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let mut config = config();
        config.mode = ServiceMode::Kernel;
        config.kernel.port = 0;

        let service = Service::new(config);
        let cancel = service.cancel_token();
        let run = tokio::spawn(service.run());
        cancel.cancel();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
