//! # knoboo
//!
//! Kernel process supervisor and notebook session broker.
//!
//! Clients connect over WebSocket (or newline-delimited JSON on a plain TCP
//! port), authenticate with a handshake and get attached to the single
//! kernel process of a notebook. Output from the kernel fans out to every
//! session on that notebook; only owners and collaborators may send input.
//!
//! ## Layout
//!
//! - [`kernel`]: one OS process with line-oriented stdin/stdout channels
//! - [`procman`]: process table, user pool and crash supervisor
//! - [`realm`]: credential checkers, portal and avatars
//! - [`notebook`]: notebook sharing records and kernel specs
//! - [`session`]: sessions and the manager binding them to kernels
//! - [`protocol`]: client and kernel wire formats
//! - [`frontend`]: WebSocket, direct TCP and admin HTTP listeners
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use knoboo::{
//!     Credentials, InMemoryDirectory, KernelSpec, NotebookRecord, PasswordChecker, Portal,
//!     ProcessManager, Realm, SessionManager, SessionManagerConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> knoboo::Result<()> {
//!     knoboo::logging::try_init(None).ok();
//!
//!     let portal = Portal::new(Realm::new())
//!         .with_checker(Arc::new(PasswordChecker::with_users([("alice", "secret")])));
//!     let directory = InMemoryDirectory::new(KernelSpec::new("/bin/cat"))
//!         .with_notebook("nb1", NotebookRecord::new("alice"));
//!     let sessions = SessionManager::new(
//!         portal,
//!         Arc::new(directory),
//!         Arc::new(ProcessManager::default()),
//!         SessionManagerConfig::default(),
//!     );
//!
//!     let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//!     let attachment = sessions
//!         .attach(tx, &"nb1".into(), &Credentials::password("alice", "secret"))
//!         .await?;
//!     sessions.route(attachment.session, "hello".into(), None).await?;
//!
//!     while let Some(message) = rx.recv().await {
//!         println!("{}", message.to_json()?);
//!     }
//!     Ok(())
//! }
//! ```

pub mod browser;
pub mod cli;
pub mod config;
pub mod error;
pub mod frontend;
pub mod kernel;
pub mod logging;
pub mod notebook;
pub mod procman;
pub mod protocol;
pub mod realm;
pub mod service;
pub mod session;

// Re-export commonly used types
pub use config::{Config, ServiceMode};
pub use error::{KnobooError, Result};
pub use kernel::{Framing, IsolationSpec, KernelProcess, KernelSpec, ProcessId, ProcessState};
pub use notebook::{Access, InMemoryDirectory, NotebookDirectory, NotebookId, NotebookRecord};
pub use procman::{ProcessEvent, ProcessManager, ProcessManagerConfig, UserPool};
pub use protocol::{ClientMessage, Envelope, PayloadKind, ServerMessage};
pub use realm::{Avatar, Credentials, PasswordChecker, Permissions, Portal, Realm, TokenChecker, UserId};
pub use service::Service;
pub use session::{Role, SessionId, SessionManager, SessionManagerConfig, SessionState, Sharing};
