//! Notebook directory: who may use which notebook, and with what kernel.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::KnobooError;
use crate::kernel::KernelSpec;
use crate::realm::UserId;
use crate::Result;

/// Identifier of a notebook as chosen by the web tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotebookId(String);

impl NotebookId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NotebookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NotebookId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A user's access level on one notebook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    None,
    Viewer,
    Collaborator,
    Owner,
}

impl Access {
    /// Whether this level may send input to the kernel.
    pub fn can_write(&self) -> bool {
        matches!(self, Access::Owner | Access::Collaborator)
    }

    pub fn can_read(&self) -> bool {
        !matches!(self, Access::None)
    }
}

/// Sharing information for one notebook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotebookRecord {
    pub owner: UserId,
    #[serde(default)]
    pub collaborators: HashSet<UserId>,
    #[serde(default)]
    pub viewers: HashSet<UserId>,
}

impl NotebookRecord {
    pub fn new(owner: impl Into<UserId>) -> Self {
        Self {
            owner: owner.into(),
            collaborators: HashSet::new(),
            viewers: HashSet::new(),
        }
    }

    pub fn collaborator(mut self, user: impl Into<UserId>) -> Self {
        self.collaborators.insert(user.into());
        self
    }

    pub fn viewer(mut self, user: impl Into<UserId>) -> Self {
        self.viewers.insert(user.into());
        self
    }

    /// Highest access level `user` holds on this notebook.
    pub fn access_for(&self, user: &UserId) -> Access {
        if &self.owner == user {
            Access::Owner
        } else if self.collaborators.contains(user) {
            Access::Collaborator
        } else if self.viewers.contains(user) {
            Access::Viewer
        } else {
            Access::None
        }
    }
}

/// Lookup service provided by the web tier.
pub trait NotebookDirectory: Send + Sync {
    /// Sharing record for `notebook`.
    fn lookup(&self, notebook: &NotebookId) -> Result<NotebookRecord>;

    /// Kernel launch description for notebooks owned by `owner`.
    fn kernel_spec(&self, owner: &UserId) -> KernelSpec;

    /// Access level of `user` on `notebook`.
    fn access(&self, notebook: &NotebookId, user: &UserId) -> Result<Access> {
        Ok(self.lookup(notebook)?.access_for(user))
    }
}

/// Directory held in memory, filled from configuration.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    notebooks: RwLock<HashMap<NotebookId, NotebookRecord>>,
    specs: HashMap<UserId, KernelSpec>,
    default_spec: KernelSpec,
}

impl InMemoryDirectory {
    pub fn new(default_spec: KernelSpec) -> Self {
        Self {
            notebooks: RwLock::new(HashMap::new()),
            specs: HashMap::new(),
            default_spec,
        }
    }

    /// Use a dedicated kernel spec for notebooks owned by `owner`.
    pub fn with_spec(mut self, owner: impl Into<UserId>, spec: KernelSpec) -> Self {
        self.specs.insert(owner.into(), spec);
        self
    }

    pub fn with_notebook(self, id: impl Into<NotebookId>, record: NotebookRecord) -> Self {
        self.insert(id.into(), record);
        self
    }

    pub fn insert(&self, id: NotebookId, record: NotebookRecord) {
        if let Ok(mut notebooks) = self.notebooks.write() {
            notebooks.insert(id, record);
        }
    }

    pub fn remove(&self, id: &NotebookId) -> Option<NotebookRecord> {
        self.notebooks.write().ok()?.remove(id)
    }

    pub fn count(&self) -> usize {
        self.notebooks.read().map(|n| n.len()).unwrap_or(0)
    }
}

impl NotebookDirectory for InMemoryDirectory {
    fn lookup(&self, notebook: &NotebookId) -> Result<NotebookRecord> {
        let notebooks = self.notebooks.read().map_err(|_| KnobooError::LockPoisoned)?;
        notebooks
            .get(notebook)
            .cloned()
            .ok_or_else(|| KnobooError::NotebookNotFound(notebook.to_string()))
    }

    fn kernel_spec(&self, owner: &UserId) -> KernelSpec {
        self.specs
            .get(owner)
            .cloned()
            .unwrap_or_else(|| self.default_spec.clone())
    }
}
