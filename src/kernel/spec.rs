//! Launch description for kernel processes.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::KnobooError;
use crate::Result;

/// How requests are framed on the kernel's stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// One JSON object per line carrying a request tag.
    #[default]
    Json,
    /// Payload written verbatim followed by a newline.
    Raw,
}

/// Everything needed to spawn one kernel process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelSpec {
    /// Executable path or name resolved through `PATH`.
    pub command: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Working directory. Interpreted inside `root` when a jail is used.
    pub working_dir: Option<PathBuf>,
    /// Chroot jail for the process.
    pub root: Option<PathBuf>,
    /// Package search path exported as `PYTHONPATH`.
    pub search_path: Vec<PathBuf>,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
    /// Request framing on stdin.
    pub framing: Framing,
}

impl Default for KernelSpec {
    fn default() -> Self {
        Self {
            command: "/usr/bin/python3".to_string(),
            args: vec!["-u".into(), "-m".into(), "knoboo.engine".into()],
            working_dir: None,
            root: None,
            search_path: Vec::new(),
            env: HashMap::new(),
            framing: Framing::Json,
        }
    }
}

impl KernelSpec {
    /// Create a spec for `command` with no arguments.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            ..Default::default()
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set the working directory.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Run the process inside a chroot jail.
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Add a package search path entry.
    pub fn search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_path.push(path.into());
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the request framing.
    pub fn framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    /// The `PYTHONPATH` value for this spec, if any search path is configured.
    pub fn python_path(&self) -> Result<Option<OsString>> {
        if self.search_path.is_empty() {
            return Ok(None);
        }
        std::env::join_paths(&self.search_path)
            .map(Some)
            .map_err(|e| KnobooError::Spawn(format!("invalid search path: {e}")))
    }
}

/// OS identity a kernel process runs as.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationSpec {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl IsolationSpec {
    /// Run as the current user.
    pub fn none() -> Self {
        Self::default()
    }

    /// Run as the given uid/gid pair.
    pub fn user(uid: u32, gid: u32) -> Self {
        Self {
            uid: Some(uid),
            gid: Some(gid),
        }
    }

    pub fn is_isolated(&self) -> bool {
        self.uid.is_some() || self.gid.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_spec() {
        let spec = KernelSpec::default();
        assert!(spec.command.contains("python"));
        assert_eq!(spec.framing, Framing::Json);
        assert!(spec.python_path().unwrap().is_none());
    }

    #[test]
    fn test_builder() {
        let spec = KernelSpec::new("/bin/cat")
            .arg("-u")
            .working_dir("/tmp")
            .env("KEY", "value")
            .framing(Framing::Raw);

        assert_eq!(spec.command, "/bin/cat");
        assert_eq!(spec.args, vec!["-u".to_string()]);
        assert_eq!(spec.working_dir, Some(PathBuf::from("/tmp")));
        assert_eq!(spec.env.get("KEY").map(String::as_str), Some("value"));
        assert_eq!(spec.framing, Framing::Raw);
    }

    #[test]
    #[cfg(unix)]
    fn test_python_path_joined() {
        let spec = KernelSpec::default()
            .search_path("/opt/knoboo/lib")
            .search_path("/opt/site");
        let joined = spec.python_path().unwrap().unwrap();
        assert_eq!(joined, OsString::from("/opt/knoboo/lib:/opt/site"));
    }

    #[test]
    fn test_spec_from_partial_json() {
        let spec: KernelSpec = serde_json::from_str(r#"{"command": "sage"}"#).unwrap();
        assert_eq!(spec.command, "sage");
        assert_eq!(spec.framing, Framing::Json);
    }

    #[test]
    fn test_isolation() {
        assert!(!IsolationSpec::none().is_isolated());
        assert!(IsolationSpec::user(1001, 1001).is_isolated());
    }
}
