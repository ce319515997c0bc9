//! Configuration management for knoboo.
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. Command-line arguments
//! 2. Environment variables (`KNOBOO_*`)
//! 3. Configuration file (JSON)
//! 4. Default values

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cli::Args;
use crate::frontend::{ConnectionConfig, ServerConfig, DEFAULT_MAX_FRAME_BYTES};
use crate::kernel::{Framing, IsolationSpec, KernelSpec};
use crate::notebook::NotebookRecord;
use crate::procman::SupervisorConfig;
use crate::session::{SessionManagerConfig, Sharing};

/// Name of the config file looked up inside `env_path`.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// User that `KNOBOO_ADMIN_TOKEN` authenticates as.
pub const ENV_ADMIN_USER: &str = "admin";

/// First uid handed out by the user pool when none is configured.
pub const DEFAULT_POOL_BASE_UID: u32 = 20_000;

/// Which listeners the service runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceMode {
    /// Web front-end plus the direct kernel listener.
    #[default]
    Desktop,
    /// Web front-end only.
    Webapp,
    /// Direct kernel listener only.
    Kernel,
}

impl ServiceMode {
    pub fn serves_web(&self) -> bool {
        matches!(self, Self::Desktop | Self::Webapp)
    }

    pub fn serves_direct(&self) -> bool {
        matches!(self, Self::Desktop | Self::Kernel)
    }
}

impl fmt::Display for ServiceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Desktop => "desktop",
            Self::Webapp => "webapp",
            Self::Kernel => "kernel",
        })
    }
}

impl FromStr for ServiceMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "desktop" => Ok(Self::Desktop),
            "webapp" => Ok(Self::Webapp),
            "kernel" => Ok(Self::Kernel),
            _ => Err(ConfigError::Invalid(format!("unknown mode '{}'", s))),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listeners to run.
    pub mode: ServiceMode,
    /// Development mode: verbose logging.
    pub devel: bool,
    pub server: ServerSection,
    pub kernel: KernelSection,
    pub engines: EnginesSection,
    pub auth: AuthSection,
    pub sessions: SessionsSection,
    /// Notebook sharing records keyed by notebook id.
    pub notebooks: BTreeMap<String, NotebookRecord>,
    pub logging: LoggingSection,
}

/// Web front-end section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Running behind a reverse proxy.
    pub proxy: bool,
    /// Root URL path the front-end is served under.
    pub url_root: String,
    /// Open the front-end in a browser once it listens (desktop mode).
    pub open_browser: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            proxy: false,
            url_root: "/".to_string(),
            open_browser: false,
        }
    }
}

/// Direct kernel listener section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelSection {
    pub host: String,
    pub port: u16,
}

impl Default for KernelSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8337,
        }
    }
}

/// Kernel process launch section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnginesSection {
    /// Kernel executable.
    pub command: String,
    /// Kernel arguments.
    pub args: Vec<String>,
    /// Request framing on the kernel's stdin.
    pub framing: Framing,
    /// Run path of kernel processes.
    pub path: Option<PathBuf>,
    /// Chroot jail for kernel processes.
    pub root: Option<PathBuf>,
    /// Package search path inside the jail.
    pub pythonpath: Vec<PathBuf>,
    /// Fixed uid for kernels. Used as the pool's first uid when `max > 1`.
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Maximum number of simultaneously isolated kernels.
    pub max: usize,
    /// Name prefix for pool identities.
    pub user_prefix: String,
    /// Seconds a stopping kernel gets before it is killed.
    pub grace_secs: u64,
    /// Per-owner kernel overrides.
    pub owners: BTreeMap<String, KernelSpec>,
}

impl Default for EnginesSection {
    fn default() -> Self {
        let spec = KernelSpec::default();
        Self {
            command: spec.command,
            args: spec.args,
            framing: spec.framing,
            path: None,
            root: None,
            pythonpath: Vec::new(),
            uid: None,
            gid: None,
            max: 1,
            user_prefix: "knoboo".to_string(),
            grace_secs: 5,
            owners: BTreeMap::new(),
        }
    }
}

/// Credential section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    /// Username to shared secret.
    pub users: BTreeMap<String, String>,
    /// Bearer token to username.
    pub tokens: BTreeMap<String, String>,
    /// Users allowed to manage kernel processes.
    pub admins: Vec<String>,
}

/// Session behavior section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsSection {
    pub sharing: Sharing,
    /// Seconds an unattached kernel may idle before it is stopped. 0 disables.
    pub idle_timeout_secs: u64,
    /// Seconds between supervisor sweeps.
    pub supervisor_interval_secs: u64,
    pub max_protocol_errors: u32,
    pub handshake_timeout_secs: u64,
    /// Largest client frame accepted, in bytes.
    pub max_frame_bytes: usize,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            sharing: Sharing::Shared,
            idle_timeout_secs: 0,
            supervisor_interval_secs: 2,
            max_protocol_errors: 5,
            handshake_timeout_secs: 30,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Level or filter directives. Unset means `knoboo=info`.
    pub level: Option<String>,
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        serde_json::from_str(&content).map_err(ConfigError::Json)
    }

    /// Apply `KNOBOO_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("KNOBOO_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("KNOBOO_PORT") {
            self.server.port = parse_env("KNOBOO_PORT", &port)?;
        }
        if let Some(host) = lookup("KNOBOO_KERNEL_HOST") {
            self.kernel.host = host;
        }
        if let Some(port) = lookup("KNOBOO_KERNEL_PORT") {
            self.kernel.port = parse_env("KNOBOO_KERNEL_PORT", &port)?;
        }
        if let Some(max) = lookup("KNOBOO_ENGINES_MAX") {
            self.engines.max = parse_env("KNOBOO_ENGINES_MAX", &max)?;
        }
        if let Some(mode) = lookup("KNOBOO_MODE") {
            self.mode = mode.parse()?;
        }
        if let Some(token) = lookup("KNOBOO_ADMIN_TOKEN").filter(|t| !t.is_empty()) {
            self.auth.tokens.insert(token, ENV_ADMIN_USER.to_string());
            if !self.auth.admins.iter().any(|a| a == ENV_ADMIN_USER) {
                self.auth.admins.push(ENV_ADMIN_USER.to_string());
            }
        }
        if let Some(level) = lookup("KNOBOO_LOG_LEVEL") {
            self.logging.level = Some(level);
        }
        Ok(())
    }

    /// Apply CLI argument overrides.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(host) = args.host {
            self.server.host = host.to_string();
        }
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(host) = args.kernel_host {
            self.kernel.host = host.to_string();
        }
        if let Some(port) = args.kernel_port {
            self.kernel.port = port;
        }
        if let Some(ref path) = args.engines_path {
            self.engines.path = Some(path.clone());
        }
        if let Some(ref root) = args.engines_root {
            self.engines.root = Some(root.clone());
        }
        if !args.engines_pythonpath.is_empty() {
            self.engines.pythonpath = args.engines_pythonpath.clone();
        }
        if let Some(uid) = args.engines_uid {
            self.engines.uid = Some(uid);
        }
        if let Some(gid) = args.engines_gid {
            self.engines.gid = Some(gid);
        }
        if let Some(max) = args.engines_max {
            self.engines.max = max;
        }
        if let Some(ref prefix) = args.engines_user_prefix {
            self.engines.user_prefix = prefix.clone();
        }
        if args.proxy {
            self.server.proxy = true;
        }
        if let Some(ref root) = args.url_root {
            self.server.url_root = root.clone();
        }
        if args.open_browser {
            self.server.open_browser = true;
        }
        if let Some(mode) = args.mode {
            self.mode = mode;
        }
        if args.devel {
            self.devel = true;
        }
        if let Some(ref level) = args.log_level {
            self.logging.level = Some(level.clone());
        }
    }

    /// Load configuration with full priority chain.
    ///
    /// Without `--config`, `config.json` inside `env_path` is used when it
    /// exists.
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let path = args.config.clone().or_else(|| {
            args.env_path
                .as_ref()
                .map(|dir| dir.join(CONFIG_FILE_NAME))
                .filter(|p| p.is_file())
        });

        let mut config = match path {
            Some(ref path) => Config::from_file(path)?,
            None => Config::default(),
        };
        config.apply_env()?;
        config.apply_args(args);
        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_host(&self.server.host)?;
        parse_host(&self.kernel.host)?;
        if self.engines.max == 0 {
            return Err(ConfigError::Invalid("engines.max must be at least 1".into()));
        }
        if self.engines.command.trim().is_empty() {
            return Err(ConfigError::Invalid("engines.command is empty".into()));
        }
        for (id, record) in &self.notebooks {
            if record.owner.as_str().is_empty() {
                return Err(ConfigError::Invalid(format!("notebook '{}' has no owner", id)));
            }
        }
        Ok(())
    }

    /// Front-end listener settings.
    pub fn to_server_config(&self) -> Result<ServerConfig, ConfigError> {
        let host = parse_host(&self.server.host)?;
        let mut server = ServerConfig::new(host.to_string(), self.server.port);
        server.proxy = self.server.proxy;
        server.url_root = self.server.url_root.clone();
        Ok(server)
    }

    /// Address of the direct kernel listener.
    pub fn kernel_address(&self) -> Result<String, ConfigError> {
        let host = parse_host(&self.kernel.host)?;
        Ok(format!("{}:{}", host, self.kernel.port))
    }

    /// Default kernel launch description.
    pub fn kernel_spec(&self) -> KernelSpec {
        KernelSpec {
            command: self.engines.command.clone(),
            args: self.engines.args.clone(),
            working_dir: self.engines.path.clone(),
            root: self.engines.root.clone(),
            search_path: self.engines.pythonpath.clone(),
            framing: self.engines.framing,
            ..KernelSpec::default()
        }
    }

    /// Whether kernels are isolated through the user pool.
    pub fn uses_pool(&self) -> bool {
        self.engines.max > 1
    }

    /// Fixed identity for kernels outside pool mode.
    pub fn isolation(&self) -> IsolationSpec {
        if self.uses_pool() {
            return IsolationSpec::none();
        }
        IsolationSpec {
            uid: self.engines.uid,
            gid: self.engines.gid,
        }
    }

    /// First uid and the gid of pool identities.
    pub fn pool_identity(&self) -> (u32, u32) {
        let base = self.engines.uid.unwrap_or(DEFAULT_POOL_BASE_UID);
        (base, self.engines.gid.unwrap_or(base))
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.engines.grace_secs)
    }

    pub fn session_manager_config(&self) -> SessionManagerConfig {
        SessionManagerConfig {
            sharing: self.sessions.sharing,
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            max_protocol_errors: self.sessions.max_protocol_errors.max(1),
            handshake_timeout: Duration::from_secs(self.sessions.handshake_timeout_secs.max(1)),
            max_frame_bytes: self.sessions.max_frame_bytes.max(1024),
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            interval: Duration::from_secs(self.sessions.supervisor_interval_secs.max(1)),
            idle_timeout: match self.sessions.idle_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }

    /// Log filter, with development mode defaulting to `debug`.
    pub fn log_filter(&self) -> Option<&str> {
        match self.logging.level.as_deref() {
            Some(level) => Some(level),
            None if self.devel => Some("debug"),
            None => None,
        }
    }
}

fn parse_host(host: &str) -> Result<IpAddr, ConfigError> {
    host.parse()
        .map_err(|_| ConfigError::InvalidHost(host.to_string()))
}

fn parse_env<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv(name, value.to_string()))
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    Io(std::io::Error),
    /// JSON parsing error.
    Json(serde_json::Error),
    /// Invalid host address.
    InvalidHost(String),
    /// Environment variable with an unparsable value.
    InvalidEnv(&'static str, String),
    /// Value outside its allowed range.
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "failed to read config file: {}", e),
            Self::Json(e) => write!(f, "failed to parse config file: {}", e),
            Self::InvalidHost(host) => write!(f, "invalid host address: {}", host),
            Self::InvalidEnv(name, value) => write!(f, "invalid value for {}: '{}'", name, value),
            Self::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for crate::error::KnobooError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
