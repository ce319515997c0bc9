//! Command-line interface for knoboo.
//!
//! Uses lexopt for minimal binary size overhead. Every option is optional so
//! that values from the environment and the config file survive when the
//! flag is absent.

use std::ffi::OsString;
use std::net::IpAddr;
use std::path::PathBuf;

use crate::config::ServiceMode;

/// Command-line arguments.
#[derive(Debug, Clone, Default)]
pub struct Args {
    /// Front-end host address.
    pub host: Option<IpAddr>,
    /// Front-end port.
    pub port: Option<u16>,
    /// Direct kernel listener host address.
    pub kernel_host: Option<IpAddr>,
    /// Direct kernel listener port.
    pub kernel_port: Option<u16>,
    /// Directory holding `config.json`.
    pub env_path: Option<PathBuf>,
    /// Run path of kernel processes.
    pub engines_path: Option<PathBuf>,
    /// Chroot jail for kernel processes.
    pub engines_root: Option<PathBuf>,
    /// Package search path for kernels.
    pub engines_pythonpath: Vec<PathBuf>,
    pub engines_uid: Option<u32>,
    pub engines_gid: Option<u32>,
    /// Maximum simultaneous kernels; above 1 enables the user pool.
    pub engines_max: Option<usize>,
    pub engines_user_prefix: Option<String>,
    /// Running behind a reverse proxy.
    pub proxy: bool,
    /// Root URL path for the front-end.
    pub url_root: Option<String>,
    /// Open the front-end in a browser (desktop mode).
    pub open_browser: bool,
    /// Which listeners to run.
    pub mode: Option<ServiceMode>,
    /// Path to configuration file.
    pub config: Option<PathBuf>,
    /// Log level or filter directives.
    pub log_level: Option<String>,
    /// Development mode.
    pub devel: bool,
    /// Show version and exit.
    pub version: bool,
    /// Show help and exit.
    pub help: bool,
}

/// Parse command-line arguments.
pub fn parse_args() -> Result<Args, ArgsError> {
    parse_args_from(std::env::args_os())
}

/// Parse arguments from an iterator (for testing).
pub fn parse_args_from<I>(args: I) -> Result<Args, ArgsError>
where
    I: IntoIterator<Item = OsString>,
{
    use lexopt::prelude::*;

    let mut result = Args::default();
    let mut parser = lexopt::Parser::from_iter(args);

    while let Some(arg) = parser.next()? {
        match arg {
            Short('h') | Long("help") => {
                result.help = true;
            }
            Short('V') | Long("version") => {
                result.version = true;
            }
            Short('H') | Long("host") => {
                result.host = Some(parse_value(&mut parser, "host")?);
            }
            Short('p') | Long("port") => {
                result.port = Some(parse_value(&mut parser, "port")?);
            }
            Short('k') | Long("kernel-host") => {
                result.kernel_host = Some(parse_value(&mut parser, "kernel-host")?);
            }
            Short('q') | Long("kernel-port") => {
                result.kernel_port = Some(parse_value(&mut parser, "kernel-port")?);
            }
            Short('e') | Long("env-path") => {
                result.env_path = Some(parser.value()?.into());
            }
            Long("engines-path") => {
                result.engines_path = Some(parser.value()?.into());
            }
            Long("engines-root") => {
                result.engines_root = Some(parser.value()?.into());
            }
            Long("engines-pythonpath") => {
                let value = parser.value()?;
                result.engines_pythonpath = std::env::split_paths(&value)
                    .filter(|p| !p.as_os_str().is_empty())
                    .collect();
            }
            Long("engines-uid") => {
                result.engines_uid = Some(parse_value(&mut parser, "engines-uid")?);
            }
            Long("engines-gid") => {
                result.engines_gid = Some(parse_value(&mut parser, "engines-gid")?);
            }
            Short('m') | Long("engines-max") => {
                result.engines_max = Some(parse_value(&mut parser, "engines-max")?);
            }
            Long("engines-user-prefix") => {
                result.engines_user_prefix = Some(parser.value()?.parse()?);
            }
            Short('r') | Long("proxy") => {
                result.proxy = true;
            }
            Short('u') | Long("url-root") => {
                result.url_root = Some(parser.value()?.parse()?);
            }
            Short('b') | Long("open-browser") => {
                result.open_browser = true;
            }
            Long("mode") => {
                result.mode = Some(parse_value(&mut parser, "mode")?);
            }
            Short('c') | Long("config") => {
                result.config = Some(parser.value()?.into());
            }
            Short('l') | Long("log-level") => {
                result.log_level = Some(parser.value()?.parse()?);
            }
            Short('d') | Long("devel") => {
                result.devel = true;
            }
            Value(val) => {
                return Err(ArgsError::UnexpectedArgument(val.to_string_lossy().into()));
            }
            _ => return Err(arg.unexpected().into()),
        }
    }

    Ok(result)
}

fn parse_value<T: std::str::FromStr>(
    parser: &mut lexopt::Parser,
    name: &'static str,
) -> Result<T, ArgsError> {
    use lexopt::prelude::*;

    let value: String = parser.value()?.parse()?;
    value
        .parse()
        .map_err(|_| ArgsError::InvalidValue(name, value))
}

/// Print help message.
pub fn print_help() {
    let version = env!("CARGO_PKG_VERSION");
    println!(
        r#"knoboo {version}
Kernel process supervisor and notebook session broker

USAGE:
    knoboo [OPTIONS]

OPTIONS:
    -H, --host <ADDR>              Front-end host address [default: 127.0.0.1]
    -p, --port <PORT>              Front-end port [default: 8000]
    -k, --kernel-host <ADDR>       Direct kernel listener address [default: 127.0.0.1]
    -q, --kernel-port <PORT>       Direct kernel listener port [default: 8337]
        --mode <MODE>              desktop, webapp or kernel [default: desktop]
    -e, --env-path <DIR>           Directory containing config.json
    -c, --config <FILE>            Path to configuration file (JSON)
        --engines-path <DIR>       Run path for kernel processes
        --engines-root <DIR>       Chroot jail for kernel processes
        --engines-pythonpath <P>   Package search path inside the jail
        --engines-uid <UID>        uid of kernel processes (pool base uid if max > 1)
        --engines-gid <GID>        gid of kernel processes
    -m, --engines-max <N>          Maximum simultaneous kernels [default: 1]
        --engines-user-prefix <S>  Name prefix for pool identities [default: knoboo]
    -r, --proxy                    Run behind a reverse proxy
    -u, --url-root <PATH>          Root URL path for the front-end [default: /]
    -b, --open-browser             Open the front-end in a browser (desktop mode)
    -l, --log-level <LVL>          Log level (error, warn, info, debug, trace)
    -d, --devel                    Development mode
    -h, --help                     Print help
    -V, --version                  Print version

ENVIRONMENT VARIABLES:
    KNOBOO_HOST             Front-end host (overrides config)
    KNOBOO_PORT             Front-end port (overrides config)
    KNOBOO_KERNEL_HOST      Kernel listener host (overrides config)
    KNOBOO_KERNEL_PORT      Kernel listener port (overrides config)
    KNOBOO_ENGINES_MAX      Maximum simultaneous kernels (overrides config)
    KNOBOO_MODE             Service mode (overrides config)
    KNOBOO_ADMIN_TOKEN      Bearer token for the admin API
    KNOBOO_LOG_LEVEL        Log level (overrides config)
    RUST_LOG                Log filter, takes precedence over every level setting

EXAMPLES:
    # Desktop mode on localhost
    knoboo

    # Kernel server with four isolated engines
    knoboo --mode kernel -m 4 --engines-uid 20000 --engines-gid 20000

    # Front-end behind a reverse proxy under /notebook
    knoboo --mode webapp -r -u /notebook -c /etc/knoboo/config.json
"#
    );
}

/// Print version.
pub fn print_version() {
    println!("knoboo {}", env!("CARGO_PKG_VERSION"));
}

/// Argument parsing errors.
#[derive(Debug)]
pub enum ArgsError {
    /// Lexopt parsing error.
    Lexopt(lexopt::Error),
    /// Invalid argument value.
    InvalidValue(&'static str, String),
    /// Unexpected positional argument.
    UnexpectedArgument(String),
}

impl std::fmt::Display for ArgsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lexopt(e) => write!(f, "{}", e),
            Self::InvalidValue(name, value) => {
                write!(f, "invalid value for --{}: '{}'", name, value)
            }
            Self::UnexpectedArgument(arg) => {
                write!(f, "unexpected argument: '{}'", arg)
            }
        }
    }
}

impl std::error::Error for ArgsError {}

impl From<lexopt::Error> for ArgsError {
    fn from(e: lexopt::Error) -> Self {
        Self::Lexopt(e)
    }
}
