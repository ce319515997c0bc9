//! Opening the front-end in the user's browser (desktop mode).

use std::net::IpAddr;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::ServerSection;
use crate::error::KnobooError;
use crate::Result;

/// Address of the front-end as reachable from this machine.
///
/// Wildcard hosts are replaced with loopback.
pub fn browser_url(server: &ServerSection) -> String {
    let host = match server.host.parse::<IpAddr>() {
        Ok(ip) if ip.is_unspecified() && ip.is_ipv6() => "[::1]".to_string(),
        Ok(ip) if ip.is_unspecified() => "127.0.0.1".to_string(),
        Ok(IpAddr::V6(ip)) => format!("[{}]", ip),
        _ => server.host.clone(),
    };
    let root = server.url_root.trim_matches('/');
    if root.is_empty() {
        format!("http://{}:{}/", host, server.port)
    } else {
        format!("http://{}:{}/{}/", host, server.port, root)
    }
}

/// Program and arguments that open a URL.
///
/// `browser` (usually `$BROWSER`) wins over the platform opener.
fn browser_command(browser: Option<&str>) -> Result<(String, Vec<String>)> {
    if let Some(browser) = browser {
        let mut parts = browser.split_whitespace().map(String::from);
        let program = parts
            .next()
            .ok_or_else(|| KnobooError::Config("browser command is empty".into()))?;
        return Ok((program, parts.collect()));
    }
    let command = if cfg!(target_os = "macos") {
        ("open".to_string(), Vec::new())
    } else if cfg!(target_os = "windows") {
        ("cmd".to_string(), vec!["/C".to_string(), "start".to_string()])
    } else {
        ("xdg-open".to_string(), Vec::new())
    };
    Ok(command)
}

/// Launch the browser on `url` without waiting for it.
pub fn open_browser(url: &str) -> Result<()> {
    let browser = std::env::var("BROWSER").ok();
    let (program, args) = browser_command(browser.as_deref())?;
    let mut child = Command::new(&program)
        .args(&args)
        .arg(url)
        .kill_on_drop(false)
        .spawn()
        .map_err(KnobooError::Io)?;
    debug!(%program, url, "browser launched");

    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if !status.success() => {
                warn!(%status, "browser command failed");
            }
            Ok(_) => {}
            Err(e) => warn!("failed to wait for browser: {}", e),
        }
    });
    Ok(())
}
