//! Startup privilege check
//!
//! Reading SMART / reliability data needs root on Unix-like hosts and an
//! elevated token on Windows. The agent refuses to start without it rather
//! than logging a `PermissionDenied` for every device on every tick.

use crate::error::StartupError;
use tracing::debug;

/// Fail with `InsufficientPrivilege` unless the process runs elevated
pub async fn ensure_privileged() -> Result<(), StartupError> {
    let elevated = is_elevated().await;
    debug!(platform = platform_name(), elevated, "Privilege check");
    check(elevated)
}

pub fn check(elevated: bool) -> Result<(), StartupError> {
    if elevated {
        Ok(())
    } else {
        Err(StartupError::InsufficientPrivilege)
    }
}

/// OS label used in startup logs
pub fn platform_name() -> &'static str {
    std::env::consts::OS
}

#[cfg(unix)]
async fn is_elevated() -> bool {
    unix::is_root()
}

#[cfg(windows)]
async fn is_elevated() -> bool {
    windows::is_administrator().await
}

#[cfg(not(any(unix, windows)))]
async fn is_elevated() -> bool {
    false
}

#[cfg(unix)]
mod unix {
    use nix::unistd::geteuid;

    pub fn is_root() -> bool {
        geteuid().is_root()
    }
}

#[cfg(windows)]
mod windows {
    use std::process::Stdio;
    use tokio::process::Command;

    /// `net session` only succeeds from an elevated prompt
    pub async fn is_administrator() -> bool {
        Command::new("net")
            .arg("session")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }
}
