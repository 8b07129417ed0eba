//! OS-native secret storage
//!
//! # Platform Support
//!
//! - **macOS**: Keychain via `security`
//! - **Linux**: Secret Service via `secret-tool` (libsecret)
//! - **Other**: not available; the token store uses the file backend only

use std::path::Path;
#[cfg(any(target_os = "macos", target_os = "linux"))]
use std::process::Command;

use tracing::debug;

use super::backend::{BackendError, SecretBackend};

/// Keychain entry identified by service and account
#[derive(Debug, Clone)]
pub struct KeychainBackend {
    service: String,
    account: String,
}

#[cfg(target_os = "macos")]
const TOOL: &str = "security";
#[cfg(target_os = "linux")]
const TOOL: &str = "secret-tool";

/// Exit status `security` uses for "item could not be found"
#[cfg(target_os = "macos")]
const SECURITY_ITEM_NOT_FOUND: i32 = 44;

impl KeychainBackend {
    /// Create a backend without checking host support
    #[must_use]
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }

    /// Return a backend only if the platform keychain tool is installed
    #[must_use]
    pub fn detect(service: &str, account: &str) -> Option<Self> {
        if tool_on_path() {
            Some(Self::new(service, account))
        } else {
            debug!("No OS keychain tool found, using credentials file only");
            None
        }
    }
}

#[cfg(any(target_os = "macos", target_os = "linux"))]
fn tool_on_path() -> bool {
    std::env::var_os("PATH").is_some_and(|paths| {
        std::env::split_paths(&paths).any(|dir| is_executable(&dir.join(TOOL)))
    })
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn tool_on_path() -> bool {
    false
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(any(target_os = "macos", target_os = "linux"))]
fn exec_error(e: &std::io::Error) -> BackendError {
    if e.kind() == std::io::ErrorKind::NotFound {
        BackendError::Unavailable(format!("`{TOOL}` is not installed"))
    } else {
        BackendError::Failed(format!("failed to execute `{TOOL}`: {e}"))
    }
}

/// Build the `security -i` line that stores `secret` as hex data
///
/// Service and account are quoted, so they may not contain quotes,
/// backslashes or line breaks.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn interactive_add_command(service: &str, account: &str, secret: &str) -> Result<String, BackendError> {
    for value in [service, account] {
        if value.is_empty() || value.contains(['"', '\\', '\n', '\r']) {
            return Err(BackendError::Failed(format!(
                "keychain service/account name {value:?} cannot be passed to `security`"
            )));
        }
    }
    Ok(format!(
        "add-generic-password -U -s \"{service}\" -a \"{account}\" -X {}\n",
        hex::encode(secret)
    ))
}

/// Stderr fragments meaning no Secret Service provider is running
#[cfg(target_os = "linux")]
fn secret_service_unavailable(stderr: &str) -> bool {
    stderr.contains("org.freedesktop.secrets was not provided by any .service files")
        || stderr.contains("Cannot autolaunch D-Bus without X11")
        || stderr.contains("org.freedesktop.Secret.Service")
}

#[cfg(target_os = "macos")]
impl SecretBackend for KeychainBackend {
    fn name(&self) -> &'static str {
        "macOS keychain"
    }

    fn read(&self) -> Result<String, BackendError> {
        let output = Command::new(TOOL)
            .args(["find-generic-password", "-s", &self.service, "-a", &self.account, "-w"])
            .output()
            .map_err(|e| exec_error(&e))?;

        if output.status.success() {
            let secret = String::from_utf8_lossy(&output.stdout).trim().to_string();
            return if secret.is_empty() {
                Err(BackendError::NotFound)
            } else {
                Ok(secret)
            };
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.code() == Some(SECURITY_ITEM_NOT_FOUND) || stderr.contains("could not be found") {
            return Err(BackendError::NotFound);
        }
        Err(BackendError::Failed(format!("keychain lookup failed: {}", stderr.trim())))
    }

    fn write(&self, secret: &str) -> Result<(), BackendError> {
        use std::io::Write;
        use std::process::Stdio;

        // Fed through `security -i` so the secret never appears in argv.
        let command = interactive_add_command(&self.service, &self.account, secret)?;
        let mut child = Command::new(TOOL)
            .arg("-i")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| exec_error(&e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(command.as_bytes())
                .map_err(|e| BackendError::Failed(format!("failed to pass secret to `{TOOL}`: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| BackendError::Failed(format!("failed while waiting for `{TOOL}`: {e}")))?;
        let stderr = String::from_utf8_lossy(&output.stderr);

        // Interactive mode can exit 0 after a failed command; stderr tells.
        if output.status.success() && stderr.trim().is_empty() {
            return Ok(());
        }
        Err(BackendError::Failed(format!("keychain store failed: {}", stderr.trim())))
    }

    fn remove(&self) -> Result<(), BackendError> {
        let output = Command::new(TOOL)
            .args(["delete-generic-password", "-s", &self.service, "-a", &self.account])
            .output()
            .map_err(|e| exec_error(&e))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.code() == Some(SECURITY_ITEM_NOT_FOUND) || stderr.contains("could not be found") {
            return Err(BackendError::NotFound);
        }
        Err(BackendError::Failed(format!("keychain delete failed: {}", stderr.trim())))
    }
}

#[cfg(target_os = "linux")]
impl SecretBackend for KeychainBackend {
    fn name(&self) -> &'static str {
        "Secret Service"
    }

    fn read(&self) -> Result<String, BackendError> {
        let output = Command::new(TOOL)
            .args(["lookup", "service", &self.service, "account", &self.account])
            .output()
            .map_err(|e| exec_error(&e))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if secret_service_unavailable(&stderr) {
            return Err(BackendError::Unavailable("no Secret Service provider is running".to_string()));
        }

        if output.status.success() {
            let secret = String::from_utf8_lossy(&output.stdout).trim().to_string();
            return if secret.is_empty() {
                Err(BackendError::NotFound)
            } else {
                Ok(secret)
            };
        }

        // secret-tool exits 1 without output when nothing matches.
        if output.status.code() == Some(1) && stderr.trim().is_empty() {
            return Err(BackendError::NotFound);
        }
        Err(BackendError::Failed(format!("secret lookup failed: {}", stderr.trim())))
    }

    fn write(&self, secret: &str) -> Result<(), BackendError> {
        use std::io::Write;
        use std::process::Stdio;

        let label = format!("--label=Kernel CLI ({})", self.service);
        let mut child = Command::new(TOOL)
            .args(["store", &label, "service", &self.service, "account", &self.account])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| exec_error(&e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(secret.as_bytes())
                .map_err(|e| BackendError::Failed(format!("failed to pass secret to `{TOOL}`: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| BackendError::Failed(format!("failed while waiting for `{TOOL}`: {e}")))?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if secret_service_unavailable(&stderr) {
            return Err(BackendError::Unavailable("no Secret Service provider is running".to_string()));
        }
        Err(BackendError::Failed(format!("secret store failed: {}", stderr.trim())))
    }

    fn remove(&self) -> Result<(), BackendError> {
        let output = Command::new(TOOL)
            .args(["clear", "service", &self.service, "account", &self.account])
            .output()
            .map_err(|e| exec_error(&e))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        clear_outcome(output.status.success(), output.status.code(), &stderr)
    }
}

/// Classify the result of `secret-tool clear`
///
/// Exit 1 with nothing on stderr means no item matched; exit 1 with a
/// message (locked collection, D-Bus denial) is a real failure.
#[cfg(target_os = "linux")]
fn clear_outcome(success: bool, code: Option<i32>, stderr: &str) -> Result<(), BackendError> {
    if secret_service_unavailable(stderr) {
        return Err(BackendError::Unavailable("no Secret Service provider is running".to_string()));
    }
    if success {
        return Ok(());
    }
    if code == Some(1) && stderr.trim().is_empty() {
        return Err(BackendError::NotFound);
    }
    Err(BackendError::Failed(format!("secret delete failed: {}", stderr.trim())))
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
impl SecretBackend for KeychainBackend {
    fn name(&self) -> &'static str {
        "OS keychain"
    }

    fn read(&self) -> Result<String, BackendError> {
        Err(BackendError::Unavailable("not supported on this platform".to_string()))
    }

    fn write(&self, _secret: &str) -> Result<(), BackendError> {
        Err(BackendError::Unavailable("not supported on this platform".to_string()))
    }

    fn remove(&self) -> Result<(), BackendError> {
        Err(BackendError::Unavailable("not supported on this platform".to_string()))
    }
}
