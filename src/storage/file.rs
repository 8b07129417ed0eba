//! Owner-only credentials file

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::backend::{BackendError, SecretBackend};

/// File name of the fallback credential record
pub const CREDENTIALS_FILE: &str = "credentials";

/// Stores the secret in `<dir>/credentials`, readable by the owner only
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    /// Backend for the `credentials` file inside `dir`
    #[must_use]
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(CREDENTIALS_FILE),
        }
    }

    /// Path of the credentials file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_dir(&self) -> io::Result<()> {
        let Some(dir) = self.path.parent() else {
            return Ok(());
        };

        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder.create(dir)
    }
}

fn io_error(action: &str, path: &Path, e: &io::Error) -> BackendError {
    if e.kind() == io::ErrorKind::NotFound {
        BackendError::NotFound
    } else {
        BackendError::Failed(format!("failed to {action} {}: {e}", path.display()))
    }
}

impl SecretBackend for FileBackend {
    fn name(&self) -> &'static str {
        "credentials file"
    }

    fn read(&self) -> Result<String, BackendError> {
        fs::read_to_string(&self.path).map_err(|e| io_error("read", &self.path, &e))
    }

    fn write(&self, secret: &str) -> Result<(), BackendError> {
        self.ensure_dir().map_err(|e| {
            BackendError::Failed(format!("failed to create credentials directory: {e}"))
        })?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options
            .open(&self.path)
            .map_err(|e| BackendError::Failed(format!("failed to open {}: {e}", self.path.display())))?;

        // `mode` only applies on creation; tighten a file left by an older version.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))
                .map_err(|e| BackendError::Failed(format!("failed to restrict {}: {e}", self.path.display())))?;
        }

        file.write_all(secret.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| BackendError::Failed(format!("failed to write {}: {e}", self.path.display())))?;

        debug!(path = %self.path.display(), "Wrote credentials file");
        Ok(())
    }

    fn remove(&self) -> Result<(), BackendError> {
        fs::remove_file(&self.path).map_err(|e| io_error("remove", &self.path, &e))
    }
}
