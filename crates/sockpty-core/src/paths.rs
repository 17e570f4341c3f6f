//! Rendezvous socket path management.
//!
//! Both halves resolve the same per-user runtime directory. The server
//! listens on a fixed well-known name inside it; each client binds a
//! uniquely named endpoint next to it and dials the server.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Well-known name the server listens on inside the rendezvous directory.
pub const SERVER_SOCKET_NAME: &str = "server.sock";

/// Rendezvous configuration, resolved once at startup and handed to both
/// the client and the server instead of living in process globals.
#[derive(Debug, Clone)]
pub struct Rendezvous {
    dir: PathBuf,
}

impl Rendezvous {
    /// Resolve the rendezvous directory, preferring an explicit override,
    /// then `$XDG_RUNTIME_DIR/sockpty`, then a per-uid path under /tmp.
    pub fn resolve(override_dir: Option<PathBuf>) -> Self {
        let dir = override_dir.unwrap_or_else(default_runtime_dir);
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The server's fixed listening address.
    pub fn server_socket(&self) -> PathBuf {
        self.dir.join(SERVER_SOCKET_NAME)
    }

    /// A client's own endpoint, named after its session token.
    pub fn client_socket(&self, token: &str) -> PathBuf {
        self.dir.join(format!("client-{token}.sock"))
    }

    /// Ensure the rendezvous directory exists with owner-only permissions.
    pub fn ensure_dir(&self) -> Result<()> {
        let dir = &self.dir;
        // Refuse a symlinked directory rather than follow it
        if dir.exists() {
            let meta = std::fs::symlink_metadata(dir)
                .with_context(|| format!("failed to read metadata for: {}", dir.display()))?;
            if meta.is_symlink() {
                anyhow::bail!("rendezvous directory is a symlink: {}", dir.display());
            }
        }
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create rendezvous directory: {}", dir.display()))?;
        let metadata = std::fs::metadata(dir)
            .with_context(|| format!("failed to read metadata for: {}", dir.display()))?;
        if !metadata.is_dir() {
            anyhow::bail!("rendezvous path is not a directory: {}", dir.display());
        }
        let mode = metadata.permissions().mode() & 0o777;
        if mode != 0o700 {
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
                .with_context(|| format!("failed to set permissions on: {}", dir.display()))?;
        }
        Ok(())
    }
}

fn default_runtime_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(xdg).join("sockpty")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/sockpty-{}", uid))
    }
}

/// Removes a socket file when dropped, whichever way its owner exits.
#[derive(Debug)]
pub struct SocketGuard {
    path: PathBuf,
}

impl SocketGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
