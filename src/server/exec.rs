//! Executable resolution and pseudo-terminal process management.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

use sockpty_core::protocol::SpawnRequest;

/// Geometry used until the client's first resize event lands.
const INITIAL_ROWS: u16 = 24;
const INITIAL_COLS: u16 = 80;

/// Resolve a program name against the search path. Names containing a
/// separator are checked directly; bare names are looked up in `PATH`.
pub fn resolve(program: Option<&str>) -> Option<PathBuf> {
    let program = program?;
    if program.is_empty() {
        return None;
    }
    if program.contains('/') {
        let path = PathBuf::from(program);
        return is_executable(&path).then_some(path);
    }
    let search = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&search) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        let candidate = dir.join(program);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// The environment handed to the spawned command: the client's, with the
/// server's own HOSTNAME appended (last entry wins on duplicates).
pub fn child_env(envs: &[String]) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = envs
        .iter()
        .filter_map(|entry| {
            entry
                .split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
        })
        .collect();
    out.push((
        "HOSTNAME".to_string(),
        std::env::var("HOSTNAME").unwrap_or_default(),
    ));
    out
}

/// A command running inside a freshly allocated pseudo-terminal.
///
/// The pieces are handed out to independent tasks: the reader and writer
/// to the two relay directions, the child to the exit waiter, and the
/// shared master to the resize loop.
pub struct PtyProcess {
    pub master: PtyMaster,
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub child: Box<dyn Child + Send + Sync>,
}

impl PtyProcess {
    pub fn spawn(program: &Path, request: &SpawnRequest) -> Result<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: INITIAL_ROWS,
                cols: INITIAL_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| anyhow!("failed to open a pseudo-terminal: {e}"))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(&request.args[1..]);
        if !request.cwd.is_empty() {
            cmd.cwd(&request.cwd);
        }
        cmd.env_clear();
        for (key, value) in child_env(&request.envs) {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| anyhow!("failed to spawn command: {e}"))?;
        // The child holds its own subordinate-side descriptors now.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| anyhow!("failed to clone the pty reader: {e}"))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| anyhow!("failed to take the pty writer: {e}"))?;
        let pid = child.process_id();

        Ok(Self {
            master: PtyMaster {
                inner: Arc::new(Mutex::new(Some(pair.master))),
                pid,
            },
            reader,
            writer,
            child,
        })
    }
}

/// Shared handle to the master side: resizable until closed.
#[derive(Clone)]
pub struct PtyMaster {
    inner: Arc<Mutex<Option<Box<dyn MasterPty + Send>>>>,
    pid: Option<u32>,
}

impl PtyMaster {
    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        let guard = self.inner.lock();
        let master = guard
            .as_ref()
            .ok_or_else(|| anyhow!("pseudo-terminal already closed"))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| anyhow!("resize failed: {e}"))
    }

    /// Tell the child its controlling terminal changed size.
    pub fn signal_resize(&self) {
        if let Some(pid) = self.pid {
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGWINCH);
        }
    }

    /// Drop the master side. The relay directions observe end-of-stream.
    pub fn close(&self) {
        self.inner.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_resolve_finds_sh_on_path() {
        let resolved = resolve(Some("sh")).expect("sh should be on PATH");
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("sh"));
    }

    #[test]
    fn test_resolve_accepts_explicit_path() {
        assert_eq!(resolve(Some("/bin/sh")), Some(PathBuf::from("/bin/sh")));
    }

    #[test]
    fn test_resolve_rejects_unknown_and_empty() {
        assert_eq!(resolve(Some("definitely-not-a-command-1f2e3d")), None);
        assert_eq!(resolve(Some("")), None);
        assert_eq!(resolve(None), None);
    }

    #[test]
    fn test_resolve_requires_executable_bit() {
        let tmp = tempfile::tempdir().unwrap();
        let plain = tmp.path().join("plain-file");
        std::fs::write(&plain, b"#!/bin/sh\n").unwrap();
        assert_eq!(resolve(Some(plain.to_str().unwrap())), None);

        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&plain, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(resolve(Some(plain.to_str().unwrap())), Some(plain));
    }

    #[test]
    fn test_resolve_searches_path_directories() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let exe = tmp.path().join("sockpty-test-tool");
        std::fs::write(&exe, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();

        // Keep the original PATH entries so concurrently running lookups
        // (e.g. for sh) still succeed while this test holds the env lock.
        let mut dirs = vec![tmp.path().to_path_buf()];
        if let Some(original) = std::env::var_os("PATH") {
            dirs.extend(std::env::split_paths(&original));
        }
        let joined = std::env::join_paths(dirs).unwrap();
        temp_env::with_var("PATH", Some(&joined), || {
            assert_eq!(resolve(Some("sockpty-test-tool")), Some(exe.clone()));
        });
    }

    #[test]
    fn test_child_env_parses_and_appends_hostname() {
        temp_env::with_var("HOSTNAME", Some("buildbox"), || {
            let env = child_env(&[
                "TERM=xterm".to_string(),
                "PATH=/usr/bin".to_string(),
                "garbage-without-equals".to_string(),
                "WITH=a=b".to_string(),
            ]);
            assert!(env.contains(&("TERM".to_string(), "xterm".to_string())));
            assert!(env.contains(&("PATH".to_string(), "/usr/bin".to_string())));
            assert!(env.contains(&("WITH".to_string(), "a=b".to_string())));
            assert_eq!(
                env.last(),
                Some(&("HOSTNAME".to_string(), "buildbox".to_string()))
            );
            assert!(!env.iter().any(|(k, _)| k.contains("garbage")));
        });
    }
}
