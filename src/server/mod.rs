//! Server daemon: accepts hand-off sessions on the rendezvous socket and
//! runs each requested command in its own pseudo-terminal.

mod exec;
pub mod session;

use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};

use sockpty_core::paths::{Rendezvous, SocketGuard};

/// Bind the rendezvous socket and serve sessions until SIGINT/SIGTERM.
pub async fn run(rendezvous: Rendezvous, handshake: Duration) -> Result<()> {
    rendezvous.ensure_dir()?;
    let sock = rendezvous.server_socket();

    // A leftover socket file may belong to a live instance; only replace
    // it when nothing answers.
    if sock.exists() {
        match tokio::net::UnixStream::connect(&sock).await {
            Ok(_) => {
                anyhow::bail!(
                    "another server is already running (socket {} is active)",
                    sock.display()
                );
            }
            Err(_) => {
                std::fs::remove_file(&sock)
                    .with_context(|| format!("failed to remove stale socket: {}", sock.display()))?;
            }
        }
    }

    let listener = UnixListener::bind(&sock).context("failed to bind the rendezvous socket")?;
    std::fs::set_permissions(&sock, std::fs::Permissions::from_mode(0o700))
        .context("failed to set socket permissions")?;
    let _guard = SocketGuard::new(sock.clone());

    tracing::info!("listening on {}", sock.display());

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(async move {
                            if let Err(e) = session::handle(stream, handshake).await {
                                tracing::debug!("session ended with error: {e:#}");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("accept error: {e}");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
            _ = sigterm.recv() => break,
        }
    }

    tracing::info!("shutting down");
    Ok(())
}
