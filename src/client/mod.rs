//! Client side of a hand-off session.
//!
//! Dials the daemon, negotiates the spawn, then relays this terminal's
//! input/output and resize events until the remote command exits. The
//! client process exits with the remote command's exit code.

mod term;

use std::io::IsTerminal;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::timeout;

use sockpty_core::mux::{Channel, ChannelRole, MuxSession};
use sockpty_core::paths::{Rendezvous, SocketGuard};
use sockpty_core::protocol::{self, ResizeEvent, SpawnRequest, STATUS_ACCEPTED, STATUS_COMMAND_NOT_FOUND};

/// Environment variables describing the invoking host, never forwarded.
const STRIPPED_ENV_VARS: &[&str] = &["container", "TOOLBOX_PATH", "DISTTAG", "FGC"];

const IO_BUFFER_SIZE: usize = 4096;

/// Run one command on the daemon. Returns the exit code this process
/// should terminate with.
pub async fn run(rendezvous: Rendezvous, args: Vec<String>, handshake: Duration) -> Result<i32> {
    if args.is_empty() {
        bail!("no command given");
    }
    if !std::io::stdin().is_terminal() {
        bail!("stdin is not a terminal");
    }

    rendezvous.ensure_dir()?;
    let token = session_token();
    let client_sock = rendezvous.client_socket(&token);
    let server_sock = rendezvous.server_socket();

    let request = SpawnRequest {
        cwd: std::env::current_dir()
            .context("failed to read the working directory")?
            .to_string_lossy()
            .into_owned(),
        args: args.clone(),
        envs: forwarded_env(),
        session: token.clone(),
    };

    let stream = dial(&client_sock, &server_sock).with_context(|| {
        format!("unable to reach the server at {}", server_sock.display())
    })?;
    let _sock_guard = SocketGuard::new(client_sock);

    // Raw mode from here until the guard drops, on every exit path.
    let raw = term::RawModeGuard::enable().context("failed to put the terminal into raw mode")?;

    let session = MuxSession::client(stream);

    let mut info = timeout(handshake, session.open(ChannelRole::Info))
        .await
        .context("timed out opening the info channel")??;
    info.send(&protocol::encode(&request)?)
        .await
        .map_err(|e| anyhow!("failed to send the spawn request: {e}"))?;

    let verdict = timeout(handshake, info.recv())
        .await
        .context("timed out waiting for the spawn verdict")?
        .ok_or_else(|| anyhow!("server closed the connection during negotiation"))?;
    let status = protocol::decode_status(&verdict)
        .ok_or_else(|| anyhow!("short spawn verdict from the server"))?;

    if status == STATUS_COMMAND_NOT_FOUND {
        drop(raw);
        eprintln!("{}: command not found", args[0]);
        return Ok(STATUS_COMMAND_NOT_FOUND as i32);
    }

    let control = timeout(handshake, session.open(ChannelRole::Control))
        .await
        .context("timed out opening the control channel")??;
    let data = timeout(handshake, session.open(ChannelRole::Data))
        .await
        .context("timed out opening the data channel")??;

    let resize_task = tokio::spawn(resize_loop(control));

    let (data_tx, mut data_rx) = data.split();
    let stdin_tx = data_tx.clone();
    let mut input_task = tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = vec![0u8; IO_BUFFER_SIZE];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdin_tx.send(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    let mut output_task = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(chunk) = data_rx.recv().await {
            if stdout.write_all(&chunk).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    // Data-drain rendezvous: the first finished direction decides the
    // follow-up. A terminal read cannot be unblocked, so the input task is
    // cancelled when the remote side went away first.
    tokio::select! {
        _ = &mut input_task => {
            data_tx.close().await;
            let _ = (&mut output_task).await;
        }
        _ = &mut output_task => {
            input_task.abort();
        }
    }

    // Final exit code. If the transport is already gone the accepted
    // verdict stands.
    let exit_code = match info.recv().await {
        Some(frame) => protocol::decode_status(&frame).unwrap_or(STATUS_ACCEPTED),
        None => STATUS_ACCEPTED,
    };
    info.close().await;
    resize_task.abort();

    drop(raw);
    tracing::debug!("session {token} finished with exit code {exit_code}");
    Ok(exit_code as i32)
}

/// Send the current geometry immediately, then once per SIGWINCH, until
/// the terminal or the transport goes away.
async fn resize_loop(control: Channel) {
    let mut winch = match signal(SignalKind::window_change()) {
        Ok(winch) => winch,
        Err(e) => {
            tracing::debug!("failed to install the resize handler: {e}");
            return;
        }
    };
    loop {
        let Some((rows, cols)) = term::window_size() else {
            break;
        };
        let Ok(frame) = protocol::encode(&ResizeEvent { rows, cols }) else {
            break;
        };
        if control.send(&frame).await.is_err() {
            break;
        }
        if winch.recv().await.is_none() {
            break;
        }
    }
}

/// Dial the server from a uniquely named local endpoint, so the server
/// sees a stable peer address for this invocation.
fn dial(local: &Path, server: &Path) -> Result<UnixStream> {
    use nix::sys::socket::{bind, connect, socket, AddressFamily, SockFlag, SockType, UnixAddr};
    use std::os::fd::AsRawFd;

    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .context("failed to create a unix socket")?;
    let local_addr = UnixAddr::new(local)?;
    bind(fd.as_raw_fd(), &local_addr)
        .with_context(|| format!("failed to bind {}", local.display()))?;
    let server_addr = UnixAddr::new(server)?;
    connect(fd.as_raw_fd(), &server_addr)?;

    let stream = std::os::unix::net::UnixStream::from(fd);
    stream.set_nonblocking(true)?;
    Ok(UnixStream::from_std(stream)?)
}

/// Random hex token identifying this invocation in server logs.
fn session_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// The environment to forward: everything except host-identity markers.
fn forwarded_env() -> Vec<String> {
    std::env::vars_os()
        .filter(|(key, _)| !STRIPPED_ENV_VARS.iter().any(|s| key.as_os_str() == *s))
        .map(|(key, value)| {
            format!("{}={}", key.to_string_lossy(), value.to_string_lossy())
        })
        .collect()
}
