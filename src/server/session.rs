//! One accepted connection: negotiate the spawn, relay terminal bytes,
//! and tear the session down in order.

use std::io::{Read, Write};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::net::UnixStream;
use tokio::time::timeout;

use sockpty_core::mux::{Channel, ChannelRole, MuxSession};
use sockpty_core::protocol::{
    self, ResizeEvent, SpawnRequest, MAX_SPAWN_REQUEST_LEN, STATUS_ACCEPTED,
    STATUS_COMMAND_NOT_FOUND,
};

use super::exec::{self, PtyMaster, PtyProcess};

const IO_BUFFER_SIZE: usize = 4096;

/// Drive one session from negotiation to teardown.
pub async fn handle(stream: UnixStream, handshake: Duration) -> Result<()> {
    let mut session = MuxSession::server(stream);

    let mut info = timeout(handshake, session.accept())
        .await
        .context("timed out waiting for the info channel")??
        .expect_role(ChannelRole::Info)?;

    let frame = timeout(handshake, info.recv())
        .await
        .context("timed out waiting for the spawn request")?
        .ok_or_else(|| anyhow!("connection closed before the spawn request"))?;
    let request = decode_spawn_request(&frame);
    let session_tag = if request.session.is_empty() {
        "unknown".to_string()
    } else {
        request.session.clone()
    };
    let command_line = request.args.join(" ");

    let Some(program) = exec::resolve(request.args.first().map(String::as_str)) else {
        info.send(&protocol::encode_status(STATUS_COMMAND_NOT_FOUND))
            .await
            .map_err(|e| anyhow!("failed to send the verdict: {e}"))?;
        tracing::info!("[{session_tag}] {command_line:?} rejected, command not found");
        return Ok(());
    };
    info.send(&protocol::encode_status(STATUS_ACCEPTED))
        .await
        .map_err(|e| anyhow!("failed to send the verdict: {e}"))?;

    let mut pty = PtyProcess::spawn(&program, &request)
        .with_context(|| format!("[{session_tag}] spawn failed"))?;
    tracing::info!("[{session_tag}] {command_line} start");

    let (control, data) = match accept_relay_channels(&mut session, handshake).await {
        Ok(channels) => channels,
        Err(e) => {
            // Nobody will ever attach to this pty; reap the child now.
            let _ = pty.child.kill();
            return Err(e);
        }
    };

    let master = pty.master.clone();
    let resize_task = tokio::spawn(resize_loop(control, master.clone(), session_tag.clone()));

    // Exit-status task: waits for the child off the runtime, then reports
    // the code on the info channel. Runs while the relay is still draining.
    let mut child = pty.child;
    let wait_handle = tokio::task::spawn_blocking(move || child.wait());
    let exit_tag = session_tag.clone();
    let exit_task = tokio::spawn(async move {
        let code = match wait_handle.await {
            Ok(Ok(status)) => u64::from(status.exit_code()),
            Ok(Err(e)) => {
                tracing::warn!("[{exit_tag}] wait failed: {e}");
                1
            }
            Err(e) => {
                tracing::warn!("[{exit_tag}] wait task failed: {e}");
                1
            }
        };
        let _ = info.send(&protocol::encode_status(code)).await;
        info.close().await;
        code
    });

    // Two blocking relay directions, one per pty end.
    let (data_tx, mut data_rx) = data.split();
    let mut reader = pty.reader;
    let pty_out_tx = data_tx.clone();
    let mut out_task = tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; IO_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if pty_out_tx.blocking_send(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
    });
    let mut writer = pty.writer;
    let mut in_task = tokio::task::spawn_blocking(move || {
        while let Some(chunk) = data_rx.blocking_recv() {
            if writer.write_all(&chunk).is_err() {
                break;
            }
            let _ = writer.flush();
        }
    });

    tracing::info!("[{session_tag}] {command_line} running");

    // Data-drain rendezvous: either direction ending closes the pty and
    // the data channel, which releases the other direction.
    let output_drained_first = tokio::select! {
        _ = &mut out_task => true,
        _ = &mut in_task => false,
    };
    master.close();
    data_tx.close().await;
    if output_drained_first {
        let _ = in_task.await;
    } else {
        let _ = out_task.await;
    }

    // Full-teardown barrier: the child may still have been flushing output
    // when it exited, so the exit waiter and the resize loop get to finish
    // before the session ends.
    let (exit_code, _) = tokio::join!(exit_task, resize_task);
    let exit_code = exit_code.unwrap_or(1);
    tracing::info!("[{session_tag}] {command_line} done, exit code {exit_code}");

    Ok(())
}

async fn accept_relay_channels(
    session: &mut MuxSession,
    handshake: Duration,
) -> Result<(Channel, Channel)> {
    let control = timeout(handshake, session.accept())
        .await
        .context("timed out waiting for the control channel")??
        .expect_role(ChannelRole::Control)?;
    let data = timeout(handshake, session.accept())
        .await
        .context("timed out waiting for the data channel")??
        .expect_role(ChannelRole::Data)?;
    Ok((control, data))
}

/// Apply resize events until the channel ends or one fails to apply.
/// Failures end the loop only; the data relay is unaffected.
async fn resize_loop(mut control: Channel, master: PtyMaster, session_tag: String) {
    while let Some(frame) = control.recv().await {
        let event: ResizeEvent = match protocol::decode(&frame) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!("[{session_tag}] malformed resize event: {e}");
                break;
            }
        };
        if let Err(e) = master.resize(event.rows, event.cols) {
            tracing::debug!("[{session_tag}] {e}");
            break;
        }
        master.signal_resize();
    }
}

/// Decode the spawn request, degrading a malformed or oversized payload to
/// an empty request, which then fails command resolution.
fn decode_spawn_request(frame: &[u8]) -> SpawnRequest {
    if frame.len() > MAX_SPAWN_REQUEST_LEN {
        tracing::warn!("spawn request too large ({} bytes)", frame.len());
        return SpawnRequest::default();
    }
    match protocol::decode(frame) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("malformed spawn request: {e}");
            SpawnRequest::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decode_spawn_request_valid() {
        let request = SpawnRequest {
            cwd: "/tmp".to_string(),
            args: vec!["ls".to_string()],
            envs: vec![],
            session: "s1".to_string(),
        };
        let frame = protocol::encode(&request).unwrap();
        assert_eq!(decode_spawn_request(&frame), request);
    }

    #[test]
    fn test_decode_spawn_request_degrades_malformed() {
        assert_eq!(decode_spawn_request(b"{broken"), SpawnRequest::default());
    }

    #[test]
    fn test_decode_spawn_request_degrades_oversized() {
        let huge = vec![b'x'; MAX_SPAWN_REQUEST_LEN + 1];
        assert_eq!(decode_spawn_request(&huge), SpawnRequest::default());
    }
}
