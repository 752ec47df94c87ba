use crate::layers::execution::{ExecContext, ExecutionCoordinator};
use anyhow::Context;
use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use protocol::framing::MAX_FRAME_LENGTH;
use protocol::{ErrorKind, ExecuteRequest, ExecutionResult};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Duration;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

type Connection = Framed<TcpStream, LengthDelimitedCodec>;

/// Frames a client may queue behind a running request before it is dropped.
pub const MAX_PIPELINED_REQUESTS: usize = 16;

/// Accepts data connections until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    coordinator: Arc<ExecutionCoordinator>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(event = "server.listener.bound", addr = %addr);
    }
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let coordinator = Arc::clone(&coordinator);
                    let cancel = shutdown.child_token();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, addr, coordinator, cancel).await {
                            tracing::warn!(
                                event = "server.conn.error",
                                peer = %addr,
                                error = %err,
                                "connection handler failed"
                            );
                        }
                    });
                }
                Err(err) => {
                    tracing::error!(event = "server.listener.accept_failed", error = %err);
                }
            },
        }
    }
    tracing::info!(event = "server.listener.stopped");
    Ok(())
}

/// One request at a time per connection. The socket is still watched while a
/// request runs so that a disconnect cancels it; frames that arrive early are
/// answered afterwards in order, up to [`MAX_PIPELINED_REQUESTS`]. A client
/// that pipelines past that is disconnected and its running request cancelled.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    coordinator: Arc<ExecutionCoordinator>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    tracing::info!(event = "server.conn.accepted", peer = %addr);
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec();
    let mut framed = Framed::new(stream, codec);
    let mut backlog: VecDeque<BytesMut> = VecDeque::new();
    let mut disconnected = false;

    loop {
        let bytes = match backlog.pop_front() {
            Some(bytes) => bytes,
            None => {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = framed.next() => frame,
                };
                match frame {
                    Some(frame) => frame.context("frame read")?,
                    None => break,
                }
            }
        };

        let request: ExecuteRequest = match serde_json::from_slice(&bytes) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(event = "server.request.invalid", peer = %addr, error = %err);
                let result = ExecutionResult::failure(
                    "invalid",
                    "",
                    "",
                    ErrorKind::ExecutionFailed,
                    format!("invalid request: {err}"),
                );
                send_result(&mut framed, &result).await?;
                continue;
            }
        };

        let request_cancel = cancel.child_token();
        let mut ctx = ExecContext::new().with_cancel(request_cancel.clone());
        if let Some(id) = request.id.clone() {
            ctx = ctx.with_request_id(id);
        }
        if let Some(timeout_ms) = request.timeout_ms {
            ctx = ctx.with_timeout(Duration::from_millis(timeout_ms));
        }
        tracing::info!(
            event = "server.request.received",
            peer = %addr,
            session_id = %request.session_id,
            host = %request.host,
            command = %request.command,
        );

        let execution = coordinator.execute(&request.session_id, &request.host, &request.command, &ctx);
        tokio::pin!(execution);
        let result = loop {
            tokio::select! {
                biased;
                result = &mut execution => break result,
                frame = framed.next(), if !disconnected => match frame {
                    Some(Ok(bytes)) if backlog.len() < MAX_PIPELINED_REQUESTS => backlog.push_back(bytes),
                    Some(Ok(_)) => {
                        tracing::warn!(
                            event = "server.conn.backlog_full",
                            peer = %addr,
                            queued = backlog.len(),
                        );
                        backlog.clear();
                        disconnected = true;
                        request_cancel.cancel();
                    }
                    _ => {
                        disconnected = true;
                        request_cancel.cancel();
                    }
                },
            }
        };

        if disconnected {
            tracing::info!(event = "server.conn.dropped_mid_request", peer = %addr, id = %result.id);
            break;
        }
        send_result(&mut framed, &result).await?;
    }

    tracing::info!(event = "server.conn.closed", peer = %addr);
    Ok(())
}

async fn send_result(framed: &mut Connection, result: &ExecutionResult) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(result)?;
    framed.send(Bytes::from(payload)).await?;
    Ok(())
}
