use crate::layers::execution::ExecutionCoordinator;
use anyhow::Context;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use protocol::control::{ControlRequest, ControlResponse};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

pub async fn spawn_control_server(
    addr: &str,
    coordinator: Arc<ExecutionCoordinator>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind control addr {addr}"))?;
    tracing::info!(event = "control.listener.bound", addr = %addr);
    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let coordinator = Arc::clone(&coordinator);
                    let cancel = shutdown.child_token();
                    tokio::spawn(async move {
                        tracing::info!(event = "control.conn.accepted", peer = %peer);
                        if let Err(err) = handle_control_connection(stream, peer, coordinator, cancel).await {
                            tracing::warn!(
                                event = "control.conn.error",
                                peer = %peer,
                                error = %err,
                                "control connection failed"
                            );
                        }
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        event = "control.listener.accept_failed",
                        error = %err,
                        "control listener accept failed"
                    );
                }
            }
        }
    });
    Ok(())
}

async fn handle_control_connection(
    stream: TcpStream,
    peer: SocketAddr,
    coordinator: Arc<ExecutionCoordinator>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(protocol::framing::MAX_FRAME_LENGTH)
        .new_codec();
    let mut framed = Framed::new(stream, codec);
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = framed.next() => frame,
        };
        let Some(frame) = frame else {
            break;
        };
        let bytes = frame.context("read frame")?;
        let response = match serde_json::from_slice::<ControlRequest>(&bytes) {
            Ok(request) => handle_request(&coordinator, request),
            Err(err) => {
                tracing::warn!(
                    event = "control.request.invalid",
                    peer = %peer,
                    error = %err,
                    "invalid control request"
                );
                ControlResponse::Error {
                    message: format!("invalid request: {err}"),
                }
            }
        };
        send_response(&mut framed, &response).await?;
    }
    tracing::info!(event = "control.conn.closed", peer = %peer);
    Ok(())
}

pub fn handle_request(coordinator: &ExecutionCoordinator, request: ControlRequest) -> ControlResponse {
    match request {
        ControlRequest::Pending => ControlResponse::Pending {
            items: coordinator.approvals().pending(),
        },
        ControlRequest::Approve {
            name,
            requested_text,
        } => match coordinator.approvals().approve(&name, &requested_text) {
            Ok(spec) => ControlResponse::Approved { name: spec.name },
            Err(err) => {
                tracing::warn!(event = "control.approve_failed", name = %name, error = %err);
                ControlResponse::Error {
                    message: err.to_string(),
                }
            }
        },
        ControlRequest::Reject { requested_text } => {
            if coordinator.approvals().reject(&requested_text) {
                ControlResponse::Ack {
                    message: "rejected".to_string(),
                }
            } else {
                ControlResponse::Error {
                    message: format!("no pending request for {requested_text:?}"),
                }
            }
        }
        ControlRequest::Breakers => ControlResponse::Breakers {
            hosts: coordinator.breaker().snapshot(),
        },
        ControlRequest::ResetHost { host } => {
            let message = if coordinator.breaker().reset(&host) {
                format!("breaker reset for {host}")
            } else {
                format!("no breaker state for {host}")
            };
            ControlResponse::Ack { message }
        }
    }
}

async fn send_response(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
    response: &ControlResponse,
) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(response)?;
    framed.send(Bytes::from(payload)).await?;
    Ok(())
}
