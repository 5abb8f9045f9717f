//! Per-client connection handler.
//!
//! One task per accepted connection, regardless of transport: TCP, VSOCK and
//! UNIX sockets all speak the same newline-delimited JSON framing, so the
//! handler is generic over any `AsyncRead + AsyncWrite` stream.

use std::sync::Arc;
use std::time::Duration;

use common::{Metrics, RequestRateLimiter};
use protocol::{ApiError, Event, Request};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::notify::encode_event;
use crate::orchestrator::{ApiResponse, OrchestratorHandle};

const WRITE_DEADLINE: Duration = Duration::from_secs(2);

const KNOWN_ACTIONS: &[&str] = &[
    "enable_notifications",
    "usb_list",
    "usb_attach",
    "usb_detach",
    "pci_list",
    "pci_attach",
    "pci_detach",
];

pub async fn handle_connection<S>(
    stream: S,
    peer: String,
    orchestrator: OrchestratorHandle,
    rate_limiter: Arc<RequestRateLimiter>,
    metrics: Arc<Metrics>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    metrics.record_api_connection();
    info!(peer = %peer, "api client connected");

    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();
    let mut events_rx: Option<broadcast::Receiver<Event>> = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else {
                    debug!(peer = %peer, "api client disconnected");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }

                while !rate_limiter.try_acquire().await {
                    tokio::time::sleep(rate_limiter.wait_time().await).await;
                }

                let response = process_line(&line, &orchestrator).await;
                if matches!(&response, RequestOutcome::EnableNotifications) {
                    events_rx = Some(orchestrator.subscribe());
                }
                let body = response.into_json();
                if write_response(&mut write_half, &body).await.is_err() {
                    warn!(peer = %peer, "write deadline exceeded, disconnecting client");
                    break;
                }
            }
            event = recv_event(&mut events_rx), if events_rx.is_some() => {
                match event {
                    Some(Ok(event)) => {
                        let Ok(line) = encode_event(&event) else { continue };
                        if write_raw(&mut write_half, &line).await.is_err() {
                            warn!(peer = %peer, "write deadline exceeded, disconnecting client");
                            break;
                        }
                    }
                    Some(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                        warn!(peer = %peer, skipped, "client fell behind on notifications, disconnecting");
                        break;
                    }
                    Some(Err(broadcast::error::RecvError::Closed)) | None => {
                        events_rx = None;
                    }
                }
            }
        }
    }
}

async fn recv_event(
    rx: &mut Option<broadcast::Receiver<Event>>,
) -> Option<Result<Event, broadcast::error::RecvError>> {
    Some(rx.as_mut()?.recv().await)
}

enum RequestOutcome {
    Response(Value),
    EnableNotifications,
}

impl RequestOutcome {
    fn into_json(self) -> Value {
        match self {
            RequestOutcome::Response(v) => v,
            RequestOutcome::EnableNotifications => json!({"result": "ok"}),
        }
    }
}

async fn process_line(line: &str, orchestrator: &OrchestratorHandle) -> RequestOutcome {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => return RequestOutcome::Response(failure("invalid json")),
    };

    let Some(action) = value.get("action").and_then(Value::as_str) else {
        return RequestOutcome::Response(failure("invalid json"));
    };

    if !KNOWN_ACTIONS.contains(&action) {
        return RequestOutcome::Response(failure("unknown action"));
    }

    let request: Request = match serde_json::from_value(value) {
        Ok(r) => r,
        Err(_) => return RequestOutcome::Response(failure("invalid json")),
    };

    let enabling_notifications = matches!(request, Request::EnableNotifications);

    match orchestrator.dispatch(request).await {
        Ok(ApiResponse::Ok) if enabling_notifications => RequestOutcome::EnableNotifications,
        Ok(ApiResponse::Ok) => RequestOutcome::Response(json!({"result": "ok"})),
        Ok(ApiResponse::UsbList(devices)) => {
            RequestOutcome::Response(json!({"result": "ok", "usb_devices": devices}))
        }
        Ok(ApiResponse::PciList(devices)) => {
            RequestOutcome::Response(json!({"result": "ok", "pci_devices": devices}))
        }
        Err(err) => RequestOutcome::Response(failure(api_error_wire(&err))),
    }
}

fn api_error_wire(err: &ApiError) -> &'static str {
    err.code.as_str()
}

fn failure(error: &str) -> Value {
    json!({"result": "failed", "error": error})
}

async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, body: &Value) -> std::io::Result<()> {
    let mut line = serde_json::to_string(body).expect("response always serializes");
    line.push('\n');
    write_raw(writer, &line).await
}

async fn write_raw<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    let result = tokio::time::timeout(WRITE_DEADLINE, async {
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    })
    .await;
    match result {
        Ok(inner) => inner,
        Err(_) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "write deadline exceeded")),
    }
}
