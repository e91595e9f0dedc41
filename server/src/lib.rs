//! TCP transport for the engine: one line-delimited JSON duplex channel per
//! client connection.
#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::sync::Arc;
use std::time::Duration;

use terminus_core::Engine;
use terminus_core::config::Config;
use terminus_core::sandbox;
use terminus_protocol::ErrorCategory;
use terminus_protocol::ErrorDetectedEvent;
use terminus_protocol::EventMsg;
use terminus_protocol::Op;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Size of the per-connection outgoing queue. 128 messages is plenty for an
/// interactive client while bounding memory use.
const CHANNEL_CAPACITY: usize = 128;

/// How long shutdown waits for workflow cancellations to propagate.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

/// Log whether the runtime preconditions hold. Degradation is reported but
/// does not refuse connections.
pub fn report_readiness(config: &Config) {
    let mut degraded = Vec::new();
    if !config.offline && config.api_key.is_none() {
        degraded.push("no upstream API key configured".to_string());
    }
    if let Err(reason) = sandbox::check_sandbox_user(config) {
        degraded.push(reason);
    }
    if degraded.is_empty() {
        info!("startup checks passed; service is ready");
    } else {
        for reason in &degraded {
            warn!("{reason}");
        }
        warn!("service is degraded; connections are still accepted");
    }
}

/// Accept connections until `shutdown` fires, then give in-flight
/// cancellations a moment to reach their clients before returning.
pub async fn serve(
    listener: TcpListener,
    config: Config,
    shutdown: Arc<Notify>,
) -> std::io::Result<()> {
    report_readiness(&config);
    info!(addr = %listener.local_addr()?, "listening");

    loop {
        let accepted = tokio::select! {
            res = listener.accept() => res,
            _ = shutdown.notified() => break,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, "connection accepted");
                let config = config.clone();
                let shutdown = Arc::clone(&shutdown);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, config, shutdown).await {
                        debug!(%peer, "connection closed: {e}");
                    }
                });
            }
            Err(e) => warn!("accept failed: {e}"),
        }
    }

    tokio::time::sleep(SHUTDOWN_GRACE).await;
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    config: Config,
    shutdown: Arc<Notify>,
) -> std::io::Result<()> {
    let (read_half, write_half) = stream.into_split();
    let engine = Arc::new(Engine::spawn(config, shutdown));
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<EventMsg>(CHANNEL_CAPACITY);

    // Task: forward engine events to the outgoing queue.
    let forwarder = tokio::spawn({
        let engine = Arc::clone(&engine);
        let outgoing_tx = outgoing_tx.clone();
        async move {
            while let Ok(event) = engine.next_event().await {
                if outgoing_tx.send(event).await.is_err() {
                    break;
                }
            }
        }
    });

    // Task: write outgoing events as JSON lines, preserving emission order.
    let writer = tokio::spawn(async move {
        let mut write_half = write_half;
        while let Some(event) = outgoing_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if write_half.write_all(json.as_bytes()).await.is_err() {
                        break;
                    }
                    if write_half.write_all(b"\n").await.is_err() {
                        break;
                    }
                    if write_half.flush().await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("failed to serialize event: {e}"),
            }
        }
    });

    // Read inbound envelopes on this task; EOF ends the connection.
    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Op>(line) {
            Ok(op) => {
                if engine.submit(op).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                // Envelope-shape problems are admission failures; tell the
                // client instead of silently dropping the line.
                debug!("undecodable inbound envelope: {e}");
                let event = EventMsg::ErrorDetected(ErrorDetectedEvent::new(
                    ErrorCategory::Validation,
                    format!("invalid event envelope: {e}"),
                    "validate",
                ));
                if outgoing_tx.send(event).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("reader finished (EOF)");

    // Dropping the engine ends its loop, which aborts any running workflow.
    forwarder.abort();
    writer.abort();
    Ok(())
}
