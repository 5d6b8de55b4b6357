//! Logging and metrics plumbing: JSON line logs, the Prometheus recorder,
//! and the small HTTP listener serving `/metrics`, `/health` and the
//! operator's `/resume` command.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use liquidator_core::SafetyController;

/// Initialize JSON structured logging. One object per line with
/// timestamp, level, target and the event's structured fields.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(fmt::layer().json().with_current_span(false).with_span_list(false))
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,liquidator=debug,liquidator_core=debug,liquidator_chain=debug")
            }),
        )
        .init();
}

/// Install the Prometheus recorder and return its render handle.
pub fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}

/// Serve the operator HTTP surface until shutdown.
///
/// `GET /metrics` renders the Prometheus text format, `GET /health`
/// answers `OK` while the orchestrator runs, `POST /resume` issues the
/// manual resume against the safety controller.
pub async fn serve_http(
    port: u16,
    handle: PrometheusHandle,
    safety: Arc<SafetyController>,
    running: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "metrics endpoint listening");

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.changed() => break,
        };
        let (mut stream, _) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        let handle = handle.clone();
        let safety = safety.clone();
        let running = running.clone();
        tokio::spawn(async move {
            let mut buffer = vec![0u8; 4096];
            let read = match stream.read(&mut buffer).await {
                Ok(read) => read,
                Err(_) => return,
            };
            let request = String::from_utf8_lossy(&buffer[..read]).to_string();
            let response = route(&request, &handle, &safety, &running).await;
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }

    info!("metrics endpoint stopped");
    Ok(())
}

async fn route(
    request: &str,
    handle: &PrometheusHandle,
    safety: &SafetyController,
    running: &AtomicBool,
) -> String {
    let first_line = request.lines().next().unwrap_or_default();
    let mut parts = first_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or_default();
    let path = target.split('?').next().unwrap_or_default();

    match (method, path) {
        ("GET", "/metrics") => {
            let body = handle.render();
            http_response("200 OK", "text/plain; version=0.0.4", &body)
        }
        ("GET", "/health") => {
            if running.load(Ordering::Relaxed) {
                http_response("200 OK", "text/plain", "OK")
            } else {
                http_response("503 Service Unavailable", "text/plain", "stopping")
            }
        }
        ("POST", "/resume") => {
            let query = target.split('?').nth(1).unwrap_or_default();
            let operator = query_param(query, "operator").unwrap_or_else(|| "unknown".to_string());
            let reason = query_param(query, "reason").unwrap_or_else(|| "unspecified".to_string());
            if safety.manual_resume(&operator, &reason).await {
                http_response("200 OK", "text/plain", "resumed")
            } else {
                http_response("409 Conflict", "text/plain", "not halted")
            }
        }
        _ => http_response("404 Not Found", "text/plain", "not found"),
    }
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.replace('+', " "))
    })
}

fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_params_parse() {
        assert_eq!(query_param("operator=ops-1&reason=fixed", "operator").as_deref(), Some("ops-1"));
        assert_eq!(
            query_param("operator=ops-1&reason=root+cause+fixed", "reason").as_deref(),
            Some("root cause fixed")
        );
        assert_eq!(query_param("operator=ops-1", "reason"), None);
    }

    #[test]
    fn responses_carry_content_length() {
        let response = http_response("200 OK", "text/plain", "OK");
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-Length: 2\r\n"));
        assert!(response.ends_with("\r\n\r\nOK"));
    }
}
