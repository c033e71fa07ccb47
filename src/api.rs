//! Health & status endpoints
//!
//! Serves on the configured PORT (default 3000):
//! - GET /health  - liveness probe
//! - GET /metrics - Prometheus metrics
//! - GET /status  - bridge status histogram and app identity

#![allow(dead_code)]

use eyre::Result;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use sqlx::PgPool;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use crate::config::APP_NAME;
use crate::db;
use crate::metrics;

/// Status response
#[derive(Serialize)]
struct StatusResponse {
    app: String,
    status: String,
    bridge_status_counts: Vec<StatusCount>,
}

#[derive(Serialize)]
struct StatusCount {
    status: i16,
    count: i64,
}

/// Start the status/metrics server
pub async fn start_api_server(addr: SocketAddr, db: PgPool) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Status server started");

    metrics::UP.set(1.0);

    loop {
        let (mut socket, _) = listener.accept().await?;
        let db = db.clone();

        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            if socket.readable().await.is_ok() {
                let _ = socket.try_read(&mut buf);
            }

            let request = String::from_utf8_lossy(&buf);

            if request.contains("GET /metrics") {
                let encoder = TextEncoder::new();
                let metric_families = prometheus::gather();
                let mut buffer = Vec::new();
                let _ = encoder.encode(&metric_families, &mut buffer);

                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n",
                    buffer.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.write_all(&buffer).await;
            } else if request.contains("GET /health") {
                let response =
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nOK";
                let _ = socket.write_all(response.as_bytes()).await;
            } else if request.contains("GET /status") {
                let status = build_status_response(&db).await;
                let body = serde_json::to_string(&status).unwrap_or_else(|_| "{}".to_string());
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            } else {
                let response =
                    "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: 9\r\n\r\nNot Found";
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
    }
}

async fn build_status_response(db: &PgPool) -> StatusResponse {
    let counts = db::count_bridges_by_status(db)
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|(status, count)| StatusCount { status, count })
        .collect();

    StatusResponse {
        app: APP_NAME.to_string(),
        status: "ok".to_string(),
        bridge_status_counts: counts,
    }
}
