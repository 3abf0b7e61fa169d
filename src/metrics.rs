//! Prometheus metrics for the node core.
//!
//! Exposes metrics on /metrics for Prometheus scraping. Query and
//! message-handler timers are scoped: the caller holds the
//! [`HistogramTimer`] for the duration of the work and every exit path
//! records a sample when it drops.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge, CounterVec, Encoder,
    HistogramTimer, HistogramVec, IntGauge, TextEncoder,
};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

lazy_static! {
    // Database statement latency, per operation and entity
    pub static ref DB_QUERY_SECONDS: HistogramVec = register_histogram_vec!(
        "lumen_db_query_duration_seconds",
        "Latency of database statements",
        &["op", "entity"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    // Overlay message handler latency, per message type
    pub static ref RECV_MESSAGE_SECONDS: HistogramVec = register_histogram_vec!(
        "lumen_overlay_recv_duration_seconds",
        "Latency of inbound overlay message handlers",
        &["type"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    ).unwrap();

    pub static ref PEERS_DROPPED: CounterVec = register_counter_vec!(
        "lumen_overlay_peers_dropped_total",
        "Peer sessions dropped, by reason",
        &["reason"]
    ).unwrap();

    pub static ref MESSAGES_BROADCAST: CounterVec = register_counter_vec!(
        "lumen_overlay_broadcast_total",
        "Messages fanned out to peers, by type",
        &["type"]
    ).unwrap();

    pub static ref AUTHENTICATED_PEERS: IntGauge = register_int_gauge!(
        "lumen_overlay_authenticated_peers",
        "Peer sessions that completed the handshake"
    ).unwrap();
}

pub fn select_timer(entity: &str) -> HistogramTimer {
    DB_QUERY_SECONDS
        .with_label_values(&["select", entity])
        .start_timer()
}

pub fn insert_timer(entity: &str) -> HistogramTimer {
    DB_QUERY_SECONDS
        .with_label_values(&["insert", entity])
        .start_timer()
}

pub fn update_timer(entity: &str) -> HistogramTimer {
    DB_QUERY_SECONDS
        .with_label_values(&["update", entity])
        .start_timer()
}

pub fn delete_timer(entity: &str) -> HistogramTimer {
    DB_QUERY_SECONDS
        .with_label_values(&["delete", entity])
        .start_timer()
}

pub fn recv_timer(message_type: &str) -> HistogramTimer {
    RECV_MESSAGE_SECONDS
        .with_label_values(&[message_type])
        .start_timer()
}

pub fn record_peer_dropped(reason: &str) {
    PEERS_DROPPED.with_label_values(&[reason]).inc();
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(addr: SocketAddr) -> eyre::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Metrics server started");

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let n = match socket.read(&mut buf).await {
                Ok(n) if n > 0 => n,
                _ => return,
            };

            let (method, path) = match parse_metrics_request(&buf[..n]) {
                Some(mp) => mp,
                None => {
                    let _ = socket
                        .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
                        .await;
                    return;
                }
            };

            match (method.as_str(), path.as_str()) {
                ("GET", "/metrics") | ("GET", "/") => {
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
                }
                ("GET", "/health") => {
                    let response =
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nOK";
                    let _ = socket.write_all(response.as_bytes()).await;
                }
                _ => {
                    let response = "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
                    let _ = socket.write_all(response.as_bytes()).await;
                }
            }
        });
    }
}

/// Parse HTTP method and path from raw request bytes (metrics server).
fn parse_metrics_request(buf: &[u8]) -> Option<(String, String)> {
    let request = std::str::from_utf8(buf).ok()?;
    let first_line = request.lines().next()?;
    let mut parts = first_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    Some((method, path))
}
