//! Load check for the order server's notification fan-out: opens several
//! dashboards for one restaurant, places a burst of orders over HTTP and
//! reports how many `novo_pedido` events arrived and how fast.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use servers::order_logic::auth::{JwtAuth, PrincipalKind};
use tokio::task::JoinSet;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Base HTTP URL of the order server
    #[clap(long, default_value = "http://127.0.0.1:8000")]
    base_url: String,

    /// Secret the server verifies tokens with
    #[clap(long, env = "ORDERS_JWT_SECRET")]
    jwt_secret: String,

    /// Restaurant whose dashboards are opened
    #[clap(long)]
    restaurante_id: Uuid,

    /// Menu item ordered in every request (must belong to the restaurant)
    #[clap(long)]
    prato_id: Uuid,

    /// Number of dashboards to open
    #[clap(short, long, default_value_t = 8)]
    dashboards: usize,

    /// Number of orders to place
    #[clap(short, long, default_value_t = 50)]
    orders: usize,

    /// Pause between orders in milliseconds
    #[clap(long, default_value_t = 20)]
    interval_ms: u64,

    /// Seconds to wait for stragglers after the last order
    #[clap(long, default_value_t = 5)]
    settle_seconds: u64,
}

type Arrivals = Arc<Mutex<Vec<(String, Instant)>>>;

fn ws_url(base_url: &str, restaurante_id: Uuid, token: &str) -> String {
    let ws_base = base_url
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    format!("{}/ws/restaurante/{}?token={}", ws_base.trim_end_matches('/'), restaurante_id, token)
}

fn percentile(sorted: &[Duration], pct: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let rank = ((sorted.len() as f64 - 1.0) * pct).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let auth = JwtAuth::new(&args.jwt_secret);
    let restaurant_token = auth.issue_token(args.restaurante_id, PrincipalKind::Restaurante, 3600)?;
    let user_token = auth.issue_token(Uuid::new_v4(), PrincipalKind::Usuario, 3600)?;

    // Open every dashboard before the first order.
    let arrivals: Arrivals = Arc::new(Mutex::new(Vec::new()));
    let mut readers = JoinSet::new();
    let url = ws_url(&args.base_url, args.restaurante_id, &restaurant_token);
    println!("Opening {} dashboards at {}...", args.dashboards, url);
    for _ in 0..args.dashboards {
        let (ws_stream, _) = connect_async(url.as_str()).await.context("Failed to connect dashboard")?;
        let (mut write, mut read) = ws_stream.split();
        let arrivals = Arc::clone(&arrivals);
        readers.spawn(async move {
            while let Some(Ok(msg)) = read.next().await {
                let Message::Text(text) = msg else { continue };
                let Ok(event) = serde_json::from_str::<Value>(text.as_str()) else { continue };
                if event["type"] == "novo_pedido" {
                    if let Some(id) = event["pedido_id"].as_str() {
                        if let Ok(mut data) = arrivals.lock() {
                            data.push((id.to_string(), Instant::now()));
                        }
                    }
                }
            }
            let _ = write.close().await;
        });
    }

    // Place the orders.
    let http = reqwest::Client::new();
    let orders_url = format!("{}/pedidos", args.base_url.trim_end_matches('/'));
    let mut sent: HashMap<String, Instant> = HashMap::new();
    let mut failures = 0usize;
    for _ in 0..args.orders {
        let started = Instant::now();
        let response = http
            .post(&orders_url)
            .bearer_auth(&user_token)
            .json(&json!({
                "restaurante_id": args.restaurante_id,
                "itens": [{"prato_id": args.prato_id, "quantidade": 1}]
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            failures += 1;
            eprintln!("Order rejected: {} {}", response.status(), response.text().await.unwrap_or_default());
            continue;
        }
        let order: Value = response.json().await?;
        if let Some(id) = order["pedido_id"].as_str() {
            sent.insert(id.to_string(), started);
        }
        tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
    }
    if sent.is_empty() {
        bail!("no order was accepted ({} failures)", failures);
    }

    tokio::time::sleep(Duration::from_secs(args.settle_seconds)).await;
    readers.abort_all();

    // Summarize.
    let data = arrivals.lock().map_err(|_| anyhow::anyhow!("arrival log poisoned"))?;
    let mut latencies: Vec<Duration> = data
        .iter()
        .filter_map(|(id, at)| sent.get(id).map(|start| at.saturating_duration_since(*start)))
        .collect();
    latencies.sort();

    let expected = sent.len() * args.dashboards;
    println!("\n----- Fan-out Summary -----");
    println!("Dashboards: {}", args.dashboards);
    println!("Orders accepted: {} (rejected: {})", sent.len(), failures);
    println!("Deliveries: {} of {} expected", latencies.len(), expected);
    println!(
        "Latency p50: {:?}  p95: {:?}  max: {:?}",
        percentile(&latencies, 0.50),
        percentile(&latencies, 0.95),
        latencies.last().copied().unwrap_or_default()
    );
    println!("---------------------------\n");

    if latencies.len() < expected {
        bail!("{} deliveries missing", expected - latencies.len());
    }
    Ok(())
}
