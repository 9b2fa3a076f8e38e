//! Ping/pong demo - one round trip between two groups.
//!
//! Connects a `parent` and a `child` coordinator to the same stream, sends
//! `"ping"` from parent to child, and prints the reply the child's handler
//! produced.
//!
//! ## Configuration
//!
//! Environment variables:
//! - `REDIS_URL`: Redis connection string (default: `redis://localhost:6379`)
//! - `SWITCHBOARD_CONFIG`: optional TOML config path
//! - `RUST_LOG`: logging level (default: "info")

use std::env;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{error, info};

use switchboard::{
    Entry, ErrorHandler, RequestHandler, Switchboard, SwitchboardConfig, SwitchboardError,
};

/// Answers every request with `"pong"`.
struct Pong;

#[async_trait]
impl RequestHandler for Pong {
    async fn call(&self, board: &Switchboard, request: Entry) -> Result<(), SwitchboardError> {
        info!(entry_id = %request.id, content = %request.content, "request received");
        board.fulfill_request(&request, json!("pong")).await
    }
}

/// The parent never expects inbound requests.
struct Unhandled;

#[async_trait]
impl RequestHandler for Unhandled {
    async fn call(&self, board: &Switchboard, request: Entry) -> Result<(), SwitchboardError> {
        board
            .reject_request(&request, json!("this group does not serve requests"))
            .await
    }
}

struct LogErrors;

#[async_trait]
impl ErrorHandler for LogErrors {
    async fn call(&self, error: &SwitchboardError) {
        error!(error = %error, "worker error");
    }
}

/// Per-host stream name so demo runs sharing a Redis do not collide.
fn demo_stream_name() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|name| name.to_str().map(str::to_string))
        .unwrap_or_else(|| "local".to_string());
    format!("switchboard:demo:{host}")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    let mut config = SwitchboardConfig::load()?;
    if let Ok(url) = env::var("REDIS_URL") {
        config.redis.url = url;
    }

    let stream = demo_stream_name();
    info!(stream = %stream, "starting ping/pong demo");

    let child = Switchboard::new(stream.clone(), "child");
    child.on_request(Arc::new(Pong));
    child.on_error(Arc::new(LogErrors));
    child.connect(config.clone()).await?;

    let parent = Switchboard::new(stream.clone(), "parent");
    parent.on_request(Arc::new(Unhandled));
    parent.on_error(Arc::new(LogErrors));
    parent.connect(config).await?;

    let response = parent.send_to_group(json!("ping"), "child").await?;
    match &response {
        r if r.is_fulfilled() => info!(reply = ?r.value(), "round trip complete"),
        r => error!(reason = ?r.reason(), "request rejected"),
    }

    parent.disconnect().await?;
    child.disconnect().await?;
    Ok(())
}
