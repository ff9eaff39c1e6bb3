//! Interactive morphing console.
//!
//! Reads user messages from stdin, one per line, runs each through the
//! coordinator with an in-memory store, and prints the decision record as
//! JSON on stdout. Logs go to stderr.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Tracing filter (default: "info,morphing=debug")
//! - `MORPHING_ENABLED`: Overrides the config's `enabled` flag
//! - `MORPHING_CONVERSATION`: Conversation id (default: "console")
//!
//! # Usage
//!
//! ```bash
//! echo "Hola, quiero comprar una laptop" | cargo run --bin morph_console -- morphing.yaml
//! ```

use std::io::BufRead;
use std::sync::Arc;

use anyhow::Context;
use morphing::{InMemoryConversation, InMemoryStore, MorphMetrics, MorphingConfig, MorphingCoordinator, Turn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,morphing=debug".into()),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .context("usage: morph_console <config.yaml>")?;
    let mut config =
        MorphingConfig::from_yaml_file(&path).with_context(|| format!("loading {}", path))?;
    config.apply_env_overrides();

    let metrics = Arc::new(MorphMetrics::new());
    let coordinator = MorphingCoordinator::new(config, Arc::new(InMemoryStore::new()), metrics.clone())
        .context("building morphing coordinator")?;

    let conversation_id = std::env::var("MORPHING_CONVERSATION").unwrap_or_else(|_| "console".to_string());
    let conversation = InMemoryConversation::new(conversation_id);

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("reading stdin")?;
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        let decision = coordinator.process_message(&conversation, text).await;
        conversation.push_turn(Turn::user(text));
        println!("{}", serde_json::to_string(&decision.to_record())?);
    }

    tracing::info!(
        "Session metrics: {}",
        serde_json::to_string(&metrics.snapshot())?
    );
    Ok(())
}
