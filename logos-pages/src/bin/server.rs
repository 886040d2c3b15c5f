//! Standalone page sync server.
//!
//! Configured from `LOGOS_PAGES_*` variables; credentials come from
//! `LOGOS_PAGES_TOKENS` as `token=user-uuid` pairs separated by commas.

use std::sync::Arc;

use log::{info, warn};
use logos_pages::{ServerConfig, StaticTokenAuthenticator, SyncServer};
use uuid::Uuid;

const ENV_TOKENS: &str = "LOGOS_PAGES_TOKENS";

fn load_tokens(raw: &str) -> StaticTokenAuthenticator {
    let tokens = StaticTokenAuthenticator::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match pair.split_once('=').map(|(t, u)| (t.trim(), Uuid::parse_str(u.trim()))) {
            Some((token, Ok(user_id))) if !token.is_empty() => tokens.insert(token, user_id),
            _ => warn!("Ignoring malformed {ENV_TOKENS} entry"),
        }
    }
    tokens
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    info!("Starting Logos page sync server...");

    let config = ServerConfig::from_env();
    let tokens = load_tokens(&std::env::var(ENV_TOKENS).unwrap_or_default());
    let server = SyncServer::new(config, Arc::new(tokens))?;
    server.run().await
}
