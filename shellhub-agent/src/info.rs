//! The `info` subcommand: probes the server endpoints and exits 0/1.

#![allow(clippy::print_stdout)]

use anyhow::Context as _;

use crate::client::ApiClient;
use crate::config::AgentConfig;

pub async fn probe(config: AgentConfig) -> anyhow::Result<()> {
    let api = ApiClient::new(config.clone())?;

    let info = api.info().await.context("server info endpoint unreachable")?;

    println!("server: {}", config.server_address);
    println!("tenant: {}", config.tenant_id);
    println!("info:   {}", serde_json::to_string_pretty(&info)?);

    Ok(())
}
