#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]

#[macro_use]
extern crate tracing;

mod service;

use anyhow::Context;
use shellhub_gateway::config::ConfHandle;
use tap::prelude::*;

use crate::service::GatewayService;

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config-path" => {
                let path = args.next().context("missing value for --config-path")?;
                // SAFETY: At this point the program is single-threaded.
                unsafe { std::env::set_var("SHELLHUB_GATEWAY_CONFIG_PATH", &path) };
            }
            "--config-init-only" => {
                let conf_file = shellhub_gateway::config::load_conf_file_or_generate_new()?;
                let conf_file_json =
                    serde_json::to_string_pretty(&conf_file).context("couldn't represent config file as JSON")?;
                println!("{conf_file_json}");
                return Ok(());
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            unexpected => {
                anyhow::bail!("unexpected argument: {unexpected}");
            }
        }
    }

    let conf_handle = ConfHandle::init().context("unable to initialize configuration")?;
    let mut service = GatewayService::load(conf_handle).context("service loading failed")?;

    service
        .start()
        .tap_err(|error| error!(error = format!("{error:#}"), "Failed to start"))?;

    // Waiting for some stop signal (CTRL-C…)
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .context("failed to build the async runtime")?;
    rt.block_on(build_signals_fut())?;

    service.stop();

    Ok(())
}

fn print_help() {
    println!(
        r#"shellhub-gateway

    Run:
        shellhub-gateway

    Initialize configuration only (will not override existing configuration):
        shellhub-gateway --config-init-only

    Options:
        --config-path <CONFIG_PATH>
"#
    );
}

#[cfg(unix)]
async fn build_signals_fut() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate_signal = signal(SignalKind::terminate()).context("failed to create terminate signal stream")?;
    let mut quit_signal = signal(SignalKind::quit()).context("failed to create quit signal stream")?;
    let mut interrupt_signal = signal(SignalKind::interrupt()).context("failed to create interrupt signal stream")?;

    futures::future::select_all(vec![
        Box::pin(terminate_signal.recv()),
        Box::pin(quit_signal.recv()),
        Box::pin(interrupt_signal.recv()),
    ])
    .await;

    Ok(())
}

#[cfg(not(unix))]
async fn build_signals_fut() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("CTRL_C signal failed")
}
