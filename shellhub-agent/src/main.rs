#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]

#[macro_use]
extern crate tracing;

use std::future::Future;
use std::process::ExitCode;

use anyhow::Context as _;
use seahorse::{App, Command, Context};
use shellhub_agent::config::AgentConfig;

fn main() -> ExitCode {
    let app = App::new(env!("CARGO_PKG_NAME"))
        .description(env!("CARGO_PKG_DESCRIPTION"))
        .version(env!("CARGO_PKG_VERSION"))
        .usage(format!("{} [info|sftp]", env!("CARGO_PKG_NAME")))
        .action(run_agent)
        .command(info_command())
        .command(sftp_command());

    app.run(std::env::args().collect());

    // seahorse actions report failures through the exit code they set.
    ExitCode::SUCCESS
}

fn run_agent(_c: &Context) {
    let config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error:#}");
            std::process::exit(1);
        }
    };

    setup_logger(&config.log_level);

    let code = match run(shellhub_agent::connector::run(config)) {
        Ok(()) => 0,
        Err(error) => {
            error!(error = format!("{error:#}"), "Agent terminated");
            1
        }
    };

    std::process::exit(code);
}

fn info_command() -> Command {
    Command::new("info")
        .description("probe the server endpoints and exit")
        .action(|_c: &Context| {
            let config = match AgentConfig::from_env() {
                Ok(config) => config,
                Err(error) => {
                    eprintln!("configuration error: {error:#}");
                    std::process::exit(1);
                }
            };

            setup_logger(&config.log_level);

            let code = match run(shellhub_agent::info::probe(config)) {
                Ok(()) => 0,
                Err(error) => {
                    eprintln!("probe failed: {error:#}");
                    1
                }
            };

            std::process::exit(code);
        })
}

/// Internal command, invoked by the agent itself for each SFTP session.
fn sftp_command() -> Command {
    Command::new("sftp")
        .description("serve SFTP over stdio (internal)")
        .action(|_c: &Context| {
            let code = match run(shellhub_agent::sftp::serve_stdio()) {
                Ok(()) => 0,
                Err(error) => {
                    eprintln!("sftp failed: {error:#}");
                    1
                }
            };

            std::process::exit(code);
        })
}

fn setup_logger(log_level: &str) {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::prelude::*;

    // `warning` is accepted for compatibility with the documented levels.
    let level = match log_level {
        "warning" => "warn",
        other => other,
    };

    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}

fn run<F: Future<Output = anyhow::Result<()>>>(f: F) -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("runtime build failed")?;

    rt.block_on(f)
}
