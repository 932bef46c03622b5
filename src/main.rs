//! boundary: runs a child process under an enforced, allow-listed
//! network egress policy, enforced by an in-process intercepting proxy.

mod audit;
mod ca;
mod cli;
mod error;
mod jailer;
mod orchestrator;
mod proxy;
mod rules;
mod user;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Cli;
use orchestrator::Orchestrator;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_filter_str());

    let orchestrator = Orchestrator::new(cli);
    match orchestrator.run().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("boundary: {err}");
            std::process::exit(1);
        }
    }
}

/// `RUST_LOG` overrides the `--log-level` default when set, matching the
/// teacher's `tracing-subscriber` setup generalized from a fixed level
/// to an `EnvFilter`.
fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
