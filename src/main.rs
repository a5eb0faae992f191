use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use sealpost::cli;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else if args.quiet {
        tracing::Level::ERROR
    } else {
        tracing::Level::INFO
    };

    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time();
    match std::env::var("RUST_LOG") {
        Ok(filter) if !filter.is_empty() => {
            subscriber.with_env_filter(EnvFilter::new(filter)).init()
        }
        _ => subscriber.with_max_level(log_level).init(),
    }

    let mut app = match args.command {
        cli::Command::Completions { shell } => {
            let mut cmd = <cli::Cli as clap::CommandFactory>::command();
            clap_complete::generate(shell, &mut cmd, "sealpost", &mut std::io::stdout());
            return Ok(());
        }
        _ => cli::context::App::load(&args)?,
    };

    let quiet = args.quiet;
    match args.command {
        cli::Command::Keys(args) => cli::keys::run(args, &mut app, quiet).await,
        cli::Command::Compose(args) => cli::compose::run(args, &mut app, quiet).await,
        cli::Command::Draft(args) => cli::draft::run(args, &mut app, quiet).await,
        cli::Command::Decrypt(args) => cli::decrypt::run(args, &mut app, quiet).await,
        cli::Command::Completions { .. } => Ok(()),
    }
}
