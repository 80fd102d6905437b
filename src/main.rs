//! tfworker CLI: run dependent Terraform definitions in order.

use clap::Parser;
use tfworker::transport::CancelToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "tfworker",
    version,
    about = "Orchestrate dependent Terraform definitions: ordering, rendering, hooks"
)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: tfworker::cli::Commands,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let cancel = CancelToken::new();
    let handler = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("interrupt received, stopping after cleanup");
        handler.cancel();
    }) {
        tracing::warn!("cannot install Ctrl-C handler: {}", e);
    }

    if let Err(e) = tfworker::cli::dispatch(cli.command, &cancel) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
