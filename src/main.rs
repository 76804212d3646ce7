//! andamio CLI — idempotent provisioning of external resource graphs.

use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = andamio::cli::Cli::parse();

    // Create logger
    let level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = andamio::cli::dispatch(cli.command).await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
