//! shotcache renderer
//!
//! Spawned by the capture supervisor as
//! `shotcache-render [SCRIPT] <PAYLOAD> <OUTPUT>`. Exits 0 after writing the
//! screenshot, nonzero otherwise.

use clap::Parser;
use shotcache::render::RenderExit;
use std::path::PathBuf;

/// shotcache renderer process
#[derive(Parser, Debug)]
#[command(name = "shotcache-render")]
#[command(version)]
#[command(about = "Render one screenshot from a base64 options payload")]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// [SCRIPT] PAYLOAD OUTPUT
    #[arg(num_args = 2..=3, required = true, value_name = "ARGS")]
    positional: Vec<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    // stdout and stderr are both forwarded by the supervisor
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let (script, payload, output) = match args.positional.as_slice() {
        [payload, output] => (None, payload.as_str(), PathBuf::from(output)),
        [script, payload, output] => (
            Some(script.as_str()),
            payload.as_str(),
            PathBuf::from(output),
        ),
        other => {
            tracing::error!(
                "Error: expected [SCRIPT] PAYLOAD OUTPUT, got {} arguments",
                other.len()
            );
            std::process::exit(RenderExit::InvalidInput.code());
        }
    };

    let exit = shotcache::render::run(script, payload, &output).await;
    std::process::exit(exit.code());
}
