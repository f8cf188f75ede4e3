//! hotmod daemon entry point
//!
//! ```bash
//! hotmod-daemon --port 3100 --root ./app --entry src/main.js
//! RUST_LOG=hotmod=debug hotmod-daemon --root .
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use hotmod::graph::ModuleId;
use hotmod::{EsmTransformer, HmrError, HmrServer, ServerOptions};

/// Development server with hot module replacement
#[derive(Parser, Debug)]
#[command(name = "hotmod-daemon")]
#[command(about = "Push-based hot module replacement dev server")]
struct Args {
    /// Port the WebSocket listener binds to
    #[arg(short, long, default_value = "3100")]
    port: u16,

    /// Project root to watch and serve modules from
    #[arg(short, long, default_value = ".")]
    root: PathBuf,

    /// Project entry modules (never pruned), relative to the root
    #[arg(short, long)]
    entry: Vec<String>,

    /// In-flight update batches
    #[arg(long, default_value_t = hotmod::config::DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Batch collection window in milliseconds
    #[arg(long, default_value_t = hotmod::config::DEFAULT_BATCH_WINDOW_MS)]
    batch_window_ms: u64,

    /// Maximum jobs per batch
    #[arg(long, default_value_t = hotmod::config::DEFAULT_MAX_BATCH)]
    max_batch: usize,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hotmod=info".parse().expect("static directive parses")),
        )
        .init();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            e.exit_code()
        }
    }
}

async fn run() -> hotmod::Result<()> {
    let args = Args::parse();

    let root = args
        .root
        .canonicalize()
        .map_err(|e| HmrError::io(&args.root, e))?;

    let options = ServerOptions::new(args.port, root)
        .with_concurrency(args.concurrency)
        .with_batch_window_ms(args.batch_window_ms)
        .with_max_batch(args.max_batch);

    let server = HmrServer::new(options, Box::new(EsmTransformer::new()))?;
    for entry in &args.entry {
        server.set_entry(ModuleId::new(entry.clone()));
    }

    server.run().await
}
