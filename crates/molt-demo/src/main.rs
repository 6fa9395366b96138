use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod server;

use server::PidServer;

/// PID-reporting demo server with zero-downtime restart.
///
/// SIGUSR2 restarts in place, SIGINT/SIGTERM drain and exit.
#[derive(Parser, Debug)]
struct Args {
    /// Address to serve on (repeatable).
    #[arg(long = "addr", default_value = "127.0.0.1:8081")]
    addrs: Vec<String>,

    /// How long a successor waits for this process to finish draining
    /// before it starts accepting. 0 means stateless handoff.
    #[arg(long, default_value_t = 0)]
    wait_parent_shutdown_ms: u64,

    /// Write the serving pid here on startup and again on takeover.
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Never finish the complete-shutdown hook. Simulates a hung
    /// predecessor so the successor's kill path can be exercised by hand.
    #[arg(long)]
    hang_complete_shutdown: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    info!(pid = std::process::id(), addrs = ?args.addrs, "molt-echod starting");

    let servers: Vec<Arc<dyn molt::Server>> = args
        .addrs
        .iter()
        .map(|addr| PidServer::new(addr) as Arc<dyn molt::Server>)
        .collect();

    let mut app = molt::App::new(servers)
        .wait_parent_shutdown_timeout(Duration::from_millis(args.wait_parent_shutdown_ms));

    if let Some(path) = args.pid_file {
        let on_start = path.clone();
        app = app
            .pre_serve(move |inherited| {
                if !inherited {
                    write_pid(&on_start);
                }
                Ok(())
            })
            .pre_parent_exit(move || write_pid(&path));
    }

    if args.hang_complete_shutdown {
        app = app.complete_shutdown(|| loop {
            std::thread::sleep(Duration::from_secs(3600));
        });
    }

    app.listen_and_serve().await?;
    info!("bye");
    Ok(())
}

fn write_pid(path: &Path) {
    if let Err(e) = std::fs::write(path, std::process::id().to_string()) {
        warn!(path = %path.display(), error = %e, "failed to write pid file");
    }
}
