use std::env;
use std::panic;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use kvcli::config::NodeConfig;
use kvcli::trace;
use twopc::config::{replica_addr, Paths, MASTER_ADDR};
use twopc::coordinator::Coordinator;
use twopc::replica::Replica;

/// CMD like:
///     twopc -m -n 4          -- run as coordinator over 4 replicas
///     twopc -r -i 2 -n 4     -- run as replica 2 of 4
#[derive(Debug, Parser, PartialEq)]
#[command(version, author, about)]
struct Args {
    /// Run as the coordinator.
    #[clap(short = 'm', long = "master", conflicts_with = "replica")]
    master: bool,

    /// Run as a replica.
    #[clap(short = 'r', long = "replica", conflicts_with = "master")]
    replica: bool,

    /// Replica count; required when running as the coordinator.
    #[clap(short = 'n', long = "replica-count")]
    replica_count: Option<usize>,

    /// 0-based replica index; required when running as a replica.
    #[clap(short = 'i', long = "index")]
    index: Option<usize>,

    /// Root directory for logs/ and data/, overriding the config file.
    #[clap(long = "root")]
    root: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_hooks();

    let args = Args::parse();
    let config = NodeConfig::load();
    let root = args.root.clone().unwrap_or(config.root.clone());

    let _guards = trace::init_logging(&format!("{}/logs", root), &config.log_level).await?;
    info!("twopc starting with args: {:?}", &args);

    let shutdown = Arc::new(Notify::new());
    let s = shutdown.clone();
    ctrlc::set_handler(move || {
        log::info!("received Ctrl+C, shutting down");
        s.notify_one();
    })
    .context("failed to install Ctrl+C handler")?;

    let exit_code = match run(args, &root, shutdown).await {
        Ok(()) => 0,
        Err(err) => {
            log::error!("fatal error: {:#}", err);
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(args: Args, root: &str, shutdown: Arc<Notify>) -> Result<()> {
    let paths = Paths::new(root);

    if args.master {
        let replica_count = args
            .replica_count
            .context("-m requires -n <replicaCount>")?;
        let replicas = (0..replica_count).map(replica_addr).collect::<Vec<_>>();

        let coordinator = Arc::new(
            Coordinator::open(paths.master_log(), replicas)
                .context("failed to open coordinator log")?,
        );
        let listener = TcpListener::bind(MASTER_ADDR)
            .await
            .with_context(|| format!("failed to bind coordinator address {}", MASTER_ADDR))?;
        info!("coordinator listening on {}", MASTER_ADDR);

        tokio::select! {
            result = twopc::coordinator::serve(coordinator, listener) => result?,
            _ = shutdown.notified() => info!("coordinator shut down cleanly"),
        }
        return Ok(());
    }

    if args.replica {
        let index = args.index.context("-r requires -i <index>")?;

        let replica = Arc::new(
            Replica::open(
                index,
                paths.replica_log(index),
                paths.replica_committed(index).join("data.log"),
                paths.replica_temp(index).join("data.log"),
            )
            .context("failed to open replica storage")?,
        );
        let addr = replica_addr(index);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind replica address {}", addr))?;
        info!("replica {} listening on {}", index, addr);

        tokio::select! {
            result = twopc::replica::serve(replica.clone(), MASTER_ADDR.to_string(), listener) => result?,
            _ = shutdown.notified() => {
                replica.flush().context("failed to flush replica stores on shutdown")?;
                info!("replica {} shut down cleanly", index);
            }
        }
        return Ok(());
    }

    anyhow::bail!("one of -m (coordinator) or -r (replica) is required")
}

fn setup_panic_hooks() {
    let meta = human_panic::Metadata {
        version: env!("CARGO_PKG_VERSION").into(),
        name: env!("CARGO_PKG_NAME").into(),
        authors: env!("CARGO_PKG_AUTHORS").replace(':', ", ").into(),
        homepage: env!("CARGO_PKG_HOMEPAGE").into(),
    };

    let default_hook = panic::take_hook();

    if env::var("RUST_BACKTRACE").is_err() {
        panic::set_hook(Box::new(move |info: &panic::PanicInfo| {
            default_hook(info);
            let file_path = human_panic::handle_dump(&meta, info);
            human_panic::print_msg(file_path, &meta)
                .expect("human-panic: printing error message to console failed");
        }));
    }
}
