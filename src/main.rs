//! CLI entry points (§4.11): `unicornproxy proxy` starts the dispatcher's
//! background subsystems (broker session, persistence pipeline); `unicornproxy
//! worker <id>` runs a single-threaded request executor.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Parser, Subcommand};
use log::{LevelFilter, error, info};
use unicornproxy::config::Config;
use unicornproxy::dispatcher::ProxyDispatcher;
use unicornproxy::persistence::PersistencePipeline;
use unicornproxy::persistence::store::TenantStore;
use unicornproxy::supervisor::Supervisor;
use unicornproxy::{broker, logging, worker};

#[derive(Parser)]
#[command(name = "unicornproxy", about = "Intercepting HTTP/HTTPS proxy backed by a message broker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Starts the broker session and persistence pipeline.
    Proxy,
    /// Runs a single worker process.
    Worker {
        /// Disambiguates log files across worker processes on this host.
        id: u32,
    },
}

fn install_shutdown_flag() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let flag_for_handler = flag.clone();
    ctrlc::set_handler(move || {
        flag_for_handler.store(true, Ordering::SeqCst);
    })
    .expect("failed to install SIGINT/SIGTERM handler");
    flag
}

fn level_from_env() -> LevelFilter {
    std::env::var("RUST_LOG")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(LevelFilter::Info)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        // The proxy multiplexes many concurrent dispatches and supervised
        // background tasks, so it gets the default multi-threaded runtime.
        Command::Proxy => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(run_proxy(config))
        }
        // Workers scale by process count, not threads (§4.6) — each one
        // runs a single-threaded current-thread runtime.
        Command::Worker { id } => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(run_worker(config, id))
        }
    }
}

async fn run_proxy(config: Config) -> anyhow::Result<()> {
    logging::init("proxy", config.log_dir.as_deref(), level_from_env())?;
    info!("starting proxy (pid {})", std::process::id());

    let supervisor = Arc::new(Supervisor::new());
    let (broker_session, broker_handle) = broker::BrokerSession::new(config.broker.clone());
    let broker_session = Arc::new(broker_session);

    let store = Arc::new(TenantStore::new(config.database.url.clone()));
    let (pipeline, persistence_queue) = PersistencePipeline::new(
        config.write_queue_capacity,
        config.max_bulk_write,
        config.fuzzer_mode,
        store,
    );

    {
        let broker_session = broker_session.clone();
        let shutdown = supervisor.shutdown_signal();
        supervisor
            .spawn("broker-session", move || {
                let broker_session = broker_session.clone();
                let shutdown = shutdown.clone();
                Box::pin(async move {
                    broker_session.run(shutdown).await;
                })
            })
            .await;
    }

    {
        // PersistencePipeline owns its receiver and can only run once; wrap
        // it so the supervisor's restart factory type-checks even though
        // persistence loss is unrecoverable without a fresh pipeline.
        let pipeline = Arc::new(tokio::sync::Mutex::new(Some(pipeline)));
        let cancellation = supervisor.cancellation_token();
        supervisor
            .spawn("persistence-pipeline", move || {
                let pipeline = pipeline.clone();
                let cancellation = cancellation.clone();
                Box::pin(async move {
                    if let Some(pipeline) = pipeline.lock().await.take() {
                        pipeline.run(cancellation).await;
                    }
                })
            })
            .await;
    }

    // `dispatch()` is invoked by the embedding front end (out of scope
    // here, per §1) once per intercepted request; this binary's job is
    // just to keep its background subsystems alive and ready for it.
    let _dispatcher = ProxyDispatcher::new(
        broker_handle,
        persistence_queue,
        supervisor.clone(),
        config.request_timeout,
    );

    let shutdown_flag = install_shutdown_flag();
    while !shutdown_flag.load(Ordering::SeqCst) {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }

    info!("shutdown requested");
    supervisor.shutdown().await;
    Ok(())
}

async fn run_worker(config: Config, worker_id: u32) -> anyhow::Result<()> {
    let process_name = format!("worker-{worker_id}");
    logging::init(&process_name, config.log_dir.as_deref(), level_from_env())?;
    info!("starting worker {worker_id} (pid {})", std::process::id());

    let shutdown_flag = install_shutdown_flag();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let watcher = {
        let shutdown_flag = shutdown_flag.clone();
        tokio::spawn(async move {
            while !shutdown_flag.load(Ordering::SeqCst) {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
            let _ = shutdown_tx.send(true);
        })
    };

    let result = worker::run(&config, worker_id, shutdown_rx).await;
    watcher.abort();
    if let Err(err) = &result {
        error!("worker {worker_id} exited with error: {err:#}");
    }
    result
}
