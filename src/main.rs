use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use clap::Parser;
use clap_serde_derive::ClapSerde;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::Config;
use crate::inference::onnx::{
    shared_library_path, OnnxEnvironment, OnnxSession, Platform, TensorSpec,
};
use crate::inference::slot::InferenceSlot;
use crate::inference::{FEATURE_ARITY, LABEL_ARITY};
use crate::telemetry::init_telemetry;

mod config;
mod error;
mod extractors;
mod inference;
mod net;
mod routes;
mod telemetry;

#[cfg(unix)]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

const DEFAULT_CONFIG_FILE: &str = "ClassifierRunner.toml";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env, default_value = DEFAULT_CONFIG_FILE)]
    config_file: String,

    /// Configuration options
    #[command(flatten)]
    pub opt_config: <Config as ClapSerde>::Opt,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) slot: Arc<InferenceSlot>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = match Config::from_toml(&args.config_file) {
        Ok(opt) => Config::from(opt).merge(args.opt_config),
        Err(err) if args.config_file == DEFAULT_CONFIG_FILE && Config::is_missing_file(&err) => {
            Config::default().merge(args.opt_config)
        }
        Err(err) => {
            return Err(err.context(format!(
                "Failed to read configuration file {}",
                args.config_file
            )))
        }
    };
    let _telemetry = init_telemetry(&config.otel_endpoint(), config.console)?;

    info!("Initializing onnxruntime environment");
    let (environment, slot) = match load_model(&config) {
        Ok(loaded) => loaded,
        Err(err) => exit_err!(1, "Failed to load model: {:#}", err),
    };

    let ip = match config.bind_ip() {
        Ok(ip) => ip,
        Err(err) => exit_err!(1, "Failed to resolve listen address: {:#}", err),
    };
    let addr = SocketAddr::new(ip, config.port);

    info!(
        "Inference slot {:?} with {} features -> {} labels",
        slot.state(),
        slot.input_arity(),
        slot.output_arity()
    );
    let state = AppState {
        slot: Arc::new(slot),
    };
    let router = routes::router(state.clone());
    info!("Available endpoints: /, /echo, /inference");

    let served = serve(router, addr, config.tls_files()).await;

    // The listener is closed at this point, wait for the last run then release
    state.slot.shutdown();
    drop(environment);
    served
}

fn load_model(config: &Config) -> Result<(OnnxEnvironment, InferenceSlot)> {
    let platform = Platform::host()?;
    let library_path = shared_library_path(Path::new(&config.library_dir), platform);
    info!("Using {} runtime library {}", platform, library_path.display());

    let environment = OnnxEnvironment::initialize(&library_path)?;
    let session = OnnxSession::load(
        &environment,
        Path::new(&config.model_file),
        TensorSpec::new(&config.input_name, FEATURE_ARITY),
        TensorSpec::new(&config.output_name, LABEL_ARITY),
    )?;

    Ok((environment, InferenceSlot::bind(Box::new(session))))
}

async fn serve(
    router: Router,
    addr: SocketAddr,
    tls_files: Option<(PathBuf, PathBuf)>,
) -> Result<()> {
    match tls_files {
        Some((cert_file, key_file)) => {
            let tls = RustlsConfig::from_pem_file(&cert_file, &key_file)
                .await
                .with_context(|| format!("Failed to load TLS files {}", cert_file.display()))?;
            let handle = Handle::new();
            tokio::spawn(graceful_shutdown(handle.clone()));

            info!("Listening on https://{}", addr);
            axum_server::bind_rustls(addr, tls)
                .handle(handle)
                .serve(router.into_make_service())
                .await?;
        }
        None => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {}", addr))?;
            info!("Listening on http://{}", listener.local_addr()?);

            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }
    }
    Ok(())
}

async fn graceful_shutdown(handle: Handle) {
    shutdown_signal().await;
    handle.graceful_shutdown(Some(Duration::from_secs(30)));
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutting down..."),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
}

#[macro_export]
macro_rules! exit_err {
    ($msg:expr) => {
        {
            tracing::error!($msg);
            std::process::exit(1);
        }
    };
    ($code:expr, $fmt:expr $(, $arg:expr)*) => {
        {
            tracing::error!($fmt $(, $arg)*);
            std::process::exit($code);
        }
    };
}
