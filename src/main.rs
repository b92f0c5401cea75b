use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use clap_serde_derive::ClapSerde;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::completion::CompletionClient;
use crate::config::Config;
use crate::inference::whisper::WhisperPreset;
use crate::model_manager::ModelManager;
use crate::routes::AppState;

mod completion;
mod config;
mod error;
mod extractors;
mod inference;
mod model_manager;
mod routes;
mod telemetry;
#[cfg(test)]
mod test_support;
mod transcription;

#[cfg(unix)]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

static DEFAULT_CONFIG_FILE: &str = "VoiceNotes.toml";

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

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let config = match Config::from_toml(&args.config_file) {
        Ok(conf) => conf.merge(args.opt_config),
        Err(err) => {
            if args.config_file == DEFAULT_CONFIG_FILE {
                Config::default().merge(args.opt_config)
            } else {
                eprintln!(
                    "Failed to read configuration file {} with error: {}",
                    args.config_file, err
                );
                std::process::exit(1);
            }
        }
    };

    let telemetry = telemetry::init_telemetry(config.otlp_endpoint(), config.console_logs)?;

    let preset: WhisperPreset = match config.whisper_model_size.parse() {
        Ok(preset) => preset,
        Err(err) => exit_err!(1, "Invalid WHISPER_MODEL_SIZE: {}", err),
    };
    info!(
        "Supported features: avx: {}, neon: {}, simd128: {}, f16c: {}",
        candle_core::utils::with_avx(),
        candle_core::utils::with_neon(),
        candle_core::utils::with_simd128(),
        candle_core::utils::with_f16c()
    );

    let models = Arc::new(ModelManager::default());
    match model_manager::load_whisper(preset).await {
        Ok(model) => models.publish(Arc::new(model)),
        Err(err) => exit_err!(1, "Failed to load Whisper model {}: {:#}", preset, err),
    }

    let completions = CompletionClient::from_config(&config)?;
    if config.api_key().is_none() {
        warn!("OPENROUTER_API_KEY is not set, summary and structure requests will fail");
    }

    let state = AppState {
        models: Arc::clone(&models),
        completions,
    };
    let router = routes::router(state, &config);

    let listener = TcpListener::bind(format!("{}:{}", config.address, config.port)).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if models.release() {
        info!("Whisper model released");
    }
    telemetry.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutting down...");
}

#[macro_export]
macro_rules! exit_err {
    ($code:expr, $fmt:expr $(, $arg:expr)*) => {{
        error!($fmt $(, $arg)*);
        std::process::exit($code);
    }};
}
