use anyhow::{bail, Result};
use clap::Parser;
use reqwest::Url;
use serde::Deserialize;

/// Probes the health endpoint, exits non-zero when the service is unhealthy
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Health endpoint URL
    #[arg(default_value = "http://127.0.0.1:8000/health")]
    url: Url,

    /// Also fail while the Whisper model is not loaded
    #[arg(long)]
    require_model: bool,
}

#[derive(Deserialize)]
struct Health {
    status: String,
    model_loaded: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let response = reqwest::blocking::get(args.url)?;
    if !response.status().is_success() {
        bail!("Request failed with status {}", response.status());
    }

    let health: Health = response.json()?;
    if health.status != "ok" {
        bail!("Service reported status {}", health.status);
    }
    if args.require_model && !health.model_loaded {
        bail!("Whisper model is not loaded");
    }

    Ok(())
}
