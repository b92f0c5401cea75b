use anyhow::Result;
use clap_serde_derive::ClapSerde;

/// Origins allowed when no explicit list is configured
static DEFAULT_CORS_ORIGINS: [&str; 4] = [
    "http://localhost:3000",
    "http://127.0.0.1:3000",
    "http://localhost:3001",
    "http://127.0.0.1:3001",
];

static DEFAULT_REFERER: &str = "http://localhost:3000";

#[derive(ClapSerde, Debug, Clone)]
pub struct Config {
    /// The address the listener binds to
    #[default("0.0.0.0".to_string())]
    #[arg(short, long, env = "ADDRESS")]
    pub(crate) address: String,

    /// The port the listener binds to
    #[default(8000)]
    #[arg(short, long, env = "BACKEND_PORT")]
    pub(crate) port: u16,

    /// Whisper model preset loaded at startup, e.g. tiny, base.en, small or quantized-tiny
    #[default("base".to_string())]
    #[arg(short, long, env = "WHISPER_MODEL_SIZE")]
    pub(crate) whisper_model_size: String,

    /// Origins allowed to make cross-origin requests, comma separated
    #[arg(long, env = "CORS_ORIGINS", value_delimiter = ',')]
    pub(crate) cors_origins: Vec<String>,

    /// URL of the frontend application, trusted as an origin and sent as the referer upstream
    #[arg(long, env = "NEXTAUTH_URL")]
    pub(crate) app_url: String,

    /// API key for the OpenRouter chat completion API
    #[arg(long, env = "OPENROUTER_API_KEY", hide_env_values = true)]
    pub(crate) openrouter_api_key: String,

    /// Base URL of the OpenRouter API
    #[default("https://openrouter.ai/api/v1".to_string())]
    #[arg(long, env = "OPENROUTER_BASE_URL")]
    pub(crate) openrouter_base_url: String,

    /// Maximum accepted size of an uploaded audio request in bytes
    #[default(26_214_400)]
    #[arg(long, env = "MAX_UPLOAD_BYTES")]
    pub(crate) max_upload_bytes: usize,

    /// OTLP collector endpoint, telemetry export is disabled when empty
    #[arg(long, env = "OTLP_ENDPOINT")]
    pub(crate) otlp_endpoint: String,

    /// Keep logging to the console while exporting telemetry
    #[arg(long, env = "CONSOLE_LOGS")]
    pub(crate) console_logs: bool,
}

impl Config {
    pub fn from_toml(path: &str) -> Result<Self> {
        let str = std::fs::read_to_string(path)?;
        let opt: <Config as ClapSerde>::Opt = toml::from_str(&str)?;
        Ok(Config::from(opt))
    }

    /// Origins the CORS layer accepts.
    ///
    /// An explicit list is used as is. Otherwise the local development origins are
    /// used together with the application URL, if one is configured.
    pub fn allowed_origins(&self) -> Vec<String> {
        let explicit: Vec<String> = self
            .cors_origins
            .iter()
            .map(|origin| origin.trim())
            .filter(|origin| !origin.is_empty())
            .map(String::from)
            .collect();
        if !explicit.is_empty() {
            return explicit;
        }

        let mut origins: Vec<String> = DEFAULT_CORS_ORIGINS.iter().map(|o| o.to_string()).collect();
        if !self.app_url.is_empty() && !origins.contains(&self.app_url) {
            origins.push(self.app_url.clone());
        }
        origins
    }

    pub fn referer(&self) -> &str {
        if self.app_url.is_empty() {
            DEFAULT_REFERER
        } else {
            &self.app_url
        }
    }

    pub fn api_key(&self) -> Option<&str> {
        Some(self.openrouter_api_key.as_str()).filter(|key| !key.is_empty())
    }

    pub fn otlp_endpoint(&self) -> Option<&str> {
        Some(self.otlp_endpoint.as_str()).filter(|endpoint| !endpoint.is_empty())
    }
}
