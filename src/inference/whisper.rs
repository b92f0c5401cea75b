use std::fmt::{Display, Formatter};
use std::path::Path;
use std::str::FromStr;
use std::time::Instant;

use anyhow::{anyhow, bail, Result};
use candle_core::Device;
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self, model, quantized_model, Config};
use candle_transformers::quantized_var_builder;
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use tokenizers::Tokenizer;
use tracing::info;

use crate::inference::audio_pipeline::{AudioGeneratorPipeline, WhisperWeights};
use crate::inference::task::transcribe::{SpeechModel, TranscribeOptions};

/// Model sizes that can be loaded at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhisperPreset {
    Tiny,
    TinyEn,
    Base,
    BaseEn,
    Small,
    SmallEn,
    Medium,
    MediumEn,
    Large,
    LargeV2,
    LargeV3,
    QuantizedTiny,
    QuantizedTinyEn,
}

static PRESETS: [(&str, WhisperPreset); 13] = [
    ("tiny", WhisperPreset::Tiny),
    ("tiny.en", WhisperPreset::TinyEn),
    ("base", WhisperPreset::Base),
    ("base.en", WhisperPreset::BaseEn),
    ("small", WhisperPreset::Small),
    ("small.en", WhisperPreset::SmallEn),
    ("medium", WhisperPreset::Medium),
    ("medium.en", WhisperPreset::MediumEn),
    ("large", WhisperPreset::Large),
    ("large-v2", WhisperPreset::LargeV2),
    ("large-v3", WhisperPreset::LargeV3),
    ("quantized-tiny", WhisperPreset::QuantizedTiny),
    ("quantized-tiny.en", WhisperPreset::QuantizedTinyEn),
];

impl FromStr for WhisperPreset {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_lowercase();
        PRESETS
            .iter()
            .find(|(preset_name, _)| *preset_name == name)
            .map(|(_, preset)| *preset)
            .ok_or_else(|| {
                let known: Vec<&str> = PRESETS.iter().map(|(name, _)| *name).collect();
                anyhow!(
                    "unknown Whisper model size {s}, expected one of {}",
                    known.join(", ")
                )
            })
    }
}

impl Display for WhisperPreset {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = PRESETS
            .iter()
            .find(|(_, preset)| preset == self)
            .map_or("unknown", |(name, _)| *name);
        write!(f, "{name}")
    }
}

impl WhisperPreset {
    pub fn is_multilingual(self) -> bool {
        !matches!(
            self,
            Self::TinyEn | Self::BaseEn | Self::SmallEn | Self::MediumEn | Self::QuantizedTinyEn
        )
    }

    pub fn is_quantized(self) -> bool {
        matches!(self, Self::QuantizedTiny | Self::QuantizedTinyEn)
    }

    /// Hugging Face repository and revision holding the weights
    pub fn repo(self) -> (&'static str, &'static str) {
        match self {
            Self::Tiny => ("openai/whisper-tiny", "main"),
            Self::TinyEn => ("openai/whisper-tiny.en", "refs/pr/15"),
            Self::Base => ("openai/whisper-base", "refs/pr/22"),
            Self::BaseEn => ("openai/whisper-base.en", "refs/pr/13"),
            Self::Small => ("openai/whisper-small", "main"),
            Self::SmallEn => ("openai/whisper-small.en", "refs/pr/10"),
            Self::Medium => ("openai/whisper-medium", "main"),
            Self::MediumEn => ("openai/whisper-medium.en", "main"),
            Self::Large => ("openai/whisper-large", "refs/pr/36"),
            Self::LargeV2 => ("openai/whisper-large-v2", "refs/pr/57"),
            Self::LargeV3 => ("openai/whisper-large-v3", "main"),
            Self::QuantizedTiny | Self::QuantizedTinyEn => ("lmz/candle-whisper", "main"),
        }
    }

    /// Config, tokenizer and weight file names inside the repository
    fn files(self) -> (String, String, String) {
        match self {
            Self::QuantizedTiny => quantized_files("tiny"),
            Self::QuantizedTinyEn => quantized_files("tiny-en"),
            _ => (
                "config.json".into(),
                "tokenizer.json".into(),
                "model.safetensors".into(),
            ),
        }
    }
}

fn quantized_files(ext: &str) -> (String, String, String) {
    (
        format!("config-{ext}.json"),
        format!("tokenizer-{ext}.json"),
        format!("model-{ext}-q80.gguf"),
    )
}

// Taken from https://github.com/huggingface/candle/blob/main/candle-examples/examples/whisper/main.rs
#[derive(Clone)]
pub struct WhisperModel {
    preset: WhisperPreset,
    generator_pipeline: AudioGeneratorPipeline,
}

impl WhisperModel {
    /// Fetches the preset's files from the hub cache, downloading them if needed, and loads the weights on CPU
    #[tracing::instrument(level = "info", skip(api))]
    pub fn load(api: &Api, preset: WhisperPreset) -> Result<Self> {
        let (repo_id, revision) = preset.repo();
        let repo = api.repo(Repo::with_revision(
            repo_id.into(),
            RepoType::Model,
            revision.into(),
        ));
        let (config_filename, tokenizer_filename, weights_filename) = preset.files();
        let config_path = repo.get(&config_filename)?;
        let tokenizer_path = repo.get(&tokenizer_filename)?;
        let weights_path = repo.get(&weights_filename)?;

        let config: Config = serde_json::from_str(&std::fs::read_to_string(config_path)?)?;
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow!("failed to load tokenizer: {e}"))?;

        let device = Device::Cpu;
        let weights = if preset.is_quantized() {
            let vb = quantized_var_builder::VarBuilder::from_gguf(&weights_path, &device)?;
            WhisperWeights::Quantized(quantized_model::Whisper::load(&vb, config)?)
        } else {
            // SAFETY: the safetensors file is memory-mapped read-only from the hub cache
            let vb = unsafe {
                VarBuilder::from_mmaped_safetensors(&[weights_path], whisper::DTYPE, &device)?
            };
            WhisperWeights::Normal(model::Whisper::load(&vb, config)?)
        };

        let generator_pipeline =
            AudioGeneratorPipeline::new(weights, tokenizer, preset.is_multilingual())?;
        Ok(Self {
            preset,
            generator_pipeline,
        })
    }
}

impl SpeechModel for WhisperModel {
    #[tracing::instrument(level = "info", skip(self), fields(preset = %self.preset))]
    fn transcribe(&self, path: &Path, options: &TranscribeOptions) -> Result<String> {
        if options.fp16 {
            bail!("fp16 decoding is not supported on CPU");
        }

        // Weights are shared between clones, the decoder caches are not
        let mut pipeline = self.generator_pipeline.clone();
        let started = Instant::now();
        let transcription = pipeline.transcribe(path, options.language.as_deref())?;

        info!(
            language = transcription.language,
            segments = transcription.segments.len(),
            fallbacks = transcription.fallbacks(),
            audio_seconds = transcription.end_seconds(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "transcription finished"
        );
        Ok(transcription.text())
    }
}
