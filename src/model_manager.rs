use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;
use hf_hub::api::sync::Api;
use tracing::info;

use crate::inference::task::transcribe::SpeechModel;
use crate::inference::whisper::{WhisperModel, WhisperPreset};

/// Holds the process wide speech model between startup and shutdown.
///
/// The lock only guards publishing and releasing the model, inference runs on a cloned `Arc`.
#[derive(Default)]
pub struct ModelManager {
    model: RwLock<Option<Arc<dyn SpeechModel>>>,
}

impl ModelManager {
    pub fn is_ready(&self) -> bool {
        self.model
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn get(&self) -> Option<Arc<dyn SpeechModel>> {
        self.model
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn publish(&self, model: Arc<dyn SpeechModel>) {
        *self.model.write().unwrap_or_else(PoisonError::into_inner) = Some(model);
    }

    /// Drops the manager's reference, the memory is reclaimed once in-flight requests finish
    pub fn release(&self) -> bool {
        self.model
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }
}

/// Loads the Whisper preset on the blocking pool
pub async fn load_whisper(preset: WhisperPreset) -> Result<WhisperModel> {
    info!(%preset, "Loading Whisper model");
    let model = tokio::task::spawn_blocking(move || {
        let api = Api::new()?;
        WhisperModel::load(&api, preset)
    })
    .await??;
    info!(%preset, "Whisper model loaded successfully");
    Ok(model)
}
