use std::path::Path;

use anyhow::Result;

/// Decoding options handed to the speech model as is
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscribeOptions {
    /// Whisper language code, detected from the audio when absent
    pub language: Option<String>,
    /// Decode in half precision
    pub fp16: bool,
}

/// A loaded speech to text model.
///
/// Implementations are shared read-only between concurrent requests, any per-call decoding
/// state has to live inside `transcribe`.
pub trait SpeechModel: Send + Sync {
    /// Transcribes the audio file at `path` and returns the raw text
    fn transcribe(&self, path: &Path, options: &TranscribeOptions) -> Result<String>;
}
