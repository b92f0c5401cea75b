use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::inference::task::transcribe::{SpeechModel, TranscribeOptions};

#[derive(Debug, Error)]
pub enum TranscriptionError {
    #[error("File must be an audio file")]
    InvalidContentType,
    #[error("Failed to stage uploaded audio: {0}")]
    Io(#[from] std::io::Error),
    #[error("Whisper transcription failed: {0}")]
    Model(String),
    #[error("Whisper returned empty transcript")]
    EmptyTranscript,
}

/// An uploaded audio file as received from the client
#[derive(Debug, Clone)]
pub struct AudioUpload {
    pub bytes: Bytes,
    pub content_type: Option<String>,
    pub filename: Option<String>,
}

/// Temp file suffix for an upload: the filename's extension, else one derived from the content type
pub fn audio_suffix(filename: Option<&str>, content_type: &str) -> String {
    let from_filename = filename
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty());
    if let Some(ext) = from_filename {
        return format!(".{ext}");
    }

    let mime = content_type.split(';').next().unwrap_or_default().trim();
    match mime {
        "audio/mpeg" => ".mp3",
        "audio/wav" => ".wav",
        "audio/webm" => ".webm",
        "audio/ogg" => ".ogg",
        "audio/mp4" => ".m4a",
        _ => "",
    }
    .to_string()
}

/// Transcribes an upload with the shared speech model.
///
/// The audio is staged in a temporary file that is removed before this returns, whatever the
/// outcome. The returned text is trimmed and never empty.
#[tracing::instrument(
    level = "info",
    skip(model, upload),
    fields(bytes = upload.bytes.len(), content_type = ?upload.content_type)
)]
pub async fn transcribe(
    model: Arc<dyn SpeechModel>,
    upload: AudioUpload,
    language: Option<String>,
) -> Result<String, TranscriptionError> {
    let content_type = upload
        .content_type
        .as_deref()
        .filter(|content_type| content_type.starts_with("audio/"))
        .ok_or(TranscriptionError::InvalidContentType)?;
    let suffix = audio_suffix(upload.filename.as_deref(), content_type);
    let options = TranscribeOptions {
        language,
        fp16: false,
    };

    tokio::task::spawn_blocking(move || {
        transcribe_blocking(model.as_ref(), &upload.bytes, &suffix, &options)
    })
    .await
    .map_err(|e| TranscriptionError::Model(e.to_string()))?
}

fn transcribe_blocking(
    model: &dyn SpeechModel,
    audio: &[u8],
    suffix: &str,
    options: &TranscribeOptions,
) -> Result<String, TranscriptionError> {
    let mut file = tempfile::Builder::new()
        .prefix("voice-note-")
        .suffix(suffix)
        .tempfile()?;
    file.write_all(audio)?;
    file.flush()?;
    debug!(path = %file.path().display(), "staged uploaded audio");

    let started = Instant::now();
    let outcome = model.transcribe(file.path(), options);

    let path = file.path().to_path_buf();
    if let Err(err) = file.close() {
        warn!(path = %path.display(), error = %err, "failed to remove temporary audio file");
    }

    let raw = outcome.map_err(|e| TranscriptionError::Model(format!("{e:#}")))?;
    let transcript = raw.trim();
    if transcript.is_empty() {
        return Err(TranscriptionError::EmptyTranscript);
    }

    info!(
        chars = transcript.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "audio transcribed"
    );
    Ok(transcript.to_string())
}
