pub mod audio_pipeline;
pub mod mel;
pub mod pcm_decode;
pub mod task;
pub mod whisper;
