#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

use std::path::Path;

use anyhow::{anyhow, bail, Result};
use candle_core::{Device, IndexOp, Tensor, D};
use candle_nn::ops::softmax;
use candle_transformers::models::whisper::{
    self, audio, model, quantized_model, Config, EOT_TOKEN, HOP_LENGTH, LOGPROB_THRESHOLD,
    NO_SPEECH_THRESHOLD, NO_SPEECH_TOKENS, NO_TIMESTAMPS_TOKEN, SAMPLE_RATE, SOT_TOKEN,
    TEMPERATURES, TRANSCRIBE_TOKEN,
};
use rand::distributions::Distribution;
use rand::SeedableRng;
use tokenizers::Tokenizer;
use tracing::{debug, error, info};

use crate::inference::mel::mel_filters;
use crate::inference::pcm_decode::pcm_decode;

/// Languages Whisper has special tokens for, by code and English name
const LANGUAGES: &[(&str, &str)] = &[
    ("en", "english"), ("zh", "chinese"), ("de", "german"), ("es", "spanish"),
    ("ru", "russian"), ("ko", "korean"), ("fr", "french"), ("ja", "japanese"),
    ("pt", "portuguese"), ("tr", "turkish"), ("pl", "polish"), ("ca", "catalan"),
    ("nl", "dutch"), ("ar", "arabic"), ("sv", "swedish"), ("it", "italian"),
    ("id", "indonesian"), ("hi", "hindi"), ("fi", "finnish"), ("vi", "vietnamese"),
    ("he", "hebrew"), ("uk", "ukrainian"), ("el", "greek"), ("ms", "malay"),
    ("cs", "czech"), ("ro", "romanian"), ("da", "danish"), ("hu", "hungarian"),
    ("ta", "tamil"), ("no", "norwegian"), ("th", "thai"), ("ur", "urdu"),
    ("hr", "croatian"), ("bg", "bulgarian"), ("lt", "lithuanian"), ("la", "latin"),
    ("mi", "maori"), ("ml", "malayalam"), ("cy", "welsh"), ("sk", "slovak"),
    ("te", "telugu"), ("fa", "persian"), ("lv", "latvian"), ("bn", "bengali"),
    ("sr", "serbian"), ("az", "azerbaijani"), ("sl", "slovenian"), ("kn", "kannada"),
    ("et", "estonian"), ("mk", "macedonian"), ("br", "breton"), ("eu", "basque"),
    ("is", "icelandic"), ("hy", "armenian"), ("ne", "nepali"), ("mn", "mongolian"),
    ("bs", "bosnian"), ("kk", "kazakh"), ("sq", "albanian"), ("sw", "swahili"),
    ("gl", "galician"), ("mr", "marathi"), ("pa", "punjabi"), ("si", "sinhala"),
    ("km", "khmer"), ("sn", "shona"), ("yo", "yoruba"), ("so", "somali"),
    ("af", "afrikaans"), ("oc", "occitan"), ("ka", "georgian"), ("be", "belarusian"),
    ("tg", "tajik"), ("sd", "sindhi"), ("gu", "gujarati"), ("am", "amharic"),
    ("yi", "yiddish"), ("lo", "lao"), ("uz", "uzbek"), ("fo", "faroese"),
    ("ht", "haitian creole"), ("ps", "pashto"), ("tk", "turkmen"), ("nn", "nynorsk"),
    ("mt", "maltese"), ("sa", "sanskrit"), ("lb", "luxembourgish"), ("my", "myanmar"),
    ("bo", "tibetan"), ("tl", "tagalog"), ("mg", "malagasy"), ("as", "assamese"),
    ("tt", "tatar"), ("haw", "hawaiian"), ("ln", "lingala"), ("ha", "hausa"),
    ("ba", "bashkir"), ("jw", "javanese"), ("su", "sundanese"), ("yue", "cantonese"),
];

/// Alternative names accepted for a language
const LANGUAGE_ALIASES: &[(&str, &str)] = &[
    ("burmese", "my"), ("valencian", "ca"), ("flemish", "nl"), ("haitian", "ht"),
    ("letzeburgesch", "lb"), ("pushto", "ps"), ("panjabi", "pa"), ("moldavian", "ro"),
    ("moldovan", "ro"), ("sinhalese", "si"), ("castilian", "es"), ("mandarin", "zh"),
];

/// Resolves a language hint given as a code or a name, in any case, to its code
pub fn language_code(hint: &str) -> Option<&'static str> {
    let hint = hint.trim().to_lowercase();
    LANGUAGES
        .iter()
        .find(|(code, name)| *code == hint || *name == hint)
        .map(|(code, _)| *code)
        .or_else(|| {
            LANGUAGE_ALIASES
                .iter()
                .find(|(alias, _)| *alias == hint)
                .map(|(_, code)| *code)
        })
}

/// Full precision or GGUF quantized Whisper weights
#[derive(Clone)]
pub enum WhisperWeights {
    Normal(model::Whisper),
    Quantized(quantized_model::Whisper),
}

impl WhisperWeights {
    fn config(&self) -> &Config {
        match self {
            Self::Normal(m) => &m.config,
            Self::Quantized(m) => &m.config,
        }
    }

    fn encoder_forward(&mut self, x: &Tensor, flush: bool) -> candle_core::Result<Tensor> {
        match self {
            Self::Normal(m) => m.encoder.forward(x, flush),
            Self::Quantized(m) => m.encoder.forward(x, flush),
        }
    }

    fn decoder_forward(
        &mut self,
        x: &Tensor,
        xa: &Tensor,
        flush: bool,
    ) -> candle_core::Result<Tensor> {
        match self {
            Self::Normal(m) => m.decoder.forward(x, xa, flush),
            Self::Quantized(m) => m.decoder.forward(x, xa, flush),
        }
    }

    fn decoder_final_linear(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Normal(m) => m.decoder.final_linear(x),
            Self::Quantized(m) => m.decoder.final_linear(x),
        }
    }
}

// Taken from https://github.com/huggingface/candle/blob/main/candle-examples/examples/whisper/main.rs
#[derive(Clone)]
pub struct AudioGeneratorPipeline {
    model: WhisperWeights,
    tokenizer: Tokenizer,
    config: Config,
    mel_filters: Vec<f32>,
    suppress_tokens: Tensor,
    sot_token: u32,
    transcribe_token: u32,
    eot_token: u32,
    no_speech_token: u32,
    no_timestamps_token: u32,
    /// Empty for English-only models
    language_tokens: Vec<(&'static str, u32)>,
    seed: rand::rngs::StdRng,
}

/// Text decoded from one window of audio
#[derive(Debug, Clone)]
pub struct Segment {
    pub start: f64,
    pub duration: f64,
    pub dr: DecodingResult,
}

#[derive(Debug, Clone)]
pub struct DecodingResult {
    pub text: String,
    pub avg_logprob: f64,
    pub no_speech_prob: f64,
    pub temperature: f64,
}

/// Outcome of transcribing a whole file
#[derive(Debug, Clone)]
pub struct Transcription {
    pub language: Option<&'static str>,
    pub segments: Vec<Segment>,
}

impl Transcription {
    pub fn text(&self) -> String {
        self.segments
            .iter()
            .map(|segment| segment.dr.text.trim())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// End of the last segment with speech
    pub fn end_seconds(&self) -> f64 {
        self.segments
            .last()
            .map_or(0.0, |segment| segment.start + segment.duration)
    }

    /// Segments that needed a non-zero temperature to decode
    pub fn fallbacks(&self) -> usize {
        self.segments
            .iter()
            .filter(|segment| segment.dr.temperature > 0.0)
            .count()
    }
}

impl AudioGeneratorPipeline {
    pub fn new(model: WhisperWeights, tokenizer: Tokenizer, multilingual: bool) -> Result<Self> {
        let config = model.config().clone();
        let mel_filters = mel_filters(config.num_mel_bins);

        let suppress_tokens: Vec<f32> = (0..config.vocab_size as u32)
            .map(|i| {
                if config.suppress_tokens.contains(&i) {
                    f32::NEG_INFINITY
                } else {
                    0f32
                }
            })
            .collect();
        let suppress_tokens = Tensor::new(suppress_tokens.as_slice(), &Device::Cpu)?;

        let sot_token = token_id(&tokenizer, SOT_TOKEN)?;
        let transcribe_token = token_id(&tokenizer, TRANSCRIBE_TOKEN)?;
        let eot_token = token_id(&tokenizer, EOT_TOKEN)?;
        let no_timestamps_token = token_id(&tokenizer, NO_TIMESTAMPS_TOKEN)?;
        let Some(no_speech_token) = NO_SPEECH_TOKENS
            .iter()
            .find_map(|token| token_id(&tokenizer, token).ok())
        else {
            bail!("Unable to find any non-speech token")
        };

        let language_tokens = if multilingual {
            LANGUAGES
                .iter()
                .filter_map(|(code, _)| {
                    token_id(&tokenizer, &format!("<|{code}|>"))
                        .ok()
                        .map(|id| (*code, id))
                })
                .collect()
        } else {
            vec![]
        };

        Ok(Self {
            model,
            tokenizer,
            config,
            mel_filters,
            suppress_tokens,
            sot_token,
            transcribe_token,
            eot_token,
            no_speech_token,
            no_timestamps_token,
            language_tokens,
            seed: rand::rngs::StdRng::from_seed([0; 32]),
        })
    }

    pub fn transcribe(&mut self, path: &Path, language: Option<&str>) -> Result<Transcription> {
        let mel = self.load_mel(path)?;
        let (_, _, content_frames) = mel.dims3()?;

        let language = self.resolve_language(&mel, language)?;
        let language_token = language.map(|(_, token)| token);

        let mut seek = 0;
        let mut segments = vec![];
        while seek < content_frames {
            let time_offset = (seek * HOP_LENGTH) as f64 / SAMPLE_RATE as f64;
            let segment_size = usize::min(content_frames - seek, whisper::N_FRAMES);
            let mel_segment = mel.narrow(2, seek, segment_size)?;
            let segment_duration = (segment_size * HOP_LENGTH) as f64 / SAMPLE_RATE as f64;
            let dr = self.decode_with_fallback(&mel_segment, language_token)?;
            seek += segment_size;
            if dr.no_speech_prob > NO_SPEECH_THRESHOLD && dr.avg_logprob < LOGPROB_THRESHOLD {
                debug!("no speech detected, skipping {seek} {dr:?}");
                continue;
            }
            debug!(
                "{:.1}s -- {:.1}s: {}",
                time_offset,
                time_offset + segment_duration,
                dr.text
            );
            segments.push(Segment {
                start: time_offset,
                duration: segment_duration,
                dr,
            });
        }

        Ok(Transcription {
            language: language.map(|(code, _)| code),
            segments,
        })
    }

    fn resolve_language(
        &mut self,
        mel: &Tensor,
        language: Option<&str>,
    ) -> Result<Option<(&'static str, u32)>> {
        if self.language_tokens.is_empty() {
            if let Some(language) = language {
                debug!("ignoring language {language} for an English-only model");
            }
            return Ok(None);
        }
        match language {
            Some(hint) => {
                let language = language_code(hint).and_then(|code| {
                    self.language_tokens.iter().find(|(c, _)| *c == code).copied()
                });
                match language {
                    Some(language) => Ok(Some(language)),
                    None => bail!("language {hint} is not supported"),
                }
            }
            None => self.detect_language(mel).map(Some),
        }
    }

    /// Picks the most likely language token from the first window of audio
    fn detect_language(&mut self, mel: &Tensor) -> Result<(&'static str, u32)> {
        let (_, _, seq_len) = mel.dims3()?;
        let mel = mel.narrow(2, 0, usize::min(seq_len, whisper::N_FRAMES))?;
        let device = mel.device();

        let audio_features = self.model.encoder_forward(&mel, true)?;
        let tokens = Tensor::new(&[[self.sot_token]], device)?;
        let ys = self.model.decoder_forward(&tokens, &audio_features, true)?;
        let logits = self.model.decoder_final_linear(&ys.i(..1)?)?.i(0)?.i(0)?;

        let ids: Vec<u32> = self.language_tokens.iter().map(|(_, id)| *id).collect();
        let ids = Tensor::new(ids.as_slice(), device)?;
        let probs = softmax(&logits.index_select(&ids, 0)?, D::Minus1)?.to_vec1::<f32>()?;
        let (best, prob) = probs
            .iter()
            .enumerate()
            .max_by(|(_, u), (_, v)| u.total_cmp(v))
            .ok_or_else(|| anyhow!("no language tokens to choose from"))?;

        let language = self.language_tokens[best];
        info!(language = language.0, probability = prob, "detected language");
        Ok(language)
    }

    fn decode_with_fallback(
        &mut self,
        segment: &Tensor,
        language_token: Option<u32>,
    ) -> Result<DecodingResult> {
        for (i, &t) in TEMPERATURES.iter().enumerate() {
            let dr: Result<DecodingResult> = self.decode(segment, t, language_token);
            if i == TEMPERATURES.len() - 1 {
                return dr;
            }
            // On errors, we try again with a different temperature.
            match dr {
                Ok(dr) => {
                    let needs_fallback = dr.avg_logprob < LOGPROB_THRESHOLD;
                    if !needs_fallback || dr.no_speech_prob > NO_SPEECH_THRESHOLD {
                        return Ok(dr);
                    }
                }
                Err(err) => {
                    error!("Error running at {t}: {err}");
                }
            }
        }
        unreachable!()
    }

    fn decode(
        &mut self,
        mel: &Tensor,
        t: f64,
        language_token: Option<u32>,
    ) -> Result<DecodingResult> {
        let audio_features = self.model.encoder_forward(mel, true)?;
        debug!("audio features: {:?}", audio_features.dims());

        let max_target_positions = self.config.max_target_positions;
        let sample_len = max_target_positions / 2;
        let mut sum_logprob = 0f64;
        let mut no_speech_prob = f64::NAN;
        let mut tokens = vec![self.sot_token];
        if let Some(language_token) = language_token {
            tokens.push(language_token);
        }
        tokens.push(self.transcribe_token);
        tokens.push(self.no_timestamps_token);

        for i in 0..sample_len {
            let tokens_t = Tensor::new(tokens.as_slice(), mel.device())?;

            // The model expects a batch dim but this inference loop does not handle
            // it so we add it at this point.
            let tokens_t = tokens_t.unsqueeze(0)?;
            let ys = self
                .model
                .decoder_forward(&tokens_t, &audio_features, i == 0)?;

            // Extract the no speech probability on the first iteration by looking at the first
            // token logits and the probability for the according token.
            if i == 0 {
                let logits = self.model.decoder_final_linear(&ys.i(..1)?)?.i(0)?.i(0)?;
                no_speech_prob = f64::from(
                    softmax(&logits, 0)?
                        .i(self.no_speech_token as usize)?
                        .to_scalar::<f32>()?,
                );
            }

            let (_, seq_len, _) = ys.dims3()?;
            let logits = self
                .model
                .decoder_final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?;
            let logits = logits.broadcast_add(&self.suppress_tokens)?;
            let next_token = if t > 0f64 {
                let prs = softmax(&(&logits / t)?, 0)?;
                let logits_v: Vec<f32> = prs.to_vec1()?;
                let distr = rand::distributions::WeightedIndex::new(&logits_v)?;
                u32::try_from(distr.sample(&mut self.seed))?
            } else {
                let logits_v: Vec<f32> = logits.to_vec1()?;
                logits_v
                    .iter()
                    .enumerate()
                    .max_by(|(_, u), (_, v)| u.total_cmp(v))
                    .map(|(i, _)| i as u32)
                    .ok_or_else(|| anyhow!("decoder produced no logits"))?
            };
            tokens.push(next_token);
            let prob = f64::from(
                softmax(&logits, D::Minus1)?
                    .i(next_token as usize)?
                    .to_scalar::<f32>()?,
            );
            if next_token == self.eot_token || tokens.len() > max_target_positions {
                break;
            }
            sum_logprob += prob.ln();
        }
        let text = self
            .tokenizer
            .decode(&tokens, true)
            .map_err(|e| anyhow!("failed to decode tokens: {e}"))?;
        let avg_logprob = sum_logprob / tokens.len() as f64;

        Ok(DecodingResult {
            text,
            avg_logprob,
            no_speech_prob,
            temperature: t,
        })
    }

    fn load_mel(&self, path: &Path) -> Result<Tensor> {
        let pcm_data = pcm_decode(path)?;
        let mel = audio::pcm_to_mel(&self.config, &pcm_data, &self.mel_filters);
        let mel_len = mel.len();
        let mel = Tensor::from_vec(
            mel,
            (
                1,
                self.config.num_mel_bins,
                mel_len / self.config.num_mel_bins,
            ),
            &Device::Cpu,
        )?;
        debug!("loaded mel: {:?}", mel.dims());
        Ok(mel)
    }
}

pub fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    match tokenizer.token_to_id(token) {
        None => bail!("no token-id for {token}"),
        Some(id) => Ok(id),
    }
}
