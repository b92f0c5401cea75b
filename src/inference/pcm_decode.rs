use std::fs::File;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{anyhow, Result};
use candle_transformers::models::whisper::SAMPLE_RATE;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

const RESAMPLE_CHUNK: usize = 1024;

/// Decodes the audio file at `path` into mono f32 samples at Whisper's 16 kHz.
///
/// The file extension is used as a probing hint, multichannel audio is averaged down to one channel.
pub fn pcm_decode(path: &Path) -> Result<Vec<f32>> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|track| track.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| anyhow!("no supported audio track found"))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let sample_rate = codec_params
        .sample_rate
        .ok_or_else(|| anyhow!("unknown sample rate"))?;

    let mut decoder = symphonia::default::get_codecs().make(&codec_params, &DecoderOptions::default())?;

    let mut pcm_data = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                warn!(error = e, "skipping corrupt audio frame");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let spec = *decoded.spec();
        let frames = decoded.frames();
        if frames == 0 {
            continue;
        }
        let channels = spec.channels.count().max(1);
        let mut samples = SampleBuffer::<f32>::new(frames as u64, spec);
        samples.copy_interleaved_ref(decoded);

        if channels == 1 {
            pcm_data.extend_from_slice(samples.samples());
        } else {
            pcm_data.extend(
                samples
                    .samples()
                    .chunks(channels)
                    .map(|frame| frame.iter().sum::<f32>() / channels as f32),
            );
        }
    }

    if pcm_data.is_empty() {
        return Err(anyhow!("no audio samples could be decoded"));
    }
    let target_rate = u32::try_from(SAMPLE_RATE)?;
    if sample_rate != target_rate {
        pcm_data = resample(&pcm_data, sample_rate, target_rate)?;
    }
    debug!(
        samples = pcm_data.len(),
        source_rate = sample_rate,
        "pcm data loaded"
    );
    Ok(pcm_data)
}

/// Band-limited sinc resampling of mono samples
fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let ratio = f64::from(to_rate) / f64::from(from_rate);
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLE_CHUNK, 1)
        .map_err(|e| anyhow!("failed to create resampler: {e}"))?;

    let expected_len = (samples.len() as f64 * ratio) as usize;
    let mut output = Vec::with_capacity(expected_len + RESAMPLE_CHUNK);
    for chunk in samples.chunks(RESAMPLE_CHUNK) {
        let mut input = chunk.to_vec();
        // the last chunk is zero padded
        input.resize(RESAMPLE_CHUNK, 0.0);
        let resampled = resampler
            .process(&[input], None)
            .map_err(|e| anyhow!("failed to resample audio: {e}"))?;
        if let Some(channel) = resampled.first() {
            output.extend_from_slice(channel);
        }
    }
    output.truncate(expected_len);
    Ok(output)
}
