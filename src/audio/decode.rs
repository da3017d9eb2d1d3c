//! Decoding of encoded reference clips into mono PCM at the engine rate.

use std::io::Cursor;

use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, WindowFunction};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{Decoder, DecoderOptions},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader},
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};
use tracing::debug;

use crate::error::DecodeError;

const RESAMPLE_CHUNK: usize = 1024;

/// Decode `bytes`, downmix to mono and resample to `target_rate`.
pub fn ingest(bytes: &[u8], target_rate: u32) -> Result<Vec<f32>, DecodeError> {
    let (samples, rate, channels) = decode_audio(bytes)?;
    debug!(bytes = bytes.len(), samples = samples.len(), channels, rate, "decoded audio");

    resample(&to_mono(&samples, channels), rate, target_rate)
}

fn resample(input: &[f32], input_rate: u32, output_rate: u32) -> Result<Vec<f32>, DecodeError> {
    if input_rate == output_rate || input.is_empty() {
        return Ok(input.to_vec());
    }

    let params = SincInterpolationParameters {
        sinc_len: 128,
        f_cutoff: 0.95,
        oversampling_factor: 64,
        interpolation: rubato::SincInterpolationType::Linear,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f32>::new(
        output_rate as f64 / input_rate as f64,
        2.0,
        params,
        RESAMPLE_CHUNK,
        1,
    )
    .map_err(|e| DecodeError::Resample(e.to_string()))?;

    process(input, &mut resampler)
}

fn process(input: &[f32], resampler: &mut SincFixedIn<f32>) -> Result<Vec<f32>, DecodeError> {
    let mut output = Vec::new();

    for chunk in input.chunks(RESAMPLE_CHUNK) {
        let result = if chunk.len() == RESAMPLE_CHUNK {
            resampler.process(&[chunk], None)
        } else {
            let mut padded = vec![0.0; RESAMPLE_CHUNK];
            padded[..chunk.len()].copy_from_slice(chunk);
            resampler.process(&[padded], None)
        };
        let result = result.map_err(|e| DecodeError::Resample(e.to_string()))?;

        output.extend_from_slice(&result[0]);
    }

    Ok(output)
}

fn to_mono(input: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return input.to_vec();
    }
    input
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

fn decode_audio(bytes: &[u8]) -> Result<(Vec<f32>, u32, usize), DecodeError> {
    let cursor = Cursor::new(bytes.to_vec());
    let media_source_stream = MediaSourceStream::new(Box::new(cursor), Default::default());

    let mut format = get_format(media_source_stream)?;
    let track = format.default_track().ok_or(DecodeError::NoTrack)?;

    let mut decoder = get_decoder(&track.codec_params)?;

    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or(DecodeError::MissingParameter("a sample rate"))?;
    let channels = track
        .codec_params
        .channels
        .ok_or(DecodeError::MissingParameter("a channel layout"))?
        .count();
    let track_id = track.id;

    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(_) => break,
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(reason)) => {
                debug!(reason, "skipping undecodable packet");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
        buffer.copy_interleaved_ref(decoded);
        samples.extend_from_slice(buffer.samples());
    }

    Ok((samples, sample_rate, channels))
}

fn get_format(media_source_stream: MediaSourceStream) -> Result<Box<dyn FormatReader>, DecodeError> {
    let hint = Hint::new();
    let probed = symphonia::default::get_probe().format(
        &hint,
        media_source_stream,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;

    Ok(probed.format)
}

fn get_decoder(
    params: &symphonia::core::codecs::CodecParameters,
) -> Result<Box<dyn Decoder>, DecodeError> {
    Ok(symphonia::default::get_codecs().make(params, &DecoderOptions::default())?)
}
