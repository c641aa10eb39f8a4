//! Voice gateway client and PCM segmentation for streamed audio.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;
pub const DEFAULT_SILENCE_THRESHOLD: f64 = 0.01;
pub const DEFAULT_SILENCE_DURATION: Duration = Duration::from_millis(1_500);
pub const DEFAULT_MAX_SEGMENT_DURATION: Duration = Duration::from_secs(30);
/// 20 ms of 16-bit mono audio at 16 kHz.
const MIN_RMS_CHUNK_BYTES: usize = 640;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    pub text: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub duration: f64,
}

/// HTTP client for the speech-to-text / text-to-speech sidecar.
#[derive(Clone)]
pub struct VoiceGatewayClient {
    http: reqwest::Client,
    base_url: String,
}

impl VoiceGatewayClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(anyhow!("voice gateway url is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[tracing::instrument(level = "info", skip_all, fields(filename, bytes = audio.len()))]
    pub async fn transcribe(&self, audio: Vec<u8>, filename: &str) -> Result<Transcription> {
        tracing::Span::current().record("filename", filename);
        if audio.is_empty() {
            return Err(anyhow!("audio payload is empty"));
        }
        let part = reqwest::multipart::Part::bytes(audio).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);
        let response = self
            .http
            .post(format!("{}/api/transcribe", self.base_url))
            .multipart(form)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "voice transcribe failed: status={status} body={body}"
            ));
        }
        Ok(serde_json::from_str(&body)?)
    }

    /// WAV bytes for `text`.
    #[tracing::instrument(level = "info", skip_all, fields(chars = text.len()))]
    pub async fn synthesize(&self, text: &str, voice: &str) -> Result<bytes::Bytes> {
        let response = self
            .http
            .post(format!("{}/api/synthesize", self.base_url))
            .json(&serde_json::json!({ "text": text, "voice": voice }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "voice synthesize failed: status={status} body={body}"
            ));
        }
        Ok(response.bytes().await?)
    }

    pub async fn is_healthy(&self) -> bool {
        match self
            .http
            .get(format!("{}/health", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(%e, "voice gateway health probe failed");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmenterConfig {
    pub sample_rate: u32,
    pub silence_threshold: f64,
    pub silence_duration: Duration,
    pub max_segment_duration: Duration,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            silence_threshold: DEFAULT_SILENCE_THRESHOLD,
            silence_duration: DEFAULT_SILENCE_DURATION,
            max_segment_duration: DEFAULT_MAX_SEGMENT_DURATION,
        }
    }
}

/// A completed utterance cut from the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSegment {
    pub pcm: Vec<u8>,
    pub duration_secs: f64,
    pub chunks: u64,
}

/// Buffers 16-bit little-endian mono PCM and cuts a segment after a run of
/// silence or when the segment grows too long.
#[derive(Debug)]
pub struct AudioSegmenter {
    config: SegmenterConfig,
    buffer: Vec<u8>,
    segment_started: Instant,
    last_voice: Instant,
    chunks: u64,
    closed: bool,
}

impl AudioSegmenter {
    pub fn new(config: SegmenterConfig, now: Instant) -> Self {
        Self {
            config,
            buffer: Vec::new(),
            segment_started: now,
            last_voice: now,
            chunks: 0,
            closed: false,
        }
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn feed(&mut self, chunk: &[u8], now: Instant) -> Option<AudioSegment> {
        if self.closed {
            return None;
        }
        self.buffer.extend_from_slice(chunk);
        self.chunks += 1;

        let mut cut = now.duration_since(self.segment_started) >= self.config.max_segment_duration;
        if !cut && chunk.len() >= MIN_RMS_CHUNK_BYTES {
            if pcm_rms(chunk) < self.config.silence_threshold {
                cut = now.duration_since(self.last_voice) >= self.config.silence_duration;
            } else {
                self.last_voice = now;
            }
        }

        if cut { self.flush(now) } else { None }
    }

    pub fn flush(&mut self, now: Instant) -> Option<AudioSegment> {
        if self.buffer.is_empty() {
            return None;
        }
        let pcm = std::mem::take(&mut self.buffer);
        self.segment_started = now;
        self.last_voice = now;
        let duration_secs = pcm.len() as f64 / (2.0 * f64::from(self.config.sample_rate));
        Some(AudioSegment {
            pcm,
            duration_secs: (duration_secs * 100.0).round() / 100.0,
            chunks: self.chunks,
        })
    }

    /// Flushes what is left; later feeds are ignored.
    pub fn close(&mut self, now: Instant) -> Option<AudioSegment> {
        let out = self.flush(now);
        self.closed = true;
        out
    }
}

/// Normalized RMS of 16-bit little-endian samples, in `[0, 1]`.
pub fn pcm_rms(pcm: &[u8]) -> f64 {
    let samples = pcm.len() / 2;
    if samples == 0 {
        return 0.0;
    }
    let sum: f64 = pcm
        .chunks_exact(2)
        .map(|pair| {
            let v = f64::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0;
            v * v
        })
        .sum();
    (sum / samples as f64).sqrt()
}

/// Wraps raw mono 16-bit PCM in a RIFF/WAVE header.
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32) -> Vec<u8> {
    let data_len = pcm.len() as u32;
    let byte_rate = sample_rate * 2;
    let mut out = Vec::with_capacity(44 + pcm.len());
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes()); // block align
    out.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.extend_from_slice(pcm);
    out
}
