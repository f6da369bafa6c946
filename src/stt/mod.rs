use crate::config::SttConfig;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde_json::Value;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

pub mod tts;

pub use tts::TtsClient;

const MIN_AUDIO_BYTES: usize = 800;
const MIN_DURATION_SECS: f64 = 0.1;
const MIN_RMS: f64 = 0.001;

/// Band-pass + denoise + loudness chain applied before transcription.
const ENHANCE_FILTER: &str = "highpass=f=120,lowpass=f=3800,afftdn,loudnorm";

#[derive(Debug, Error)]
pub enum SttError {
    /// The service reports an exhausted balance (403 or a balance phrase).
    /// Promoted by the caller to a dialer pause.
    #[error("transcription quota exhausted: {0}")]
    QuotaExhausted(String),
    /// The service's empty-audio sentinel. Treated as caller hangup, not a
    /// transcription failure.
    #[error("empty audio: {0}")]
    EmptyAudio(String),
    #[error("transcription failed: {0}")]
    Transient(String),
}

pub type SttResult<T> = Result<T, SttError>;

#[derive(Debug, Clone)]
pub struct Transcript {
    pub status: String,
    pub text: String,
}

/// Outcome of a transcription request. `Empty` means the pre-filter
/// rejected the recording locally and the service was never called.
#[derive(Debug, Clone)]
pub enum Transcription {
    Empty,
    Text(Transcript),
}

/// Async transcription client: enhances the recording, archives the
/// enhanced copy, rejects silence locally, then posts to the service.
pub struct SttClient {
    config: SttConfig,
    client: Client,
    semaphore: Arc<Semaphore>,
}

impl SttClient {
    pub fn new(
        config: SttConfig,
        timeout: f64,
        max_connections: usize,
        semaphore: Arc<Semaphore>,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs_f64(timeout))
            .pool_max_idle_per_host(max_connections)
            .build()?;
        Ok(Self {
            config,
            client,
            semaphore,
        })
    }

    pub async fn transcribe(
        &self,
        audio: Vec<u8>,
        name: &str,
        hotwords: &[String],
    ) -> SttResult<Transcription> {
        let enhanced = self.enhance(&audio, name).await;
        if is_empty_audio(&enhanced) {
            debug!("recording {} rejected by pre-filter", name);
            return Ok(Transcription::Empty);
        }
        let transcript = self.request_transcription(enhanced, hotwords).await?;
        Ok(Transcription::Text(transcript))
    }

    /// Run the ffmpeg enhancement chain, keeping the enhanced copy in the
    /// archive directory. Falls back to the raw bytes when ffmpeg is
    /// unavailable or fails.
    async fn enhance(&self, audio: &[u8], name: &str) -> Vec<u8> {
        let archive_dir = PathBuf::from(&self.config.archive_dir);
        if let Err(err) = tokio::fs::create_dir_all(&archive_dir).await {
            warn!("cannot create archive dir {:?}: {}", archive_dir, err);
            return audio.to_vec();
        }
        let input_path = std::env::temp_dir().join(format!("{}-raw.wav", name));
        let output_path = archive_dir.join(format!("{}.wav", name));
        if let Err(err) = tokio::fs::write(&input_path, audio).await {
            warn!("cannot stage recording {}: {}", name, err);
            return audio.to_vec();
        }
        let result = run_ffmpeg(&input_path, &output_path).await;
        tokio::fs::remove_file(&input_path).await.ok();
        match result {
            Ok(()) => match tokio::fs::read(&output_path).await {
                Ok(enhanced) if !enhanced.is_empty() => enhanced,
                Ok(_) | Err(_) => audio.to_vec(),
            },
            Err(err) => {
                warn!("ffmpeg enhancement failed for {}: {}", name, err);
                audio.to_vec()
            }
        }
    }

    async fn request_transcription(
        &self,
        audio: Vec<u8>,
        hotwords: &[String],
    ) -> SttResult<Transcript> {
        if self.config.stt_token.is_empty() {
            warn!("STT token missing; transcription skipped");
            return Ok(Transcript {
                status: "unauthorized".into(),
                text: String::new(),
            });
        }

        let mut form = Form::new()
            .part(
                "audio",
                Part::bytes(audio)
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| SttError::Transient(e.to_string()))?,
            )
            .text("model", "default")
            .text("srt", "false")
            .text("inverseNormalizer", "false")
            .text("timestamp", "false")
            .text("spokenPunctuation", "false")
            .text("punctuation", "false")
            .text("numSpeakers", "0")
            .text("diarize", "false");
        for word in hotwords {
            form = form.text("hotwords[]", word.clone());
        }

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| SttError::Transient(e.to_string()))?;
        let response = self
            .client
            .post(&self.config.stt_url)
            .header("gateway-token", &self.config.stt_token)
            .header("accept", "application/json")
            .multipart(form)
            .send()
            .await
            .map_err(|e| SttError::Transient(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SttError::Transient(e.to_string()))?;
        if status.as_u16() == 403 || is_quota_body(&body) {
            return Err(SttError::QuotaExhausted(truncate(&body, 200)));
        }
        if !status.is_success() {
            return Err(SttError::Transient(format!(
                "status {}: {}",
                status,
                truncate(&body, 200)
            )));
        }

        let payload: Value =
            serde_json::from_str(&body).map_err(|e| SttError::Transient(e.to_string()))?;
        let transcript = extract_transcript(&payload);
        if is_empty_audio_sentinel(&transcript.text) {
            return Err(SttError::EmptyAudio(transcript.text));
        }
        if transcript.text.is_empty() {
            info!("transcription returned empty text, status={}", transcript.status);
        }
        Ok(transcript)
    }
}

async fn run_ffmpeg(input: &Path, output: &Path) -> anyhow::Result<()> {
    let status = Command::new("ffmpeg")
        .arg("-y")
        .arg("-i")
        .arg(input)
        .arg("-af")
        .arg(ENHANCE_FILTER)
        .arg("-ar")
        .arg("16000")
        .arg("-ac")
        .arg("1")
        .arg("-c:a")
        .arg("pcm_s16le")
        .arg(output)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await?;
    if !status.success() {
        anyhow::bail!("ffmpeg exited with {}", status);
    }
    Ok(())
}

/// Transcript text extraction: `data.text`, then `data.data.text`, then
/// `data.data.aiResponse.result.text`, else empty. Upstream responses are
/// inconsistent about nesting, so every path is probed.
fn extract_transcript(payload: &Value) -> Transcript {
    let data = payload.get("data").cloned().unwrap_or(Value::Null);
    let nested = data.get("data").cloned().unwrap_or(Value::Null);
    let ai_result = nested
        .get("aiResponse")
        .and_then(|r| r.get("result"))
        .cloned()
        .unwrap_or(Value::Null);

    let text = [&data, &nested, &ai_result]
        .iter()
        .find_map(|v| v.get("text").and_then(|t| t.as_str()))
        .unwrap_or("")
        .to_string();
    let status = data
        .get("status")
        .or_else(|| payload.get("status"))
        .and_then(|s| s.as_str())
        .unwrap_or("unknown")
        .to_string();
    Transcript { status, text }
}

fn is_quota_body(body: &str) -> bool {
    body.contains("balanceError") || body.contains("credit is below the set threshold")
}

fn is_empty_audio_sentinel(text: &str) -> bool {
    text == "Empty Audio file" || text.contains("Input file content is unexpected")
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        text.to_string()
    } else {
        let mut end = limit;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text[..end].to_string()
    }
}

/// Local silence filter: too small, too short, or too quiet. Non-WAV
/// payloads pass through so the service can decide.
pub fn is_empty_audio(audio: &[u8]) -> bool {
    if audio.len() < MIN_AUDIO_BYTES {
        return true;
    }
    let reader = match hound::WavReader::new(Cursor::new(audio)) {
        Ok(reader) => reader,
        Err(_) => return false,
    };
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return true;
    }
    let frames = reader.duration();
    let duration = frames as f64 / spec.sample_rate as f64;
    if duration < MIN_DURATION_SECS {
        return true;
    }
    let mut reader = reader;
    let mut sum_sq = 0.0f64;
    let mut count = 0usize;
    for sample in reader.samples::<i16>() {
        let value = match sample {
            Ok(v) => v as f64 / i16::MAX as f64,
            Err(_) => return false,
        };
        sum_sq += value * value;
        count += 1;
    }
    if count == 0 {
        return true;
    }
    let rms = (sum_sq / count as f64).sqrt();
    rms < MIN_RMS
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wav_bytes(samples: &[i16], sample_rate: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_empty_audio_by_size() {
        assert!(is_empty_audio(&[0u8; 100]));
    }

    #[test]
    fn test_empty_audio_by_duration() {
        // 0.05 s at 16 kHz, loud enough to pass the RMS check.
        let samples: Vec<i16> = (0..800).map(|i| if i % 2 == 0 { 8000 } else { -8000 }).collect();
        let audio = wav_bytes(&samples, 16_000);
        assert!(is_empty_audio(&audio));
    }

    #[test]
    fn test_empty_audio_by_rms() {
        // 1 s of near-silence.
        let samples = vec![1i16; 16_000];
        let audio = wav_bytes(&samples, 16_000);
        assert!(is_empty_audio(&audio));
    }

    #[test]
    fn test_speech_like_audio_accepted() {
        let samples: Vec<i16> = (0..16_000)
            .map(|i| ((i as f64 * 0.2).sin() * 12_000.0) as i16)
            .collect();
        let audio = wav_bytes(&samples, 16_000);
        assert!(!is_empty_audio(&audio));
    }

    #[test]
    fn test_transcript_fall_through() {
        let top = json!({"data": {"text": "بله", "status": "success"}});
        assert_eq!(extract_transcript(&top).text, "بله");

        let nested = json!({"data": {"data": {"text": "نه"}}});
        assert_eq!(extract_transcript(&nested).text, "نه");

        let deep = json!({
            "data": {"data": {"aiResponse": {"result": {"text": "باشه"}}}}
        });
        assert_eq!(extract_transcript(&deep).text, "باشه");

        let none = json!({"data": {}});
        assert_eq!(extract_transcript(&none).text, "");
        assert_eq!(extract_transcript(&none).status, "unknown");
    }

    #[test]
    fn test_quota_detection() {
        assert!(is_quota_body(r#"{"error": "balanceError"}"#));
        assert!(is_quota_body("your credit is below the set threshold"));
        assert!(!is_quota_body(r#"{"data": {"text": "hi"}}"#));
    }

    #[test]
    fn test_empty_audio_sentinel() {
        assert!(is_empty_audio_sentinel("Empty Audio file"));
        assert!(is_empty_audio_sentinel("Input file content is unexpected for wav"));
        assert!(!is_empty_audio_sentinel("بله"));
    }
}
