//! Turning uploaded images and audio into raw problem text.
//!
//! Extraction is transcription only. The vision prompt forbids solving or
//! rewriting the problem, but that is an instruction to the model, not a
//! check on its output; the human confirmation step that follows is what
//! catches a bad transcription.
//!
//! Images go to the vision model first and fall back to local OCR on any
//! failure, including missing credentials. Audio has no offline path: the
//! transcription endpoint either answers or the upload fails.

use anyhow::{bail, Context};
use async_trait::async_trait;
use base64::Engine as _;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::llm::{ChatMessage, CompletionClient, CompletionRequest, LlmError, TranscriptionRequest};

pub const MIME_PNG: &str = "image/png";
pub const MIME_JPEG: &str = "image/jpeg";
pub const MIME_GIF: &str = "image/gif";
pub const MIME_WEBP: &str = "image/webp";

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "m4a", "mp4", "mpeg", "mpga", "ogg", "webm", "flac"];

const VISION_PROMPT: &str = "You are a Robot. You cannot solve math. You can only read text.

JOB: Output the EXACT text seen in the image.

NEGATIVE CONSTRAINTS (Read Carefully):
- DO NOT solve the problem.
- DO NOT calculate anything.
- DO NOT add 'Step 1', 'Solution', or 'Answer'.
- DO NOT correct typos.

Input: [Image]
Output: [Raw Text String]";

const VISION_USER_TEXT: &str = "Transcribe this image. Return ONLY the text visible in the image.";

const TRANSCRIPTION_PROMPT: &str = "Transcribe this math question clearly. Use standard math terminology.";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("API key not found: set the {0} environment variable")]
    MissingCredentials(String),

    #[error("extraction failed: {0}")]
    Primary(String),

    #[error("extraction failed ({primary}); fallback also failed ({fallback})")]
    Fallback { primary: String, fallback: String },

    #[error("unsupported media: {0}")]
    Unsupported(String),
}

/// Identify an image format from its magic bytes.
pub fn sniff_image_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        Some(MIME_PNG)
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some(MIME_JPEG)
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some(MIME_GIF)
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some(MIME_WEBP)
    } else {
        None
    }
}

/// Local, offline text recognition.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(&self, image: &[u8]) -> anyhow::Result<String>;
}

/// Runs the `tesseract` CLI, feeding the image on stdin.
pub struct TesseractOcr {
    command: String,
}

impl TesseractOcr {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl OcrEngine for TesseractOcr {
    async fn recognize(&self, image: &[u8]) -> anyhow::Result<String> {
        let mut child = Command::new(&self.command)
            .args(["stdin", "stdout"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to run {}", self.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(image).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("{} failed: {}", self.command, stderr.trim());
        }

        let text = String::from_utf8_lossy(&output.stdout);
        Ok(collapse_whitespace(&text))
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub struct VisionExtractor {
    client: Arc<dyn CompletionClient>,
    model: String,
    ocr: Option<Arc<dyn OcrEngine>>,
}

impl VisionExtractor {
    pub fn new(client: Arc<dyn CompletionClient>, model: impl Into<String>, ocr: Option<Arc<dyn OcrEngine>>) -> Self {
        Self {
            client,
            model: model.into(),
            ocr,
        }
    }

    pub async fn extract(&self, image: &[u8]) -> Result<String, ExtractError> {
        let mime = sniff_image_mime(image)
            .ok_or_else(|| ExtractError::Unsupported("not a PNG, JPEG, GIF or WebP image".to_string()))?;

        let primary = match self.read_with_model(image, mime).await {
            Ok(text) => return Ok(text),
            Err(e) => e,
        };
        tracing::warn!(stage = "vision", error = %primary, "vision model failed; falling back to OCR");

        let Some(ocr) = &self.ocr else {
            return Err(ExtractError::Fallback {
                primary: primary.to_string(),
                fallback: "no OCR engine configured".to_string(),
            });
        };
        match ocr.recognize(image).await {
            Ok(text) if !text.trim().is_empty() => Ok(text.trim().to_string()),
            Ok(_) => Err(ExtractError::Fallback {
                primary: primary.to_string(),
                fallback: "OCR found no text".to_string(),
            }),
            Err(e) => Err(ExtractError::Fallback {
                primary: primary.to_string(),
                fallback: e.to_string(),
            }),
        }
    }

    async fn read_with_model(&self, image: &[u8], mime: &str) -> Result<String, LlmError> {
        let data_url = format!(
            "data:{};base64,{}",
            mime,
            base64::engine::general_purpose::STANDARD.encode(image)
        );
        let mut request = CompletionRequest::new(
            self.model.clone(),
            0.0,
            vec![
                ChatMessage::system(VISION_PROMPT),
                ChatMessage::user_with_image(VISION_USER_TEXT, data_url),
            ],
        );
        request.max_tokens = Some(1024);
        let text = self.client.complete(&request).await?.into_text()?;
        Ok(text.trim().to_string())
    }
}

pub struct AudioExtractor {
    client: Arc<dyn CompletionClient>,
    model: String,
}

impl AudioExtractor {
    pub fn new(client: Arc<dyn CompletionClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    pub async fn extract(&self, audio: &[u8], filename: &str) -> Result<String, ExtractError> {
        if audio.is_empty() {
            return Err(ExtractError::Unsupported("empty audio upload".to_string()));
        }
        let ext = filename
            .rsplit_once('.')
            .map(|(_, e)| e.to_ascii_lowercase())
            .unwrap_or_default();
        if !AUDIO_EXTENSIONS.contains(&ext.as_str()) {
            return Err(ExtractError::Unsupported(format!("audio file '{}'", filename)));
        }

        let request = TranscriptionRequest {
            model: self.model.clone(),
            audio: audio.to_vec(),
            filename: filename.to_string(),
            prompt: TRANSCRIPTION_PROMPT.to_string(),
        };
        match self.client.transcribe(&request).await {
            Ok(text) => Ok(text.trim().to_string()),
            Err(LlmError::MissingCredentials(var)) => Err(ExtractError::MissingCredentials(var)),
            Err(e) => {
                tracing::warn!(stage = "audio", file = filename, error = %e, "transcription failed");
                Err(ExtractError::Primary(e.to_string()))
            }
        }
    }
}
