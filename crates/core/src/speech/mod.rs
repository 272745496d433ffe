//! Remote text-to-speech and speech-to-text collaborators.
//!
//! The engine only depends on [`SpeechService`]. [`OpenAiSpeechClient`] talks
//! to an OpenAI-compatible API:
//!
//! - `POST {base_url}/audio/speech` with `{model, input, voice, response_format}`
//!   answers with raw audio bytes.
//! - `POST {base_url}/audio/transcriptions` with a multipart `file` and `model`
//!   answers with `{"text": "..."}`.

use std::{fmt, str::FromStr, time::Duration};

use async_trait::async_trait;
use reqwest::{multipart, Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{AudioFormat, AudioUpload, AvatarError, Result, SpeechConfig};

/// Voices offered by the synthesis endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Voice {
    #[default]
    Alloy,
    Verse,
    Aria,
}

impl Voice {
    pub const ALL: [Voice; 3] = [Voice::Alloy, Voice::Verse, Voice::Aria];

    /// Voice id sent to the synthesis endpoint.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alloy => "alloy",
            Self::Verse => "verse",
            Self::Aria => "aria",
        }
    }

    /// Human-readable label.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Alloy => "Alloy",
            Self::Verse => "Verse",
            Self::Aria => "Aria",
        }
    }
}

impl fmt::Display for Voice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Voice {
    type Err = AvatarError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|voice| voice.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| AvatarError::msg(format!("unknown voice `{s}`")))
    }
}

/// The two remote speech operations the engine consumes.
///
/// Implementations must not retry: every call may be billed.
#[async_trait]
pub trait SpeechService: Send + Sync {
    async fn synthesize_speech(
        &self,
        text: &str,
        voice: Voice,
        format: AudioFormat,
    ) -> Result<Vec<u8>>;

    async fn transcribe_audio(&self, file: &AudioUpload) -> Result<String>;
}

/// HTTP client for an OpenAI-compatible speech API.
#[derive(Clone)]
pub struct OpenAiSpeechClient {
    http: Client,
    cfg: SpeechConfig,
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

impl OpenAiSpeechClient {
    /// Builds the HTTP client; proxies are bypassed for loopback URLs.
    pub fn new(cfg: SpeechConfig) -> Result<Self> {
        let mut builder = Client::builder().timeout(Duration::from_millis(cfg.timeout_ms));
        if is_loopback(&cfg.base_url) {
            builder = builder.no_proxy();
        }
        let http = builder
            .build()
            .map_err(|e| AvatarError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, cfg })
    }

    pub fn config(&self) -> &SpeechConfig {
        &self.cfg
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.cfg.base_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.cfg.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[async_trait]
impl SpeechService for OpenAiSpeechClient {
    async fn synthesize_speech(
        &self,
        text: &str,
        voice: Voice,
        format: AudioFormat,
    ) -> Result<Vec<u8>> {
        let url = self.endpoint("audio/speech");
        debug!(target: "speech", %url, %voice, %format, "POST speech synthesis");

        let body = SpeechRequest {
            model: &self.cfg.tts_model,
            input: text,
            voice: voice.as_str(),
            response_format: format.as_str(),
        };
        let response = self
            .authorize(self.http.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| AvatarError::Synthesis(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = error_detail(status, response.text().await.unwrap_or_default());
            warn!(target: "speech", %status, "speech synthesis rejected");
            return Err(AvatarError::Synthesis(detail));
        }

        if let Some(content_type) = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            if !content_type.starts_with(format.mime()) {
                warn!(target: "speech", content_type, expected = format.mime(), "unexpected audio content type");
            }
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AvatarError::Synthesis(format!("failed to read audio body: {e}")))?;
        Ok(bytes.to_vec())
    }

    async fn transcribe_audio(&self, file: &AudioUpload) -> Result<String> {
        let url = self.endpoint("audio/transcriptions");
        debug!(target: "speech", %url, file = %file.file_name, bytes = file.bytes.len(), "POST transcription");

        let part = multipart::Part::bytes(file.bytes.clone())
            .file_name(file.file_name.clone())
            .mime_str(&file.content_type())
            .map_err(|e| AvatarError::Transcription(format!("invalid content type: {e}")))?;
        let form = multipart::Form::new()
            .text("model", self.cfg.stt_model.clone())
            .part("file", part);

        let response = self
            .authorize(self.http.post(&url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| AvatarError::Transcription(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = error_detail(status, response.text().await.unwrap_or_default());
            warn!(target: "speech", %status, "transcription rejected");
            return Err(AvatarError::Transcription(detail));
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| AvatarError::Transcription(format!("malformed response: {e}")))?;
        Ok(parsed.text)
    }
}

impl fmt::Debug for OpenAiSpeechClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiSpeechClient")
            .field("cfg", &self.cfg)
            .finish()
    }
}

fn error_detail(status: StatusCode, body: String) -> String {
    match serde_json::from_str::<ApiErrorEnvelope>(&body) {
        Ok(envelope) => format!("{status}: {}", envelope.error.message),
        Err(_) if body.trim().is_empty() => status.to_string(),
        Err(_) => format!("{status}: {}", body.trim()),
    }
}

fn is_loopback(base_url: &str) -> bool {
    let rest = base_url.split("://").nth(1).unwrap_or(base_url);
    ["localhost", "127.0.0.1", "[::1]"]
        .iter()
        .any(|host| rest.starts_with(host))
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        task::JoinHandle,
    };

    use super::*;

    /// Serves exactly one HTTP response and hands back the raw request.
    async fn serve_once(
        status: &'static str,
        content_type: &'static str,
        body: Vec<u8>,
    ) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            let head = format!(
                "HTTP/1.1 {status}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(&body).await.unwrap();
            socket.shutdown().await.ok();
            request
        });
        (format!("http://{addr}/v1"), handle)
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            let Some(split) = text.find("\r\n\r\n") else {
                continue;
            };
            let head = text[..split].to_ascii_lowercase();
            let body_len = buf.len() - (split + 4);
            if let Some(len) = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
            {
                if body_len >= len {
                    break;
                }
            } else if head.contains("transfer-encoding: chunked") {
                if text.ends_with("0\r\n\r\n") {
                    break;
                }
            } else {
                break;
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    fn client(base_url: String) -> OpenAiSpeechClient {
        OpenAiSpeechClient::new(SpeechConfig {
            base_url,
            api_key: Some("test-key".into()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn voices_round_trip_their_wire_names() {
        for voice in Voice::ALL {
            assert_eq!(voice.as_str().parse::<Voice>().unwrap(), voice);
        }
        assert_eq!(" ALLOY ".parse::<Voice>().unwrap(), Voice::Alloy);
        assert!("nova".parse::<Voice>().is_err());
        assert_eq!(serde_json::to_string(&Voice::Verse).unwrap(), "\"verse\"");
    }

    #[test]
    fn recognises_loopback_hosts() {
        assert!(is_loopback("http://127.0.0.1:9000/v1"));
        assert!(is_loopback("http://localhost/v1"));
        assert!(!is_loopback("https://api.openai.com/v1"));
    }

    #[tokio::test]
    async fn synthesis_posts_json_and_returns_audio() {
        let (url, server) = serve_once("200 OK", "audio/mpeg", vec![0xFF, 0xFB, 1, 2]).await;

        let bytes = client(url)
            .synthesize_speech("Hello there", Voice::Alloy, AudioFormat::Mp3)
            .await
            .unwrap();
        let request = server.await.unwrap();

        assert_eq!(bytes, vec![0xFF, 0xFB, 1, 2]);
        assert!(request.starts_with("POST /v1/audio/speech"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer test-key"));
        assert!(request.contains(r#""voice":"alloy""#));
        assert!(request.contains(r#""response_format":"mp3""#));
        assert!(request.contains(r#""input":"Hello there""#));
    }

    #[tokio::test]
    async fn synthesis_surfaces_api_error_message() {
        let body = br#"{"error":{"message":"quota exceeded","type":"insufficient_quota"}}"#.to_vec();
        let (url, server) = serve_once("429 Too Many Requests", "application/json", body).await;

        let err = client(url)
            .synthesize_speech("hi", Voice::Aria, AudioFormat::Wav)
            .await
            .unwrap_err();
        server.await.unwrap();

        match err {
            AvatarError::Synthesis(detail) => {
                assert!(detail.contains("429"));
                assert!(detail.contains("quota exceeded"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn transcription_accepts_empty_text() {
        let (url, server) = serve_once("200 OK", "application/json", br#"{"text":""}"#.to_vec()).await;
        let upload = AudioUpload::new("silence.wav", None, b"RIFF\0\0\0\0WAVE".to_vec());

        let text = client(url).transcribe_audio(&upload).await.unwrap();
        let request = server.await.unwrap();

        assert_eq!(text, "");
        assert!(request.starts_with("POST /v1/audio/transcriptions"));
        assert!(request.contains("multipart/form-data"));
        assert!(request.contains("whisper-1"));
        assert!(request.contains("filename=\"silence.wav\""));
    }

    #[tokio::test]
    async fn transcription_failure_is_typed() {
        let (url, server) = serve_once("500 Internal Server Error", "text/plain", b"STT error".to_vec()).await;
        let upload = AudioUpload::new("clip.mp3", None, vec![0xFF, 0xFB, 0, 0]);

        let err = client(url).transcribe_audio(&upload).await.unwrap_err();
        server.await.unwrap();

        assert!(matches!(err, AvatarError::Transcription(ref d) if d.contains("STT error")));
    }
}
