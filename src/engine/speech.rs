use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::ACCEPT;
use serde::Serialize;

use crate::engine::{env_duration_seconds, env_string, send_with_retry, EngineError, SpeechSynth};

#[derive(Debug, Clone)]
pub struct SpeechConfig {
    pub api_url: String,
    pub model: String,
    pub voice: String,
    pub timeout: Duration,
}

impl SpeechConfig {
    pub fn from_env() -> Self {
        Self {
            api_url: env_string("TTS_API_URL", "http://localhost:5050/v1/audio/speech"),
            model: env_string("TTS_MODEL", "tts-1"),
            voice: env_string("TTS_VOICE", "en-US-JennyNeural"),
            timeout: env_duration_seconds("TTS_TIMEOUT_SECONDS", 30.0),
        }
    }
}

/// OpenAI-compatible `audio/speech` client returning MP3 bytes.
#[derive(Debug)]
pub struct HttpSpeech {
    client: reqwest::Client,
    config: SpeechConfig,
}

impl HttpSpeech {
    pub fn new(config: SpeechConfig) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .user_agent("jetbot-relay/0.1")
            .timeout(config.timeout)
            .build()
            .map_err(|err| EngineError::SpeechRequest(err.to_string()))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl SpeechSynth for HttpSpeech {
    async fn synthesize(&self, text: &str) -> Result<Bytes, EngineError> {
        let payload = SpeechRequest {
            model: &self.config.model,
            input: text,
            voice: &self.config.voice,
            response_format: "mp3",
        };

        let response = send_with_retry(|| {
            self.client
                .post(&self.config.api_url)
                .header(ACCEPT, "audio/mpeg")
                .json(&payload)
        })
        .await
        .map_err(|err| EngineError::SpeechRequest(err.to_string()))?;

        let response = response
            .error_for_status()
            .map_err(|err| EngineError::SpeechRequest(err.to_string()))?;

        let data = response
            .bytes()
            .await
            .map_err(|err| EngineError::SpeechRequest(err.to_string()))?;
        if data.is_empty() {
            return Err(EngineError::InvalidResponse(
                "speech service returned no audio".to_string(),
            ));
        }
        Ok(data)
    }
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}
