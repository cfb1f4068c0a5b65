use std::env;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::protocol::CommandPlan;

mod narrator;
mod speech;
mod vision;

pub use narrator::{AudioClip, Narrator};
pub use speech::{HttpSpeech, SpeechConfig};
pub use vision::{OllamaVision, VisionConfig};

const MAX_RETRY_ATTEMPTS: usize = 5;
const RETRY_BACKOFF_BASE_MS: u64 = 200;

fn retry_backoff_duration(attempt: usize) -> Duration {
    let factor = 1u64 << attempt.saturating_sub(1);
    Duration::from_millis(RETRY_BACKOFF_BASE_MS.saturating_mul(factor))
}

fn escape_single_quotes(value: &str) -> String {
    value.replace('\'', r"'\''")
}

fn curl_equivalent(request: &reqwest::Request) -> String {
    let mut parts = Vec::new();
    parts.push("curl".to_string());
    parts.push("-X".to_string());
    parts.push(request.method().to_string());
    parts.push(format!("'{}'", escape_single_quotes(request.url().as_str())));
    for (name, value) in request.headers().iter() {
        if let Ok(value) = value.to_str() {
            parts.push("-H".to_string());
            parts.push(format!(
                "'{}: {}'",
                escape_single_quotes(name.as_str()),
                escape_single_quotes(value)
            ));
        }
    }
    if let Some(body) = request.body().and_then(|body| body.as_bytes()) {
        let data = match std::str::from_utf8(body) {
            Ok(value) if value.len() <= 512 => escape_single_quotes(value),
            Ok(value) => format!("<{} bytes>", value.len()),
            Err(_) => format!("<{} bytes>", body.len()),
        };
        parts.push("-d".to_string());
        parts.push(format!("'{}'", data));
    }
    parts.join(" ")
}

fn debug_urls_enabled() -> bool {
    env::var("DEBUG_URLS")
        .map(|value| value.trim() == "1")
        .unwrap_or(false)
}

/// Sends the request built by `build`, retrying 5xx answers with exponential
/// backoff. Transport errors are returned immediately.
pub(crate) async fn send_with_retry<F>(mut build: F) -> Result<reqwest::Response, reqwest::Error>
where
    F: FnMut() -> reqwest::RequestBuilder,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let builder = build();
        if debug_urls_enabled() {
            if let Some(clone) = builder.try_clone() {
                if let Ok(request) = clone.build() {
                    let curl = curl_equivalent(&request);
                    info!(curl = %curl, "sending request");
                }
            }
        }
        let response = builder.send().await?;
        if response.status().is_server_error() && attempt < MAX_RETRY_ATTEMPTS {
            warn!(
                status = %response.status(),
                attempt,
                max_attempts = MAX_RETRY_ATTEMPTS,
                "request failed with 5xx, retrying"
            );
            sleep(retry_backoff_duration(attempt)).await;
            continue;
        }
        return Ok(response);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("inference request failed: {0}")]
    InferenceRequest(String),
    #[error("speech request failed: {0}")]
    SpeechRequest(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Vision-capable planner. Implementations never fail: any problem talking
/// to the model is folded into [`CommandPlan::fallback`].
#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn infer(&self, prompt: &str, image: Option<&str>) -> CommandPlan;
}

/// Raw text-to-speech backend.
#[async_trait]
pub trait SpeechSynth: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Bytes, EngineError>;
}

pub(crate) fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

pub(crate) fn env_optional_f32(key: &str) -> Option<f32> {
    env::var(key).ok().and_then(|value| value.parse::<f32>().ok())
}

pub(crate) fn env_optional_u32(key: &str) -> Option<u32> {
    env::var(key).ok().and_then(|value| value.parse::<u32>().ok())
}

pub(crate) fn env_duration_seconds(key: &str, default_secs: f32) -> Duration {
    seconds_or_default(env_optional_f32(key), default_secs)
}

/// Negative, infinite or NaN values fall back to `default_secs`.
fn seconds_or_default(value: Option<f32>, default_secs: f32) -> Duration {
    let fallback = Duration::try_from_secs_f32(default_secs).unwrap_or(Duration::ZERO);
    value
        .and_then(|secs| Duration::try_from_secs_f32(secs).ok())
        .unwrap_or(fallback)
}
