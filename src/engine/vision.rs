use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::engine::{
    env_duration_seconds, env_optional_f32, env_optional_u32, env_string, EngineError,
    VisionModel,
};
use crate::protocol::{CommandPlan, PlanStep};

const CONTROL_INSTRUCTIONS: &str = r#"You are steering a small wheeled JetBot robot from its front camera image.
Look closely at what is directly in front of the robot: objects, obstacles, free floor, edges and anything hazardous.
Estimate distances and sizes in centimeters, comparing against familiar objects where you can.
Decide what the robot should do next using only these commands: "forward", "backward", "left", "right", "stop", "dance".
Every command carries "parameters" with "speed" (0.0 to 1.0) and "duration" (seconds), and a "tts" sentence spoken aloud explaining the move.
Stay safe: steer around obstacles and say so. Move slowly and briefly in cramped spaces, faster and longer in open ones.
Answer with JSON only, shaped like:
{
  "commands": [
    {"command": "<name>", "parameters": {"speed": <float>, "duration": <float>}, "tts": "<spoken feedback>"}
  ],
  "description": "<detailed description of the scene>"
}"#;

const NO_DESCRIPTION: &str = "No description provided.";

#[derive(Debug, Clone)]
pub struct VisionConfig {
    pub host: String,
    pub model: String,
    pub timeout: Duration,
    pub temperature: f32,
    pub top_p: f32,
    pub num_predict: u32,
}

impl VisionConfig {
    pub fn from_env() -> Self {
        Self {
            host: env_string("OLLAMA_HOST", "http://localhost:11434"),
            model: env_string("VISION_MODEL", "granite3.2-vision"),
            timeout: env_duration_seconds("INFERENCE_TIMEOUT_SECONDS", 300.0),
            temperature: env_optional_f32("INFERENCE_TEMPERATURE").unwrap_or(0.5),
            top_p: env_optional_f32("INFERENCE_TOP_P").unwrap_or(0.95),
            num_predict: env_optional_u32("INFERENCE_NUM_PREDICT").unwrap_or(512),
        }
    }
}

/// Plans robot moves through an Ollama `/api/generate` endpoint.
#[derive(Debug, Clone)]
pub struct OllamaVision {
    client: reqwest::Client,
    endpoint: Url,
    config: VisionConfig,
}

impl OllamaVision {
    pub fn new(config: VisionConfig) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| EngineError::InferenceRequest(err.to_string()))?;
        let endpoint = generate_endpoint(&config.host)
            .map_err(|err| EngineError::InferenceRequest(err.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            config,
        })
    }

    async fn request_plan(&self, prompt: &str, image: Option<&str>) -> Result<CommandPlan, EngineError> {
        let payload = GenerateRequest {
            model: &self.config.model,
            prompt: format!("{}\n{}", prompt, CONTROL_INSTRUCTIONS),
            images: image.into_iter().collect(),
            stream: false,
            format: "json",
            options: GenerateOptions {
                temperature: self.config.temperature,
                top_p: self.config.top_p,
                num_predict: self.config.num_predict,
            },
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|err| EngineError::InferenceRequest(err.to_string()))?;

        let response = response
            .error_for_status()
            .map_err(|err| EngineError::InferenceRequest(err.to_string()))?;

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|err| EngineError::InvalidResponse(err.to_string()))?;

        parse_plan(body.response.as_deref().unwrap_or("{}"))
    }
}

#[async_trait]
impl VisionModel for OllamaVision {
    async fn infer(&self, prompt: &str, image: Option<&str>) -> CommandPlan {
        match self.request_plan(prompt, image).await {
            Ok(plan) => {
                tracing::debug!(
                    steps = plan.commands.len(),
                    description = %plan.description,
                    "vision plan received"
                );
                plan
            }
            Err(err) => {
                tracing::error!("vision inference failed: {}", err);
                CommandPlan::fallback(err)
            }
        }
    }
}

fn generate_endpoint(host: &str) -> Result<Url, url::ParseError> {
    let mut base = Url::parse(host)?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join("api/generate")
}

fn parse_plan(raw: &str) -> Result<CommandPlan, EngineError> {
    let reply: PlanReply = serde_json::from_str(strip_code_fence(raw))
        .map_err(|err| EngineError::InvalidResponse(err.to_string()))?;
    let commands = reply.commands.unwrap_or_default();
    if commands.is_empty() {
        return Err(EngineError::InvalidResponse(
            "no valid commands returned".to_string(),
        ));
    }
    Ok(CommandPlan {
        commands,
        description: reply
            .description
            .unwrap_or_else(|| NO_DESCRIPTION.to_string()),
    })
}

fn strip_code_fence(raw: &str) -> &str {
    static FENCE_RE: OnceLock<Regex> = OnceLock::new();
    let regex = FENCE_RE.get_or_init(|| {
        Regex::new(r"(?s)^\s*```[a-zA-Z]*\s*(.*?)\s*```\s*$").expect("fence pattern is valid")
    });
    match regex.captures(raw).and_then(|cap| cap.get(1)) {
        Some(inner) => inner.as_str(),
        None => raw.trim(),
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    images: Vec<&'a str>,
    stream: bool,
    format: &'a str,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    top_p: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlanReply {
    commands: Option<Vec<PlanStep>>,
    description: Option<String>,
}
