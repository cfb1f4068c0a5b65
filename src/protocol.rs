use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `jetbot_command` value carried by results that did not move the robot.
pub const NO_COMMAND: &str = "none";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientRequest {
    pub command: String,
    pub parameters: RequestParameters,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestParameters {
    pub text: Option<String>,
    pub iterations: Option<u64>,
    pub delay: Option<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("request is not a json object")]
    NotAnObject,
}

impl ClientRequest {
    /// Parses a client text frame. Field types are read leniently: a wrong
    /// type for an optional parameter is treated as if it were absent.
    pub fn parse(text: &str) -> Result<Self, RequestError> {
        let value: Value = serde_json::from_str(text)?;
        let object = value.as_object().ok_or(RequestError::NotAnObject)?;

        let command = object
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or(NO_COMMAND)
            .to_string();
        let empty = Map::new();
        let parameters = object
            .get("parameters")
            .and_then(Value::as_object)
            .unwrap_or(&empty);

        Ok(Self {
            command,
            parameters: RequestParameters {
                text: parameters
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                iterations: parameters.get("iterations").and_then(Value::as_u64),
                delay: parameters.get("delay").and_then(Value::as_f64),
            },
        })
    }

    pub fn prompt(&self) -> String {
        self.parameters
            .text
            .clone()
            .unwrap_or_else(|| format!("Execute {}", self.command))
    }

    pub fn iterations(&self) -> u64 {
        self.parameters.iterations.unwrap_or(1).max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResult {
    pub response: String,
    pub jetbot_command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Everything the server writes to observer clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ServerMessage {
    Image { image: String },
    Error { error: String },
    Result(CommandResult),
}

impl ServerMessage {
    pub fn invalid_json() -> Self {
        ServerMessage::Error {
            error: "Invalid JSON format".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MotionParameters {
    pub speed: f64,
    pub duration: f64,
}

/// Frame written to the robot socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RobotCommand {
    pub command: String,
    pub parameters: MotionParameters,
}

impl RobotCommand {
    /// Builds a command with speed clamped into `[0, 1]` and a non-negative
    /// duration.
    pub fn new(command: impl Into<String>, speed: f64, duration: f64) -> Self {
        Self {
            command: command.into(),
            parameters: MotionParameters {
                speed: if speed.is_nan() { 0.0 } else { speed.clamp(0.0, 1.0) },
                duration: if duration.is_nan() { 0.0 } else { duration.max(0.0) },
            },
        }
    }
}

/// Inbound robot message. Only `image` is interpreted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Telemetry {
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StepParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanStep {
    #[serde(default = "no_command")]
    pub command: String,
    #[serde(default)]
    pub parameters: StepParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tts: Option<String>,
}

impl PlanStep {
    pub fn is_noop(&self) -> bool {
        self.command == NO_COMMAND
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandPlan {
    pub commands: Vec<PlanStep>,
    pub description: String,
}

impl CommandPlan {
    /// Safe plan used whenever the model could not be consulted.
    pub fn fallback(cause: impl std::fmt::Display) -> Self {
        Self {
            commands: vec![PlanStep {
                command: "stop".to_string(),
                parameters: StepParameters::default(),
                tts: Some("An error occurred.".to_string()),
            }],
            description: format!("Error: {}", cause),
        }
    }
}

fn no_command() -> String {
    NO_COMMAND.to_string()
}
