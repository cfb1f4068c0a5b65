use std::time::Duration;

use crate::engine::env_string;
use crate::robot::RobotLinkConfig;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub robot: RobotLinkConfig,
    pub client_buffer: usize,
    pub dispatch: DispatchConfig,
}

impl ServerConfig {
    pub fn default_bind() -> String {
        "0.0.0.0:8000".to_string()
    }

    pub fn default_robot_url() -> String {
        env_string("ROBOT_WS_URL", "ws://192.168.137.181:8766")
    }

    pub fn default_client_addr() -> String {
        "ws://127.0.0.1:8000/ws/client".to_string()
    }
}

/// Motion defaults and pacing used by the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub default_speed: f64,
    pub default_duration: f64,
    /// Added to a step's duration before the next step starts.
    pub step_buffer: Duration,
    /// Pause between iterations.
    pub step_delay: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_speed: 0.5,
            default_duration: 1.0,
            step_buffer: Duration::from_millis(100),
            step_delay: Duration::from_millis(100),
        }
    }
}
