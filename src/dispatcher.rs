//! Turns client commands into paced robot actions.
//!
//! Four modes are supported:
//!
//! * direct moves (`forward`, `backward`, `left`, `right`, `stop`, `dance`)
//!   sent with default parameters and a spoken acknowledgement,
//! * `describe`, a single look at the current frame that is narrated but
//!   never moves the robot,
//! * `custom`, which asks the vision model for a plan on every iteration and
//!   keeps going through the plan when the robot is unreachable,
//! * `autonomous`, the control loop, which needs a frame on every iteration
//!   and abandons the current plan as soon as the robot is unreachable.
//!
//! Every outcome is broadcast to all observers. Steps whose command is
//! `"none"` are skipped without a message.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::config::DispatchConfig;
use crate::engine::{Narrator, VisionModel};
use crate::hub::ClientRegistry;
use crate::protocol::{ClientRequest, CommandPlan, CommandResult, RobotCommand, ServerMessage, NO_COMMAND};
use crate::robot::RobotLink;

pub const NOT_CONNECTED: &str = "JetBot not connected!";
pub const NO_IMAGE: &str = "No image available!";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Motion {
    Forward,
    Backward,
    Left,
    Right,
    Stop,
    Dance,
}

impl Motion {
    pub fn parse(command: &str) -> Option<Self> {
        match command {
            "forward" => Some(Motion::Forward),
            "backward" => Some(Motion::Backward),
            "left" => Some(Motion::Left),
            "right" => Some(Motion::Right),
            "stop" => Some(Motion::Stop),
            "dance" => Some(Motion::Dance),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Motion::Forward => "forward",
            Motion::Backward => "backward",
            Motion::Left => "left",
            Motion::Right => "right",
            Motion::Stop => "stop",
            Motion::Dance => "dance",
        }
    }

    fn acknowledgement(self) -> String {
        let name = self.as_str();
        let mut chars = name.chars();
        match chars.next() {
            Some(first) => format!("{}{} executed.", first.to_ascii_uppercase(), chars.as_str()),
            None => "Executed.".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Direct(Motion),
    Describe,
    Custom,
    Autonomous,
}

impl Mode {
    pub fn parse(command: &str) -> Option<Self> {
        if let Some(motion) = Motion::parse(command) {
            return Some(Mode::Direct(motion));
        }
        match command {
            "describe" => Some(Mode::Describe),
            "custom" => Some(Mode::Custom),
            "autonomous" => Some(Mode::Autonomous),
            _ => None,
        }
    }
}

/// What a plan does when a step cannot reach the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnDisconnect {
    NextStep,
    AbandonPlan,
}

pub struct Dispatcher {
    robot: RobotLink,
    hub: ClientRegistry,
    vision: Arc<dyn VisionModel>,
    narrator: Narrator,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        robot: RobotLink,
        hub: ClientRegistry,
        vision: Arc<dyn VisionModel>,
        narrator: Narrator,
        config: DispatchConfig,
    ) -> Self {
        Self {
            robot,
            hub,
            vision,
            narrator,
            config,
        }
    }

    /// Runs `request` to completion.
    pub async fn dispatch(&self, request: &ClientRequest) {
        let Some(mode) = Mode::parse(&request.command) else {
            tracing::warn!(command = %request.command, "ignoring unknown command");
            return;
        };
        let iterations = request.iterations();
        tracing::info!(command = %request.command, iterations, "dispatching command");

        match mode {
            Mode::Direct(motion) => self.run_direct(motion, iterations).await,
            Mode::Describe => self.run_describe(&request.prompt()).await,
            Mode::Custom => self.run_custom(&request.prompt(), iterations).await,
            Mode::Autonomous => {
                let delay = request
                    .parameters
                    .delay
                    .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                    .unwrap_or(self.config.step_delay);
                self.run_autonomous(&request.prompt(), iterations, delay).await
            }
        }
    }

    async fn run_direct(&self, motion: Motion, iterations: u64) {
        for _ in 0..iterations {
            let command = RobotCommand::new(
                motion.as_str(),
                self.config.default_speed,
                self.config.default_duration,
            );
            match self.robot.send(&command).await {
                Ok(()) => {
                    let response = motion.acknowledgement();
                    let audio = self.narrator.speak(&response).await;
                    self.hub.broadcast(&ServerMessage::Result(CommandResult {
                        response,
                        jetbot_command: motion.as_str().to_string(),
                        audio: audio.data_url(),
                        description: None,
                    }));
                    sleep(self.step_pause(command.parameters.duration)).await;
                }
                Err(err) => {
                    tracing::debug!(command = motion.as_str(), "direct command not sent: {}", err);
                    self.notify(NOT_CONNECTED);
                }
            }
            sleep(self.config.step_delay).await;
        }
    }

    async fn run_describe(&self, prompt: &str) {
        let Some(frame) = self.robot.current_frame() else {
            self.notify(NO_IMAGE);
            return;
        };
        tracing::debug!(age_ms = frame.captured_at.elapsed().as_millis() as u64, "describing frame");
        let plan = self.vision.infer(prompt, Some(frame.image.as_str())).await;
        let audio = self.narrator.speak(&plan.description).await;
        self.hub.broadcast(&ServerMessage::Result(CommandResult {
            response: plan.description.clone(),
            jetbot_command: NO_COMMAND.to_string(),
            audio: audio.data_url(),
            description: Some(plan.description),
        }));
    }

    async fn run_custom(&self, prompt: &str, iterations: u64) {
        if self.robot.current_frame().is_none() {
            self.notify(NO_IMAGE);
            return;
        }
        for _ in 0..iterations {
            let frame = self.robot.current_frame();
            let plan = self
                .vision
                .infer(prompt, frame.as_ref().map(|frame| frame.image.as_str()))
                .await;
            self.execute_plan(&plan, OnDisconnect::NextStep, |command| {
                format!("Executing {}.", command)
            })
            .await;
            sleep(self.config.step_delay).await;
        }
    }

    async fn run_autonomous(&self, prompt: &str, iterations: u64, delay: Duration) {
        for iteration in 1..=iterations {
            tracing::info!(iteration, iterations, "autonomous iteration");
            let Some(frame) = self.robot.current_frame() else {
                tracing::warn!("no image available from robot; stopping autonomous run");
                self.notify(NO_IMAGE);
                break;
            };
            let plan = self.vision.infer(prompt, Some(frame.image.as_str())).await;
            self.execute_plan(&plan, OnDisconnect::AbandonPlan, |_| {
                format!("Autonomous step {}.", iteration)
            })
            .await;
            sleep(delay).await;
        }
    }

    async fn execute_plan<F>(&self, plan: &CommandPlan, on_disconnect: OnDisconnect, default_tts: F)
    where
        F: Fn(&str) -> String,
    {
        for step in &plan.commands {
            if step.is_noop() {
                continue;
            }
            let command = RobotCommand::new(
                step.command.as_str(),
                step.parameters.speed.unwrap_or(self.config.default_speed),
                step.parameters
                    .duration
                    .unwrap_or(self.config.default_duration),
            );
            if let Err(err) = self.robot.send(&command).await {
                tracing::debug!(command = %step.command, "plan step not sent: {}", err);
                self.notify(NOT_CONNECTED);
                match on_disconnect {
                    OnDisconnect::NextStep => continue,
                    OnDisconnect::AbandonPlan => break,
                }
            }

            sleep(self.step_pause(command.parameters.duration)).await;
            let response = step
                .tts
                .clone()
                .unwrap_or_else(|| default_tts(&step.command));
            let audio = self.narrator.speak(&response).await;
            self.hub.broadcast(&ServerMessage::Result(CommandResult {
                response,
                jetbot_command: step.command.clone(),
                audio: audio.data_url(),
                description: Some(plan.description.clone()),
            }));
        }
    }

    fn step_pause(&self, duration_secs: f64) -> Duration {
        let duration = Duration::try_from_secs_f64(duration_secs).unwrap_or_else(|_| {
            Duration::try_from_secs_f64(self.config.default_duration).unwrap_or(Duration::ZERO)
        });
        duration + self.config.step_buffer
    }

    fn notify(&self, response: &str) {
        self.hub.broadcast(&ServerMessage::Result(CommandResult {
            response: response.to_string(),
            jetbot_command: NO_COMMAND.to_string(),
            audio: None,
            description: None,
        }));
    }
}
