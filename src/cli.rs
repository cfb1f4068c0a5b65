use clap::{Parser, Subcommand, ValueEnum};

use crate::config::ServerConfig;
use crate::hub::DEFAULT_OUTBOX_CAPACITY;

#[derive(Parser, Debug)]
#[command(name = "jetbot-relay", version, about = "Relay between a JetBot robot and browser observers")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Server {
        #[arg(long, default_value_t = ServerConfig::default_bind())]
        bind: String,
        #[arg(long, default_value_t = ServerConfig::default_robot_url())]
        robot_url: String,
        #[arg(long, default_value_t = 5000)]
        reconnect_ms: u64,
        #[arg(long, help = "Reconnect when the robot sends nothing for this long")]
        robot_idle_ms: Option<u64>,
        #[arg(long, default_value_t = DEFAULT_OUTBOX_CAPACITY)]
        client_buffer: usize,
    },
    Client {
        #[arg(long, default_value_t = ServerConfig::default_client_addr())]
        addr: String,
        #[arg(long, default_value_t = 1, help = "Results to wait for before exiting")]
        replies: usize,
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
        #[command(subcommand)]
        action: ClientAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ClientAction {
    #[command(about = "Send a direct motion command")]
    Drive {
        #[arg(value_enum)]
        motion: MotionArg,
        #[arg(long, default_value_t = 1)]
        iterations: u64,
    },
    #[command(about = "Describe the current camera frame")]
    Describe { text: Option<String> },
    #[command(about = "Vision-guided moves, re-planned every iteration")]
    Custom {
        text: String,
        #[arg(long, default_value_t = 1)]
        iterations: u64,
    },
    #[command(about = "Run the autonomous control loop")]
    Autonomous {
        text: String,
        #[arg(long, default_value_t = 1)]
        iterations: u64,
        #[arg(long, help = "Seconds between iterations")]
        delay: Option<f64>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum MotionArg {
    Forward,
    Backward,
    Left,
    Right,
    Stop,
    Dance,
}

impl MotionArg {
    pub fn as_str(self) -> &'static str {
        match self {
            MotionArg::Forward => "forward",
            MotionArg::Backward => "backward",
            MotionArg::Left => "left",
            MotionArg::Right => "right",
            MotionArg::Stop => "stop",
            MotionArg::Dance => "dance",
        }
    }
}
