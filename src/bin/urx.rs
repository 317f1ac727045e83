//! urx - command line tools for the RTDE interface
//!
//! - `urx version`: print the controller software version
//! - `urx monitor`: stream robot state snapshots as JSON lines
//! - `urx message`: show a text message on the controller
//! - `urx speed`: drive one joint at constant speed for a while

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use urx::{Config, MessageLevel, Robot, TcpTransport, DOF};

#[derive(Parser)]
#[command(name = "urx")]
#[command(about = "RTDE client tools for Universal Robots controllers")]
#[command(version)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Override the robot host from the configuration
    #[arg(long)]
    host: Option<String>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Query protocol and controller versions
    Version,
    /// Print robot state as JSON lines until Ctrl+C
    Monitor {
        /// Stop after this many snapshots
        #[arg(short = 'n', long)]
        count: Option<u64>,
        /// Switch to SCHED_RR at this priority first
        #[arg(long)]
        realtime: Option<i32>,
    },
    /// Send a text message to the controller log
    Message {
        text: String,
        #[arg(long, value_enum, default_value_t = Level::Info)]
        level: Level,
    },
    /// Run one joint at constant speed, then stop
    Speed {
        /// Joint index (0-5)
        #[arg(short, long)]
        joint: usize,
        /// Speed in rad/s
        #[arg(short, long)]
        speed: f64,
        /// Duration in seconds
        #[arg(short, long, default_value_t = 1.0)]
        duration: f64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Level {
    Exception,
    Error,
    Warning,
    Info,
}

impl From<Level> for MessageLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::Exception => MessageLevel::Exception,
            Level::Error => MessageLevel::Error,
            Level::Warning => MessageLevel::Warning,
            Level::Info => MessageLevel::Info,
        }
    }
}

impl Args {
    fn get_config_path(&self) -> String {
        self.config
            .clone()
            .or_else(|| std::env::var("URX_CONFIG").ok())
            .unwrap_or_else(|| "config/default_config.yaml".to_string())
    }

    fn load_config(&self) -> Result<Config> {
        let path = self.get_config_path();
        let mut config = match Config::load(&path) {
            Ok(config) => config,
            Err(e) => match &self.host {
                Some(host) => {
                    warn!("{}; using defaults for {}", e, host);
                    Config::with_host(host.clone())
                }
                None => return Err(e).context(format!("Failed to load config {}", path)),
            },
        };
        if let Some(host) = &self.host {
            config.robot.host = host.clone();
        }
        Ok(config)
    }
}

fn run_monitor(
    robot: &Robot<TcpTransport>,
    count: Option<u64>,
    realtime: Option<i32>,
    shutdown: &AtomicBool,
) -> Result<()> {
    robot.init_output().context("Failed to register output recipe")?;
    let started = match realtime {
        Some(priority) => robot.start_realtime(priority),
        None => robot.start(),
    };
    started.context("Failed to start data synchronization")?;

    let mut printed = 0u64;
    while !shutdown.load(Ordering::Relaxed) && count.map_or(true, |n| printed < n) {
        if let Some(state) = robot.wait_for_update(robot.sync_config().state_timeout()) {
            println!("{}", serde_json::to_string(&state)?);
            printed += 1;
        }
    }
    robot.stop().context("Failed to stop data synchronization")?;
    info!("Printed {} snapshots", printed);
    Ok(())
}

fn run_speed(
    robot: &Robot<TcpTransport>,
    joint: usize,
    speed: f64,
    duration: f64,
    shutdown: &AtomicBool,
) -> Result<()> {
    if joint >= DOF {
        bail!("Joint index {} out of range 0..{}", joint, DOF);
    }
    robot.init().context("Failed to register recipes")?;
    robot.start().context("Failed to start data synchronization")?;

    let mut speeds = [0.0; DOF];
    speeds[joint] = speed;
    let end = Instant::now() + Duration::from_secs_f64(duration.max(0.0));
    while Instant::now() < end && !shutdown.load(Ordering::Relaxed) {
        // Pace commands on incoming state
        robot.state(true);
        robot.submit_speed_command(&speeds)?;
    }
    let seq = robot.submit_stop_command()?;
    info!("Stop command sent as {}", seq);
    robot.stop().context("Failed to stop data synchronization")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    let config = args.load_config()?;
    info!("Connecting to {}:{}", config.robot.host, config.robot.port);

    let robot = tokio::task::spawn_blocking({
        let config = config.clone();
        move || Robot::connect(&config)
    })
    .await?
    .context("Failed to connect to RTDE interface")?;
    let robot = Arc::new(robot);

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down");
                shutdown.store(true, Ordering::Relaxed);
            }
        });
    }

    let worker = {
        let robot = Arc::clone(&robot);
        let shutdown = Arc::clone(&shutdown);
        tokio::task::spawn_blocking(move || -> Result<()> {
            match args.command {
                Cmd::Version => {
                    let version = robot.controller_version()?;
                    println!("{}", serde_json::json!({
                        "protocol": urx::wire::PROTOCOL_VERSION,
                        "controller": version,
                    }));
                    Ok(())
                }
                Cmd::Monitor { count, realtime } => run_monitor(&robot, count, realtime, &shutdown),
                Cmd::Message { text, level } => {
                    robot.send_text_message(&text, level.into())?;
                    info!("Message sent");
                    Ok(())
                }
                Cmd::Speed { joint, speed, duration } => {
                    run_speed(&robot, joint, speed, duration, &shutdown)
                }
            }
        })
    };

    worker.await?
}
