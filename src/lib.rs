//! urx - RTDE client for Universal Robots controllers
//!
//! Implements the Real-Time Data Exchange protocol: the wire format, recipe
//! negotiation with the controller, and a threaded synchronizer that keeps
//! a fresh robot state available while commands are sent at up to 125 Hz.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use urx::{Config, Robot};
//!
//! fn main() -> urx::Result<()> {
//!     let config = Config::load("config/default_config.yaml")?;
//!     let robot = Robot::connect(&config)?;
//!     robot.init()?;
//!     robot.start()?;
//!
//!     let state = robot.state(true);
//!     println!("seq {} at {:.3}s: {:?}", state.sequence, state.timestamp, state.joint_positions);
//!
//!     robot.submit_speed_command(&[0.0, 0.0, 0.0, 0.0, 0.0, 0.1])?;
//!     robot.stop()
//! }
//! ```
//!
//! # Architecture
//!
//! - **wire**: package headers, control messages and big-endian value codecs
//! - **catalog**: field types and the controller's named input/output fields
//! - **token** / **recipe**: field lists negotiated with the controller
//! - **handler**: protocol state machine over a [`Transport`]
//! - **robot**: receiver thread, state snapshots and command submission

pub mod catalog;
pub mod config;
pub mod error;
pub mod handler;
pub mod recipe;
pub mod robot;
pub mod token;
pub mod transport;
pub mod wire;

#[cfg(test)]
pub(crate) mod testing;

pub use catalog::{DataType, Direction, Value, DOF};
pub use config::{Config, RobotConfig, SyncConfig};
pub use error::{Result, RtdeError};
pub use handler::{HandlerState, RtdeHandler};
pub use recipe::Recipe;
pub use robot::{Command, Robot, RobotState};
pub use token::{RecipeToken, Register, Slot};
pub use transport::{Received, TcpTransport, Transport, RTDE_PORT};
pub use wire::{ControllerVersion, MessageLevel, PackageHeader, PackageType};
