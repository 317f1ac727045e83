//! RTDE protocol handler
//!
//! Drives the request/response part of the protocol (version handshake,
//! recipe setup, start and pause) and decodes streamed data packages into
//! the registered output recipe.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::catalog::Direction;
use crate::recipe::Recipe;
use crate::transport::{Received, Transport};
use crate::wire::{
    self, ControllerVersion, MessageLevel, PackageHeader, PackageType, BUFFER_SIZE,
    DATA_PACKAGE_OVERHEAD,
};
use crate::{Result, RtdeError};

/// Packages skipped while waiting for a control reply
const MAX_SKIPPED_PACKAGES: usize = 256;

/// Source name used for text messages sent to the controller
pub const MESSAGE_SOURCE: &str = "urx";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Disconnected,
    /// Connected, no recipe registered yet
    Connected,
    RecipesRegistered,
    Streaming,
}

pub struct RtdeHandler<T: Transport> {
    transport: Arc<T>,
    state: HandlerState,
    output: Option<Recipe>,
    inputs: HashMap<u8, Recipe>,
    rx_buf: Vec<u8>,
    tx_buf: Vec<u8>,
}

/// Log a text message from the controller at its own severity
pub(crate) fn log_text_message(package: &[u8]) {
    match wire::parse_text_message(package) {
        Ok(msg) => match msg.level {
            MessageLevel::Exception | MessageLevel::Error => {
                error!("Controller [{}]: {}", msg.source, msg.message)
            }
            MessageLevel::Warning => warn!("Controller [{}]: {}", msg.source, msg.message),
            MessageLevel::Info => info!("Controller [{}]: {}", msg.source, msg.message),
        },
        Err(e) => debug!("Unreadable text message: {}", e),
    }
}

impl<T: Transport> RtdeHandler<T> {
    pub fn new(transport: T) -> Self {
        Self::from_arc(Arc::new(transport))
    }

    pub fn from_arc(transport: Arc<T>) -> Self {
        let state = if transport.is_connected() {
            HandlerState::Connected
        } else {
            HandlerState::Disconnected
        };
        Self {
            transport,
            state,
            output: None,
            inputs: HashMap::new(),
            rx_buf: vec![0u8; BUFFER_SIZE],
            tx_buf: Vec::with_capacity(BUFFER_SIZE),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    pub fn connect(&mut self) -> Result<()> {
        self.transport.connect()?;
        self.state = HandlerState::Connected;
        Ok(())
    }

    pub fn disconnect(&mut self) -> Result<()> {
        self.transport.disconnect()?;
        self.state = HandlerState::Disconnected;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    fn require_connected(&self) -> Result<()> {
        if self.state == HandlerState::Disconnected || !self.transport.is_connected() {
            return Err(RtdeError::Connection("Not connected".to_string()));
        }
        Ok(())
    }

    /// Send `request` and wait for the reply tagged `expected`.
    ///
    /// Data packages that are still streaming in are dropped, text messages
    /// are logged. Returns the length of the reply in `rx_buf`.
    fn send_receive(&mut self, request: &[u8], expected: PackageType) -> Result<usize> {
        self.require_connected()?;
        self.transport.send(request)?;

        for _ in 0..MAX_SKIPPED_PACKAGES {
            let Received { len, .. } = self.transport.receive(&mut self.rx_buf)?;
            let header = PackageHeader::decode(&self.rx_buf[..len], None)?;
            match header.package_type {
                t if t == expected => return Ok(len),
                PackageType::TextMessage => log_text_message(&self.rx_buf[..len]),
                PackageType::DataPackage => {}
                other => {
                    return Err(RtdeError::MalformedFrame(format!(
                        "Expected {:?} reply, got {:?}",
                        expected, other
                    )))
                }
            }
        }
        Err(RtdeError::Timeout(format!(
            "No {:?} reply within {} packages",
            expected, MAX_SKIPPED_PACKAGES
        )))
    }

    /// Request protocol version 2
    pub fn negotiate_version(&mut self) -> Result<()> {
        let len = self.send_receive(&wire::version_request(), PackageType::RequestProtocolVersion)?;
        if !wire::parse_version_response(&self.rx_buf[..len])? {
            return Err(RtdeError::Protocol(format!(
                "Controller refused protocol version {}",
                wire::PROTOCOL_VERSION
            )));
        }
        debug!("Negotiated RTDE protocol version {}", wire::PROTOCOL_VERSION);
        Ok(())
    }

    /// Query the controller software version; only majors 1 through 6 are usable
    pub fn controller_version(&mut self) -> Result<ControllerVersion> {
        let len = self.send_receive(
            &wire::urcontrol_version_request(),
            PackageType::GetUrcontrolVersion,
        )?;
        let version = wire::parse_urcontrol_version(&self.rx_buf[..len])?;
        if version.major == 0 || version.major >= 7 {
            return Err(RtdeError::Protocol(format!(
                "Unsupported controller version {}",
                version
            )));
        }
        Ok(version)
    }

    /// Fire-and-forget text message shown on the controller
    pub fn send_text_message(&mut self, message: &str, level: MessageLevel) -> Result<()> {
        self.require_connected()?;
        let package = wire::text_message(message, MESSAGE_SOURCE, level)?;
        self.transport.send(&package)?;
        Ok(())
    }

    /// Register `recipe` with the controller and take ownership of it.
    ///
    /// Only one output recipe can be active; registering another replaces
    /// the first. Input recipes are kept by their controller-assigned id.
    pub fn register_recipe(&mut self, mut recipe: Recipe) -> Result<u8> {
        if self.state == HandlerState::Streaming {
            return Err(RtdeError::Precondition(
                "Cannot register recipes while streaming".to_string(),
            ));
        }
        let request = recipe.registration_message()?;
        let expected = match recipe.direction() {
            Direction::Output => PackageType::ControlPackageSetupOutputs,
            Direction::Input => PackageType::ControlPackageSetupInputs,
        };
        let len = self.send_receive(&request, expected)?;
        let recipe_id = recipe.confirm_registration(&self.rx_buf[..len])?;

        match recipe.direction() {
            Direction::Output => {
                if let Some(previous) = &self.output {
                    warn!(
                        "Replacing output recipe {} ({}) with {} ({})",
                        previous.recipe_id().unwrap_or_default(),
                        previous.fields(),
                        recipe_id,
                        recipe.fields()
                    );
                }
                self.output = Some(recipe);
            }
            Direction::Input => {
                if self.inputs.insert(recipe_id, recipe).is_some() {
                    warn!("Input recipe {} registered again", recipe_id);
                }
            }
        }
        info!("Registered {:?} recipe {}", expected, recipe_id);
        self.state = HandlerState::RecipesRegistered;
        Ok(recipe_id)
    }

    pub fn output_recipe(&self) -> Option<&Recipe> {
        self.output.as_ref()
    }

    pub fn output_recipe_mut(&mut self) -> Option<&mut Recipe> {
        self.output.as_mut()
    }

    pub fn input_recipe(&self, recipe_id: u8) -> Option<&Recipe> {
        self.inputs.get(&recipe_id)
    }

    pub fn input_recipe_mut(&mut self, recipe_id: u8) -> Option<&mut Recipe> {
        self.inputs.get_mut(&recipe_id)
    }

    /// Ask the controller to start streaming data packages
    pub fn start_streaming(&mut self) -> Result<()> {
        let len = self.send_receive(&wire::start_request(), PackageType::ControlPackageStart)?;
        wire::parse_start_pause(&self.rx_buf[..len], PackageType::ControlPackageStart)?;
        self.state = HandlerState::Streaming;
        info!("RTDE data synchronization started");
        Ok(())
    }

    pub fn stop_streaming(&mut self) -> Result<()> {
        let len = self.send_receive(&wire::pause_request(), PackageType::ControlPackagePause)?;
        wire::parse_start_pause(&self.rx_buf[..len], PackageType::ControlPackagePause)?;
        self.state = HandlerState::RecipesRegistered;
        info!("RTDE data synchronization paused");
        Ok(())
    }

    /// Blocking receive of one package, decoded into the output recipe
    pub fn receive_frame(&mut self) -> Result<()> {
        let Received { len, timestamp_ns } = self.transport.receive(&mut self.rx_buf)?;
        // Split the borrow: the frame lives in rx_buf while the recipe is updated
        let frame = std::mem::take(&mut self.rx_buf);
        let result = self.parse_incoming_data(&frame[..len], timestamp_ns);
        self.rx_buf = frame;
        result
    }

    /// Validate one data package and decode it into the output recipe.
    ///
    /// The frame must carry the active output recipe's id and exactly its
    /// payload width. Anything else is rejected and left for the caller to
    /// skip.
    pub fn parse_incoming_data(&mut self, frame: &[u8], timestamp_ns: Option<u64>) -> Result<()> {
        let header = PackageHeader::decode(frame, None)?;
        let size = header.size as usize;
        if size > frame.len() {
            return Err(RtdeError::MalformedFrame(format!(
                "Package claims {} bytes, {} received",
                size,
                frame.len()
            )));
        }

        match header.package_type {
            PackageType::DataPackage => {}
            PackageType::TextMessage => {
                log_text_message(&frame[..size]);
                return Err(RtdeError::MalformedFrame("Text message instead of data".to_string()));
            }
            other => {
                return Err(RtdeError::MalformedFrame(format!(
                    "Unexpected {:?} package while streaming",
                    other
                )))
            }
        }
        if size < DATA_PACKAGE_OVERHEAD {
            return Err(RtdeError::MalformedFrame("Data package without recipe id".to_string()));
        }

        let recipe_id = frame[wire::HEADER_SIZE];
        if recipe_id == 0 {
            return Err(RtdeError::MalformedFrame("Data package with recipe id 0".to_string()));
        }
        let output = self
            .output
            .as_mut()
            .filter(|r| r.is_active())
            .ok_or_else(|| RtdeError::Precondition("No active output recipe".to_string()))?;
        if output.recipe_id() != Some(recipe_id) {
            return Err(RtdeError::MalformedFrame(format!(
                "Data package for recipe {}, expected {:?}",
                recipe_id,
                output.recipe_id()
            )));
        }
        let payload = &frame[DATA_PACKAGE_OVERHEAD..size];
        if payload.len() != output.expected_bytes() {
            return Err(RtdeError::MalformedFrame(format!(
                "Data package of {} bytes, recipe expects {}",
                payload.len(),
                output.expected_bytes()
            )));
        }

        output.parse(payload, timestamp_ns)
    }

    /// Serialize the input recipe `recipe_id` and send it
    pub fn send_command(&mut self, recipe_id: u8) -> Result<()> {
        let recipe = self.inputs.get(&recipe_id).ok_or_else(|| {
            RtdeError::Precondition(format!("No input recipe with id {}", recipe_id))
        })?;
        self.require_connected()?;
        recipe.serialize(&mut self.tx_buf)?;
        self.transport.send(&self.tx_buf)?;
        Ok(())
    }
}
