//! Threaded state synchronizer for one robot
//!
//! [`Robot`] owns the protocol handler behind a single mutex. A receiver
//! thread decodes every data package into the output registers and
//! publishes a [`RobotState`] snapshot; caller threads read snapshots and
//! submit commands through the input registers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::catalog::DOF;
use crate::config::{Config, SyncConfig};
use crate::handler::RtdeHandler;
use crate::recipe::Recipe;
use crate::token::Slot;
use crate::transport::{Received, TcpTransport, Transport};
use crate::wire::{ControllerVersion, MessageLevel, BUFFER_SIZE};
use crate::{Result, RtdeError};

/// Snapshot of the robot taken from one data package
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RobotState {
    /// Local receive time, microseconds since the Unix epoch
    pub received_at_us: i64,
    /// Controller time in seconds
    pub timestamp: f64,
    pub sequence: i32,
    pub joint_positions: [f64; DOF],
    pub joint_velocities: [f64; DOF],
    pub joint_accelerations: [f64; DOF],
    pub joint_torques: [f64; DOF],
    pub tcp_pose: [f64; DOF],
    /// Last pose reference sequence number echoed by the controller
    pub reference_sequence: i32,
    pub reference_joints: [f64; DOF],
}

/// Command codes understood by the controller-side program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Command {
    None = 0,
    Stop = 1,
    Speed = 2,
    PoseReference = 3,
}

#[derive(Debug, Clone, Copy)]
struct ReferenceSlots {
    tcp_pose: Slot<[f64; DOF]>,
    sequence: Slot<i32>,
    joints: [Slot<f64>; DOF],
}

#[derive(Debug, Clone, Copy)]
struct OutputSlots {
    sequence: Slot<i32>,
    timestamp: Slot<f64>,
    q: Slot<[f64; DOF]>,
    qd: Slot<[f64; DOF]>,
    qdd: Slot<[f64; DOF]>,
    moment: Slot<[f64; DOF]>,
    reference: Option<ReferenceSlots>,
}

#[derive(Debug, Clone, Copy)]
struct InputSlots {
    recipe_id: u8,
    sequence: Slot<i32>,
    command: Slot<i32>,
    vector: [Slot<f64>; DOF],
}

struct Inner<T: Transport> {
    handler: RtdeHandler<T>,
    output: Option<OutputSlots>,
    input: Option<InputSlots>,
    state: RobotState,
    updated: bool,
    frames: u64,
    last_seqnr: i32,
}

struct Shared<T: Transport> {
    bottleneck: Mutex<Inner<T>>,
    cv: Condvar,
    transport: Arc<T>,
    running: AtomicBool,
    reference_bootstrapped: AtomicBool,
    sync: SyncConfig,
}

impl<T: Transport> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.bottleneck.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// One receive, decode and publish cycle
    fn receive_once(&self, buf: &mut [u8]) -> Result<()> {
        // Blocking read happens outside the lock
        let Received { len, timestamp_ns } = self.transport.receive(buf)?;

        {
            let mut inner = self.lock();
            inner.handler.parse_incoming_data(&buf[..len], timestamp_ns)?;
            publish(&mut inner)?;
        }
        self.cv.notify_all();
        Ok(())
    }

    fn run(&self) {
        debug!("RTDE receiver started");
        let mut buf = vec![0u8; BUFFER_SIZE];
        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.receive_once(&mut buf) {
                if e.is_transport() {
                    warn!("RTDE receive failed: {}", e);
                    thread::sleep(self.sync.receive_retry_delay());
                } else {
                    debug!("Dropped RTDE frame: {}", e);
                }
            }
        }
        debug!("RTDE receiver stopped");
    }

    /// Poll until the controller echoes `seq` (or anything newer)
    fn wait_for_reference_ack(&self, seq: i32) -> Result<()> {
        let mut inner = self.lock();
        for _ in 0..self.sync.ack_attempts {
            if acknowledges(inner.state.reference_sequence, seq) {
                return Ok(());
            }
            inner = self
                .cv
                .wait_timeout(inner, self.sync.ack_interval())
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        if acknowledges(inner.state.reference_sequence, seq) {
            return Ok(());
        }
        Err(RtdeError::Timeout(format!(
            "Pose reference {} not acknowledged after {} attempts (last echo {})",
            seq, self.sync.ack_attempts, inner.state.reference_sequence
        )))
    }
}

/// True if `echo` is `seq` or a later sequence number.
///
/// Sequence numbers wrap from `i32::MAX` to `i32::MIN`, so the order is
/// taken modulo 2^32.
fn acknowledges(echo: i32, seq: i32) -> bool {
    echo.wrapping_sub(seq) >= 0
}

fn now_us() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

/// Copy the freshly decoded output registers into a new snapshot
fn publish<T: Transport>(inner: &mut Inner<T>) -> Result<()> {
    let slots = inner
        .output
        .ok_or_else(|| RtdeError::Precondition("init_output() not completed".to_string()))?;
    let recipe = inner
        .handler
        .output_recipe()
        .ok_or_else(|| RtdeError::Precondition("No output recipe".to_string()))?;

    let received_at_us = match recipe.receive_timestamp() {
        Some(ns) if ns > 0 => (ns / 1_000) as i64,
        _ => now_us(),
    };
    let mut state = RobotState {
        received_at_us,
        timestamp: recipe.get(slots.timestamp)?,
        sequence: recipe.get(slots.sequence)?,
        joint_positions: recipe.get(slots.q)?,
        joint_velocities: recipe.get(slots.qd)?,
        joint_accelerations: recipe.get(slots.qdd)?,
        joint_torques: recipe.get(slots.moment)?,
        ..Default::default()
    };
    if let Some(reference) = slots.reference {
        state.tcp_pose = recipe.get(reference.tcp_pose)?;
        state.reference_sequence = recipe.get(reference.sequence)?;
        for (joint, slot) in state.reference_joints.iter_mut().zip(reference.joints) {
            *joint = recipe.get(slot)?;
        }
    }

    inner.state = state;
    inner.updated = true;
    inner.frames += 1;
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_round_robin(priority: i32) -> Result<()> {
    // SAFETY: sched_param is plain data; zeroed is a valid value on every libc
    let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
    param.sched_priority = priority;
    // SAFETY: pid 0 is the calling thread and param outlives the call
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_RR, &param) };
    if rc != 0 {
        return Err(RtdeError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_round_robin(_priority: i32) -> Result<()> {
    Err(RtdeError::Precondition(
        "Round-robin scheduling is only available on Linux".to_string(),
    ))
}

/// State synchronizer for one robot
pub struct Robot<T: Transport + 'static> {
    shared: Arc<Shared<T>>,
    frequency: f64,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl Robot<TcpTransport> {
    /// Connect over TCP and negotiate the protocol version
    pub fn connect(config: &Config) -> Result<Self> {
        let robot = &config.robot;
        let mut handler =
            RtdeHandler::new(TcpTransport::new(&robot.host, robot.port, robot.nodelay));
        handler.connect()?;
        handler.negotiate_version()?;
        Ok(Self::new(handler, config))
    }
}

impl<T: Transport + 'static> Robot<T> {
    pub fn new(handler: RtdeHandler<T>, config: &Config) -> Self {
        let transport = Arc::clone(handler.transport());
        Self {
            shared: Arc::new(Shared {
                bottleneck: Mutex::new(Inner {
                    handler,
                    output: None,
                    input: None,
                    state: RobotState::default(),
                    updated: false,
                    frames: 0,
                    last_seqnr: 0,
                }),
                cv: Condvar::new(),
                transport,
                running: AtomicBool::new(false),
                reference_bootstrapped: AtomicBool::new(false),
                sync: config.sync.clone(),
            }),
            frequency: config.robot.frequency,
            receiver: Mutex::new(None),
        }
    }

    pub fn sync_config(&self) -> &SyncConfig {
        &self.shared.sync
    }

    /// Register the output recipe that feeds [`RobotState`]
    pub fn init_output(&self) -> Result<()> {
        let mut inner = self.shared.lock();
        if inner.output.is_some() {
            warn!("init_output() already completed");
            return Ok(());
        }
        if !inner.handler.is_connected() {
            return Err(RtdeError::Connection("Not connected".to_string()));
        }

        let mut recipe = Recipe::output(self.frequency)?;
        let sequence = recipe.add_field("output_int_register_0")?;
        let timestamp = recipe.add_field("timestamp")?;
        let q = recipe.add_field("target_q")?;
        let qd = recipe.add_field("target_qd")?;
        let qdd = recipe.add_field("target_qdd")?;
        let moment = recipe.add_field("target_moment")?;

        let reference = if self.shared.sync.reference_tracking {
            let tcp_pose = recipe.add_field("target_TCP_pose")?;
            let sequence = recipe.add_field("output_int_register_1")?;
            let mut joints: Vec<Slot<f64>> = Vec::with_capacity(DOF);
            for i in 0..DOF {
                joints.push(recipe.add_field(&format!("output_double_register_{}", i))?);
            }
            let joints: [Slot<f64>; DOF] = joints
                .try_into()
                .map_err(|_| RtdeError::Precondition("Reference joint count".to_string()))?;
            Some(ReferenceSlots { tcp_pose, sequence, joints })
        } else {
            None
        };
        recipe.track_receive_timestamp();

        inner.handler.register_recipe(recipe)?;
        inner.output = Some(OutputSlots { sequence, timestamp, q, qd, qdd, moment, reference });
        Ok(())
    }

    /// Register the command recipe used by the `submit_*` calls
    pub fn init_input(&self) -> Result<()> {
        let mut inner = self.shared.lock();
        if inner.input.is_some() {
            warn!("init_input() already completed");
            return Ok(());
        }

        let mut recipe = Recipe::input();
        let sequence = recipe.add_field("input_int_register_0")?;
        let command = recipe.add_field("input_int_register_1")?;
        let mut vector: Vec<Slot<f64>> = Vec::with_capacity(DOF);
        for i in 0..DOF {
            vector.push(recipe.add_field(&format!("input_double_register_{}", i))?);
        }
        let vector: [Slot<f64>; DOF] = vector
            .try_into()
            .map_err(|_| RtdeError::Precondition("Command vector length".to_string()))?;

        let recipe_id = inner.handler.register_recipe(recipe).map_err(|e| {
            error!("Failed registering input recipe: {}", e);
            e
        })?;
        inner.input = Some(InputSlots { recipe_id, sequence, command, vector });
        Ok(())
    }

    pub fn init(&self) -> Result<()> {
        self.init_output()?;
        self.init_input()
    }

    /// Controller software version; only while not streaming
    pub fn controller_version(&self) -> Result<ControllerVersion> {
        if self.running() {
            return Err(RtdeError::Precondition(
                "Cannot query the controller version while streaming".to_string(),
            ));
        }
        self.shared.lock().handler.controller_version()
    }

    pub fn send_text_message(&self, message: &str, level: MessageLevel) -> Result<()> {
        self.shared.lock().handler.send_text_message(message, level)
    }

    /// Receive and publish a single frame on the calling thread
    pub fn receive(&self) -> Result<()> {
        let mut buf = vec![0u8; BUFFER_SIZE];
        self.shared.receive_once(&mut buf)
    }

    /// Latest snapshot.
    ///
    /// With `blocking` set, waits up to the configured state timeout for a
    /// frame newer than the last call. On timeout the previous snapshot is
    /// returned as is.
    pub fn state(&self, blocking: bool) -> RobotState {
        let mut inner = self.shared.lock();
        if blocking && !inner.updated {
            let (guard, result) = self
                .shared
                .cv
                .wait_timeout_while(inner, self.shared.sync.state_timeout(), |i| !i.updated)
                .unwrap_or_else(|e| e.into_inner());
            inner = guard;
            if result.timed_out() {
                debug!("No state update within {:?}", self.shared.sync.state_timeout());
                return inner.state;
            }
        }
        inner.updated = false;
        inner.state
    }

    /// True if a frame arrived since the last `state()` call
    pub fn updated_state(&self) -> bool {
        self.shared.lock().updated
    }

    fn submit(&self, command: Command, vector: Option<&[f64]>) -> Result<i32> {
        if let Some(v) = vector {
            if v.len() != DOF {
                return Err(RtdeError::Precondition(format!(
                    "Command vector has {} elements, expected {}",
                    v.len(),
                    DOF
                )));
            }
        }

        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        let slots = inner
            .input
            .ok_or_else(|| RtdeError::Precondition("init_input() not completed".to_string()))?;
        let recipe = inner.handler.input_recipe_mut(slots.recipe_id).ok_or_else(|| {
            RtdeError::Precondition(format!("Input recipe {} missing", slots.recipe_id))
        })?;

        // The registers stay bound to the recipe, so copy element-wise
        if let Some(v) = vector {
            for (slot, value) in slots.vector.iter().zip(v) {
                recipe.set(*slot, *value)?;
            }
        }
        // Wraps after i32::MAX; acknowledgement compares modulo 2^32
        let seq = inner.last_seqnr.wrapping_add(1);
        inner.last_seqnr = seq;
        recipe.set(slots.sequence, seq)?;
        recipe.set(slots.command, command as i32)?;

        let sent = inner.handler.send_command(slots.recipe_id);

        // Never leave a command armed for the next unrelated send
        if let Some(recipe) = inner.handler.input_recipe_mut(slots.recipe_id) {
            recipe.set(slots.command, Command::None as i32)?;
        }
        sent.map_err(|e| {
            error!("Sending {:?} command {} failed: {}", command, seq, e);
            e
        })?;
        Ok(seq)
    }

    /// Joint speeds in rad/s, one per joint
    pub fn submit_speed_command(&self, speeds: &[f64]) -> Result<i32> {
        self.submit(Command::Speed, Some(speeds))
    }

    pub fn submit_stop_command(&self) -> Result<i32> {
        self.submit(Command::Stop, None)
    }

    /// Send a joint pose reference and track its acknowledgement.
    ///
    /// The first reference waits for the controller's echo before
    /// returning. Later ones are acknowledged in the background and only
    /// logged if the echo never shows up.
    pub fn submit_pose_reference_command(&self, pose: &[f64]) -> Result<i32> {
        let seq = self.submit(Command::PoseReference, Some(pose))?;
        if !self.shared.sync.reference_tracking {
            return Ok(seq);
        }

        if !self.shared.reference_bootstrapped.load(Ordering::SeqCst) {
            self.shared.wait_for_reference_ack(seq)?;
            self.shared.reference_bootstrapped.store(true, Ordering::SeqCst);
            debug!("Pose reference tracking bootstrapped at {}", seq);
            return Ok(seq);
        }

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("rtde-ack-{}", seq))
            .spawn(move || {
                if let Err(e) = shared.wait_for_reference_ack(seq) {
                    warn!("{}", e);
                }
            });
        // The command is already on the wire; only the tracking is lost
        if let Err(e) = spawned {
            error!("Not tracking pose reference {}: {}", seq, e);
        }
        Ok(seq)
    }

    pub fn running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Start streaming and the receiver thread, then wait for the first frame
    pub fn start(&self) -> Result<()> {
        self.start_receiver()
    }

    /// Like [`Robot::start`], after switching the calling thread to
    /// round-robin scheduling at `priority`. The receiver thread inherits it.
    pub fn start_realtime(&self, priority: i32) -> Result<()> {
        if self.running() {
            return Err(RtdeError::Precondition("Already running".to_string()));
        }
        set_round_robin(priority)?;
        info!("Using SCHED_RR at priority {}", priority);
        self.start_receiver()
    }

    fn start_receiver(&self) -> Result<()> {
        if self.running() {
            return Err(RtdeError::Precondition("Already running".to_string()));
        }

        let frames_before = {
            let mut inner = self.shared.lock();
            if inner.output.is_none() {
                return Err(RtdeError::Precondition("init_output() not completed".to_string()));
            }
            inner.handler.start_streaming()?;
            inner.frames
        };

        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("rtde-receiver".to_string())
            .spawn(move || shared.run())
            .map_err(|e| {
                self.shared.running.store(false, Ordering::SeqCst);
                RtdeError::Io(e)
            })?;
        *self.receiver.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        let inner = self.shared.lock();
        let (_inner, result) = self
            .shared
            .cv
            .wait_timeout_while(inner, self.shared.sync.start_timeout(), |i| {
                i.frames == frames_before
            })
            .unwrap_or_else(|e| e.into_inner());
        if result.timed_out() {
            error!("No state received within {:?} of start", self.shared.sync.start_timeout());
            return Err(RtdeError::Timeout("Waiting for the first state update".to_string()));
        }
        Ok(())
    }

    /// Stop the receiver thread and pause the stream.
    ///
    /// Fails without side effects if the robot is not running.
    pub fn stop(&self) -> Result<()> {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return Err(RtdeError::Precondition("Not running".to_string()));
        }

        let handle = self.receiver.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("RTDE receiver thread panicked");
            }
        }
        self.shared.lock().handler.stop_streaming()
    }

    /// Wait up to `timeout` for the next snapshot
    pub fn wait_for_update(&self, timeout: Duration) -> Option<RobotState> {
        let inner = self.shared.lock();
        let (mut inner, result) = self
            .shared
            .cv
            .wait_timeout_while(inner, timeout, |i| !i.updated)
            .unwrap_or_else(|e| e.into_inner());
        if result.timed_out() {
            return None;
        }
        inner.updated = false;
        Some(inner.state)
    }
}

impl<T: Transport + 'static> Drop for Robot<T> {
    fn drop(&mut self) {
        if self.running() {
            if let Err(e) = self.stop() {
                warn!("Failed to stop robot cleanly: {}", e);
            }
        }
    }
}
