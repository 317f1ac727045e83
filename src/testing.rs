//! Scripted in-memory transport and package builders for unit tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::transport::{Received, Transport};
use crate::{Result, RtdeError};

const RECEIVE_WAIT: Duration = Duration::from_millis(20);

type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

/// Transport that replays queued packages and records everything sent.
///
/// `receive` waits briefly for a package and fails with `Timeout` if none
/// shows up, so receiver threads keep spinning instead of hanging.
pub(crate) struct MockTransport {
    inbound: Mutex<VecDeque<Vec<u8>>>,
    available: Condvar,
    sent: Mutex<Vec<Vec<u8>>>,
    connected: AtomicBool,
    fail_send: AtomicBool,
    rx_timestamp: AtomicU64,
    responder: Mutex<Option<Responder>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            inbound: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            fail_send: AtomicBool::new(false),
            rx_timestamp: AtomicU64::new(0),
            responder: Mutex::new(None),
        }
    }

    pub fn connected() -> Self {
        let mock = Self::new();
        mock.connected.store(true, Ordering::SeqCst);
        mock
    }

    pub fn push(&self, package: Vec<u8>) {
        self.inbound.lock().unwrap().push_back(package);
        self.available.notify_all();
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_fail_send(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    /// Receive timestamp reported with every package, 0 means none
    pub fn set_rx_timestamp(&self, ns: u64) {
        self.rx_timestamp.store(ns, Ordering::SeqCst);
    }

    /// Run `f` on every sent package and queue whatever it returns
    pub fn respond_with<F>(&self, f: F)
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        *self.responder.lock().unwrap() = Some(Box::new(f));
    }
}

impl Transport for MockTransport {
    fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn send(&self, package: &[u8]) -> Result<usize> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(RtdeError::Connection("Not connected".to_string()));
        }
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(RtdeError::Connection("Injected send failure".to_string()));
        }
        self.sent.lock().unwrap().push(package.to_vec());

        let replies = match self.responder.lock().unwrap().as_mut() {
            Some(respond) => respond(package),
            None => Vec::new(),
        };
        for reply in replies {
            self.push(reply);
        }
        Ok(package.len())
    }

    fn receive(&self, buf: &mut [u8]) -> Result<Received> {
        let mut inbound = self.inbound.lock().unwrap();
        if inbound.is_empty() {
            inbound = self
                .available
                .wait_timeout_while(inbound, RECEIVE_WAIT, |q| q.is_empty())
                .unwrap()
                .0;
        }
        let package = inbound
            .pop_front()
            .ok_or_else(|| RtdeError::Timeout("No package queued".to_string()))?;
        buf[..package.len()].copy_from_slice(&package);

        let ts = self.rx_timestamp.load(Ordering::SeqCst);
        Ok(Received {
            len: package.len(),
            timestamp_ns: (ts != 0).then_some(ts),
        })
    }

    fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

fn with_header(tag: u8, body: &[u8]) -> Vec<u8> {
    let size = (body.len() + 3) as u16;
    let mut package = size.to_be_bytes().to_vec();
    package.push(tag);
    package.extend_from_slice(body);
    package
}

/// Setup reply assigning `recipe_id` with the given type names
pub(crate) fn setup_response(tag: u8, recipe_id: u8, types: &[&str]) -> Vec<u8> {
    let mut body = vec![recipe_id];
    body.extend_from_slice(types.join(",").as_bytes());
    with_header(tag, &body)
}

/// Four byte accept/refuse reply
pub(crate) fn accept_response(tag: u8, accepted: bool) -> Vec<u8> {
    with_header(tag, &[accepted as u8])
}

pub(crate) fn data_package(recipe_id: u8, payload: &[u8]) -> Vec<u8> {
    let mut body = vec![recipe_id];
    body.extend_from_slice(payload);
    with_header(b'U', &body)
}
