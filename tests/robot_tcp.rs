//! Full session against a fake controller on a loopback socket

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use urx::catalog::lookup_type;
use urx::wire::{self, encode_value};
use urx::{Config, DataType, MessageLevel, Robot, Value, DOF};

const OUT_ID: u8 = 1;
const IN_ID: u8 = 2;

#[derive(Debug, Default)]
struct Session {
    /// (sequence, command code) of every data package received
    commands: Vec<(i32, i32)>,
    messages: Vec<String>,
    pauses: usize,
}

struct FakeController {
    port: u16,
    handle: JoinHandle<Session>,
}

fn frame(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut pkg = ((body.len() + 3) as u16).to_be_bytes().to_vec();
    pkg.push(tag);
    pkg.extend_from_slice(body);
    pkg
}

fn payload(names: &[String], seq: i32, echo: i32) -> Vec<u8> {
    let mut out = Vec::new();
    for name in names {
        let data_type = lookup_type(name);
        let value = match (name.as_str(), data_type) {
            ("output_int_register_0", _) => Value::I32(seq),
            ("output_int_register_1", _) => Value::I32(echo),
            ("timestamp", _) => Value::F64(seq as f64 * 0.008),
            (_, DataType::Vector6d) => {
                let mut v = [0.0; DOF];
                for (j, x) in v.iter_mut().enumerate() {
                    *x = j as f64 + seq as f64;
                }
                Value::Vector6d(v)
            }
            (_, DataType::Double) => Value::F64(0.25),
            (_, other) => Value::default_for(other).unwrap(),
        };
        let mut buf = vec![0u8; data_type.width()];
        encode_value(data_type, &value, &mut buf).unwrap();
        out.extend_from_slice(&buf);
    }
    out
}

fn read_package(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut header = [0u8; 3];
    stream.read_exact(&mut header).ok()?;
    let size = u16::from_be_bytes([header[0], header[1]]) as usize;
    let mut pkg = header.to_vec();
    pkg.resize(size, 0);
    stream.read_exact(&mut pkg[3..]).ok()?;
    Some(pkg)
}

impl FakeController {
    fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut reader, _) = listener.accept().unwrap();
            let writer = Arc::new(Mutex::new(reader.try_clone().unwrap()));
            let echo = Arc::new(AtomicI32::new(0));
            let streaming = Arc::new(AtomicBool::new(false));
            let mut streamer: Option<JoinHandle<()>> = None;
            let mut outputs: Vec<String> = Vec::new();
            let mut session = Session::default();

            let send = |pkg: Vec<u8>| {
                let _ = writer.lock().unwrap().write_all(&pkg);
            };

            while let Some(pkg) = read_package(&mut reader) {
                match pkg[2] {
                    b'V' => send(frame(b'V', &[1])),
                    b'v' => {
                        let mut body = Vec::new();
                        for v in [5u32, 12, 0, 1] {
                            body.extend_from_slice(&v.to_be_bytes());
                        }
                        send(frame(b'v', &body));
                    }
                    b'O' => {
                        let names = String::from_utf8(pkg[11..].to_vec()).unwrap();
                        outputs = names.split(',').map(str::to_string).collect();
                        let types: Vec<&str> =
                            outputs.iter().map(|n| lookup_type(n).wire_name()).collect();
                        let mut body = vec![OUT_ID];
                        body.extend_from_slice(types.join(",").as_bytes());
                        send(frame(b'O', &body));
                    }
                    b'I' => {
                        let names = String::from_utf8(pkg[3..].to_vec()).unwrap();
                        let types: Vec<&str> = names
                            .split(',')
                            .map(|n| urx::catalog::lookup_input_type(n).wire_name())
                            .collect();
                        let mut body = vec![IN_ID];
                        body.extend_from_slice(types.join(",").as_bytes());
                        send(frame(b'I', &body));
                    }
                    b'S' => {
                        send(frame(b'S', &[1]));
                        streaming.store(true, Ordering::SeqCst);
                        let writer = Arc::clone(&writer);
                        let echo = Arc::clone(&echo);
                        let streaming = Arc::clone(&streaming);
                        let names = outputs.clone();
                        streamer = Some(thread::spawn(move || {
                            let mut seq = 0;
                            while streaming.load(Ordering::SeqCst) {
                                seq += 1;
                                let mut body = vec![OUT_ID];
                                body.extend(payload(&names, seq, echo.load(Ordering::SeqCst)));
                                if writer.lock().unwrap().write_all(&frame(b'U', &body)).is_err() {
                                    break;
                                }
                                thread::sleep(Duration::from_millis(8));
                            }
                        }));
                    }
                    b'P' => {
                        streaming.store(false, Ordering::SeqCst);
                        if let Some(handle) = streamer.take() {
                            handle.join().unwrap();
                        }
                        session.pauses += 1;
                        send(frame(b'P', &[1]));
                    }
                    b'U' => {
                        assert_eq!(pkg[3], IN_ID);
                        let seq = i32::from_be_bytes([pkg[4], pkg[5], pkg[6], pkg[7]]);
                        let cmd = i32::from_be_bytes([pkg[8], pkg[9], pkg[10], pkg[11]]);
                        if cmd == 3 {
                            echo.store(seq, Ordering::SeqCst);
                        }
                        session.commands.push((seq, cmd));
                    }
                    b'M' => {
                        let msg = wire::parse_text_message(&pkg).unwrap();
                        session.messages.push(msg.message);
                    }
                    other => panic!("unexpected package type {}", other),
                }
            }

            streaming.store(false, Ordering::SeqCst);
            if let Some(handle) = streamer.take() {
                let _ = handle.join();
            }
            session
        });
        Self { port, handle }
    }

    fn finish(self) -> Session {
        self.handle.join().unwrap()
    }
}

fn config_for(port: u16) -> Config {
    let mut config = Config::with_host("127.0.0.1");
    config.robot.port = port;
    config.sync.reference_tracking = true;
    config.sync.start_timeout_ms = 1000;
    config.sync.ack_attempts = 250;
    config
}

#[test]
fn test_session_over_tcp() {
    let controller = FakeController::spawn();
    let robot = Robot::connect(&config_for(controller.port)).unwrap();

    let version = robot.controller_version().unwrap();
    assert_eq!((version.major, version.minor), (5, 12));

    robot.init().unwrap();
    robot.start().unwrap();
    assert!(robot.running());

    let first = robot.state(true);
    let second = robot.state(true);
    assert!(first.sequence >= 1);
    assert!(second.sequence >= first.sequence);
    assert!((second.timestamp - second.sequence as f64 * 0.008).abs() < 1e-9);
    for j in 0..DOF {
        assert!((second.joint_positions[j] - (j as f64 + second.sequence as f64)).abs() < 1e-9);
    }

    assert_eq!(robot.submit_speed_command(&[0.1; DOF]).unwrap(), 1);
    assert_eq!(robot.submit_pose_reference_command(&[0.2; DOF]).unwrap(), 2);
    assert!(robot.state(true).reference_sequence >= 2);
    assert_eq!(robot.submit_stop_command().unwrap(), 3);
    robot
        .send_text_message("hello from urx", MessageLevel::Info)
        .unwrap();

    robot.stop().unwrap();
    assert!(!robot.running());
    assert!(robot.stop().is_err());
    drop(robot);

    let session = controller.finish();
    assert_eq!(session.commands, vec![(1, 2), (2, 3), (3, 1)]);
    assert_eq!(session.messages, vec!["hello from urx".to_string()]);
    assert_eq!(session.pauses, 1);
}

#[test]
fn test_connect_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let err = Robot::connect(&config_for(port)).err().unwrap();
    assert!(err.is_transport());
}
