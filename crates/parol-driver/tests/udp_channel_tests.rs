//! UDP Command Channel tests
//!
//! A fake headless controller on a loopback socket answers the text
//! protocol; the real `UdpTransport` talks to it.

use parol_driver::{
    ChannelConfig, CommandChannel, ControllerSupervisor, DriverError, Owner, SupervisorConfig,
    SupervisorState, UdpTransport,
};
use parol_protocol::{Command, Direction, JointJog, Query, Response};
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

struct FakeController {
    port: u16,
    received: Arc<Mutex<Vec<String>>>,
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl FakeController {
    fn start() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        let port = socket.local_addr().unwrap().port();
        let received = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let received = received.clone();
            let running = running.clone();
            thread::spawn(move || {
                let mut buf = [0u8; 4096];
                let mut loops = 0u64;
                while running.load(Ordering::Relaxed) {
                    let Ok((n, peer)) = socket.recv_from(&mut buf) else {
                        continue;
                    };
                    let text = String::from_utf8_lossy(&buf[..n]).trim().to_string();
                    received.lock().unwrap().push(text.clone());
                    loops += 50;
                    let reply = match text.as_str() {
                        "PING" => Some("PONG".to_string()),
                        "GET_STATUS" => Some(
                            "STATUS|ANGLES=0,-90,180,0,0,180|IO=1,1,0,0,1".to_string(),
                        ),
                        "GET_LOOP_STATS" => Some(format!("LOOP_STATS|{{\"loop_count\":{loops}}}")),
                        _ => None,
                    };
                    if let Some(reply) = reply {
                        let _ = socket.send_to(reply.as_bytes(), peer);
                    }
                }
            })
        };

        Self {
            port,
            received,
            running,
            handle: Some(handle),
        }
    }

    fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

impl Drop for FakeController {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn channel_to(port: u16) -> CommandChannel {
    let transport = UdpTransport::connect("127.0.0.1", port).unwrap();
    CommandChannel::new(
        transport,
        ChannelConfig {
            query_timeout: Duration::from_millis(200),
            retries: 1,
        },
    )
}

#[test]
fn test_queries_over_udp() {
    let fake = FakeController::start();
    let channel = channel_to(fake.port);

    assert!(channel.probe().is_ok());
    match channel.query(Owner::Stream, Query::Status).unwrap() {
        Response::Status(t) => {
            assert_eq!(t.joint_angles.unwrap()[1], -90.0);
            assert!(t.io.unwrap().estop);
            assert!(t.pose.is_none());
        },
        other => panic!("unexpected {other:?}"),
    }
    match channel.query(Owner::Stream, Query::LoopStats).unwrap() {
        Response::LoopStats(stats) => assert!(stats.loop_count().unwrap() > 0),
        other => panic!("unexpected {other:?}"),
    }

    let health = channel.health().snapshot();
    assert_eq!(health.successes, 3);
    assert_eq!(health.consecutive_failures, 0);
}

#[test]
fn test_commands_reach_controller() {
    let fake = FakeController::start();
    let channel = channel_to(fake.port);
    let jog = Command::Jog {
        jog: JointJog::new(2, Direction::Negative, 40),
        duration: Duration::from_millis(100),
    };
    channel.send(Owner::Stream, &jog).unwrap();
    channel.send(Owner::Stream, &Command::Stop).unwrap();
    // a query after the sends orders them on the controller side
    channel.probe().unwrap();

    let received = fake.received();
    assert_eq!(&received[..2], &["JOG|8|40|0.100|NONE", "STOP"]);
}

#[test]
fn test_program_lease_over_udp() {
    let fake = FakeController::start();
    let channel = channel_to(fake.port);
    let lease = channel.claim_program().unwrap();

    let err = channel.send(Owner::Stream, &Command::Home).unwrap_err();
    assert!(matches!(err, DriverError::NotOwner { .. }));
    lease.send(&Command::Home).unwrap();
    assert!(matches!(lease.query(Query::Ping).unwrap(), Response::Pong));
    drop(lease);

    channel.send(Owner::Stream, &Command::Enable).unwrap();
    channel.probe().unwrap();
    let received = fake.received();
    assert_eq!(received.iter().filter(|p| *p == "HOME").count(), 1);
    assert!(received.contains(&"ENABLE".to_string()));
}

#[test]
fn test_silent_endpoint_is_link_failure() {
    // bound but never answering
    let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = silent.local_addr().unwrap().port();
    let channel = channel_to(port);

    let err = channel.query(Owner::Stream, Query::Ping).unwrap_err();
    assert!(err.is_link_failure(), "{err:?}");
    assert!(channel.health().consecutive_failures() >= 1);
}

#[test]
fn test_supervisor_attaches_without_spawning() {
    let fake = FakeController::start();
    let channel = channel_to(fake.port);
    let supervisor = ControllerSupervisor::new(
        SupervisorConfig {
            port: fake.port,
            ..SupervisorConfig::default()
        },
        channel,
    );

    assert_eq!(supervisor.ensure().unwrap(), SupervisorState::Ready);
    assert_eq!(supervisor.ensure().unwrap(), SupervisorState::Ready);
    assert_eq!(supervisor.spawn_count(), 0);
    assert_eq!(supervisor.endpoint().pid, None);

    supervisor.shutdown().unwrap();
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    assert!(matches!(supervisor.ensure(), Err(DriverError::ShuttingDown)));
}
