//! Tests for the handler shipped with `ctlframed`.

use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use ctlframe::control::{ControlHandler, CMD_PASS_FD, CMD_RESTART, CMD_STOP};
use ctlframe::framing::encode_request;
use ctlframe::{sys, ExitReason, Server, ServerConfig};

fn start(dir: &tempfile::TempDir) -> Server<ControlHandler> {
    let config = ServerConfig {
        socket_path: dir.path().join("ctl.sock"),
        select_timeout_ms: 20,
        ..ServerConfig::default()
    };
    Server::bind(config, ControlHandler::new()).unwrap()
}

fn connect(server: &Server<ControlHandler>) -> UnixStream {
    let client = UnixStream::connect(&server.state().config().socket_path).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    sys::send_with_fds(client.as_raw_fd(), &[0; 4], &[]).unwrap();
    client
}

fn status(client: &mut UnixStream) -> i16 {
    let mut buf = [0u8; 8];
    client.read_exact(&mut buf).unwrap();
    i16::from_le_bytes([buf[6], buf[7]])
}

#[test]
fn stop_replies_then_shuts_down() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = start(&dir);
    let mut client = connect(&server);
    client.write_all(&encode_request(CMD_STOP, b"")).unwrap();

    assert_eq!(server.run().unwrap(), ExitReason::Shutdown);
    assert_eq!(status(&mut client), 0);
    assert_eq!(server.handler().packets_handled(), 1);
}

#[test]
fn restart_request_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = start(&dir);
    let mut client = connect(&server);
    client.write_all(&encode_request(CMD_RESTART, b"")).unwrap();

    assert_eq!(server.run().unwrap(), ExitReason::Restart);
    assert!(server.state().is_restart_requested());
    assert_eq!(status(&mut client), 0);
}

#[test]
fn unknown_command_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = start(&dir);
    let mut client = connect(&server);
    client.write_all(&encode_request(42, b"")).unwrap();

    for _ in 0..3 {
        server.run_once().unwrap();
    }
    assert_eq!(status(&mut client), -32);
    assert_eq!(server.handler().packets_handled(), 0);
}

#[test]
fn passed_descriptors_are_released_on_next_command() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = start(&dir);
    let mut client = connect(&server);

    client.write_all(&encode_request(CMD_PASS_FD, b"")).unwrap();
    for _ in 0..3 {
        server.run_once().unwrap();
    }
    assert_eq!(status(&mut client), 0);

    let (a, _a_peer) = UnixStream::pair().unwrap();
    let (b, _b_peer) = UnixStream::pair().unwrap();
    sys::send_with_fds(client.as_raw_fd(), &[0; 4], &[a.as_raw_fd(), b.as_raw_fd()]).unwrap();
    client.write_all(&encode_request(CMD_STOP, b"")).unwrap();

    assert_eq!(server.run().unwrap(), ExitReason::Shutdown);
    assert_eq!(status(&mut client), 0);
    assert_eq!(server.handler().packets_handled(), 2);
}
