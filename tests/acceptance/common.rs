//! Common utilities for acceptance tests.
//!
//! Provides helpers for:
//! - Starting a server from a TOML configuration file
//! - Sending raw Modbus/TCP frames and reading replies
//! - Sampling process memory during long runs

#![allow(dead_code)]

use mbtcp_common::config::ResponderConfig;
use mbtcp_server::Server;
use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

/// Server settings shared by every acceptance test.
const BASE_CONFIG: &str = r#"
[server]
bind_address = "127.0.0.1"
port = 0
poll_interval = "20ms"
"#;

/// Start a server from `BASE_CONFIG` followed by `extra` TOML, loaded through a file.
///
/// Keys in `extra` before its first table header land in `[server]`.
pub fn start_from_toml(extra: &str) -> Server {
    let mut file = tempfile::NamedTempFile::new().expect("create temp config");
    write!(file, "{BASE_CONFIG}\n{extra}").expect("write temp config");

    let config = ResponderConfig::from_file(file.path()).expect("parse config");
    let mut server = Server::from_config(&config).expect("build server");
    server.start().expect("start server");
    server
}

/// Encode a request frame with protocol id 0.
pub fn frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let length = u16::try_from(pdu.len() + 1).expect("PDU too long");
    let mut bytes = Vec::with_capacity(7 + pdu.len());
    bytes.extend_from_slice(&transaction_id.to_be_bytes());
    bytes.extend_from_slice(&[0x00, 0x00]);
    bytes.extend_from_slice(&length.to_be_bytes());
    bytes.push(unit_id);
    bytes.extend_from_slice(pdu);
    bytes
}

/// Raw Modbus/TCP connection used by acceptance tests.
pub struct RawClient {
    stream: TcpStream,
}

impl RawClient {
    /// Connect to `addr` with 2 second I/O timeouts.
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect to server");
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("set read timeout");
        stream.set_nodelay(true).expect("set nodelay");
        Self { stream }
    }

    /// Write raw bytes.
    pub fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("send request");
    }

    /// Send `request` and read one MBAP-framed reply.
    pub fn transact(&mut self, request: &[u8]) -> Vec<u8> {
        self.send(request);
        self.read_frame()
    }

    /// Read one MBAP-framed reply.
    pub fn read_frame(&mut self) -> Vec<u8> {
        let mut reply = vec![0u8; 6];
        self.stream.read_exact(&mut reply).expect("read MBAP prefix");
        let length = usize::from(u16::from_be_bytes([reply[4], reply[5]]));
        reply.resize(6 + length, 0);
        self.stream.read_exact(&mut reply[6..]).expect("read MBAP body");
        reply
    }

    /// Read exactly `n` bytes.
    pub fn read_exact(&mut self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        self.stream.read_exact(&mut buf).expect("read reply");
        buf
    }

    /// True once the server has closed the connection.
    pub fn closed_by_server(&mut self) -> bool {
        let mut buf = [0u8; 1];
        matches!(self.stream.read(&mut buf), Ok(0))
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Get current memory usage (RSS) in bytes.
pub fn get_memory_usage() -> u64 {
    if let Ok(status) = fs::read_to_string("/proc/self/status") {
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("VmRSS:") {
                if let Some(kb) = rest.split_whitespace().next().and_then(|v| v.parse::<u64>().ok()) {
                    return kb * 1024;
                }
            }
        }
    }
    0
}
