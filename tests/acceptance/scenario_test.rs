//! End-to-end request scenarios.
//!
//! Each test starts a server from a configuration file and checks the
//! exact bytes a client sees.

use super::common::{frame, start_from_toml, wait_until, RawClient};
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_write_then_read_scenario() {
    let server = start_from_toml("[registers]\nsize = 10");
    let mut client = RawClient::connect(server.local_addr().unwrap());

    let write = frame(0x0001, 0x01, &[0x06, 0x00, 0x02, 0x12, 0x34]);
    assert_eq!(write.len(), 12);
    assert_eq!(client.transact(&write), write);
    assert_eq!(server.store().get(2), Some(0x1234));

    let reply = client.transact(&frame(0x0002, 0x01, &[0x03, 0x00, 0x02, 0x00, 0x01]));
    assert_eq!(&reply[..7], &[0x00, 0x02, 0x00, 0x00, 0x00, 0x05, 0x01]);
    assert_eq!(&reply[7..], &[0x03, 0x02, 0x12, 0x34]);
}

#[test]
fn test_read_past_end_scenario() {
    let server = start_from_toml("[registers]\nsize = 5");
    let mut client = RawClient::connect(server.local_addr().unwrap());

    let reply = client.transact(&frame(0x0003, 0x01, &[0x03, 0x00, 0x03, 0x00, 0x05]));
    assert_eq!(&reply[7..], &[0x83, 0x02]);
    assert_eq!(server.store().snapshot(), vec![0; 5]);
}

#[test]
fn test_preloaded_registers_served() {
    let server = start_from_toml(
        r#"
[registers]
size = 8

[[registers.preload]]
address = 4
values = [4660, 22136, 65535]
"#,
    );
    let mut client = RawClient::connect(server.local_addr().unwrap());

    let reply = client.transact(&frame(9, 0x11, &[0x03, 0x00, 0x03, 0x00, 0x04]));
    assert_eq!(
        &reply[7..],
        &[0x03, 0x08, 0x00, 0x00, 0x12, 0x34, 0x56, 0x78, 0xFF, 0xFF]
    );
}

#[test]
fn test_write_multiple_then_read_back() {
    let server = start_from_toml("[registers]\nsize = 300");
    let mut client = RawClient::connect(server.local_addr().unwrap());

    let values: Vec<u16> = (0..123).map(|i| 0x0100 + i).collect();
    let mut pdu = vec![0x10, 0x00, 0x64, 0x00, 123, 246];
    for value in &values {
        pdu.extend_from_slice(&value.to_be_bytes());
    }
    let reply = client.transact(&frame(0x7777, 0x02, &pdu));
    assert_eq!(
        reply,
        vec![0x77, 0x77, 0x00, 0x00, 0x00, 0x06, 0x02, 0x10, 0x00, 0x64, 0x00, 123]
    );

    assert_eq!(server.store().read_range(100, 123), Some(values));
    assert_eq!(server.store().get(99), Some(0));
    assert_eq!(server.store().get(223), Some(0));
}

#[test]
fn test_bare_exception_compat() {
    let server = start_from_toml("[registers]\nsize = 5\n[compat]\nbare_exception_frames = true");
    let mut client = RawClient::connect(server.local_addr().unwrap());

    client.send(&frame(0x0001, 0x09, &[0x2B, 0x0E, 0x01, 0x00]));
    assert_eq!(client.read_exact(3), vec![0x09, 0xAB, 0x01]);

    // Successful replies keep their MBAP prefix
    let reply = client.transact(&frame(0x0002, 0x09, &[0x03, 0x00, 0x00, 0x00, 0x01]));
    assert_eq!(reply.len(), 11);
}

#[test]
fn test_concurrent_clients_disjoint_writes() {
    const CLIENTS: u16 = 32;

    let server = start_from_toml("[registers]\nsize = 32");
    let addr = server.local_addr().unwrap();

    let handles: Vec<_> = (0..CLIENTS)
        .map(|n| {
            thread::spawn(move || {
                let mut client = RawClient::connect(addr);
                let value = (n + 1).wrapping_mul(0x0101).to_be_bytes();
                let request = frame(n, 0x01, &[0x06, 0x00, n.to_be_bytes()[1], value[0], value[1]]);
                assert_eq!(client.transact(&request), request);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for n in 0..CLIENTS {
        assert_eq!(
            server.store().get(usize::from(n)),
            Some((n + 1).wrapping_mul(0x0101))
        );
    }
    assert_eq!(server.stats().sessions_accepted, u64::from(CLIENTS));
}

#[test]
fn test_session_limit_from_config() {
    let server = start_from_toml("max_sessions = 2\n[registers]\nsize = 4");
    let addr = server.local_addr().unwrap();

    let mut kept: Vec<_> = (0..2).map(|_| RawClient::connect(addr)).collect();
    for client in &mut kept {
        let reply = client.transact(&frame(1, 0x01, &[0x03, 0x00, 0x00, 0x00, 0x01]));
        assert_eq!(&reply[7..], &[0x03, 0x02, 0x00, 0x00]);
    }

    let mut extra = RawClient::connect(addr);
    assert!(extra.closed_by_server());
    assert!(wait_until(Duration::from_secs(2), || server.stats().sessions_rejected == 1));
}

#[test]
fn test_stop_with_connected_clients() {
    let mut server = start_from_toml("[registers]\nsize = 4");
    let addr = server.local_addr().unwrap();

    let mut clients: Vec<_> = (0..8).map(|_| RawClient::connect(addr)).collect();
    assert!(wait_until(Duration::from_secs(2), || server.stats().sessions_active == 8));

    let started = Instant::now();
    server.shutdown();
    assert!(started.elapsed() < Duration::from_secs(1));

    for client in &mut clients {
        assert!(client.closed_by_server());
    }
    assert!(std::net::TcpStream::connect(addr).is_err());
}
