//! Soak (sustained load) tests.
//!
//! Several clients hammer one server for a fixed duration, each writing
//! its own block of registers with Write Multiple Registers and reading it
//! back. Every read must return exactly what that client last wrote.
//!
//! # Acceptance Criteria
//!
//! - No mismatched reads and no transport errors
//! - Server counters agree with the number of requests sent
//! - Memory usage stable (no growth > 4MB over the run)

use super::common::{frame, get_memory_usage, start_from_toml, RawClient};
use std::thread;
use std::time::{Duration, Instant};

/// Configuration for soak tests.
pub struct SoakConfig {
    /// Test duration.
    pub duration: Duration,
    /// Number of concurrent clients.
    pub clients: u16,
    /// Registers owned by each client.
    pub block_size: u16,
    /// Maximum allowed memory growth over the run (bytes).
    pub max_memory_growth: u64,
}

impl SoakConfig {
    /// Short run (2 seconds), cheap enough for every test pass.
    pub fn short() -> Self {
        Self {
            duration: Duration::from_secs(2),
            clients: 8,
            block_size: 16,
            max_memory_growth: 4 * 1024 * 1024,
        }
    }

    /// Medium run (5 minutes).
    pub fn medium() -> Self {
        Self {
            duration: Duration::from_secs(300),
            clients: 32,
            block_size: 64,
            ..Self::short()
        }
    }

    /// Long run (1 hour).
    pub fn long() -> Self {
        Self {
            duration: Duration::from_secs(3600),
            ..Self::medium()
        }
    }
}

/// Per-client results.
#[derive(Debug, Clone, Copy, Default)]
struct ClientResult {
    requests: u64,
    mismatches: u64,
}

/// Outcome of a soak run.
#[derive(Debug, Clone)]
pub struct SoakResult {
    /// Wall time of the run.
    pub duration: Duration,
    /// Requests sent by all clients.
    pub requests: u64,
    /// Reads that did not return the last written block.
    pub mismatches: u64,
    /// Requests the server reports having answered.
    pub server_requests: u64,
    /// RSS growth over the run in bytes.
    pub memory_growth: u64,
    /// Whether the run met the acceptance criteria.
    pub passed: bool,
}

fn client_loop(addr: std::net::SocketAddr, index: u16, block_size: u16, until: Instant) -> ClientResult {
    let mut client = RawClient::connect(addr);
    let start = index * block_size;
    let mut result = ClientResult::default();
    let mut round: u16 = 0;

    while Instant::now() < until {
        let values: Vec<u16> = (0..block_size)
            .map(|i| index.wrapping_mul(1000).wrapping_add(round).wrapping_add(i))
            .collect();

        let mut pdu = vec![0x10];
        pdu.extend_from_slice(&start.to_be_bytes());
        pdu.extend_from_slice(&block_size.to_be_bytes());
        pdu.push(u8::try_from(block_size * 2).expect("block fits one request"));
        for value in &values {
            pdu.extend_from_slice(&value.to_be_bytes());
        }
        let reply = client.transact(&frame(round, 0x01, &pdu));
        assert_eq!(reply[7], 0x10, "write rejected: {reply:?}");

        let mut read = vec![0x03];
        read.extend_from_slice(&start.to_be_bytes());
        read.extend_from_slice(&block_size.to_be_bytes());
        let reply = client.transact(&frame(round, 0x01, &read));
        let returned: Vec<u16> = reply[9..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        if returned != values {
            result.mismatches += 1;
        }

        result.requests += 2;
        round = round.wrapping_add(1);
    }

    result
}

/// Run a soak test with the given configuration.
pub fn run_soak_test(config: &SoakConfig) -> SoakResult {
    let registers = u32::from(config.clients) * u32::from(config.block_size);
    let mut server = start_from_toml(&format!("max_sessions = 0\n[registers]\nsize = {registers}"));
    let addr = server.local_addr().expect("server is bound");

    println!("Starting soak test...");
    println!("  Duration: {:?}", config.duration);
    println!("  Clients: {} x {} registers", config.clients, config.block_size);

    let initial_memory = get_memory_usage();
    let test_start = Instant::now();
    let until = test_start + config.duration;
    let block_size = config.block_size;

    let handles: Vec<_> = (0..config.clients)
        .map(|index| thread::spawn(move || client_loop(addr, index, block_size, until)))
        .collect();

    let mut totals = ClientResult::default();
    for handle in handles {
        let result = handle.join().expect("client thread panicked");
        totals.requests += result.requests;
        totals.mismatches += result.mismatches;
    }

    let duration = test_start.elapsed();
    server.shutdown();
    let stats = server.stats();
    let memory_growth = get_memory_usage().saturating_sub(initial_memory);

    let passed = totals.mismatches == 0
        && stats.requests == totals.requests
        && stats.exceptions == 0
        && memory_growth <= config.max_memory_growth;

    println!("\nSoak test completed:");
    println!("  Duration: {duration:?}");
    println!("  Requests: {} ({:.0}/s)", totals.requests, totals.requests as f64 / duration.as_secs_f64());
    println!("  Mismatches: {}", totals.mismatches);
    println!("  Memory growth: {:.1}KB", memory_growth as f64 / 1024.0);
    println!("  Result: {}", if passed { "PASSED" } else { "FAILED" });

    SoakResult {
        duration,
        requests: totals.requests,
        mismatches: totals.mismatches,
        server_requests: stats.requests,
        memory_growth,
        passed,
    }
}

#[test]
fn test_soak_short() {
    let result = run_soak_test(&SoakConfig::short());
    assert!(result.requests > 0);
    assert_eq!(result.mismatches, 0);
    assert_eq!(result.server_requests, result.requests);
}

#[test]
#[ignore = "Soak test - takes 5 minutes"]
fn test_soak_medium() {
    let result = run_soak_test(&SoakConfig::medium());
    assert!(result.passed, "soak test failed: {result:?}");
}

#[test]
#[ignore = "Soak test - takes 1 hour"]
fn test_soak_long() {
    let result = run_soak_test(&SoakConfig::long());
    assert!(result.passed, "soak test failed: {result:?}");
}
