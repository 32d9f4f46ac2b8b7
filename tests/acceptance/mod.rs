//! Integration tests for Modbus/TCP responder acceptance testing.
//!
//! The soak tests marked `#[ignore]` run for minutes to hours; run them
//! explicitly with `cargo test -- --ignored`.

mod common;
mod scenario_test;
mod soak_test;
