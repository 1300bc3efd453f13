//! Runtime integration tests.
//!
//! Every test runs real listeners on loopback TCP ports or unix sockets and
//! a real control channel in a temporary directory.
//! Run with: cargo test --test runtime_integration

mod common;
mod control;
mod echo;
mod routing;
mod tls;
