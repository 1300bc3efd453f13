//! rpcfleet - config-driven runtime for a fleet of gRPC apps.
//!
//! A single config file describes every app of the fleet: where it listens,
//! which services it serves and which it consumes. Each process starts as
//! one of those apps (or as a pure client), serves its services from
//! interface definitions compiled at runtime, connects to everything the
//! fleet offers, and takes part in a control channel through which
//! operators reload or stop any app.

pub mod catalog;
pub mod client;
pub mod codec;
pub mod config;
pub mod control;
pub mod runtime;
pub mod server;
pub mod service;
pub mod transport;
pub mod utils;

pub use client::{Clients, ServiceClient};
pub use config::Config;
pub use control::{Command, Reply, Role};
pub use runtime::{AppRuntime, RuntimeError};
pub use service::{HookError, ImplementationRegistry, RpcService, ServiceContext, ServiceFactory};
