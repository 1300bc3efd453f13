//! Process-wide helpers shared by the runtime and the operator CLI.

pub mod bootstrap;
pub mod retry;
