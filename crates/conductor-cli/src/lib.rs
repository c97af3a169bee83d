//! Conductor CLI library: engine bootstrap and command implementations,
//! shared by the `conductor` binary and the integration tests.

pub mod app;
pub mod commands;
