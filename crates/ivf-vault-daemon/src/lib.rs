//! `ivf-vault` daemon library: configuration, vault bootstrap and the
//! maintenance worker. The binary in `main.rs` is a thin clap front end.

pub mod bootstrap;
pub mod config;
pub mod worker;
