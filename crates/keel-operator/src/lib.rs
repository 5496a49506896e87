//! keel operator - command line and controller wiring

pub mod cli;
pub mod controller_runner;
