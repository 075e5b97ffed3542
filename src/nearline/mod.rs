//! Nearline (HSM) storage integration
//!
//! Only removal is handled here: building the backend command for a
//! location and running a batch of them with bounded concurrency.

pub mod hsm;
pub mod remove;
pub mod runner;

pub use hsm::{HsmConfig, HsmLocation, HsmSet};
pub use remove::{
    RemovalCoordinator, RemovalError, RemovalReply, RemovalResult, RemovalTarget, ReplyError,
};
pub use runner::{CommandRunner, ProcessRunner, SimulatedRunner};
