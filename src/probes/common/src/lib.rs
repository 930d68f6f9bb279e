//! Shared types for the tcpwatch probes
//!
//! Everything whose byte layout is part of the contract between the kernel
//! eBPF program and userspace lives here: the offset-guessing control
//! record, the guessing enums, the event records, and the constants both
//! sides agree on.

#![no_std]

pub mod constants;
pub mod types;

pub use constants::*;
pub use types::{GuessPhase, TcpEventV4, TcpEventV6, TracerState, TracerStatus};
