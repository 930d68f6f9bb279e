//! tcpwatch userspace library
//!
//! Loads the kernel program, discovers the `struct sock` offsets it needs
//! at runtime, and streams decoded connection lifecycle events.

pub mod events;
pub mod loader;
pub mod offsetguess;
pub mod stimulus;
pub mod types;

pub use loader::ProbeLoader;
pub use offsetguess::{guess, BpfStatusChannel, GuessConfig, GuessError};
pub use types::{EventType, TcpEvent};
