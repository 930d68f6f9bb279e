//! tcpwatch kernel-space program
//!
//! Kprobes on the TCP connect, accept and close paths. Until the offset
//! guessing session completes, the connect return probes act as the
//! sampling side of the guessing protocol: they read socket memory at the
//! candidate offset userspace put in the control record and report what
//! they saw. Once the record is ready, the same probes decode sockets for
//! real and emit lifecycle events through the perf arrays.
//!
//! Built for the bpfel-unknown-none target:
//!
//! ```bash
//! cargo build --release --target=bpfel-unknown-none
//! ```

#![no_std]
#![no_main]

mod handlers;
mod helpers;
mod maps;
mod sock_sampler;

// Re-export the probe entry points so they are visible to the loader.
pub use handlers::{
    inet_csk_accept_ret, tcp_close, tcp_v4_connect, tcp_v4_connect_ret, tcp_v6_connect,
    tcp_v6_connect_ret,
};

pub use maps::{CONNECT_SOCK_V4, CONNECT_SOCK_V6, TCPWATCH_STATUS, TCP_EVENTS_V4, TCP_EVENTS_V6};

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    // eBPF programs cannot panic; the verifier rejects anything that
    // could reach this.
    loop {}
}
