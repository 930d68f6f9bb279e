//! BPF map definitions
//!
//! The control record map is the shared state of the offset-guessing
//! protocol; the perf arrays carry lifecycle events once guessing is done.

use aya_ebpf::{
    macros::map,
    maps::{HashMap, PerfEventArray},
};
use tcpwatch_common::{
    TcpEventV4, TcpEventV6, TracerStatus, MAX_IN_FLIGHT_CONNECTS, STATUS_MAP_ENTRIES,
};

/// The offset-guessing control record, at key 0.
///
/// Userspace writes it between stimuli; the connect return probes write it
/// while a stimulus syscall from the guessing thread is in flight. The
/// strict alternation is what makes the shared record safe without locks.
#[map]
pub static TCPWATCH_STATUS: HashMap<u64, TracerStatus> =
    HashMap::with_max_entries(STATUS_MAP_ENTRIES, 0);

/// `struct sock *` captured at `tcp_v4_connect` entry, keyed by pid_tgid,
/// consumed by the matching return probe (which has no argument registers
/// left to read it from).
#[map]
pub static CONNECT_SOCK_V4: HashMap<u64, u64> =
    HashMap::with_max_entries(MAX_IN_FLIGHT_CONNECTS, 0);

/// Same for `tcp_v6_connect`.
#[map]
pub static CONNECT_SOCK_V6: HashMap<u64, u64> =
    HashMap::with_max_entries(MAX_IN_FLIGHT_CONNECTS, 0);

/// IPv4 lifecycle events to userspace.
#[map]
pub static TCP_EVENTS_V4: PerfEventArray<TcpEventV4> = PerfEventArray::new(0);

/// IPv6 lifecycle events to userspace.
#[map]
pub static TCP_EVENTS_V6: PerfEventArray<TcpEventV6> = PerfEventArray::new(0);
