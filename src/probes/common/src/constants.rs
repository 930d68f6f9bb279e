//! Shared constants for the tcpwatch probes
//!
//! Used by both the kernel program and userspace so the two sides never
//! disagree on wire values or limits.

use core::net::Ipv4Addr;

// ============================================================================
// Offset guessing
// ============================================================================

/// Upper bound for every candidate offset except the source port.
///
/// All guessed fields live inside `struct sock` well below this; crossing it
/// means the search is chasing a field that is not where we think it is.
pub const OFFSET_THRESHOLD: u64 = 200;

/// Upper bound for the source-port candidate offset.
///
/// `inet_sport` sits deeper inside `struct inet_sock` than the
/// `sock_common` fields, so its search gets more room.
pub const SPORT_OFFSET_THRESHOLD: u64 = 2000;

/// Loopback address the guessing listener binds to. Connecting to it from
/// an unbound socket yields the known 5-tuple 127.0.0.1 -> 127.0.0.2.
pub const GUESS_LISTEN_IP: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 2);

/// Destination port for the IPv6 guessing stimulus. Fixed and unlistened;
/// the connection is expected to fail and only the connect entry matters.
pub const GUESS_IPV6_PORT: u16 = 9092;

/// `AF_INET` on Linux.
pub const AF_INET: u16 = 2;

/// `AF_INET6` on Linux.
pub const AF_INET6: u16 = 10;

// ============================================================================
// BPF map sizing
// ============================================================================

/// The control record map holds exactly one record, at key 0.
pub const STATUS_MAP_ENTRIES: u32 = 1;

/// Key of the single control record.
pub const STATUS_KEY: u64 = 0;

/// In-flight `connect(2)` calls tracked between entry and return probes.
pub const MAX_IN_FLIGHT_CONNECTS: u32 = 1024;

// ============================================================================
// Event types (TcpEventV4/V6.kind)
// ============================================================================

/// Outbound connection established (`tcp_v4_connect`/`tcp_v6_connect`).
pub const EVENT_CONNECT: u32 = 1;

/// Inbound connection accepted (`inet_csk_accept`).
pub const EVENT_ACCEPT: u32 = 2;

/// Connection closed (`tcp_close`).
pub const EVENT_CLOSE: u32 = 3;
