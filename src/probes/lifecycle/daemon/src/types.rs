//! Userspace views of kernel events
//!
//! The kernel program ships raw repr(C) records through the perf buffers;
//! this module turns them into typed events with proper addresses and
//! host-order ports, ready for display or serialization.

use std::fmt;
use std::mem;

use serde::Serialize;
use thiserror::Error;

use tcpwatch_common::{TcpEventV4, TcpEventV6, EVENT_ACCEPT, EVENT_CLOSE, EVENT_CONNECT};

#[derive(Debug, Error)]
pub enum EventError {
    #[error("truncated event sample: {got} bytes, need {need}")]
    Truncated { got: usize, need: usize },

    #[error("unknown event type {0}")]
    UnknownKind(u32),
}

/// Connection lifecycle event types, in sync with the kernel program's
/// `EVENT_*` wire values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Connect,
    Accept,
    Close,
}

impl TryFrom<u32> for EventType {
    type Error = EventError;

    fn try_from(v: u32) -> Result<Self, EventError> {
        match v {
            EVENT_CONNECT => Ok(Self::Connect),
            EVENT_ACCEPT => Ok(Self::Accept),
            EVENT_CLOSE => Ok(Self::Close),
            other => Err(EventError::UnknownKind(other)),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connect => "connect",
            Self::Accept => "accept",
            Self::Close => "close",
        })
    }
}

/// A decoded connection lifecycle event.
#[derive(Clone, Debug, Serialize)]
pub struct TcpEvent {
    /// Kernel timestamp, nanoseconds since boot.
    pub timestamp_ns: u64,
    pub cpu: u64,
    pub kind: EventType,
    pub pid: u32,
    pub comm: String,
    pub saddr: std::net::IpAddr,
    pub daddr: std::net::IpAddr,
    pub sport: u16,
    pub dport: u16,
    pub netns: u32,
}

impl fmt::Display for TcpEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} pid={} comm={} netns={} {}:{} -> {}:{}",
            self.kind,
            self.pid,
            self.comm,
            self.netns,
            self.saddr,
            self.sport,
            self.daddr,
            self.dport,
        )
    }
}

impl TryFrom<TcpEventV4> for TcpEvent {
    type Error = EventError;

    fn try_from(raw: TcpEventV4) -> Result<Self, EventError> {
        Ok(Self {
            timestamp_ns: raw.timestamp,
            cpu: raw.cpu,
            kind: EventType::try_from(raw.kind)?,
            pid: raw.pid,
            comm: comm_str(&raw.comm),
            // Addresses arrive as the kernel's in-memory u32, i.e. the
            // network-order bytes read natively.
            saddr: std::net::Ipv4Addr::from(u32::from_be(raw.saddr)).into(),
            daddr: std::net::Ipv4Addr::from(u32::from_be(raw.daddr)).into(),
            sport: u16::from_be(raw.sport),
            dport: u16::from_be(raw.dport),
            netns: raw.netns,
        })
    }
}

impl TryFrom<TcpEventV6> for TcpEvent {
    type Error = EventError;

    fn try_from(raw: TcpEventV6) -> Result<Self, EventError> {
        Ok(Self {
            timestamp_ns: raw.timestamp,
            cpu: raw.cpu,
            kind: EventType::try_from(raw.kind)?,
            pid: raw.pid,
            comm: comm_str(&raw.comm),
            saddr: ipv6_from_words(raw.saddr).into(),
            daddr: ipv6_from_words(raw.daddr).into(),
            sport: u16::from_be(raw.sport),
            dport: u16::from_be(raw.dport),
            netns: raw.netns,
        })
    }
}

/// Decode a raw perf sample holding a [`TcpEventV4`].
pub fn decode_v4(buf: &[u8]) -> Result<TcpEvent, EventError> {
    read_raw::<TcpEventV4>(buf)?.try_into()
}

/// Decode a raw perf sample holding a [`TcpEventV6`].
pub fn decode_v6(buf: &[u8]) -> Result<TcpEvent, EventError> {
    read_raw::<TcpEventV6>(buf)?.try_into()
}

fn read_raw<T: Copy>(buf: &[u8]) -> Result<T, EventError> {
    let need = mem::size_of::<T>();
    if buf.len() < need {
        return Err(EventError::Truncated {
            got: buf.len(),
            need,
        });
    }
    Ok(unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const T) })
}

fn comm_str(comm: &[u8; 16]) -> String {
    let len = comm.iter().position(|&b| b == 0).unwrap_or(comm.len());
    String::from_utf8_lossy(&comm[..len]).into_owned()
}

/// The kernel holds an IPv6 address as 16 raw bytes; the probe reports
/// them as four native words. Reassemble in memory order.
fn ipv6_from_words(words: [u32; 4]) -> std::net::Ipv6Addr {
    let mut bytes = [0u8; 16];
    for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_ne_bytes());
    }
    std::net::Ipv6Addr::from(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn raw_v4() -> TcpEventV4 {
        let mut comm = [0u8; 16];
        comm[..4].copy_from_slice(b"curl");
        TcpEventV4 {
            timestamp: 1_000_000,
            cpu: 2,
            kind: EVENT_CONNECT,
            pid: 4242,
            comm,
            saddr: u32::from(Ipv4Addr::new(127, 0, 0, 1)).to_be(),
            daddr: u32::from(Ipv4Addr::new(127, 0, 0, 2)).to_be(),
            sport: 45678u16.to_be(),
            dport: 9091u16.to_be(),
            netns: 0xf000_0001,
        }
    }

    #[test]
    fn v4_event_decodes_to_host_view() {
        let event = TcpEvent::try_from(raw_v4()).unwrap();
        assert_eq!(event.kind, EventType::Connect);
        assert_eq!(event.comm, "curl");
        assert_eq!(event.saddr, IpAddr::from(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(event.daddr, IpAddr::from(Ipv4Addr::new(127, 0, 0, 2)));
        assert_eq!(event.sport, 45678);
        assert_eq!(event.dport, 9091);
    }

    #[test]
    fn raw_sample_bytes_decode() {
        let raw = raw_v4();
        let bytes = unsafe {
            std::slice::from_raw_parts(
                &raw as *const TcpEventV4 as *const u8,
                mem::size_of::<TcpEventV4>(),
            )
        };
        let event = decode_v4(bytes).unwrap();
        assert_eq!(event.pid, 4242);
        assert_eq!(event.dport, 9091);
    }

    #[test]
    fn truncated_sample_is_rejected() {
        let err = decode_v4(&[0u8; 8]).unwrap_err();
        assert!(matches!(err, EventError::Truncated { got: 8, .. }));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut raw = raw_v4();
        raw.kind = 99;
        assert!(matches!(
            TcpEvent::try_from(raw),
            Err(EventError::UnknownKind(99))
        ));
    }

    #[test]
    fn v6_words_reassemble_in_memory_order() {
        let words: [u32; 4] = [
            u32::from_ne_bytes([0xfe, 0x80, 0, 0]),
            0,
            0,
            u32::from_ne_bytes([0, 0, 0, 1]),
        ];
        let addr = ipv6_from_words(words);
        assert_eq!(addr.octets()[..2], [0xfe, 0x80]);
        assert_eq!(addr.octets()[15], 1);
    }

    #[test]
    fn display_is_one_line() {
        let event = TcpEvent::try_from(raw_v4()).unwrap();
        let line = event.to_string();
        assert!(line.starts_with("connect pid=4242 comm=curl"));
        assert!(line.contains("127.0.0.1:45678 -> 127.0.0.2:9091"));
    }
}
