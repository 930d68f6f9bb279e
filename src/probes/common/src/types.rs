//! Structures shared between kernel and userspace
//!
//! These are repr(C) so both sides of the probe see the same byte layout.
//! The control record additionally carries explicit padding fields: its
//! layout is a wire contract, not something the compiler may rearrange.

/// Lifecycle states of the offset-guessing protocol.
///
/// Stored as the `state` word of [`TracerStatus`]. Userspace flips the
/// record to `Checking` before each stimulus; the kernel probe flips it to
/// `Checked` once it has sampled the candidate offset; userspace sets
/// `Ready` when every field is resolved.
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracerState {
    /// Freshly created map entry, nothing written yet.
    Uninitialized = 0,
    /// Waiting for the kernel probe to sample the current offset.
    Checking = 1,
    /// The kernel probe wrote a sample to be compared.
    Checked = 2,
    /// All offsets resolved; the probes can decode sockets.
    Ready = 3,
}

impl TracerState {
    pub const fn from_wire(v: u64) -> Option<Self> {
        match v {
            0 => Some(Self::Uninitialized),
            1 => Some(Self::Checking),
            2 => Some(Self::Checked),
            3 => Some(Self::Ready),
            _ => None,
        }
    }
}

/// The field whose offset is currently being searched.
///
/// Phases are visited strictly in declaration order. The order matters:
/// the source-port search is seeded from the resolved family offset
/// (`inet_sport` follows the address family inside `struct inet_sock`),
/// and the IPv6 destination is only exercised once the IPv4 fields are
/// known.
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum GuessPhase {
    Saddr = 0,
    Daddr = 1,
    Family = 2,
    Sport = 3,
    Dport = 4,
    Netns = 5,
    DaddrIpv6 = 6,
}

impl GuessPhase {
    pub const fn from_wire(v: u64) -> Option<Self> {
        match v {
            0 => Some(Self::Saddr),
            1 => Some(Self::Daddr),
            2 => Some(Self::Family),
            3 => Some(Self::Sport),
            4 => Some(Self::Dport),
            5 => Some(Self::Netns),
            6 => Some(Self::DaddrIpv6),
            _ => None,
        }
    }

    /// The phase searched after this one, or `None` for the last phase.
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Saddr => Some(Self::Daddr),
            Self::Daddr => Some(Self::Family),
            Self::Family => Some(Self::Sport),
            Self::Sport => Some(Self::Dport),
            Self::Dport => Some(Self::Netns),
            Self::Netns => Some(Self::DaddrIpv6),
            Self::DaddrIpv6 => None,
        }
    }
}

/// Offset-guessing control record, shared with the kernel program through
/// a single-entry BPF map.
///
/// Field order, widths and padding match the kernel side exactly; the
/// assertions below pin the layout. Multibyte fields are host byte order
/// except `sport`/`dport`, which the kernel holds in network byte order
/// inside `struct inet_sock` and which userspace therefore stores the
/// same way.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TracerStatus {
    /// [`TracerState`] wire value.
    pub state: u64,
    /// `(pid << 32) | tid` of the userspace thread driving the stimuli,
    /// matching `bpf_get_current_pid_tgid()`. The probe samples only when
    /// this matches, which keeps unrelated traffic out of the record.
    pub pid_tgid: u64,
    /// [`GuessPhase`] wire value.
    pub what: u64,
    /// Candidate byte offsets into `struct sock`.
    pub offset_saddr: u64,
    pub offset_daddr: u64,
    pub offset_sport: u64,
    pub offset_dport: u64,
    /// Offset of the netns pointer inside `struct sock`.
    pub offset_netns: u64,
    /// Offset of the inode number inside the structure reached through the
    /// netns pointer.
    pub offset_ino: u64,
    pub offset_family: u64,
    pub offset_daddr_ipv6: u64,
    /// Set to 1 by the kernel probe when the dereference at the candidate
    /// netns offset faulted. Consumed and cleared by userspace.
    pub err: u8,
    pub _pad0: [u8; 3],
    /// Scratch fields the probe samples into.
    pub saddr: u32,
    pub daddr: u32,
    pub sport: u16,
    pub dport: u16,
    pub netns: u32,
    pub family: u16,
    pub _pad1: [u8; 2],
    pub daddr_ipv6: [u32; 4],
}

impl TracerStatus {
    /// Record for the start of a guessing session: checking the first
    /// phase, every candidate offset at zero.
    pub fn initial(pid_tgid: u64) -> Self {
        Self {
            state: TracerState::Checking as u64,
            pid_tgid,
            what: GuessPhase::Saddr as u64,
            ..Self::default()
        }
    }

    pub fn state(&self) -> Option<TracerState> {
        TracerState::from_wire(self.state)
    }

    pub fn set_state(&mut self, state: TracerState) {
        self.state = state as u64;
    }

    pub fn phase(&self) -> Option<GuessPhase> {
        GuessPhase::from_wire(self.what)
    }

    pub fn set_phase(&mut self, phase: GuessPhase) {
        self.what = phase as u64;
    }
}

/// IPv4 connection lifecycle event sent from the kernel program.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct TcpEventV4 {
    /// Kernel timestamp (nanoseconds, `bpf_ktime_get_ns`).
    pub timestamp: u64,
    /// CPU the probe fired on.
    pub cpu: u64,
    /// Event type (see `EVENT_*` constants).
    pub kind: u32,
    /// Process that owns the socket.
    pub pid: u32,
    /// Task comm, NUL padded.
    pub comm: [u8; 16],
    /// Addresses as the kernel's little-endian in-memory value (the same
    /// raw bytes as network order, read as a native u32): `127.0.0.1` is
    /// `0x0100007F`.
    pub saddr: u32,
    pub daddr: u32,
    /// Ports in network byte order.
    pub sport: u16,
    pub dport: u16,
    /// Network namespace inode.
    pub netns: u32,
}

/// IPv6 connection lifecycle event sent from the kernel program.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct TcpEventV6 {
    pub timestamp: u64,
    pub cpu: u64,
    pub kind: u32,
    pub pid: u32,
    pub comm: [u8; 16],
    /// Addresses as four native words over the kernel's in-memory bytes.
    pub saddr: [u32; 4],
    pub daddr: [u32; 4],
    pub sport: u16,
    pub dport: u16,
    pub netns: u32,
}

// The control record layout is a wire contract; fail the build if the
// compiler ever disagrees with the kernel side's view of it.
const _: () = {
    use core::mem::{align_of, offset_of, size_of};

    assert!(size_of::<TracerStatus>() == 128);
    assert!(align_of::<TracerStatus>() == 8);
    assert!(offset_of!(TracerStatus, err) == 88);
    assert!(offset_of!(TracerStatus, saddr) == 92);
    assert!(offset_of!(TracerStatus, daddr_ipv6) == 112);

    assert!(size_of::<TcpEventV4>() == 56);
    assert!(size_of::<TcpEventV6>() == 80);
};

// Pod lets userspace read these out of BPF maps and perf buffers directly.
#[cfg(feature = "userspace")]
mod userspace_impls {
    use super::*;

    unsafe impl aya::Pod for TracerStatus {}
    unsafe impl aya::Pod for TcpEventV4 {}
    unsafe impl aya::Pod for TcpEventV6 {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    #[test]
    fn control_record_field_offsets() {
        assert_eq!(offset_of!(TracerStatus, state), 0);
        assert_eq!(offset_of!(TracerStatus, pid_tgid), 8);
        assert_eq!(offset_of!(TracerStatus, what), 16);
        assert_eq!(offset_of!(TracerStatus, offset_saddr), 24);
        assert_eq!(offset_of!(TracerStatus, offset_daddr), 32);
        assert_eq!(offset_of!(TracerStatus, offset_sport), 40);
        assert_eq!(offset_of!(TracerStatus, offset_dport), 48);
        assert_eq!(offset_of!(TracerStatus, offset_netns), 56);
        assert_eq!(offset_of!(TracerStatus, offset_ino), 64);
        assert_eq!(offset_of!(TracerStatus, offset_family), 72);
        assert_eq!(offset_of!(TracerStatus, offset_daddr_ipv6), 80);
        assert_eq!(offset_of!(TracerStatus, err), 88);
        assert_eq!(offset_of!(TracerStatus, saddr), 92);
        assert_eq!(offset_of!(TracerStatus, daddr), 96);
        assert_eq!(offset_of!(TracerStatus, sport), 100);
        assert_eq!(offset_of!(TracerStatus, dport), 102);
        assert_eq!(offset_of!(TracerStatus, netns), 104);
        assert_eq!(offset_of!(TracerStatus, family), 108);
        assert_eq!(offset_of!(TracerStatus, daddr_ipv6), 112);
    }

    #[test]
    fn wire_enums_round_trip() {
        for v in 0..=3u64 {
            assert_eq!(TracerState::from_wire(v).unwrap() as u64, v);
        }
        assert_eq!(TracerState::from_wire(4), None);

        for v in 0..=6u64 {
            assert_eq!(GuessPhase::from_wire(v).unwrap() as u64, v);
        }
        assert_eq!(GuessPhase::from_wire(7), None);
    }

    #[test]
    fn phase_order_is_fixed() {
        let mut order = [GuessPhase::Saddr; 7];
        let mut phase = GuessPhase::Saddr;
        let mut i = 1;
        while let Some(next) = phase.next() {
            order[i] = next;
            phase = next;
            i += 1;
        }
        assert_eq!(
            order,
            [
                GuessPhase::Saddr,
                GuessPhase::Daddr,
                GuessPhase::Family,
                GuessPhase::Sport,
                GuessPhase::Dport,
                GuessPhase::Netns,
                GuessPhase::DaddrIpv6,
            ]
        );
        assert_eq!(GuessPhase::DaddrIpv6.next(), None);
    }

    #[test]
    fn control_record_round_trips_through_raw_bytes() {
        let mut status = TracerStatus::initial(7 << 32 | 9);
        status.offset_family = 16;
        status.offset_sport = 44;
        status.sport = 0x1f90u16.to_be();
        status.err = 1;
        status.daddr_ipv6 = [1, 2, 3, 4];

        let bytes: [u8; 128] = unsafe { core::mem::transmute(status) };
        let back: TracerStatus = unsafe { core::mem::transmute(bytes) };
        assert_eq!(back, status);
    }

    #[test]
    fn initial_record_starts_at_saddr() {
        let status = TracerStatus::initial(42 << 32 | 43);
        assert_eq!(status.state(), Some(TracerState::Checking));
        assert_eq!(status.phase(), Some(GuessPhase::Saddr));
        assert_eq!(status.offset_saddr, 0);
        assert_eq!(status.offset_sport, 0);
        assert_eq!(status.pid_tgid, 42 << 32 | 43);
    }
}
