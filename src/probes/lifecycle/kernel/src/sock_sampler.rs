//! Socket field reads at caller-supplied offsets
//!
//! The kernel's `struct sock` layout is unknown at build time; userspace
//! hands byte offsets over through the control record and we read exactly
//! there. `bpf_probe_read_kernel` keeps a wrong offset survivable: the
//! read fails instead of faulting the kernel.

use aya_ebpf::helpers::bpf_probe_read_kernel;
use tcpwatch_common::{GuessPhase, TracerState, TracerStatus};

/// `skc_v6_rcv_saddr` follows `skc_v6_daddr` in `struct sock_common`, so
/// the source address sits one in6_addr past the guessed destination.
const IPV6_SADDR_FROM_DADDR: u64 = 16;

/// Read a `T` at `base + offset` in kernel memory.
#[inline(always)]
pub unsafe fn read_at<T>(base: u64, offset: u64) -> Result<T, i64> {
    bpf_probe_read_kernel((base + offset) as *const T)
}

/// Chase the netns pointer at `offset_netns`, then read the inode number
/// at `offset_ino` inside the structure it points to.
#[inline(always)]
pub unsafe fn read_netns(sk: u64, status: &TracerStatus) -> Result<u32, i64> {
    let ns_ptr: u64 = read_at(sk, status.offset_netns)?;
    read_at(ns_ptr, status.offset_ino)
}

/// Service one guessing request: sample the current phase's field at its
/// candidate offset into the record and mark the record checked.
///
/// A failed read leaves the previous sample in place; userspace sees a
/// mismatch and advances the offset, which is exactly right. The netns
/// pointer chase is the exception: its failure is reported through `err`
/// so userspace can move the outer offset instead of the inner one.
#[inline(always)]
pub unsafe fn sample_phase(sk: u64, status: &mut TracerStatus) {
    let Some(phase) = status.phase() else {
        return;
    };

    match phase {
        GuessPhase::Saddr => {
            if let Ok(v) = read_at::<u32>(sk, status.offset_saddr) {
                status.saddr = v;
            }
        }
        GuessPhase::Daddr => {
            if let Ok(v) = read_at::<u32>(sk, status.offset_daddr) {
                status.daddr = v;
            }
        }
        GuessPhase::Family => {
            if let Ok(v) = read_at::<u16>(sk, status.offset_family) {
                status.family = v;
            }
        }
        GuessPhase::Sport => {
            if let Ok(v) = read_at::<u16>(sk, status.offset_sport) {
                status.sport = v;
            }
        }
        GuessPhase::Dport => {
            if let Ok(v) = read_at::<u16>(sk, status.offset_dport) {
                status.dport = v;
            }
        }
        GuessPhase::Netns => match read_netns(sk, status) {
            Ok(inum) => status.netns = inum,
            Err(_) => status.err = 1,
        },
        GuessPhase::DaddrIpv6 => {
            if let Ok(v) = read_at::<[u32; 4]>(sk, status.offset_daddr_ipv6) {
                status.daddr_ipv6 = v;
            }
        }
    }

    status.set_state(TracerState::Checked);
}

pub struct TupleV4 {
    pub saddr: u32,
    pub daddr: u32,
    pub sport: u16,
    pub dport: u16,
    pub netns: u32,
}

pub struct TupleV6 {
    pub saddr: [u32; 4],
    pub daddr: [u32; 4],
    pub sport: u16,
    pub dport: u16,
    pub netns: u32,
}

/// Decode an IPv4 socket with the resolved offsets.
#[inline(always)]
pub unsafe fn read_tuple_v4(sk: u64, status: &TracerStatus) -> Result<TupleV4, i64> {
    Ok(TupleV4 {
        saddr: read_at(sk, status.offset_saddr)?,
        daddr: read_at(sk, status.offset_daddr)?,
        sport: read_at(sk, status.offset_sport)?,
        dport: read_at(sk, status.offset_dport)?,
        netns: read_netns(sk, status)?,
    })
}

/// Decode an IPv6 socket with the resolved offsets.
#[inline(always)]
pub unsafe fn read_tuple_v6(sk: u64, status: &TracerStatus) -> Result<TupleV6, i64> {
    Ok(TupleV6 {
        saddr: read_at(sk, status.offset_daddr_ipv6 + IPV6_SADDR_FROM_DADDR)?,
        daddr: read_at(sk, status.offset_daddr_ipv6)?,
        sport: read_at(sk, status.offset_sport)?,
        dport: read_at(sk, status.offset_dport)?,
        netns: read_netns(sk, status)?,
    })
}
