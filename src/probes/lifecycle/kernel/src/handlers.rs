//! Kprobe handlers for the TCP lifecycle
//!
//! The connect return probes do double duty: they are the sampling side
//! of the offset-guessing protocol while the control record is in the
//! guessing states, and event sources once it reads ready.

use aya_ebpf::{
    macros::{kprobe, kretprobe},
    maps::HashMap,
    programs::{ProbeContext, RetProbeContext},
    EbpfContext,
};
use aya_log_ebpf::debug;
use core::ffi::c_void;

use tcpwatch_common::{
    GuessPhase, TcpEventV4, TcpEventV6, TracerState, TracerStatus, AF_INET, AF_INET6,
    EVENT_ACCEPT, EVENT_CLOSE, EVENT_CONNECT, STATUS_KEY,
};

use crate::helpers::{comm, cpu, pid_tgid, timestamp};
use crate::maps::{
    CONNECT_SOCK_V4, CONNECT_SOCK_V6, TCPWATCH_STATUS, TCP_EVENTS_V4, TCP_EVENTS_V6,
};
use crate::sock_sampler::{read_at, read_tuple_v4, read_tuple_v6, sample_phase};

/// Remember the socket a connect call is working on; the return probe
/// picks it back up by pid_tgid.
#[inline(always)]
fn try_connect_entry(ctx: &ProbeContext, socks: &HashMap<u64, u64>) -> Result<u32, i64> {
    let sk: *const c_void = ctx.arg(0).ok_or(-1i64)?;
    socks.insert(&pid_tgid(), &(sk as u64), 0)?;
    Ok(0)
}

#[kprobe]
pub fn tcp_v4_connect(ctx: ProbeContext) -> u32 {
    match try_connect_entry(&ctx, &CONNECT_SOCK_V4) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

#[kprobe]
pub fn tcp_v6_connect(ctx: ProbeContext) -> u32 {
    match try_connect_entry(&ctx, &CONNECT_SOCK_V6) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

#[kretprobe]
pub fn tcp_v4_connect_ret(ctx: RetProbeContext) -> u32 {
    match try_tcp_v4_connect_ret(&ctx) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

fn try_tcp_v4_connect_ret(ctx: &RetProbeContext) -> Result<u32, i64> {
    let id = pid_tgid();
    let Some(sk) = (unsafe { CONNECT_SOCK_V4.get(&id) }).copied() else {
        return Ok(0);
    };
    let _ = CONNECT_SOCK_V4.remove(&id);
    let ret: i64 = ctx.ret().unwrap_or(-1);

    let Some(status) = TCPWATCH_STATUS.get_ptr_mut(&STATUS_KEY) else {
        return Ok(0);
    };
    let status: &mut TracerStatus = unsafe { &mut *status };

    // Guessing protocol: sample for the driving thread only. Every phase
    // except the IPv6 destination is observable on a v4 connect.
    if status.state == TracerState::Checking as u64
        && status.pid_tgid == id
        && status.what != GuessPhase::DaddrIpv6 as u64
    {
        unsafe { sample_phase(sk, status) };
        return Ok(0);
    }

    if status.state == TracerState::Ready as u64 && ret == 0 {
        emit_v4(ctx, sk, status, EVENT_CONNECT);
    }
    Ok(0)
}

#[kretprobe]
pub fn tcp_v6_connect_ret(ctx: RetProbeContext) -> u32 {
    match try_tcp_v6_connect_ret(&ctx) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

fn try_tcp_v6_connect_ret(ctx: &RetProbeContext) -> Result<u32, i64> {
    let id = pid_tgid();
    let Some(sk) = (unsafe { CONNECT_SOCK_V6.get(&id) }).copied() else {
        return Ok(0);
    };
    let _ = CONNECT_SOCK_V6.remove(&id);
    let ret: i64 = ctx.ret().unwrap_or(-1);

    let Some(status) = TCPWATCH_STATUS.get_ptr_mut(&STATUS_KEY) else {
        return Ok(0);
    };
    let status: &mut TracerStatus = unsafe { &mut *status };

    // The v6 destination field is sampled here even though the connect
    // itself is doomed: the socket carries the address regardless.
    if status.state == TracerState::Checking as u64
        && status.pid_tgid == id
        && status.what == GuessPhase::DaddrIpv6 as u64
    {
        unsafe { sample_phase(sk, status) };
        return Ok(0);
    }

    if status.state == TracerState::Ready as u64 && ret == 0 {
        emit_v6(ctx, sk, status, EVENT_CONNECT);
    }
    Ok(0)
}

#[kprobe]
pub fn tcp_close(ctx: ProbeContext) -> u32 {
    match try_sock_event(&ctx, EVENT_CLOSE) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

#[kretprobe]
pub fn inet_csk_accept_ret(ctx: RetProbeContext) -> u32 {
    match try_inet_csk_accept_ret(&ctx) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

fn try_inet_csk_accept_ret(ctx: &RetProbeContext) -> Result<u32, i64> {
    let newsk: *const c_void = ctx.ret().ok_or(-1i64)?;
    if newsk.is_null() {
        return Ok(0);
    }
    emit_for_family(ctx, newsk as u64, EVENT_ACCEPT);
    Ok(0)
}

fn try_sock_event(ctx: &ProbeContext, kind: u32) -> Result<u32, i64> {
    let sk: *const c_void = ctx.arg(0).ok_or(-1i64)?;
    emit_for_family(ctx, sk as u64, kind);
    Ok(0)
}

/// Emit an event for a socket of either family, provided the offsets are
/// resolved.
#[inline(always)]
fn emit_for_family<C: EbpfContext>(ctx: &C, sk: u64, kind: u32) {
    let Some(status) = TCPWATCH_STATUS.get_ptr_mut(&STATUS_KEY) else {
        return;
    };
    let status: &TracerStatus = unsafe { &*status };
    if status.state != TracerState::Ready as u64 {
        return;
    }

    match unsafe { read_at::<u16>(sk, status.offset_family) } {
        Ok(AF_INET) => emit_v4(ctx, sk, status, kind),
        Ok(AF_INET6) => emit_v6(ctx, sk, status, kind),
        _ => {}
    }
}

#[inline(always)]
fn emit_v4<C: EbpfContext>(ctx: &C, sk: u64, status: &TracerStatus, kind: u32) {
    let tuple = match unsafe { read_tuple_v4(sk, status) } {
        Ok(tuple) => tuple,
        Err(_) => {
            debug!(ctx, "dropping v4 event: socket read failed");
            return;
        }
    };
    // Sockets without an established 4-tuple read as zero ports.
    if tuple.sport == 0 || tuple.dport == 0 {
        return;
    }

    let event = TcpEventV4 {
        timestamp: timestamp(),
        cpu: cpu(),
        kind,
        pid: (pid_tgid() >> 32) as u32,
        comm: comm(),
        saddr: tuple.saddr,
        daddr: tuple.daddr,
        sport: tuple.sport,
        dport: tuple.dport,
        netns: tuple.netns,
    };
    TCP_EVENTS_V4.output(ctx, &event, 0);
}

#[inline(always)]
fn emit_v6<C: EbpfContext>(ctx: &C, sk: u64, status: &TracerStatus, kind: u32) {
    let tuple = match unsafe { read_tuple_v6(sk, status) } {
        Ok(tuple) => tuple,
        Err(_) => {
            debug!(ctx, "dropping v6 event: socket read failed");
            return;
        }
    };
    if tuple.sport == 0 || tuple.dport == 0 {
        return;
    }

    let event = TcpEventV6 {
        timestamp: timestamp(),
        cpu: cpu(),
        kind,
        pid: (pid_tgid() >> 32) as u32,
        comm: comm(),
        saddr: tuple.saddr,
        daddr: tuple.daddr,
        sport: tuple.sport,
        dport: tuple.dport,
        netns: tuple.netns,
    };
    TCP_EVENTS_V6.output(ctx, &event, 0);
}
