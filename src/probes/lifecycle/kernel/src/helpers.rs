//! Wrappers around the BPF helpers the handlers share.

use aya_ebpf::helpers::{
    bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_get_smp_processor_id, bpf_ktime_get_ns,
};

#[inline(always)]
pub fn timestamp() -> u64 {
    unsafe { bpf_ktime_get_ns() }
}

#[inline(always)]
pub fn cpu() -> u64 {
    unsafe { bpf_get_smp_processor_id() as u64 }
}

#[inline(always)]
pub fn pid_tgid() -> u64 {
    unsafe { bpf_get_current_pid_tgid() }
}

#[inline(always)]
pub fn comm() -> [u8; 16] {
    bpf_get_current_comm().unwrap_or_default()
}
