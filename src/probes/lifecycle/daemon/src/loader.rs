//! eBPF program loading and attachment

use anyhow::{Context, Result};
use aya::maps::perf::AsyncPerfEventArray;
use aya::maps::{HashMap as AyaHashMap, MapData};
use aya::programs::KProbe;
use aya::Ebpf;
use aya_log::EbpfLogger;
use log::{info, warn};
use std::path::PathBuf;

use tcpwatch_common::TracerStatus;

/// Program name in the eBPF object and the kernel function it attaches
/// to. Entry and return probes are separate programs; both connect paths
/// need their return probe because that is where the offset sampler and
/// the connect events run.
const PROBES: &[(&str, &str)] = &[
    ("tcp_v4_connect", "tcp_v4_connect"),
    ("tcp_v4_connect_ret", "tcp_v4_connect"),
    ("tcp_v6_connect", "tcp_v6_connect"),
    ("tcp_v6_connect_ret", "tcp_v6_connect"),
    ("tcp_close", "tcp_close"),
    ("inet_csk_accept_ret", "inet_csk_accept"),
];

/// Loads the tcpwatch eBPF object and wires up its probes and maps.
pub struct ProbeLoader {
    ebpf: Ebpf,
}

impl ProbeLoader {
    /// Load the eBPF program from a file, or the embedded bytecode when
    /// built with the `embedded` feature.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        bump_memlock_rlimit();

        let ebpf = if let Some(obj_path) = path {
            info!("loading eBPF object from {obj_path:?}");
            let data = std::fs::read(&obj_path)
                .with_context(|| format!("failed to read eBPF object file {obj_path:?}"))?;
            Ebpf::load(&data).context("failed to load eBPF program")?
        } else {
            #[cfg(feature = "embedded")]
            {
                info!("loading embedded eBPF program");
                Ebpf::load(include_bytes!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/../kernel/target/bpfel-unknown-none/release/tcpwatch-ebpf"
                )))
                .context("failed to load embedded eBPF program")?
            }
            #[cfg(not(feature = "embedded"))]
            {
                anyhow::bail!(
                    "no eBPF object file provided; pass --ebpf-object or build with the 'embedded' feature"
                )
            }
        };

        Ok(Self { ebpf })
    }

    /// Forward the kernel program's log statements through `log`.
    /// Not fatal when it fails; the probes work without it.
    pub fn init_logger(&mut self) {
        if let Err(e) = EbpfLogger::init(&mut self.ebpf) {
            warn!("failed to initialize eBPF logger: {e}");
        }
    }

    /// Attach every probe the tracer needs. The guessing session depends
    /// on the connect probes being live, so this runs before it.
    pub fn attach_probes(&mut self) -> Result<()> {
        for (name, target) in PROBES {
            let program: &mut KProbe = self
                .ebpf
                .program_mut(name)
                .with_context(|| format!("{name} program not found in eBPF object"))?
                .try_into()
                .with_context(|| format!("failed to get {name} as a kprobe"))?;
            program
                .load()
                .with_context(|| format!("failed to load {name}"))?;
            program
                .attach(target, 0)
                .with_context(|| format!("failed to attach {name} to {target}"))?;
            info!("attached {name} to {target}");
        }
        Ok(())
    }

    /// The offset-guessing control record map.
    pub fn take_status_map(&mut self) -> Result<AyaHashMap<MapData, u64, TracerStatus>> {
        let map = self
            .ebpf
            .take_map("TCPWATCH_STATUS")
            .context("TCPWATCH_STATUS map not found in eBPF object")?;
        AyaHashMap::try_from(map).context("failed to open TCPWATCH_STATUS as a hash map")
    }

    /// Perf event array carrying IPv4 lifecycle events.
    pub fn take_events_v4(&mut self) -> Result<AsyncPerfEventArray<MapData>> {
        let map = self
            .ebpf
            .take_map("TCP_EVENTS_V4")
            .context("TCP_EVENTS_V4 map not found in eBPF object")?;
        AsyncPerfEventArray::try_from(map).context("failed to open TCP_EVENTS_V4")
    }

    /// Perf event array carrying IPv6 lifecycle events.
    pub fn take_events_v6(&mut self) -> Result<AsyncPerfEventArray<MapData>> {
        let map = self
            .ebpf
            .take_map("TCP_EVENTS_V6")
            .context("TCP_EVENTS_V6 map not found in eBPF object")?;
        AsyncPerfEventArray::try_from(map).context("failed to open TCP_EVENTS_V6")
    }
}

/// Kernels before 5.11 account BPF maps against RLIMIT_MEMLOCK.
fn bump_memlock_rlimit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!(
            "failed to remove memlock rlimit: {}",
            std::io::Error::last_os_error()
        );
    }
}
