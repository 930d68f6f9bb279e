//! Runtime discovery of `struct sock` field offsets
//!
//! The kernel program reads socket fields at offsets it is handed through a
//! shared control record; it has no headers and no BTF to find them itself.
//! This module learns the offsets on the running kernel: it creates
//! loopback connections whose properties are known in advance, lets the
//! probe sample memory at a candidate offset, and walks the offset forward
//! one byte at a time until the sample matches the expectation. Fields are
//! resolved in a fixed order, one at a time, and the session bails out if
//! any candidate crosses its threshold.
//!
//! The exchange with the probe is strictly alternating: userspace writes
//! the record, triggers a stimulus (during which the probe samples and
//! flips the record to `Checked`), reads the record back, updates it, and
//! repeats. The `pid_tgid` filter in the record keeps unrelated traffic
//! from ever touching the sample.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use aya::maps::{HashMap as AyaHashMap, MapData, MapError};
use log::{debug, info};
use thiserror::Error;

use tcpwatch_common::{
    GuessPhase, TracerState, TracerStatus, AF_INET, GUESS_IPV6_PORT, GUESS_LISTEN_IP,
    OFFSET_THRESHOLD, SPORT_OFFSET_THRESHOLD, STATUS_KEY,
};

use crate::stimulus::{LoopbackStimulus, Stimulus};

type SharedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can end a guessing session.
#[derive(Debug, Error)]
pub enum GuessError {
    #[error("failed to stat network namespace file: {0}")]
    Netns(#[source] io::Error),

    #[error("failed to bind guessing listener: {0}")]
    Listen(#[source] io::Error),

    #[error("error dialing {addr}: {source}")]
    Dial {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to configure stimulus socket: {0}")]
    Socket(#[source] io::Error),

    #[error("failed to read control record: {0}")]
    RecordRead(#[source] SharedError),

    #[error("failed to write control record: {0}")]
    RecordWrite(#[source] SharedError),

    #[error("invalid guessing state {0}: the probe did not sample for this thread")]
    InvalidState(u64),

    #[error("unexpected field to guess: {0}")]
    UnknownPhase(u64),

    #[error("offset for {field} overflowed past {limit}, bailing out")]
    Overflow { field: &'static str, limit: u64 },
}

/// Read/write access to the control record shared with the kernel probe.
///
/// User space only touches the record between stimuli and the probe only
/// writes while a stimulus syscall from this thread is in flight, so plain
/// whole-record copies are race-free without locks.
pub trait StatusChannel {
    fn read(&mut self) -> Result<TracerStatus, GuessError>;
    fn write(&mut self, status: &TracerStatus) -> Result<(), GuessError>;
}

/// The real channel: the single-entry `TCPWATCH_STATUS` BPF map.
pub struct BpfStatusChannel {
    map: AyaHashMap<MapData, u64, TracerStatus>,
}

impl BpfStatusChannel {
    pub fn new(map: AyaHashMap<MapData, u64, TracerStatus>) -> Self {
        Self { map }
    }
}

impl StatusChannel for BpfStatusChannel {
    fn read(&mut self) -> Result<TracerStatus, GuessError> {
        match self.map.get(&STATUS_KEY, 0) {
            Ok(status) => Ok(status),
            // A map entry nobody has written yet reads as an untouched
            // record, not as a failure.
            Err(MapError::KeyNotFound) => Ok(TracerStatus::default()),
            Err(e) => Err(GuessError::RecordRead(Box::new(e))),
        }
    }

    fn write(&mut self, status: &TracerStatus) -> Result<(), GuessError> {
        self.map
            .insert(STATUS_KEY, status, 0)
            .map_err(|e| GuessError::RecordWrite(Box::new(e)))
    }
}

/// What the probe should observe for the connection the current stimulus
/// creates. Ports are converted to network byte order once, when captured;
/// comparisons against the sampled record are raw after that.
#[derive(Clone, Copy, Debug)]
pub struct ExpectedValues {
    pub saddr: u32,
    pub daddr: u32,
    pub sport: u16,
    pub dport: u16,
    pub netns: u32,
    pub family: u16,
    pub daddr_ipv6: [u32; 4],
}

impl ExpectedValues {
    pub fn new(listen_ip: Ipv4Addr, listen_port: u16, netns: u32) -> Self {
        Self {
            // Loopback dials source from 127.0.0.1; both addresses are
            // compared as the kernel holds them in memory.
            saddr: u32::from(Ipv4Addr::LOCALHOST).to_be(),
            daddr: u32::from(listen_ip).to_be(),
            // Captured from the connected socket at each IPv4 dial.
            sport: 0,
            dport: listen_port.to_be(),
            netns,
            family: AF_INET,
            daddr_ipv6: [0; 4],
        }
    }

    pub fn randomize_daddr_ipv6(&mut self) {
        self.daddr_ipv6 = rand::random();
    }

    /// The IPv6 address whose in-memory bytes are exactly `daddr_ipv6`,
    /// so a dial to it makes the kernel store those words verbatim.
    pub fn daddr_ipv6_addr(&self) -> std::net::Ipv6Addr {
        let mut bytes = [0u8; 16];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(self.daddr_ipv6) {
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
        std::net::Ipv6Addr::from(bytes)
    }
}

/// Session parameters. Taking these as a value instead of module globals
/// lets concurrent sessions (tests, mostly) coexist.
#[derive(Clone, Debug)]
pub struct GuessConfig {
    /// Loopback address the listener binds to.
    pub listen_ip: Ipv4Addr,
    /// Destination port of the doomed IPv6 stimulus.
    pub ipv6_port: u16,
}

impl Default for GuessConfig {
    fn default() -> Self {
        Self {
            listen_ip: GUESS_LISTEN_IP,
            ipv6_port: GUESS_IPV6_PORT,
        }
    }
}

/// Loopback listener that accepts and discards connections on a helper
/// thread so stimulus dials complete promptly. Dropping the guard stops
/// the thread and releases the socket on every exit path.
struct ListenerGuard {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    port: u16,
}

impl ListenerGuard {
    fn bind(ip: Ipv4Addr) -> Result<Self, GuessError> {
        let listener =
            TcpListener::bind(SocketAddrV4::new(ip, 0)).map_err(GuessError::Listen)?;
        let port = listener.local_addr().map_err(GuessError::Listen)?.port();
        listener.set_nonblocking(true).map_err(GuessError::Listen)?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !thread_stop.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(2));
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            stop,
            handle: Some(handle),
            port,
        })
    }

    fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Inode of this process's network namespace, the value the netns phase
/// searches for.
fn own_netns_inode() -> Result<u64, GuessError> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata("/proc/self/ns/net").map_err(GuessError::Netns)?;
    Ok(meta.ino())
}

/// Same convention as `bpf_get_current_pid_tgid()`: tgid high, tid low.
fn current_pid_tgid() -> u64 {
    let pid = std::process::id() as u64;
    let tid = unsafe { libc::gettid() } as u64;
    pid << 32 | tid
}

/// Compare the probe's sample against the expectation and either accept
/// the candidate offset (advancing to the next phase) or move it forward
/// one byte. The record leaves in `Checking`, ready for the next stimulus,
/// except when the last phase resolves and it leaves in `Ready`.
fn check_and_update(
    status: &mut TracerStatus,
    expected: &ExpectedValues,
) -> Result<(), GuessError> {
    if status.state() != Some(TracerState::Checked) {
        return Err(GuessError::InvalidState(status.state));
    }
    let phase = status
        .phase()
        .ok_or(GuessError::UnknownPhase(status.what))?;

    match phase {
        GuessPhase::Saddr => {
            if status.saddr == expected.saddr {
                status.set_phase(GuessPhase::Daddr);
            } else {
                status.offset_saddr += 1;
                status.saddr = expected.saddr;
            }
        }
        GuessPhase::Daddr => {
            if status.daddr == expected.daddr {
                status.set_phase(GuessPhase::Family);
            } else {
                status.offset_daddr += 1;
                status.daddr = expected.daddr;
            }
        }
        GuessPhase::Family => {
            if status.family == expected.family {
                status.set_phase(GuessPhase::Sport);
                // inet_sport sits after the family field inside
                // struct inet_sock; skip the known-impossible prefix.
                status.offset_sport = status.offset_family;
            } else {
                status.offset_family += 1;
            }
        }
        GuessPhase::Sport => {
            if status.sport == expected.sport {
                status.set_phase(GuessPhase::Dport);
            } else {
                status.offset_sport += 1;
            }
        }
        GuessPhase::Dport => {
            if status.dport == expected.dport {
                status.set_phase(GuessPhase::Netns);
            } else {
                status.offset_dport += 1;
            }
        }
        GuessPhase::Netns => {
            if status.netns == expected.netns {
                status.set_phase(GuessPhase::DaddrIpv6);
            } else {
                status.offset_ino += 1;
                // A faulted dereference means the word at offset_netns is
                // not a pointer worth chasing; move the outer offset on.
                if status.err != 0 || status.offset_ino >= OFFSET_THRESHOLD {
                    status.offset_ino = 0;
                    status.offset_netns += 1;
                    status.err = 0;
                }
            }
        }
        GuessPhase::DaddrIpv6 => {
            if status.daddr_ipv6 == expected.daddr_ipv6 {
                status.set_state(TracerState::Ready);
                return Ok(());
            }
            status.offset_daddr_ipv6 += 1;
        }
    }

    status.set_state(TracerState::Checking);
    Ok(())
}

/// Stop before any search walks off the end of the structure it is
/// scanning. `offset_ino` is absent on purpose: it cycles inside its
/// window and never grows past it.
fn check_thresholds(status: &TracerStatus) -> Result<(), GuessError> {
    let limits: [(&'static str, u64, u64); 7] = [
        ("saddr", status.offset_saddr, OFFSET_THRESHOLD),
        ("daddr", status.offset_daddr, OFFSET_THRESHOLD),
        ("sport", status.offset_sport, SPORT_OFFSET_THRESHOLD),
        ("dport", status.offset_dport, OFFSET_THRESHOLD),
        ("netns", status.offset_netns, OFFSET_THRESHOLD),
        ("family", status.offset_family, OFFSET_THRESHOLD),
        ("daddr_ipv6", status.offset_daddr_ipv6, OFFSET_THRESHOLD),
    ];
    for (field, value, limit) in limits {
        if value >= limit {
            return Err(GuessError::Overflow { field, limit });
        }
    }
    Ok(())
}

/// The iteration loop: stimulus, read the probe's sample, update the
/// record, write it back, enforce the thresholds. Strictly sequential on
/// the calling thread.
fn run<C, S>(
    channel: &mut C,
    stimulus: &mut S,
    status: &mut TracerStatus,
    expected: &mut ExpectedValues,
) -> Result<(), GuessError>
where
    C: StatusChannel,
    S: Stimulus,
{
    let mut last_phase = status.phase();

    while status.state() != Some(TracerState::Ready) {
        let phase = status
            .phase()
            .ok_or(GuessError::UnknownPhase(status.what))?;

        stimulus.trigger(phase, expected)?;
        *status = channel.read()?;
        check_and_update(status, expected)?;
        channel.write(status)?;
        check_thresholds(status)?;

        if status.phase() != last_phase {
            debug!(
                "resolved {:?}, moving on to {:?}",
                last_phase,
                status.phase()
            );
            last_phase = status.phase();
        }
    }

    Ok(())
}

/// Discover the `struct sock` offsets on the running kernel and leave them
/// in the control record with `status == Ready`.
///
/// The kernel probes must already be attached: the loopback dials issued
/// here are what make them fire. On failure the record is left inert; the
/// caller is expected to tear the probes down.
pub fn guess<C: StatusChannel>(channel: &mut C, config: &GuessConfig) -> Result<(), GuessError> {
    let netns = own_netns_inode()?;

    // Offsets live as long as the program stays loaded; a record that
    // already reads Ready means a previous session did the work.
    if channel.read()?.state() == Some(TracerState::Ready) {
        debug!("control record already ready, skipping offset guessing");
        return Ok(());
    }

    info!("guessing struct sock offsets via loopback connections");

    let listener = ListenerGuard::bind(config.listen_ip)?;
    let mut expected = ExpectedValues::new(config.listen_ip, listener.port(), netns as u32);
    let mut stimulus = LoopbackStimulus::new(
        SocketAddrV4::new(config.listen_ip, listener.port()),
        config.ipv6_port,
    );

    let mut status = TracerStatus::initial(current_pid_tgid());
    channel.write(&status)?;

    run(channel, &mut stimulus, &mut status, &mut expected)?;

    info!(
        "offsets resolved: saddr={} daddr={} family={} sport={} dport={} netns={} ino={} daddr_ipv6={}",
        status.offset_saddr,
        status.offset_daddr,
        status.offset_family,
        status.offset_sport,
        status.offset_dport,
        status.offset_netns,
        status.offset_ino,
        status.offset_daddr_ipv6,
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Offsets at which the simulated kernel finds each field.
    #[derive(Clone, Copy)]
    struct Truth {
        saddr: u64,
        daddr: u64,
        family: u64,
        sport: u64,
        dport: u64,
        netns: u64,
        ino: u64,
        daddr_ipv6: u64,
    }

    /// A layout loosely shaped like a real struct sock.
    const TRUTH: Truth = Truth {
        saddr: 40,
        daddr: 44,
        family: 16,
        sport: 72,
        dport: 74,
        netns: 176,
        ino: 32,
        daddr_ipv6: 48,
    };

    /// Everything resolves on the first sample.
    const TRIVIAL_TRUTH: Truth = Truth {
        saddr: 0,
        daddr: 0,
        family: 0,
        sport: 0,
        dport: 0,
        netns: 0,
        ino: 0,
        daddr_ipv6: 0,
    };

    const EPHEMERAL_PORT: u16 = 50000;

    #[derive(Clone, Copy, PartialEq)]
    enum Misbehavior {
        /// Sample garbage at wrong offsets; fault the netns dereference
        /// whenever the outer offset is wrong, the way a bogus pointer
        /// would.
        None,
        /// Always sample zero during the saddr phase.
        SaddrAlwaysZero,
        /// Fault the netns dereference on every sample.
        NetnsAlwaysFaults,
        /// Fault on alternating samples while the outer netns offset is
        /// wrong; behave once it is right.
        NetnsFlakyPointer,
        /// Never flip the record to Checked.
        NeverFires,
    }

    struct SimState {
        truth: Truth,
        misbehavior: Misbehavior,
        record: TracerStatus,
        expected: ExpectedValues,
        v4_dials: u64,
        v6_dials: u64,
        flip: bool,
        writes: Vec<TracerStatus>,
    }

    /// A simulated kernel + network: hands out samples the way the probe
    /// would for a socket layout described by `Truth`. Cloning shares the
    /// state, so one instance can serve as both channel and stimulus.
    #[derive(Clone)]
    struct Sim(Rc<RefCell<SimState>>);

    impl Sim {
        fn new(truth: Truth, misbehavior: Misbehavior) -> Self {
            Sim(Rc::new(RefCell::new(SimState {
                truth,
                misbehavior,
                record: TracerStatus::default(),
                expected: ExpectedValues::new(GUESS_LISTEN_IP, 9091, 0xbeef),
                v4_dials: 0,
                v6_dials: 0,
                flip: false,
                writes: Vec::new(),
            })))
        }

        /// Start a session against this simulated kernel, the way `guess`
        /// would once past its setup.
        fn session(&self) -> Result<TracerStatus, GuessError> {
            let mut status = TracerStatus::initial(current_pid_tgid());
            self.session_from(&mut status)?;
            Ok(status)
        }

        fn session_from(&self, status: &mut TracerStatus) -> Result<(), GuessError> {
            let mut expected = {
                let state = self.0.borrow();
                state.expected
            };
            let mut channel = self.clone();
            let mut stimulus = self.clone();
            channel.write(status)?;
            run(&mut channel, &mut stimulus, status, &mut expected)
        }

        fn dials(&self) -> (u64, u64) {
            let s = self.0.borrow();
            (s.v4_dials, s.v6_dials)
        }

        fn writes(&self) -> Vec<TracerStatus> {
            self.0.borrow().writes.clone()
        }
    }

    impl SimState {
        /// What the kernel probe would have done while the stimulus
        /// syscall was in flight.
        fn sample(&mut self) {
            if self.record.state() != Some(TracerState::Checking) {
                return;
            }
            if self.misbehavior == Misbehavior::NeverFires {
                return;
            }

            let exp = self.expected;
            let truth = self.truth;
            let phase = self.record.phase().expect("sim record phase");
            match phase {
                GuessPhase::Saddr => {
                    self.record.saddr = if self.misbehavior == Misbehavior::SaddrAlwaysZero {
                        0
                    } else if self.record.offset_saddr == truth.saddr {
                        exp.saddr
                    } else {
                        0xdead_beef
                    };
                }
                GuessPhase::Daddr => {
                    self.record.daddr = if self.record.offset_daddr == truth.daddr {
                        exp.daddr
                    } else {
                        0xdead_beef
                    };
                }
                GuessPhase::Family => {
                    self.record.family = if self.record.offset_family == truth.family {
                        exp.family
                    } else {
                        0xffff
                    };
                }
                GuessPhase::Sport => {
                    self.record.sport = if self.record.offset_sport == truth.sport {
                        exp.sport
                    } else {
                        0
                    };
                }
                GuessPhase::Dport => {
                    self.record.dport = if self.record.offset_dport == truth.dport {
                        exp.dport
                    } else {
                        0
                    };
                }
                GuessPhase::Netns => {
                    let at_outer = self.record.offset_netns == truth.netns;
                    let fault = match self.misbehavior {
                        Misbehavior::NetnsAlwaysFaults => true,
                        Misbehavior::NetnsFlakyPointer if !at_outer => {
                            self.flip = !self.flip;
                            self.flip
                        }
                        _ => !at_outer,
                    };
                    if fault {
                        self.record.err = 1;
                        self.record.netns = 0;
                    } else {
                        self.record.netns = if at_outer && self.record.offset_ino == truth.ino
                        {
                            exp.netns
                        } else {
                            0
                        };
                    }
                }
                GuessPhase::DaddrIpv6 => {
                    self.record.daddr_ipv6 =
                        if self.record.offset_daddr_ipv6 == truth.daddr_ipv6 {
                            exp.daddr_ipv6
                        } else {
                            [0; 4]
                        };
                }
            }
            self.record.set_state(TracerState::Checked);
        }
    }

    impl Stimulus for Sim {
        fn trigger(
            &mut self,
            phase: GuessPhase,
            expected: &mut ExpectedValues,
        ) -> Result<(), GuessError> {
            let mut s = self.0.borrow_mut();
            if phase == GuessPhase::DaddrIpv6 {
                s.v6_dials += 1;
                // The doomed dial fails, but the destination it aimed at
                // is still what the probe sees on the socket.
                expected.randomize_daddr_ipv6();
            } else {
                s.v4_dials += 1;
                expected.sport = EPHEMERAL_PORT.to_be();
            }
            s.expected = *expected;
            Ok(())
        }
    }

    impl StatusChannel for Sim {
        fn read(&mut self) -> Result<TracerStatus, GuessError> {
            let mut s = self.0.borrow_mut();
            s.sample();
            Ok(s.record)
        }

        fn write(&mut self, status: &TracerStatus) -> Result<(), GuessError> {
            let mut s = self.0.borrow_mut();
            s.record = *status;
            s.writes.push(*status);
            Ok(())
        }
    }

    /// Phase transitions only ever step to the immediate successor, and a
    /// resolved phase's offset is never touched again.
    fn assert_search_invariants(writes: &[TracerStatus]) {
        for pair in writes.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            assert!(
                next.what == prev.what || next.what == prev.what + 1,
                "phase must advance one step at a time"
            );
        }

        let frozen_after: [(GuessPhase, fn(&TracerStatus) -> u64); 6] = [
            (GuessPhase::Saddr, |s| s.offset_saddr),
            (GuessPhase::Daddr, |s| s.offset_daddr),
            (GuessPhase::Family, |s| s.offset_family),
            (GuessPhase::Sport, |s| s.offset_sport),
            (GuessPhase::Dport, |s| s.offset_dport),
            (GuessPhase::Netns, |s| s.offset_netns),
        ];
        for (phase, offset) in frozen_after {
            let resolved: Vec<&TracerStatus> = writes
                .iter()
                .filter(|s| s.what > phase as u64)
                .collect();
            if let Some(first) = resolved.first() {
                assert!(
                    resolved.iter().all(|s| offset(s) == offset(first)),
                    "offset for {phase:?} changed after the phase resolved"
                );
            }
        }

        assert!(
            writes.iter().all(|s| s.offset_ino < OFFSET_THRESHOLD),
            "offset_ino must stay inside its window"
        );
    }

    #[test]
    fn clean_run_resolves_all_offsets() {
        let sim = Sim::new(TRUTH, Misbehavior::None);
        let status = sim.session().expect("session should converge");

        assert_eq!(status.state(), Some(TracerState::Ready));
        assert_eq!(status.offset_saddr, TRUTH.saddr);
        assert_eq!(status.offset_daddr, TRUTH.daddr);
        assert_eq!(status.offset_family, TRUTH.family);
        assert_eq!(status.offset_sport, TRUTH.sport);
        assert_eq!(status.offset_dport, TRUTH.dport);
        assert_eq!(status.offset_netns, TRUTH.netns);
        assert_eq!(status.offset_ino, TRUTH.ino);
        assert_eq!(status.offset_daddr_ipv6, TRUTH.daddr_ipv6);

        // One rejected sample per byte walked, plus one acceptance per
        // field. The sport search starts at the resolved family offset,
        // and the netns outer offset advances on faulted dereferences.
        let walked = TRUTH.saddr
            + TRUTH.daddr
            + TRUTH.family
            + (TRUTH.sport - TRUTH.family)
            + TRUTH.dport
            + (TRUTH.netns + TRUTH.ino)
            + TRUTH.daddr_ipv6;
        let (v4, v6) = sim.dials();
        assert_eq!(v4 + v6, walked + 7);
        assert_eq!(v6, TRUTH.daddr_ipv6 + 1);

        assert_search_invariants(&sim.writes());
    }

    #[test]
    fn sport_search_is_seeded_from_family_offset() {
        let sim = Sim::new(TRUTH, Misbehavior::None);
        sim.session().expect("session should converge");

        let writes = sim.writes();
        let entered_sport = writes
            .iter()
            .find(|s| s.what == GuessPhase::Sport as u64)
            .expect("session reaches the sport phase");
        assert_eq!(entered_sport.offset_sport, entered_sport.offset_family);
        assert_eq!(entered_sport.offset_family, TRUTH.family);
    }

    #[test]
    fn cooperative_probe_resolves_in_one_iteration_per_phase() {
        let sim = Sim::new(TRIVIAL_TRUTH, Misbehavior::None);
        let status = sim.session().expect("session should converge");

        assert_eq!(status.state(), Some(TracerState::Ready));
        let (v4, v6) = sim.dials();
        assert_eq!((v4, v6), (6, 1));
        assert_eq!(status.offset_saddr, 0);
        assert_eq!(status.offset_sport, 0);
        assert_eq!(status.offset_sport, status.offset_family);
    }

    #[test]
    fn saddr_never_matching_overflows() {
        let sim = Sim::new(TRUTH, Misbehavior::SaddrAlwaysZero);
        let err = sim.session().expect_err("search cannot converge");

        assert!(
            matches!(
                err,
                GuessError::Overflow {
                    field: "saddr",
                    limit: OFFSET_THRESHOLD,
                }
            ),
            "unexpected error: {err}"
        );

        let writes = sim.writes();
        let last = writes.last().unwrap();
        assert_eq!(last.offset_saddr, OFFSET_THRESHOLD);
        assert_eq!(last.phase(), Some(GuessPhase::Saddr));
        let (v4, _) = sim.dials();
        assert_eq!(v4, OFFSET_THRESHOLD);
    }

    #[test]
    fn faulting_netns_dereference_advances_outer_offset_only() {
        let sim = Sim::new(TRIVIAL_TRUTH, Misbehavior::NetnsAlwaysFaults);
        let err = sim.session().expect_err("netns search cannot converge");

        assert!(matches!(err, GuessError::Overflow { field: "netns", .. }));

        // Every faulted sample moves the outer offset by one and pins the
        // inner counter at zero.
        let writes = sim.writes();
        let netns_writes: Vec<&TracerStatus> = writes
            .iter()
            .filter(|s| s.what == GuessPhase::Netns as u64)
            .collect();
        assert!(netns_writes.iter().all(|s| s.offset_ino == 0));
        // The first such write is the one that resolved dport; each
        // faulted sample after it moves the outer offset by exactly one.
        for (i, s) in netns_writes.iter().enumerate() {
            assert_eq!(s.offset_netns, i as u64);
        }
    }

    #[test]
    fn flaky_netns_pointer_still_converges() {
        let truth = Truth {
            netns: 96,
            ino: 32,
            ..TRIVIAL_TRUTH
        };
        let sim = Sim::new(truth, Misbehavior::NetnsFlakyPointer);
        let status = sim.session().expect("session should converge");

        assert_eq!(status.state(), Some(TracerState::Ready));
        assert_eq!(status.offset_netns, 96);
        assert_eq!(status.offset_ino, 32);
        assert_search_invariants(&sim.writes());
    }

    #[test]
    fn ready_record_short_circuits_the_session() {
        let sim = Sim::new(TRUTH, Misbehavior::None);
        {
            let mut s = sim.0.borrow_mut();
            s.record.set_state(TracerState::Ready);
            s.record.set_phase(GuessPhase::DaddrIpv6);
            s.record.offset_saddr = 1312;
        }

        let mut channel = sim.clone();
        guess(&mut channel, &GuessConfig::default()).expect("cached session");

        // No stimulus, no write: the record is untouched.
        assert_eq!(sim.dials(), (0, 0));
        assert!(sim.writes().is_empty());
        assert_eq!(sim.0.borrow().record.offset_saddr, 1312);
    }

    #[test]
    fn completed_session_makes_the_next_one_a_noop() {
        let sim = Sim::new(TRUTH, Misbehavior::None);
        sim.session().expect("first session converges");
        let dials_after_first = sim.dials();

        let mut channel = sim.clone();
        guess(&mut channel, &GuessConfig::default()).expect("second session is a no-op");
        assert_eq!(sim.dials(), dials_after_first);
    }

    #[test]
    fn dial_failure_aborts_the_session() {
        // A port with nothing behind it: bind, learn it, drop it.
        let port = {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
            listener.local_addr().unwrap().port()
        };

        let sim = Sim::new(TRUTH, Misbehavior::None);
        let mut channel = sim.clone();
        let mut stimulus =
            LoopbackStimulus::new(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port), 9092);
        let mut status = TracerStatus::initial(current_pid_tgid());
        let mut expected = ExpectedValues::new(Ipv4Addr::LOCALHOST, port, 1);

        let err = run(&mut channel, &mut stimulus, &mut status, &mut expected)
            .expect_err("dialing a dead port must fail");
        assert!(matches!(err, GuessError::Dial { .. }));
        assert_eq!(sim.dials(), (0, 0));
    }

    #[test]
    fn failed_ipv6_dial_still_converges() {
        // Start at the last phase with everything before it resolved, and
        // use the real stimulus: the dial to a random address fails, but
        // the probe still samples the destination the dial aimed at.
        struct RealDialThenSample {
            inner: LoopbackStimulus,
            sim: Sim,
        }
        impl Stimulus for RealDialThenSample {
            fn trigger(
                &mut self,
                phase: GuessPhase,
                expected: &mut ExpectedValues,
            ) -> Result<(), GuessError> {
                self.inner.trigger(phase, expected)?;
                self.sim.0.borrow_mut().expected = *expected;
                Ok(())
            }
        }

        let truth = Truth {
            daddr_ipv6: 5,
            ..TRIVIAL_TRUTH
        };
        let sim = Sim::new(truth, Misbehavior::None);
        let mut channel = sim.clone();
        let mut stimulus = RealDialThenSample {
            inner: LoopbackStimulus::new(
                SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1),
                GUESS_IPV6_PORT,
            ),
            sim: sim.clone(),
        };

        let mut status = TracerStatus::initial(current_pid_tgid());
        status.set_phase(GuessPhase::DaddrIpv6);
        let mut expected = ExpectedValues::new(Ipv4Addr::LOCALHOST, 1, 1);

        channel.write(&status).unwrap();
        run(&mut channel, &mut stimulus, &mut status, &mut expected)
            .expect("session should converge despite failed dials");
        assert_eq!(status.state(), Some(TracerState::Ready));
        assert_eq!(status.offset_daddr_ipv6, truth.daddr_ipv6);
    }

    #[test]
    fn silent_probe_is_a_protocol_error() {
        let sim = Sim::new(TRUTH, Misbehavior::NeverFires);
        let err = sim.session().expect_err("silent probe must abort");
        assert!(matches!(
            err,
            GuessError::InvalidState(s) if s == TracerState::Checking as u64
        ));
    }

    #[test]
    fn expected_values_follow_the_kernel_byte_order() {
        let expected = ExpectedValues::new(GUESS_LISTEN_IP, 9091, 7);
        assert_eq!(expected.dport, 9091u16.to_be());
        assert_eq!(expected.family, AF_INET);
        #[cfg(target_endian = "little")]
        {
            assert_eq!(expected.saddr, 0x0100007F);
            assert_eq!(expected.daddr, 0x0200007F);
            assert_eq!(expected.dport, 0x8323);
        }
    }
}
