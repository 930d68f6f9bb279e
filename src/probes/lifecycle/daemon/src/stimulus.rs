//! Guessing stimuli
//!
//! Every iteration of the offset search needs the kernel probe to fire
//! exactly once for this thread, on a socket whose observable properties
//! are known in advance. For the IPv4 phases that is a loopback dial to
//! our own listener; for the IPv6 phase it is a doomed dial to a random
//! address, which exercises the v6 destination field without needing a
//! listener at all.

use std::net::{SocketAddr, SocketAddrV4, TcpStream};
use std::time::Duration;

use tcpwatch_common::GuessPhase;

use crate::offsetguess::{ExpectedValues, GuessError};

/// How long the IPv6 stimulus waits on its doomed connect. The probe fires
/// on the connect entry, so the outcome of the handshake is irrelevant; a
/// routable random address must not stall the session for minutes.
const IPV6_DIAL_TIMEOUT: Duration = Duration::from_millis(500);

/// One observable action that makes the kernel probe fire for the current
/// thread.
pub trait Stimulus {
    /// Trigger the probe for `phase`, updating `expected` with any values
    /// only known at dial time (the kernel-assigned ephemeral source port,
    /// the randomized IPv6 destination).
    fn trigger(
        &mut self,
        phase: GuessPhase,
        expected: &mut ExpectedValues,
    ) -> Result<(), GuessError>;
}

/// The real stimulus: loopback TCP dials.
pub struct LoopbackStimulus {
    v4_target: SocketAddrV4,
    ipv6_port: u16,
}

impl LoopbackStimulus {
    pub fn new(v4_target: SocketAddrV4, ipv6_port: u16) -> Self {
        Self {
            v4_target,
            ipv6_port,
        }
    }

    fn dial_v4(&self, expected: &mut ExpectedValues) -> Result<(), GuessError> {
        let addr = SocketAddr::V4(self.v4_target);
        let stream =
            TcpStream::connect(addr).map_err(|source| GuessError::Dial { addr, source })?;

        // The ephemeral source port the kernel just assigned is what the
        // sport phase searches for. Stored in network byte order, the way
        // struct inet_sock holds it.
        let local = stream.local_addr().map_err(GuessError::Socket)?;
        expected.sport = local.port().to_be();

        // Linger 0 takes the connection straight to CLOSE instead of
        // TIME_WAIT, so the 5-tuple is reclaimed within seconds.
        socket2::SockRef::from(&stream)
            .set_linger(Some(Duration::ZERO))
            .map_err(GuessError::Socket)?;

        Ok(())
    }

    fn dial_v6(&self, expected: &mut ExpectedValues) {
        expected.randomize_daddr_ipv6();
        let addr = SocketAddr::from((expected.daddr_ipv6_addr(), self.ipv6_port));
        // A random destination almost never answers. If it somehow does,
        // dropping the stream closes the connection.
        let _ = TcpStream::connect_timeout(&addr, IPV6_DIAL_TIMEOUT);
    }
}

impl Stimulus for LoopbackStimulus {
    fn trigger(
        &mut self,
        phase: GuessPhase,
        expected: &mut ExpectedValues,
    ) -> Result<(), GuessError> {
        match phase {
            GuessPhase::DaddrIpv6 => {
                self.dial_v6(expected);
                Ok(())
            }
            _ => self.dial_v4(expected),
        }
    }
}
