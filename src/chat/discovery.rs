//! Server discovery — UDP broadcast probes for live sessions.
//!
//! A joining peer broadcasts SERVER_INFO_REQUEST every 100 ms and collects
//! the beacons that come back. The full window is two seconds, but as soon
//! as any server answers the remaining window shrinks to at most one
//! second: when a session already exists there is no reason to keep the
//! user waiting.
//!
//! Discovery and the server election worker share one socket shape: bound
//! to the chat port with address reuse and broadcast enabled, so any
//! number of peers (and a local server) can coexist on a single host.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

use super::codec::{Beacon, OP_INFO_REQUEST};
use super::Config;

/// Hard cap on one discovery pass.
const FULL_WINDOW: Duration = Duration::from_secs(2);
/// Remaining window once at least one candidate has answered.
const FAST_WINDOW: Duration = Duration::from_secs(1);
/// Cadence of SERVER_INFO_REQUEST probes.
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// A server observed during discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    /// Where the beacon came from; the TCP connect target.
    pub addr: IpAddr,
    /// The server's age as advertised in the beacon.
    pub age_secs: u32,
    /// When the beacon was received, so the age can keep counting.
    pub seen_at: Instant,
    /// The server's random identity, used to break ordering ties.
    pub uid: u64,
}

impl Candidate {
    /// Age the server has reached by `now`, in whole seconds.
    pub fn effective_age(&self, now: Instant) -> u64 {
        u64::from(self.age_secs) + now.saturating_duration_since(self.seen_at).as_secs()
    }
}

/// Order candidates oldest first, higher uid breaking ties.
///
/// Oldest-first is the whole point of the election: the longest-lived
/// session is the one everyone should converge on.
pub fn rank(candidates: &mut [Candidate], now: Instant) {
    candidates.sort_by(|a, b| {
        b.effective_age(now)
            .cmp(&a.effective_age(now))
            .then(b.uid.cmp(&a.uid))
    });
}

/// Bind a UDP socket on the chat port with address reuse and broadcast
/// enabled, ready for tokio.
///
/// Reuse matters: every peer on a host binds the same port so that
/// broadcast datagrams reach all of them.
pub(crate) fn broadcast_socket(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let bind_addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], port));
    socket.bind(&bind_addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Probe the LAN for running session servers.
///
/// Returns the candidates ranked oldest first, deduplicated by source IP.
/// An empty result means nobody answered and the caller should host the
/// session itself.
pub async fn discover(config: &Config) -> io::Result<Vec<Candidate>> {
    let socket = broadcast_socket(config.port)?;
    let target = SocketAddr::from((config.broadcast, config.port));

    let mut candidates: Vec<Candidate> = Vec::new();
    let mut buf = [0u8; 64];
    let mut deadline = Instant::now() + FULL_WINDOW;

    while Instant::now() < deadline {
        socket.send_to(&[OP_INFO_REQUEST], target).await?;

        // Drain replies for one probe interval (never past the deadline).
        let slice_end = deadline.min(Instant::now() + PROBE_INTERVAL);
        loop {
            let remaining = slice_end.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, socket.recv_from(&mut buf)).await {
                Err(_) => break, // slice elapsed
                Ok(Err(e)) => return Err(e),
                Ok(Ok((len, from))) => {
                    let Some(beacon) = Beacon::decode(&buf[..len]) else {
                        continue; // our own probe echo, or garbage
                    };
                    let addr = from.ip();
                    if candidates.iter().any(|c| c.addr == addr) {
                        continue;
                    }
                    debug!(%addr, age = beacon.age_secs, uid = beacon.uid, "discovery: candidate");
                    candidates.push(Candidate {
                        addr,
                        age_secs: beacon.age_secs,
                        seen_at: Instant::now(),
                        uid: beacon.uid,
                    });
                    // Someone is out there — stop waiting for stragglers.
                    deadline = deadline.min(Instant::now() + FAST_WINDOW);
                }
            }
        }
    }

    rank(&mut candidates, Instant::now());
    Ok(candidates)
}
