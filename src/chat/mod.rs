//! LAN chat core — discovery, election, fan-out server, client, session node.
//!
//! The pieces stack bottom-up:
//!
//! 1. [`codec`] — wire framing for TCP messages and UDP beacons.
//! 2. [`client`] — one TCP connection to a session server.
//! 3. [`server`] — accepts clients, fans out messages, runs the election.
//! 4. [`node`] — joins or forms a session and exposes the public chat API.
//!
//! TCP and UDP share one well-known port. Servers advertise themselves with
//! broadcast beacons carrying their age and a random 64-bit uid; when two
//! servers hear each other, the younger one (uid breaking ties) yields and
//! its clients reconnect to the survivor.

pub mod client;
pub mod codec;
pub mod discovery;
pub mod error;
pub mod node;
pub mod server;

pub use client::{ChatClient, ClientEvent};
pub use error::Error;
pub use node::{ChatMessage, Node};
pub use server::ChatServer;

use std::net::Ipv4Addr;

/// Well-known port shared by the TCP server and the UDP beacon protocol.
pub const DEFAULT_PORT: u16 = 43993;

/// Network parameters for one chat session domain.
///
/// The defaults are the real deployment: the well-known port and the
/// limited broadcast address. Tests point `broadcast` at the loopback
/// broadcast address and give every session its own port so several
/// independent "LANs" can coexist on one host.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Port for both the TCP server and UDP beacons.
    pub port: u16,
    /// Destination for outgoing beacons and discovery probes.
    pub broadcast: Ipv4Addr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            broadcast: Ipv4Addr::BROADCAST,
        }
    }
}

/// Trim and validate outgoing message text against the protocol limit.
///
/// Returns the trimmed slice; rejects text that is empty after trimming or
/// whose UTF-16LE encoding exceeds the SAY length field.
pub(crate) fn checked_text(text: &str) -> Result<&str, Error> {
    let text = text.trim();
    if text.is_empty() {
        return Err(Error::InvalidArgument("message is empty"));
    }
    if codec::utf16le_len(text) > codec::MAX_TEXT_BYTES {
        return Err(Error::InvalidArgument("message too long for the wire"));
    }
    Ok(text)
}

/// Trim and validate a display name against the protocol limit.
pub(crate) fn checked_name(name: &str) -> Result<&str, Error> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::InvalidArgument("name is empty"));
    }
    if codec::utf16le_len(name) > codec::MAX_NAME_BYTES {
        return Err(Error::InvalidArgument("name too long for the wire"));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checked_text_trims() {
        assert_eq!(checked_text("  hello  ").unwrap(), "hello");
    }

    #[test]
    fn checked_text_rejects_whitespace_only() {
        assert!(matches!(
            checked_text("   \t "),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn checked_text_rejects_oversize() {
        // 40 000 BMP characters encode to 80 000 bytes, past the u16 field.
        let big = "x".repeat(40_000);
        assert!(matches!(
            checked_text(&big),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn checked_name_rejects_oversize() {
        let big = "n".repeat(200);
        assert!(matches!(
            checked_name(&big),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn checked_name_accepts_boundary() {
        // 127 BMP characters encode to 254 bytes, inside the u8 field.
        let name = "n".repeat(127);
        assert_eq!(checked_name(&name).unwrap(), name);
    }
}
