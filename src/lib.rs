//! Palaver — zero-configuration group chat for a single LAN.
//!
//! Any peer can join a chat session; if none is discoverable, the peer
//! transparently hosts one and others join it. A UDP broadcast protocol
//! keeps exactly one authoritative server per broadcast domain, a TCP
//! server fans messages out to every connected client, and clients
//! reconnect through rediscovery when their server dies.

pub mod chat;
