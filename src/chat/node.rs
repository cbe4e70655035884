//! Session node — joins or forms a session and exposes the chat API.
//!
//! The node owns at most one client and at most one server. Its session
//! worker loops forever: discover candidates, try them oldest-first, fall
//! back to hosting, pump messages until the connection dies, reacquire.
//! Applications only ever see `start` / `say` / `set_name` and a stream of
//! `(name, text)` events; everything about discovery, election, and
//! failover stays below this line.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

use super::client::{ChatClient, ClientEvent};
use super::discovery::discover;
use super::error::Error;
use super::server::ChatServer;
use super::{checked_name, checked_text, Config};

/// Sender name attached to node-local status notices.
const CLIENT_NAME: &str = "CLIENT";

/// A message surfaced to the application: who said what.
///
/// `name` is `"SERVER"` for server notices (joins, leaves, renames) and
/// `"CLIENT"` for node-local status lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub name: String,
    pub text: String,
}

/// A chat peer: one node per process, one session at a time.
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    config: Config,
    /// The client lock: guards connect/teardown and the backlog drain.
    client: Mutex<Option<ChatClient>>,
    /// The owned server, if this node is currently hosting.
    server: Mutex<Option<ChatServer>>,
    /// Messages produced while no connection exists. Thread-safe on its
    /// own so `say` never blocks on the client lock while offline.
    backlog: StdMutex<VecDeque<String>>,
    name: StdMutex<Option<String>>,
    connected: AtomicBool,
    started: AtomicBool,
    events: broadcast::Sender<ChatMessage>,
}

impl Node {
    pub fn new(config: Config) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(NodeInner {
                config,
                client: Mutex::new(None),
                server: Mutex::new(None),
                backlog: StdMutex::new(VecDeque::new()),
                name: StdMutex::new(None),
                connected: AtomicBool::new(false),
                started: AtomicBool::new(false),
                events,
            }),
        }
    }

    /// Receive every `ChatMessage` this node surfaces from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ChatMessage> {
        self.inner.events.subscribe()
    }

    /// Begin session acquisition. Non-blocking; calling it twice is a no-op.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(session_loop(Arc::clone(&self.inner)));
    }

    /// Send message text into the session.
    ///
    /// Validation is synchronous: empty-after-trim or oversized text fails
    /// with `InvalidArgument` before anything is queued. While the node is
    /// offline the message lands in the backlog and is delivered, in
    /// order, once a connection exists.
    pub async fn say(&self, text: &str) -> Result<(), Error> {
        let text = checked_text(text)?.to_owned();

        if !self.inner.connected.load(Ordering::SeqCst) {
            self.inner.backlog.lock().unwrap().push_back(text);
            // The session may have come up between the flag read and the
            // push, with its own backlog drain already past us. Re-check:
            // either the flip has not happened yet and the session worker
            // will drain this message, or it has and we drain it here.
            if self.inner.connected.load(Ordering::SeqCst) {
                let slot = self.inner.client.lock().await;
                if let Some(client) = slot.as_ref() {
                    drain_backlog(&self.inner, client).await;
                }
            }
            return Ok(());
        }

        let slot = self.inner.client.lock().await;
        match slot.as_ref() {
            Some(client) => match client.say(&text).await {
                Ok(()) => Ok(()),
                Err(Error::InvalidArgument(reason)) => Err(Error::InvalidArgument(reason)),
                Err(e) => {
                    // The connection is dying under us; keep the message
                    // for the reconnect pass instead of losing it.
                    debug!("node: send failed, backlogging: {e}");
                    self.inner.backlog.lock().unwrap().push_back(text);
                    Ok(())
                }
            },
            None => {
                self.inner.backlog.lock().unwrap().push_back(text);
                Ok(())
            }
        }
    }

    /// Set the display name other peers see.
    pub async fn set_name(&self, name: &str) -> Result<(), Error> {
        let name = checked_name(name)?.to_owned();
        *self.inner.name.lock().unwrap() = Some(name.clone());

        let slot = self.inner.client.lock().await;
        if let Some(client) = slot.as_ref() {
            match client.set_name(&name).await {
                Ok(()) | Err(Error::NotConnected) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// The currently stored display name, if any.
    pub fn name(&self) -> Option<String> {
        self.inner.name.lock().unwrap().clone()
    }
}

impl NodeInner {
    fn emit(&self, name: String, text: String) {
        let _ = self.events.send(ChatMessage { name, text });
    }

    fn notice(&self, text: &str) {
        info!("node: {text}");
        self.emit(CLIENT_NAME.to_owned(), text.to_owned());
    }
}

/// The session worker: acquire, pump, lose, reacquire — forever.
async fn session_loop(inner: Arc<NodeInner>) {
    loop {
        inner.notice("Searching for session…");

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let client = acquire(&inner, &events_tx).await;

        {
            let mut slot = inner.client.lock().await;
            *slot = Some(client);
            inner.notice("Connected.");

            let client = slot.as_ref().expect("just installed");
            drain_backlog(&inner, client).await;
            inner.connected.store(true, Ordering::SeqCst);
            // A say may have checked the flag mid-drain; pick up stragglers.
            drain_backlog(&inner, client).await;
        }

        loop {
            match events_rx.recv().await {
                Some(ClientEvent::MessageSaid { name, text }) => inner.emit(name, text),
                Some(ClientEvent::ConnectionLost) | None => break,
            }
        }

        inner.connected.store(false, Ordering::SeqCst);
        inner.notice("Connection Lost.");

        if let Some(dead) = inner.client.lock().await.take() {
            dead.close().await;
        }
        // The owned server (if any) stays: after an election we may be the
        // best candidate ourselves.
    }
}

/// One pass of session acquisition; loops until a connection exists.
async fn acquire(
    inner: &Arc<NodeInner>,
    events: &mpsc::UnboundedSender<ClientEvent>,
) -> ChatClient {
    loop {
        let candidates = match discover(&inner.config).await {
            Ok(found) => found,
            Err(e) => {
                warn!("node: discovery failed: {e}");
                Vec::new()
            }
        };

        let name = inner.name.lock().unwrap().clone();

        for candidate in candidates {
            let addr = SocketAddr::new(candidate.addr, inner.config.port);
            match ChatClient::connect(addr, name.as_deref(), events.clone()).await {
                Ok(client) => {
                    info!(%addr, "node: joined session");
                    return client;
                }
                Err(e) => debug!(%addr, "node: candidate refused: {e}"),
            }
        }

        // Nobody answered, or every candidate refused: host it ourselves.
        inner.notice("Starting new session.");
        {
            let mut server = inner.server.lock().await;
            if let Some(old) = server.take() {
                old.shutdown().await;
            }
            match ChatServer::spawn(inner.config).await {
                Ok(hosted) => *server = Some(hosted),
                Err(e) => {
                    warn!("node: failed to host a session: {e}");
                    continue;
                }
            }
        }

        let local = SocketAddr::from(([127, 0, 0, 1], inner.config.port));
        match ChatClient::connect(local, name.as_deref(), events.clone()).await {
            Ok(client) => return client,
            Err(e) => warn!("node: could not reach own session: {e}"),
        }
    }
}

/// Flush queued messages in FIFO order through the connected client.
///
/// Per-message validation failures are swallowed; a transport failure puts
/// the message back and leaves the rest for the next reconnect.
async fn drain_backlog(inner: &NodeInner, client: &ChatClient) {
    loop {
        let next = inner.backlog.lock().unwrap().pop_front();
        let Some(text) = next else { return };
        match client.say(&text).await {
            Ok(()) => {}
            Err(Error::InvalidArgument(_)) => {}
            Err(e) => {
                debug!("node: backlog send failed: {e}");
                inner.backlog.lock().unwrap().push_front(text);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn say_rejects_empty_and_oversize_synchronously() {
        let node = Node::new(Config::default());
        assert!(matches!(
            node.say("   ").await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            node.say(&"x".repeat(40_000)).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn offline_says_are_backlogged_in_order() {
        let node = Node::new(Config::default());
        node.say("first").await.unwrap();
        node.say("  second  ").await.unwrap();

        let backlog = node.inner.backlog.lock().unwrap();
        let queued: Vec<&str> = backlog.iter().map(String::as_str).collect();
        assert_eq!(queued, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn set_name_validates_and_stores() {
        let node = Node::new(Config::default());
        assert!(matches!(
            node.set_name("  ").await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            node.set_name(&"n".repeat(200)).await,
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(node.name(), None);

        node.set_name("  alice  ").await.unwrap();
        assert_eq!(node.name(), Some("alice".to_owned()));
    }
}
