//! Chat client — one TCP connection to a session server.
//!
//! The client splits its stream: the read half is owned by a spawned
//! receive loop that surfaces events over a channel, and the write half
//! sits behind one async mutex so every outgoing frame (SAY, SET_NAME)
//! is serialized through a single writer slot. `close` is idempotent and
//! does not return until the receive loop can no longer touch the
//! transport.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use futures::SinkExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use super::codec::{ChatCodec, Frame};
use super::error::Error;
use super::{checked_name, checked_text};

/// Events surfaced by a connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A SAY_DISPATCH arrived: who said what.
    MessageSaid { name: String, text: String },
    /// The receive loop died on a transport failure (not a local `close`).
    ConnectionLost,
}

/// A live connection to a chat server.
///
/// Constructed connected; `close` is terminal. The node builds a fresh
/// client for every connection attempt rather than reviving a closed one.
pub struct ChatClient {
    /// The exclusive writer slot — all sends serialize through this lock.
    writer: Mutex<Option<FramedWrite<OwnedWriteHalf, ChatCodec>>>,
    /// Display name; getter, setter, and the SET_NAME push may race.
    name: StdMutex<Option<String>>,
    /// Set by `close` so the receive loop's exit is not reported as a loss.
    closing: Arc<AtomicBool>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl ChatClient {
    /// Open a TCP session to `addr` and start the receive loop.
    ///
    /// If `name` is set it is registered with the server before this
    /// returns, matching what a reconnecting node expects: the new server
    /// knows the name before any backlog drains.
    pub async fn connect(
        addr: SocketAddr,
        name: Option<&str>,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Result<Self, Error> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();

        let closing = Arc::new(AtomicBool::new(false));
        let receiver = tokio::spawn(receive_loop(read_half, events, Arc::clone(&closing)));

        let client = Self {
            writer: Mutex::new(Some(FramedWrite::new(write_half, ChatCodec))),
            name: StdMutex::new(None),
            closing,
            receiver: Mutex::new(Some(receiver)),
        };

        if let Some(name) = name {
            if let Err(e) = client.set_name(name).await {
                // Tear the receive loop down so a half-dead client never
                // reports a loss for a connection the caller never got.
                client.close().await;
                return Err(e);
            }
        }

        debug!(%addr, "client: connected");
        Ok(client)
    }

    /// Send message text to the server.
    ///
    /// Trims first; empty or over-limit text fails with `InvalidArgument`
    /// before anything touches the socket.
    pub async fn say(&self, text: &str) -> Result<(), Error> {
        let text = checked_text(text)?;
        let mut slot = self.writer.lock().await;
        let writer = slot.as_mut().ok_or(Error::NotConnected)?;
        writer.send(Frame::Say(text.to_owned())).await?;
        Ok(())
    }

    /// Store a display name and push it to the server.
    pub async fn set_name(&self, name: &str) -> Result<(), Error> {
        let name = checked_name(name)?;
        *self.name.lock().unwrap() = Some(name.to_owned());
        let mut slot = self.writer.lock().await;
        if let Some(writer) = slot.as_mut() {
            writer.send(Frame::SetName(name.to_owned())).await?;
        }
        Ok(())
    }

    /// The currently stored display name, if any.
    pub fn name(&self) -> Option<String> {
        self.name.lock().unwrap().clone()
    }

    /// Close the connection. Idempotent.
    ///
    /// Signals the receive loop, drops the write half, then joins the
    /// receive task so no worker can still be touching the transport when
    /// this returns.
    pub async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.writer.lock().await.take();
        if let Some(task) = self.receiver.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

/// Read frames until EOF or a transport error.
///
/// Only SAY_DISPATCH is meaningful from a server; anything else is skipped
/// for forward compatibility. A loss is reported exactly when the loop was
/// not asked to stop locally.
async fn receive_loop(
    read_half: OwnedReadHalf,
    events: mpsc::UnboundedSender<ClientEvent>,
    closing: Arc<AtomicBool>,
) {
    let mut frames = FramedRead::new(read_half, ChatCodec);
    loop {
        match frames.next().await {
            Some(Ok(Frame::Dispatch { name, text })) => {
                let _ = events.send(ClientEvent::MessageSaid { name, text });
            }
            Some(Ok(_)) => {} // not server-to-client traffic, skip
            Some(Err(e)) => {
                warn!("client: receive failed: {e}");
                break;
            }
            None => {
                debug!("client: server closed the connection");
                break;
            }
        }
    }
    if !closing.load(Ordering::SeqCst) {
        let _ = events.send(ClientEvent::ConnectionLost);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn accept_one(listener: TcpListener) -> TcpStream {
        let (socket, _) = listener.accept().await.unwrap();
        socket
    }

    #[tokio::test]
    async fn say_rejects_empty_and_oversize_before_the_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(accept_one(listener));

        let (tx, _rx) = mpsc::unbounded_channel();
        let client = ChatClient::connect(addr, None, tx).await.unwrap();

        assert!(matches!(
            client.say("   ").await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            client.say(&"x".repeat(40_000)).await,
            Err(Error::InvalidArgument(_))
        ));

        // Nothing was written: the server side sees only the close.
        client.close().await;
        let mut socket = server.await.unwrap();
        let mut buf = Vec::new();
        socket.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(accept_one(listener));

        let (tx, _rx) = mpsc::unbounded_channel();
        let client = ChatClient::connect(addr, None, tx).await.unwrap();
        client.close().await;
        client.close().await;
        assert!(matches!(client.say("hi").await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn server_eof_raises_connection_lost() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _client = ChatClient::connect(addr, None, tx).await.unwrap();

        // Accept then immediately drop the server side.
        drop(listener.accept().await.unwrap());

        assert_eq!(rx.recv().await, Some(ClientEvent::ConnectionLost));
    }

    #[tokio::test]
    async fn local_close_does_not_raise_connection_lost() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(accept_one(listener));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = ChatClient::connect(addr, None, tx).await.unwrap();
        client.close().await;

        // Channel ends without a ConnectionLost event.
        assert_eq!(rx.recv().await, None);
    }
}
