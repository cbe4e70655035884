//! Chat server — TCP fan-out plus the UDP beacon and election worker.
//!
//! One server per LAN is the invariant this module maintains. On the TCP
//! side an accept loop registers each client in a shared table, a reader
//! worker per client feeds a single dispatch queue, and a writer worker
//! per client drains its own unbounded channel into the socket. The UDP side advertises the server with beacons and listens for
//! rivals; when an older rival (or an equal-aged one with a higher uid)
//! appears, this server yields — it signals stop, every worker winds down,
//! and its clients reconnect through rediscovery.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::SinkExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, UdpSocket};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use super::codec::{Beacon, ChatCodec, Frame, OP_INFO_REQUEST};
use super::discovery::broadcast_socket;
use super::Config;

/// Name attached to server-originated notices.
const SERVER_NAME: &str = "SERVER";

/// Below this age a server beacons rapidly; past it, once per two seconds.
const YOUNG_AGE: Duration = Duration::from_secs(2);
/// Beacon drain window while young.
const YOUNG_WINDOW: Duration = Duration::from_millis(100);
/// Beacon drain window once established.
const MATURE_WINDOW: Duration = Duration::from_secs(2);

/// Age slack treated as a tie in the election, absorbing clock skew and
/// beacon delay.
const AGE_FUZZ_SECS: i64 = 2;

/// Decide whether this server yields to a rival advertising
/// `(other_age, other_uid)`.
///
/// Older wins; within the fuzz band the higher uid wins, so two servers
/// started in the same instant still converge deterministically.
pub(crate) fn should_yield(this_age: u32, this_uid: u64, other_age: u32, other_uid: u64) -> bool {
    let delta = i64::from(other_age) - i64::from(this_age);
    delta > AGE_FUZZ_SECS || (delta.abs() <= AGE_FUZZ_SECS && other_uid > this_uid)
}

/// A registered client: its current display name, the channel its writer
/// worker drains, and the worker handles joined at shutdown.
struct ClientHandle {
    name: String,
    tx: mpsc::UnboundedSender<Frame>,
    tasks: Vec<JoinHandle<()>>,
}

struct ServerShared {
    config: Config,
    uid: u64,
    started: Instant,
    /// Client table keyed by id; ids never recycle within a server's life.
    clients: RwLock<HashMap<u64, ClientHandle>>,
    next_id: AtomicU64,
    /// Multi-producer single-consumer queue of pending dispatches.
    queue_tx: mpsc::UnboundedSender<(String, String)>,
    /// The cancellation token every worker observes.
    stop: watch::Sender<bool>,
}

impl ServerShared {
    fn age_secs(&self) -> u32 {
        self.started.elapsed().as_secs() as u32
    }

    fn signal_stop(&self) {
        self.stop.send_replace(true);
    }

    fn enqueue(&self, name: impl Into<String>, text: impl Into<String>) {
        let _ = self.queue_tx.send((name.into(), text.into()));
    }

    /// Drop a client record. At most one caller wins; only the winner
    /// announces the disconnect.
    async fn remove_client(&self, id: u64) {
        let removed = self.clients.write().await.remove(&id);
        if let Some(handle) = removed {
            info!(id, name = %handle.name, "server: client disconnected");
            self.enqueue(SERVER_NAME, format!("{} disconnected.", handle.name));
        }
    }

    /// Queue a SAY from a client under its current name.
    async fn enqueue_say(&self, id: u64, text: &str) {
        let clients = self.clients.read().await;
        if let Some(handle) = clients.get(&id) {
            self.enqueue(handle.name.clone(), text.trim());
        }
    }

    /// Apply a SET_NAME: identical names are ignored, changes are announced.
    async fn rename(&self, id: u64, new_name: &str) {
        let new_name = new_name.trim();
        let mut clients = self.clients.write().await;
        let Some(handle) = clients.get_mut(&id) else {
            return;
        };
        if handle.name == new_name {
            return;
        }
        let old = std::mem::replace(&mut handle.name, new_name.to_owned());
        drop(clients);
        self.enqueue(
            SERVER_NAME,
            format!("{old} changed their name to {new_name}"),
        );
    }
}

/// A running chat session server.
pub struct ChatServer {
    shared: Arc<ServerShared>,
    tasks: Vec<JoinHandle<()>>,
}

impl ChatServer {
    /// Bind the TCP listener and the beacon socket, then start all workers.
    ///
    /// The listener binds with address and port reuse (several peers on one
    /// host each run their own short-lived server during an election).
    pub async fn spawn(config: Config) -> std::io::Result<ChatServer> {
        let listener = bind_shared(SocketAddr::from(([0, 0, 0, 0], config.port)))?;
        let udp = broadcast_socket(config.port)?;

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (stop, _) = watch::channel(false);
        let uid = rand::random::<u64>();

        let shared = Arc::new(ServerShared {
            config,
            uid,
            started: Instant::now(),
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            queue_tx,
            stop,
        });

        info!(uid, port = config.port, "server: session hosted");

        let tasks = vec![
            tokio::spawn(accept_loop(
                Arc::clone(&shared),
                listener,
                shared.stop.subscribe(),
            )),
            tokio::spawn(dispatch_loop(
                Arc::clone(&shared),
                queue_rx,
                shared.stop.subscribe(),
            )),
            tokio::spawn(election_loop(
                Arc::clone(&shared),
                udp,
                shared.stop.subscribe(),
            )),
        ];

        Ok(ChatServer { shared, tasks })
    }

    /// The random identity chosen at spawn.
    pub fn uid(&self) -> u64 {
        self.shared.uid
    }

    /// Whole seconds since the server was created.
    pub fn age_secs(&self) -> u32 {
        self.shared.age_secs()
    }

    /// Whether the server has yielded or been shut down.
    pub fn is_stopped(&self) -> bool {
        *self.shared.stop.borrow()
    }

    /// Signal stop, join every worker, and drop all client transports.
    pub async fn shutdown(mut self) {
        self.shared.signal_stop();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        let handles: Vec<ClientHandle> = {
            let mut clients = self.shared.clients.write().await;
            clients.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            for task in handle.tasks {
                let _ = task.await;
            }
        }
        info!(uid = self.shared.uid, "server: shut down");
    }
}

/// Bind a TCP listener with `SO_REUSEADDR` and `SO_REUSEPORT`.
fn bind_shared(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseport(true)?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(64)
}

/// Resolve once the stop flag is raised (or the server is gone).
async fn wait_stop(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Accept connections until stopped. A listener error stops the whole
/// server: without an accept loop the session cannot admit anyone.
async fn accept_loop(
    shared: Arc<ServerShared>,
    listener: TcpListener,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = wait_stop(&mut stop_rx) => return,
            accepted = listener.accept() => match accepted {
                Ok((socket, addr)) => admit(&shared, socket, addr).await,
                Err(e) => {
                    warn!("server: accept failed: {e}");
                    shared.signal_stop();
                    return;
                }
            }
        }
    }
}

/// Register an accepted connection and spawn its workers.
///
/// The record goes into the table before either worker exists: the reader
/// can pick up a SET_NAME in its very first poll, and a missing record
/// would silently drop it.
async fn admit(shared: &Arc<ServerShared>, socket: tokio::net::TcpStream, addr: SocketAddr) {
    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let name = addr.ip().to_string();
    let (read_half, write_half) = socket.into_split();
    let (tx, rx) = mpsc::unbounded_channel();

    shared.clients.write().await.insert(
        id,
        ClientHandle {
            name: name.clone(),
            tx: tx.clone(),
            tasks: Vec::new(),
        },
    );

    let reader = tokio::spawn(client_reader(
        Arc::clone(shared),
        id,
        read_half,
        tx,
        shared.stop.subscribe(),
    ));
    let writer = tokio::spawn(client_writer(
        Arc::clone(shared),
        id,
        write_half,
        rx,
        shared.stop.subscribe(),
    ));

    // If the record is already gone (the client died instantly), the
    // handles just detach; the workers are winding down on their own.
    if let Some(handle) = shared.clients.write().await.get_mut(&id) {
        handle.tasks = vec![reader, writer];
    }

    info!(id, %addr, "server: client connected");
    shared.enqueue(SERVER_NAME, format!("{name} connected."));
}

/// Per-client reader: SAYs feed the queue, SET_NAMEs rename, everything
/// else is skipped. Transport failure (or server stop) removes the record.
async fn client_reader(
    shared: Arc<ServerShared>,
    id: u64,
    read_half: OwnedReadHalf,
    handle_tx: mpsc::UnboundedSender<Frame>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut frames = FramedRead::new(read_half, ChatCodec);
    loop {
        tokio::select! {
            _ = wait_stop(&mut stop_rx) => break,
            // The record was removed elsewhere (write failure); dropping the
            // read half here is what finally closes the transport.
            _ = handle_tx.closed() => return,
            frame = frames.next() => match frame {
                Some(Ok(Frame::Say(text))) => shared.enqueue_say(id, &text).await,
                Some(Ok(Frame::SetName(name))) => shared.rename(id, &name).await,
                Some(Ok(_)) => {} // not client-to-server traffic, skip
                Some(Err(e)) => {
                    debug!(id, "server: client read failed: {e}");
                    break;
                }
                None => break,
            }
        }
    }
    shared.remove_client(id).await;
}

/// Per-client writer: drains the client's channel into the socket. A write
/// failure removes the record; the rest of the session is untouched.
async fn client_writer(
    shared: Arc<ServerShared>,
    id: u64,
    write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut sink = FramedWrite::new(write_half, ChatCodec);
    loop {
        tokio::select! {
            _ = wait_stop(&mut stop_rx) => return,
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        debug!(id, "server: client write failed: {e}");
                        break;
                    }
                }
                None => return, // record removed, nothing left to drain
            }
        }
    }
    shared.remove_client(id).await;
}

/// Single consumer of the dispatch queue: one frame per message, handed to
/// every registered client's writer channel in FIFO order.
async fn dispatch_loop(
    shared: Arc<ServerShared>,
    mut queue_rx: mpsc::UnboundedReceiver<(String, String)>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = wait_stop(&mut stop_rx) => return,
            item = queue_rx.recv() => {
                let Some((name, text)) = item else { return };
                let frame = Frame::Dispatch { name, text };
                let clients = shared.clients.read().await;
                for handle in clients.values() {
                    let _ = handle.tx.send(frame.clone());
                }
            }
        }
    }
}

/// Advertise this server and watch for rivals.
///
/// Each iteration sends one beacon, then drains incoming datagrams for the
/// cadence window: 100 ms while the server is younger than two seconds
/// (fast convergence right after an election), two seconds afterwards.
/// Requests get an extra beacon; rival beacons feed the yield decision.
async fn election_loop(
    shared: Arc<ServerShared>,
    udp: UdpSocket,
    mut stop_rx: watch::Receiver<bool>,
) {
    let target = SocketAddr::from((shared.config.broadcast, shared.config.port));
    let mut buf = [0u8; 64];

    loop {
        if *stop_rx.borrow_and_update() {
            return;
        }

        let beacon = Beacon {
            age_secs: shared.age_secs(),
            uid: shared.uid,
        };
        if let Err(e) = udp.send_to(&beacon.encode(), target).await {
            warn!("server: beacon send failed: {e}");
        }

        let window = if shared.started.elapsed() < YOUNG_AGE {
            YOUNG_WINDOW
        } else {
            MATURE_WINDOW
        };
        let deadline = Instant::now() + window;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let received = tokio::select! {
                _ = wait_stop(&mut stop_rx) => return,
                received = timeout(remaining, udp.recv_from(&mut buf)) => received,
            };
            match received {
                Err(_) => break, // window elapsed
                Ok(Err(e)) => {
                    warn!("server: beacon recv failed: {e}");
                    break;
                }
                Ok(Ok((len, _from))) => {
                    let datagram = &buf[..len];
                    if len == 1 && datagram[0] == OP_INFO_REQUEST {
                        let reply = Beacon {
                            age_secs: shared.age_secs(),
                            uid: shared.uid,
                        };
                        let _ = udp.send_to(&reply.encode(), target).await;
                        continue;
                    }
                    let Some(other) = Beacon::decode(datagram) else {
                        continue;
                    };
                    if other.uid == shared.uid {
                        continue; // our own beacon echoed back
                    }
                    if should_yield(shared.age_secs(), shared.uid, other.age_secs, other.uid) {
                        info!(
                            uid = shared.uid,
                            other_uid = other.uid,
                            other_age = other.age_secs,
                            "server: yielding to a more senior session"
                        );
                        shared.signal_stop();
                        return;
                    }
                }
            }
        }
    }
}
