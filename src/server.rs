/// QSY node pool server.
///
/// Three worker loops: the UDP listener picks hello announcements off
/// the multicast group, the accept loop dials nodes over TCP and owns
/// the pool map, and the fan-out loop delivers packets and lifecycle
/// events to registered listeners. Nodes that error, miss their
/// keep-alive, or re-announce while still pooled are pruned; the node is
/// expected to hello again and come back as a fresh connection.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::node::{self, NodeHandle};
use crate::protocol::{Packet, PacketType, PACKET_SIZE};

/// Port nodes listen on, for both discovery and the TCP dial-back.
pub const QSY_PORT: u16 = 3000;

/// Multicast group nodes announce themselves on.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 12);

/// Terminal address on the isolated game network.
pub const DEFAULT_LOCAL_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

/// Keep-alive window before an idle node is considered lost.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// How often the UDP listener wakes to check for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// TCP dial-back timeout for a freshly announced node.
const DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Depth of the accept and fan-out queues.
const CHANNEL_DEPTH: usize = 16;

/// Callbacks for pool activity. Each callback runs on its own thread so
/// a slow listener never stalls the pool; ordering across callbacks is
/// not guaranteed.
pub trait Listener: Send + Sync + 'static {
    fn receive(&self, packet: Packet);
    fn new_node(&self, id: u16);
    fn lost_node(&self, id: u16);
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Multicast group to join for hello announcements.
    pub group: Ipv4Addr,
    /// Interface address the group is joined on.
    pub local_addr: Ipv4Addr,
    /// Address the UDP socket binds to.
    pub route: Ipv4Addr,
    pub keep_alive: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            group: MULTICAST_GROUP,
            local_addr: DEFAULT_LOCAL_ADDR,
            route: Ipv4Addr::UNSPECIFIED,
            keep_alive: DEFAULT_KEEP_ALIVE,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("node {0} does not exist")]
    NotExist(u16),
    #[error("connection to node {0} is closed")]
    ConnectionClosed(u16),
    #[error("server is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Io(#[from] io::Error),
}

enum AcceptMsg {
    Hello { id: u16, source: SocketAddr },
    Lost(u16),
    Shutdown,
}

enum PoolEvent {
    Packet(Packet),
    Connected(u16),
    Disconnected(u16),
    Shutdown,
}

/// Handle to the pool server. Clones share the same server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

struct Inner {
    socket: UdpSocket,
    pool: RwLock<HashMap<u16, NodeHandle>>,
    listeners: RwLock<Vec<Arc<dyn Listener>>>,
    accept_tx: SyncSender<AcceptMsg>,
    fanout_tx: SyncSender<PoolEvent>,
    accept_rx: Mutex<Option<Receiver<AcceptMsg>>>,
    fanout_rx: Mutex<Option<Receiver<PoolEvent>>>,
    keep_alive: Duration,
    searching: AtomicBool,
    running: AtomicBool,
    stopped: AtomicBool,
}

impl Server {
    /// Bind the discovery socket and join the multicast group. Failures
    /// here are fatal to startup.
    pub fn new(config: ServerConfig) -> Result<Server, ServerError> {
        let socket = UdpSocket::bind((config.route, QSY_PORT))?;
        socket.join_multicast_v4(&config.group, &config.local_addr)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        log::info!(
            "listening for hellos on {}:{} via {}",
            config.group,
            QSY_PORT,
            config.local_addr
        );
        Ok(Self::with_socket(socket, config.keep_alive))
    }

    pub(crate) fn with_socket(socket: UdpSocket, keep_alive: Duration) -> Server {
        let (accept_tx, accept_rx) = mpsc::sync_channel(CHANNEL_DEPTH);
        let (fanout_tx, fanout_rx) = mpsc::sync_channel(CHANNEL_DEPTH);
        Server {
            inner: Arc::new(Inner {
                socket,
                pool: RwLock::new(HashMap::new()),
                listeners: RwLock::new(Vec::new()),
                accept_tx,
                fanout_tx,
                accept_rx: Mutex::new(Some(accept_rx)),
                fanout_rx: Mutex::new(Some(fanout_rx)),
                keep_alive,
                searching: AtomicBool::new(false),
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn Listener>) {
        self.inner.listeners.write().unwrap().push(listener);
    }

    /// Start the three worker loops. Runs at most once per server
    /// lifetime; the call itself does not block.
    pub fn listen_and_accept(&self) -> Result<(), ServerError> {
        if self.inner.running.swap(true, Ordering::SeqCst) || self.inner.stopped.load(Ordering::SeqCst)
        {
            return Err(ServerError::AlreadyRunning);
        }
        let accept_rx = self
            .inner
            .accept_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(ServerError::AlreadyRunning)?;
        let fanout_rx = self
            .inner
            .fanout_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(ServerError::AlreadyRunning)?;
        self.inner.searching.store(true, Ordering::SeqCst);

        let udp_inner = self.inner.clone();
        let udp_socket = self.inner.socket.try_clone()?;
        thread::Builder::new()
            .name("qsy-udp".into())
            .spawn(move || run_udp(udp_inner, udp_socket))?;

        let accept_inner = self.inner.clone();
        thread::Builder::new()
            .name("qsy-accept".into())
            .spawn(move || run_accept(accept_inner, accept_rx))?;

        let fanout_inner = self.inner.clone();
        thread::Builder::new()
            .name("qsy-fanout".into())
            .spawn(move || run_fanout(fanout_inner, fanout_rx))?;
        Ok(())
    }

    /// Encode and queue a frame to the node addressed by `packet.id`.
    pub fn send(&self, packet: Packet) -> Result<(), ServerError> {
        let frame = packet.encode();
        let queue = {
            let pool = self.inner.pool.read().unwrap();
            let handle = pool.get(&packet.id).ok_or(ServerError::NotExist(packet.id))?;
            handle.sender()
        };
        queue
            .send(frame.to_vec())
            .map_err(|_| ServerError::ConnectionClosed(packet.id))
    }

    /// Snapshot of currently connected node ids.
    pub fn nodes(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.inner.pool.read().unwrap().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Resume accepting hello announcements. NOP after shutdown.
    pub fn search(&self) {
        if !self.inner.stopped.load(Ordering::SeqCst) {
            self.inner.searching.store(true, Ordering::SeqCst);
        }
    }

    /// Drop hello announcements without accepting them. NOP after
    /// shutdown.
    pub fn stop_search(&self) {
        if !self.inner.stopped.load(Ordering::SeqCst) {
            self.inner.searching.store(false, Ordering::SeqCst);
        }
    }

    /// Stop all worker loops and close every node.
    pub fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.searching.store(false, Ordering::SeqCst);
        let _ = self.inner.accept_tx.send(AcceptMsg::Shutdown);
    }
}

fn run_udp(inner: Arc<Inner>, socket: UdpSocket) {
    let mut buf = [0u8; PACKET_SIZE];
    loop {
        if inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        let (n, source) = match socket.recv_from(&mut buf) {
            Ok(read) => read,
            Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(err) => {
                log::warn!("udp read failed: {err}");
                thread::sleep(POLL_INTERVAL);
                continue;
            }
        };
        if !inner.searching.load(Ordering::SeqCst) {
            continue;
        }
        let pkt = match Packet::decode(&buf[..n]) {
            Ok(pkt) => pkt,
            Err(err) => {
                log::debug!("ignoring multicast frame from {source}: {err}");
                continue;
            }
        };
        if pkt.kind != PacketType::Hello {
            continue;
        }
        if inner
            .accept_tx
            .send(AcceptMsg::Hello {
                id: pkt.id,
                source,
            })
            .is_err()
        {
            return;
        }
    }
}

fn run_accept(inner: Arc<Inner>, queue: Receiver<AcceptMsg>) {
    for msg in queue {
        match msg {
            AcceptMsg::Hello { id, source } => accept_node(&inner, id, source),
            AcceptMsg::Lost(id) => prune(&inner, id),
            AcceptMsg::Shutdown => {
                let nodes: Vec<(u16, NodeHandle)> =
                    inner.pool.write().unwrap().drain().collect();
                for (id, handle) in nodes {
                    handle.close();
                    log::info!("closed node {id}");
                }
                let _ = inner.fanout_tx.send(PoolEvent::Shutdown);
                return;
            }
        }
    }
}

fn accept_node(inner: &Arc<Inner>, id: u16, source: SocketAddr) {
    if inner.pool.read().unwrap().contains_key(&id) {
        // A second hello while pooled means the old connection is
        // stale. Prune it; the node's next hello reconnects it.
        log::info!("duplicate hello from node {id}, pruning stale entry");
        prune(inner, id);
        return;
    }
    let addr = SocketAddr::new(source.ip(), QSY_PORT);
    let stream = match TcpStream::connect_timeout(&addr, DIAL_TIMEOUT) {
        Ok(stream) => stream,
        Err(err) => {
            log::warn!("failed to dial node {id} at {addr}: {err}");
            return;
        }
    };
    if let Err(err) = stream.set_nodelay(true) {
        log::warn!("failed to set no delay for node {id}: {err}");
        return;
    }
    let fanout_tx = inner.fanout_tx.clone();
    let accept_tx = inner.accept_tx.clone();
    let handle = match node::listen(
        stream,
        id,
        inner.keep_alive,
        move |pkt| {
            let _ = fanout_tx.send(PoolEvent::Packet(pkt));
        },
        move |id| {
            let _ = accept_tx.send(AcceptMsg::Lost(id));
        },
    ) {
        Ok(handle) => handle,
        Err(err) => {
            log::warn!("failed to start workers for node {id}: {err}");
            return;
        }
    };
    inner.pool.write().unwrap().insert(id, handle);
    log::info!("new node: {id} at {addr}");
    let _ = inner.fanout_tx.send(PoolEvent::Connected(id));
}

fn prune(inner: &Arc<Inner>, id: u16) {
    let handle = inner.pool.write().unwrap().remove(&id);
    if let Some(handle) = handle {
        handle.close();
        log::info!("lost node: {id}");
        let _ = inner.fanout_tx.send(PoolEvent::Disconnected(id));
    }
}

fn run_fanout(inner: Arc<Inner>, queue: Receiver<PoolEvent>) {
    for event in queue {
        let listeners: Vec<Arc<dyn Listener>> = inner.listeners.read().unwrap().clone();
        match event {
            PoolEvent::Packet(pkt) => {
                for listener in listeners {
                    thread::spawn(move || listener.receive(pkt));
                }
            }
            PoolEvent::Connected(id) => {
                for listener in listeners {
                    thread::spawn(move || listener.new_node(id));
                }
            }
            PoolEvent::Disconnected(id) => {
                for listener in listeners {
                    thread::spawn(move || listener.lost_node(id));
                }
            }
            PoolEvent::Shutdown => return,
        }
    }
}
