//! Distribution: TCP links between named Agim nodes.
//!
//! A node is `name@host:port` plus a shared non-zero 64-bit cookie. Each
//! peer gets one persistent TCP connection with a dedicated reader thread;
//! a single heartbeat thread services every connection. Handshakes are
//! exchanged in both directions on accept and connect, and a version or
//! cookie mismatch drops the connection before the peer is registered.
//!
//! Inbound SEND frames are handed to a user-supplied callback as
//! `(from_node, target_pid, payload)` -- routing payloads into local
//! mailboxes is the embedder's decision. Delivery is best-effort and
//! ordered per connection; loss on disconnect surfaces only through
//! nodedown monitors, and nothing is retried across reconnects.

pub mod wire;

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::block::{Message, Pid};
use crate::codec;
use crate::sched::Scheduler;
use crate::value::Value;
use self::wire::{
    encode_handshake, encode_send, parse_handshake, parse_send, read_frame, validate_handshake,
    write_frame, WireError, FRAME_HANDSHAKE, FRAME_HEARTBEAT, FRAME_SEND,
};

// ---------------------------------------------------------------------------
// Configuration & errors
// ---------------------------------------------------------------------------

/// Identity and transport parameters for a node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Short node name; the full identity is `name@host:port`.
    pub name: String,
    pub host: String,
    /// Listen port; 0 lets the OS choose.
    pub port: u16,
    /// Shared secret. Zero is rejected.
    pub cookie: u64,
    /// Heartbeat interval in milliseconds.
    pub heartbeat_ms: u64,
}

impl NodeConfig {
    pub fn new(name: &str, host: &str, port: u16, cookie: u64) -> Self {
        NodeConfig {
            name: name.to_string(),
            host: host.to_string(),
            port,
            cookie,
            heartbeat_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    ZeroCookie,
    Bind(String),
    Connect(String),
    Handshake(String),
    /// No live connection to the named peer.
    NotConnected(String),
    Encode(String),
    Io(String),
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeError::ZeroCookie => write!(f, "node cookie must be non-zero"),
            NodeError::Bind(msg) => write!(f, "bind failed: {}", msg),
            NodeError::Connect(msg) => write!(f, "connect failed: {}", msg),
            NodeError::Handshake(msg) => write!(f, "handshake failed: {}", msg),
            NodeError::NotConnected(name) => write!(f, "not connected to node '{}'", name),
            NodeError::Encode(msg) => write!(f, "payload encode failed: {}", msg),
            NodeError::Io(msg) => write!(f, "node io: {}", msg),
        }
    }
}

/// Inbound SEND hook: `(from_node, target_pid, payload)`.
pub type DeliverFn = Arc<dyn Fn(&str, u64, &[u8]) + Send + Sync>;

// ---------------------------------------------------------------------------
// Peer
// ---------------------------------------------------------------------------

/// One authenticated connection to a remote node.
pub struct Peer {
    pub name: String,
    /// Writer half; the reader thread owns a cloned handle.
    stream: Mutex<TcpStream>,
    /// Node-clock timestamp of the last inbound heartbeat.
    last_heartbeat_ms: AtomicU64,
    pub connected_at: Instant,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("name", &self.name)
            .field("last_heartbeat_ms", &self.last_heartbeat_ms.load(Ordering::Relaxed))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A running node: listener, peer table, heartbeat, nodedown monitors.
pub struct Node {
    config: NodeConfig,
    sched: Arc<Scheduler>,
    deliver: DeliverFn,
    peers: RwLock<FxHashMap<String, Arc<Peer>>>,
    /// Blocks to notify on peer disconnect; `None` matches every peer.
    monitors: Mutex<Vec<(Pid, Option<String>)>>,
    shutdown: AtomicBool,
    /// Actual listen port (differs from config when it asked for 0).
    port: u16,
    started: Instant,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Node {
    /// Bind the listener, start the accept and heartbeat threads, and
    /// return the running node.
    pub fn start(
        config: NodeConfig,
        sched: Arc<Scheduler>,
        deliver: DeliverFn,
    ) -> Result<Arc<Node>, NodeError> {
        if config.cookie == 0 {
            return Err(NodeError::ZeroCookie);
        }

        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .map_err(|e| NodeError::Bind(e.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|e| NodeError::Bind(e.to_string()))?
            .port();
        listener
            .set_nonblocking(true)
            .map_err(|e| NodeError::Bind(e.to_string()))?;

        let node = Arc::new(Node {
            config,
            sched,
            deliver,
            peers: RwLock::new(FxHashMap::default()),
            monitors: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            port,
            started: Instant::now(),
            threads: Mutex::new(Vec::new()),
        });

        let accept_node = Arc::clone(&node);
        let accept = std::thread::spawn(move || accept_loop(accept_node, listener));
        let beat_node = Arc::clone(&node);
        let heartbeat = std::thread::spawn(move || heartbeat_loop(beat_node));
        node.threads.lock().extend([accept, heartbeat]);

        Ok(node)
    }

    /// Full node identity, `name@host:port`.
    pub fn full_name(&self) -> String {
        format!("{}@{}:{}", self.config.name, self.config.host, self.port)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Connect to a peer at `host:port` and run the mutual handshake.
    /// Returns the peer's full name.
    pub fn connect(self: &Arc<Self>, addr: &str) -> Result<String, NodeError> {
        let mut stream = TcpStream::connect(addr).map_err(|e| NodeError::Connect(e.to_string()))?;

        let body = encode_handshake(self.config.cookie, &self.full_name())
            .map_err(|e| NodeError::Handshake(e.to_string()))?;
        write_frame(&mut stream, FRAME_HANDSHAKE, &body)
            .map_err(|e| NodeError::Handshake(e.to_string()))?;

        let peer_name = expect_handshake(&mut stream, self.config.cookie)?;
        self.register_peer(peer_name.clone(), stream)?;
        Ok(peer_name)
    }

    /// Send raw payload bytes to a PID on a connected peer.
    pub fn send(
        &self,
        peer_name: &str,
        target_pid: u64,
        sender: Pid,
        payload: &[u8],
    ) -> Result<(), NodeError> {
        let peer = self
            .peers
            .read()
            .get(peer_name)
            .cloned()
            .ok_or_else(|| NodeError::NotConnected(peer_name.to_string()))?;

        let body = encode_send(target_pid, sender.as_u64(), payload);
        let result = write_frame(&mut *peer.stream.lock(), FRAME_SEND, &body);
        if let Err(err) = result {
            self.disconnect(peer_name);
            return Err(NodeError::Io(err.to_string()));
        }
        Ok(())
    }

    /// Send a runtime value, TLV-encoded.
    pub fn send_value(
        &self,
        peer_name: &str,
        target_pid: u64,
        sender: Pid,
        value: &Value,
    ) -> Result<(), NodeError> {
        let payload = codec::to_bytes(value).map_err(|e| NodeError::Encode(e.to_string()))?;
        self.send(peer_name, target_pid, sender, &payload)
    }

    /// Register `watcher` for nodedown notifications; `None` watches
    /// every peer.
    pub fn monitor_node(&self, watcher: Pid, peer: Option<&str>) {
        self.monitors
            .lock()
            .push((watcher, peer.map(String::from)));
    }

    /// Drop every nodedown registration held by `watcher`.
    pub fn demonitor_node(&self, watcher: Pid) {
        self.monitors.lock().retain(|(pid, _)| *pid != watcher);
    }

    /// Names of currently connected peers.
    pub fn peers(&self) -> Vec<String> {
        self.peers.read().keys().cloned().collect()
    }

    /// Node-clock milliseconds since the last heartbeat from `peer`.
    pub fn heartbeat_age_ms(&self, peer: &str) -> Option<u64> {
        let peers = self.peers.read();
        let p = peers.get(peer)?;
        Some(
            self.now_ms()
                .saturating_sub(p.last_heartbeat_ms.load(Ordering::Relaxed)),
        )
    }

    /// Stop the listener, drop every connection, and join the threads.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let peers: Vec<Arc<Peer>> = self.peers.write().drain().map(|(_, p)| p).collect();
        for peer in peers {
            let _ = peer.stream.lock().shutdown(std::net::Shutdown::Both);
        }
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Insert an authenticated peer and start its reader thread.
    fn register_peer(self: &Arc<Self>, name: String, stream: TcpStream) -> Result<(), NodeError> {
        let reader_stream = stream
            .try_clone()
            .map_err(|e| NodeError::Io(e.to_string()))?;

        let peer = Arc::new(Peer {
            name: name.clone(),
            stream: Mutex::new(stream),
            last_heartbeat_ms: AtomicU64::new(self.now_ms()),
            connected_at: Instant::now(),
        });

        {
            let mut peers = self.peers.write();
            // One connection per peer: an existing session wins and the
            // new socket is dropped on return.
            if peers.contains_key(&name) {
                return Err(NodeError::Connect(format!("already connected to {}", name)));
            }
            peers.insert(name.clone(), Arc::clone(&peer));
        }

        let node = Arc::clone(self);
        let handle = std::thread::spawn(move || reader_loop(node, peer, reader_stream));
        self.threads.lock().push(handle);
        Ok(())
    }

    /// Remove a peer and fire its nodedown monitors.
    fn disconnect(&self, name: &str) {
        let removed = self.peers.write().remove(name);
        if let Some(peer) = removed {
            let _ = peer.stream.lock().shutdown(std::net::Shutdown::Both);
            self.fire_nodedown(name);
        }
    }

    fn fire_nodedown(&self, name: &str) {
        let monitors = self.monitors.lock().clone();
        for (pid, filter) in monitors {
            let watches_this = filter.as_deref().map(|f| f == name).unwrap_or(true);
            if !watches_this {
                continue;
            }
            if let Some(block) = self.sched.block(pid) {
                let _ = self
                    .sched
                    .deliver(&block, Message::node_down(name.to_string()));
            }
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.full_name())
            .field("peers", &self.peers.read().len())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Threads
// ---------------------------------------------------------------------------

/// Accept incoming connections until shutdown. The listener is
/// non-blocking so shutdown never strands the thread.
fn accept_loop(node: Arc<Node>, listener: TcpListener) {
    while !node.is_shutdown() {
        match listener.accept() {
            Ok((stream, _addr)) => {
                // Handshake inline; a bad peer costs one round.
                if let Err(_err) = handle_incoming(&node, stream) {
                    // Connection dropped; nothing registered.
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(_) => break,
        }
    }
}

/// Accept-side handshake: read theirs, validate, answer with ours.
fn handle_incoming(node: &Arc<Node>, mut stream: TcpStream) -> Result<(), NodeError> {
    stream
        .set_nonblocking(false)
        .map_err(|e| NodeError::Io(e.to_string()))?;
    let peer_name = expect_handshake(&mut stream, node.config.cookie)?;

    let body = encode_handshake(node.config.cookie, &node.full_name())
        .map_err(|e| NodeError::Handshake(e.to_string()))?;
    write_frame(&mut stream, FRAME_HANDSHAKE, &body)
        .map_err(|e| NodeError::Handshake(e.to_string()))?;

    node.register_peer(peer_name, stream)
}

/// Read and validate one HANDSHAKE frame. Returns the peer's name.
fn expect_handshake(stream: &mut TcpStream, cookie: u64) -> Result<String, NodeError> {
    let (kind, body) = read_frame(stream).map_err(|e| NodeError::Handshake(e.to_string()))?;
    if kind != FRAME_HANDSHAKE {
        return Err(NodeError::Handshake(format!(
            "expected handshake frame, got 0x{:02X}",
            kind
        )));
    }
    let (version, peer_cookie, name) =
        parse_handshake(&body).map_err(|e| NodeError::Handshake(e.to_string()))?;
    validate_handshake(version, peer_cookie, cookie)
        .map_err(|e: WireError| NodeError::Handshake(e.to_string()))?;
    Ok(name)
}

/// Per-connection reader: frames in, dispatch, disconnect on error.
fn reader_loop(node: Arc<Node>, peer: Arc<Peer>, mut stream: TcpStream) {
    loop {
        if node.is_shutdown() {
            return;
        }
        match read_frame(&mut stream) {
            Ok((FRAME_HEARTBEAT, _)) => {
                peer.last_heartbeat_ms.store(node.now_ms(), Ordering::Relaxed);
            }
            Ok((FRAME_SEND, body)) => match parse_send(&body) {
                Ok((target, _sender, payload)) => {
                    (node.deliver)(&peer.name, target, payload);
                }
                // Undersized SEND body: protocol violation, drop the link.
                Err(_) => break,
            },
            // Reserved opcodes (LINK..DOWN) and stray handshakes are
            // ignored for forward compatibility.
            Ok((_, _)) => {}
            Err(_) => break,
        }
    }
    node.disconnect(&peer.name);
}

/// Heartbeat every peer on the configured interval; a failed write
/// disconnects the peer.
fn heartbeat_loop(node: Arc<Node>) {
    while !node.is_shutdown() {
        std::thread::sleep(Duration::from_millis(node.config.heartbeat_ms));
        let peers: Vec<Arc<Peer>> = node.peers.read().values().cloned().collect();
        for peer in peers {
            let result = write_frame(&mut *peer.stream.lock(), FRAME_HEARTBEAT, &[]);
            if result.is_err() {
                node.disconnect(&peer.name);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::SchedulerConfig;
    use crate::stepper::{program_fn, StepStatus};
    use std::sync::mpsc;

    fn test_sched() -> Arc<Scheduler> {
        Arc::new(Scheduler::new(SchedulerConfig {
            workers: 1,
            ..SchedulerConfig::default()
        }))
    }

    fn quiet_deliver() -> DeliverFn {
        Arc::new(|_, _, _| {})
    }

    fn start_node(name: &str, cookie: u64, deliver: DeliverFn) -> Arc<Node> {
        let mut config = NodeConfig::new(name, "127.0.0.1", 0, cookie);
        config.heartbeat_ms = 50;
        Node::start(config, test_sched(), deliver).unwrap()
    }

    #[test]
    fn test_zero_cookie_rejected() {
        let config = NodeConfig::new("a", "127.0.0.1", 0, 0);
        let result = Node::start(config, test_sched(), quiet_deliver());
        assert!(matches!(result, Err(NodeError::ZeroCookie)));
    }

    #[test]
    fn test_connect_registers_both_sides() {
        let a = start_node("a", 0xAB, quiet_deliver());
        let b = start_node("b", 0xAB, quiet_deliver());

        let peer = b.connect(&format!("127.0.0.1:{}", a.port())).unwrap();
        assert_eq!(peer, a.full_name());

        // The accept side registers asynchronously.
        let deadline = Instant::now() + Duration::from_secs(2);
        while a.peers().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(a.peers(), vec![b.full_name()]);

        b.shutdown();
        a.shutdown();
    }

    #[test]
    fn test_cookie_mismatch_drops_connection() {
        let a = start_node("a", 0xAAAA, quiet_deliver());
        let b = start_node("b", 0xBBBB, quiet_deliver());

        let result = b.connect(&format!("127.0.0.1:{}", a.port()));
        assert!(result.is_err(), "mismatched cookies must not connect");
        assert!(b.peers().is_empty());

        b.shutdown();
        a.shutdown();
    }

    #[test]
    fn test_send_reaches_deliver_callback() {
        let (tx, rx) = mpsc::channel::<(String, u64, Vec<u8>)>();
        let deliver: DeliverFn = Arc::new(move |from, target, payload| {
            let _ = tx.send((from.to_string(), target, payload.to_vec()));
        });
        let a = start_node("server", 0xCAFE_BABE, deliver);
        let b = start_node("client", 0xCAFE_BABE, quiet_deliver());

        let peer = b.connect(&format!("127.0.0.1:{}", a.port())).unwrap();
        b.send(&peer, 42, Pid(7), b"Hello").unwrap();

        let (from, target, payload) = rx.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(from, b.full_name());
        assert_eq!(target, 42);
        assert_eq!(payload, b"Hello");
        assert_eq!(payload.len(), 5);

        b.shutdown();
        a.shutdown();
    }

    #[test]
    fn test_send_value_roundtrips_tlv() {
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let deliver: DeliverFn = Arc::new(move |_, _, payload| {
            let _ = tx.send(payload.to_vec());
        });
        let a = start_node("a", 0x11, deliver);
        let b = start_node("b", 0x11, quiet_deliver());

        let peer = b.connect(&format!("127.0.0.1:{}", a.port())).unwrap();
        b.send_value(&peer, 1, Pid(2), &Value::str("ping")).unwrap();

        let payload = rx.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(codec::from_bytes(&payload).unwrap(), Value::str("ping"));

        b.shutdown();
        a.shutdown();
    }

    #[test]
    fn test_send_to_unknown_peer() {
        let a = start_node("a", 0x22, quiet_deliver());
        assert_eq!(
            a.send("ghost@nowhere:1", 1, Pid(1), b"x").unwrap_err(),
            NodeError::NotConnected("ghost@nowhere:1".to_string())
        );
        a.shutdown();
    }

    #[test]
    fn test_heartbeat_refreshes() {
        let a = start_node("a", 0x33, quiet_deliver());
        let b = start_node("b", 0x33, quiet_deliver());
        let peer = b.connect(&format!("127.0.0.1:{}", a.port())).unwrap();

        // Wait past a few heartbeat intervals; the age must stay low.
        std::thread::sleep(Duration::from_millis(200));
        let age = b.heartbeat_age_ms(&peer).unwrap();
        assert!(age < 150, "heartbeats should keep the age fresh, got {}", age);

        b.shutdown();
        a.shutdown();
    }

    #[test]
    fn test_nodedown_monitor_notified() {
        let sched = test_sched();
        // A parked block that never runs; we only inspect its mailbox.
        let watcher = sched
            .spawn(program_fn(|_| StepStatus::Ok), Some("watcher"))
            .unwrap();
        let watcher_block = sched.block(watcher).unwrap();

        let config = NodeConfig::new("a", "127.0.0.1", 0, 0x44);
        let a = Node::start(config, Arc::clone(&sched), quiet_deliver()).unwrap();
        let b = start_node("b", 0x44, quiet_deliver());

        let _peer = b.connect(&format!("127.0.0.1:{}", a.port())).unwrap();
        a.monitor_node(watcher, None);

        // Wait for A to register B, then drop B entirely.
        let deadline = Instant::now() + Duration::from_secs(2);
        while a.peers().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        b.shutdown();

        let deadline = Instant::now() + Duration::from_secs(2);
        while watcher_block.mailbox().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let msg = watcher_block.mailbox().pop().unwrap();
        assert!(matches!(msg.tag, crate::block::MessageTag::NodeDown(_)));

        a.shutdown();
    }
}
