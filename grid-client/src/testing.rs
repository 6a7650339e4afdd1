//! In-process cluster speaking the client wire protocol over loopback TCP.
//!
//! Each [`MockNode`] accepts connections, answers handshakes, topology, cache
//! and task requests, and keeps counters tests can assert on. Nodes share a
//! roster, which is what they report as the cluster topology. Faults are
//! injected per node: drop the connection instead of answering, delay
//! responses, kick every client, or leave the roster while still serving.
//! A cluster started with [`MockCluster::start_tls`] terminates TLS on every
//! accepted socket before reading frames.

use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{bail, Context, Result};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    select,
    sync::watch,
    task::JoinHandle,
    time,
};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::{
    codec::{read_frame, write_frame, Flags, Opcode, Request, Response, ResponseStatus},
    message::{
        decode_body, encode_body, CacheCommand, CacheRequest, HandshakeRequest, HandshakeResponse,
        TaskRequest, PROTOCOL_VERSION,
    },
    node::{NodeDescriptor, NodeId, NodeMetrics},
};

/// Server-side task body: argument in, result or diagnostic out.
pub type TaskFn = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

/// Membership and task registry shared by every node of a cluster.
#[derive(Default)]
struct Shared {
    roster: Mutex<BTreeMap<NodeId, NodeDescriptor>>,
    tasks: Mutex<HashMap<String, TaskFn>>,
    tls: Option<TlsAcceptor>,
}

pub struct MockCluster {
    shared: Arc<Shared>,
    nodes: Vec<MockNode>,
}

impl MockCluster {
    /// Starts `size` nodes with sequential ids. Tasks `echo`, `node_id` and
    /// `fail` are registered up front.
    pub async fn start(size: usize) -> Result<Self> {
        Self::with_shared(size, Shared::default()).await
    }

    /// Like [`MockCluster::start`], but every node only accepts TLS clients
    /// and presents the certificate of `server`.
    pub async fn start_tls(size: usize, server: Arc<rustls::ServerConfig>) -> Result<Self> {
        let shared = Shared {
            tls: Some(TlsAcceptor::from(server)),
            ..Shared::default()
        };
        Self::with_shared(size, shared).await
    }

    async fn with_shared(size: usize, shared: Shared) -> Result<Self> {
        let shared = Arc::new(shared);
        let mut cluster = Self {
            shared,
            nodes: Vec::with_capacity(size),
        };
        cluster.register_task("echo", |arg| Ok(arg));
        cluster.register_task("fail", |arg| Err(format!("task failed on purpose: {arg}")));
        for _ in 0..size {
            cluster.add_node().await?;
        }
        Ok(cluster)
    }

    /// Starts one more node and adds it to the roster.
    pub async fn add_node(&mut self) -> Result<&MockNode> {
        let id = NodeId::from_u128(self.nodes.len() as u128 + 1);
        let node = MockNode::start(id, Arc::clone(&self.shared)).await?;
        self.nodes.push(node);
        let index = self.nodes.len() - 1;
        Ok(&self.nodes[index])
    }

    pub fn register_task<F>(&self, name: &str, task: F)
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.shared.tasks.lock().insert(name.to_string(), Arc::new(task));
    }

    pub fn node(&self, index: usize) -> &MockNode {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> &[MockNode] {
        &self.nodes
    }

    pub fn node_by_id(&self, id: NodeId) -> Option<&MockNode> {
        self.nodes.iter().find(|node| node.id() == id)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(MockNode::id).collect()
    }

    pub fn seeds(&self) -> Vec<SocketAddr> {
        self.nodes.iter().map(MockNode::addr).collect()
    }

    /// Data and task requests served across all nodes.
    pub fn served(&self) -> u64 {
        self.nodes.iter().map(MockNode::served).sum()
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.stop().await;
        }
    }
}

/// Per-node state the connection handlers work against.
struct NodeState {
    id: NodeId,
    addr: SocketAddr,
    shared: Arc<Shared>,
    caches: Mutex<HashMap<Option<String>, HashMap<String, Value>>>,
    served: AtomicU64,
    handshakes: AtomicU64,
    topology_requests: AtomicU64,
    drop_next: AtomicU32,
    delay: Mutex<Duration>,
    // Bumped to kick every connected client.
    kick: watch::Sender<u64>,
}

pub struct MockNode {
    state: Arc<NodeState>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MockNode {
    async fn start(id: NodeId, shared: Arc<Shared>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind mock node listener")?;
        let addr = listener.local_addr()?;
        let (kick, _) = watch::channel(0);
        let state = Arc::new(NodeState {
            id,
            addr,
            shared,
            caches: Mutex::new(HashMap::new()),
            served: AtomicU64::new(0),
            handshakes: AtomicU64::new(0),
            topology_requests: AtomicU64::new(0),
            drop_next: AtomicU32::new(0),
            delay: Mutex::new(Duration::ZERO),
            kick,
        });
        let node = Self {
            state,
            shutdown: watch::channel(false).0,
            task: Mutex::new(None),
        };
        node.join();

        let stop = node.shutdown.subscribe();
        let state = Arc::clone(&node.state);
        *node.task.lock() = Some(tokio::spawn(accept_loop(listener, state, stop)));
        info!(%id, %addr, "mock node listening");
        Ok(node)
    }

    pub fn id(&self) -> NodeId {
        self.state.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.state.addr
    }

    /// The descriptor this node advertises, with metrics and attributes.
    pub fn descriptor(&self) -> NodeDescriptor {
        self.state
            .shared
            .roster
            .lock()
            .get(&self.state.id)
            .cloned()
            .unwrap_or_else(|| default_descriptor(self.state.id, self.state.addr))
    }

    /// Cache and task requests answered so far.
    pub fn served(&self) -> u64 {
        self.state.served.load(Ordering::SeqCst)
    }

    pub fn handshakes(&self) -> u64 {
        self.state.handshakes.load(Ordering::SeqCst)
    }

    pub fn topology_requests(&self) -> u64 {
        self.state.topology_requests.load(Ordering::SeqCst)
    }

    /// Closes the connection instead of answering the next `count` cache or
    /// task requests.
    pub fn drop_next(&self, count: u32) {
        self.state.drop_next.store(count, Ordering::SeqCst);
    }

    /// Holds every response back for `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock() = delay;
    }

    /// Drops every open client connection. New connections are still accepted.
    pub fn disconnect_all(&self) {
        self.state.kick.send_modify(|generation| *generation += 1);
    }

    /// Removes this node from the advertised roster but keeps it serving.
    pub fn leave(&self) {
        self.state.shared.roster.lock().remove(&self.state.id);
    }

    /// Adds this node back to the roster.
    pub fn join(&self) {
        let descriptor = default_descriptor(self.state.id, self.state.addr);
        self.state.shared.roster.lock().insert(self.state.id, descriptor);
    }

    pub fn set_metrics(&self, metrics: NodeMetrics) {
        if let Some(descriptor) = self.state.shared.roster.lock().get_mut(&self.state.id) {
            descriptor.metrics = Some(metrics);
        }
    }

    pub fn set_attribute(&self, key: &str, value: &str) {
        if let Some(descriptor) = self.state.shared.roster.lock().get_mut(&self.state.id) {
            descriptor.attributes.insert(key.to_string(), value.to_string());
        }
    }

    /// Number of entries this node holds for `cache`.
    pub fn cache_len(&self, cache: Option<&str>) -> usize {
        self.state
            .caches
            .lock()
            .get(&cache.map(str::to_string))
            .map_or(0, HashMap::len)
    }

    /// Stops accepting, drops all clients and leaves the roster.
    pub async fn stop(&self) {
        self.leave();
        self.shutdown.send_replace(true);
        self.disconnect_all();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

fn default_descriptor(id: NodeId, addr: SocketAddr) -> NodeDescriptor {
    NodeDescriptor::new(id, vec![addr])
        .with_metrics(NodeMetrics::default())
        .with_attribute("mock.addr", addr.to_string())
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<NodeState>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        if let Err(err) = accept_connection(stream, Arc::clone(&state)).await {
                            debug!(
                                node = %state.id,
                                %peer,
                                error = ?err,
                                "mock connection ended with error"
                            );
                        }
                    });
                }
                Err(err) => warn!(node = %state.id, error = ?err, "mock node failed to accept"),
            },
        }
    }
    debug!(node = %state.id, "mock node stopped accepting");
}

async fn accept_connection(stream: TcpStream, state: Arc<NodeState>) -> Result<()> {
    match state.shared.tls.clone() {
        Some(acceptor) => {
            let stream = acceptor
                .accept(stream)
                .await
                .context("mock node TLS handshake")?;
            serve_connection(stream, state).await
        }
        None => serve_connection(stream, state).await,
    }
}

async fn serve_connection<S>(stream: S, state: Arc<NodeState>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut kicked = state.kick.subscribe();
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = BytesMut::new();

    loop {
        let frame = select! {
            biased;
            _ = kicked.changed() => return Ok(()),
            frame = read_frame(&mut reader, &mut buf) => frame?,
        };
        let Some(frame) = frame else {
            return Ok(());
        };
        let request = Request::from_frame(frame)?;

        if matches!(request.opcode, Opcode::CacheGet
            | Opcode::CachePut
            | Opcode::CacheRemove
            | Opcode::CacheReplace
            | Opcode::CacheCompareAndSet
            | Opcode::CacheGetAll
            | Opcode::CachePutAll
            | Opcode::CacheRemoveAll
            | Opcode::Task)
        {
            let dropped = state
                .drop_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if dropped {
                debug!(
                    node = %state.id,
                    correlation_id = request.correlation_id,
                    "dropping connection mid-request"
                );
                return Ok(());
            }
        }

        let response = state.handle(&request);
        let delay = *state.delay.lock();
        if !delay.is_zero() {
            select! {
                biased;
                _ = kicked.changed() => return Ok(()),
                _ = time::sleep(delay) => {}
            }
        }
        respond(&mut writer, response).await?;
    }
}

async fn respond<W>(writer: &mut W, response: Response) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, &response.into_frame()).await?;
    Ok(())
}

impl NodeState {
    fn handle(&self, request: &Request) -> Response {
        match self.dispatch(request) {
            Ok(body) => Response::success(request, body),
            Err(Failure::Rejected(diagnostic)) => {
                Response::failure(request, ResponseStatus::Failed, diagnostic)
            }
            Err(Failure::Denied(diagnostic)) => {
                Response::failure(request, ResponseStatus::AuthFailed, diagnostic)
            }
        }
    }

    fn dispatch(&self, request: &Request) -> Result<Bytes, Failure> {
        match request.opcode {
            Opcode::Handshake => {
                let hello: HandshakeRequest =
                    decode_body(&request.payload).map_err(Failure::rejected)?;
                if hello.protocol_version != PROTOCOL_VERSION {
                    return Err(Failure::Denied(format!(
                        "unsupported protocol version {}",
                        hello.protocol_version
                    )));
                }
                self.handshakes.fetch_add(1, Ordering::SeqCst);
                encode_body(&HandshakeResponse { node_id: self.id }).map_err(Failure::rejected)
            }
            Opcode::Noop => Ok(Bytes::new()),
            Opcode::Topology => {
                self.topology_requests.fetch_add(1, Ordering::SeqCst);
                let nodes: Vec<NodeDescriptor> = self
                    .shared
                    .roster
                    .lock()
                    .values()
                    .cloned()
                    .map(|mut node| {
                        if !request.flags.contains(Flags::INCLUDE_METRICS) {
                            node.metrics = None;
                        }
                        if !request.flags.contains(Flags::INCLUDE_ATTRIBUTES) {
                            node.attributes.clear();
                        }
                        node
                    })
                    .collect();
                encode_body(&nodes).map_err(Failure::rejected)
            }
            Opcode::Task => {
                self.served.fetch_add(1, Ordering::SeqCst);
                let task: TaskRequest = decode_body(&request.payload).map_err(Failure::rejected)?;
                let result = if task.task_name == "node_id" {
                    Ok(Value::String(self.id.to_string()))
                } else {
                    let body = self.shared.tasks.lock().get(&task.task_name).cloned();
                    match body {
                        Some(body) => body(task.argument),
                        None => Err(format!("unknown task {:?}", task.task_name)),
                    }
                };
                let value = result.map_err(Failure::Rejected)?;
                encode_body(&value).map_err(Failure::rejected)
            }
            _ => {
                self.served.fetch_add(1, Ordering::SeqCst);
                let cache: CacheRequest =
                    decode_body(&request.payload).map_err(Failure::rejected)?;
                if cache.command.opcode() != request.opcode {
                    return Err(Failure::Rejected(format!(
                        "opcode {:?} does not match command {:?}",
                        request.opcode,
                        cache.command.opcode()
                    )));
                }
                let value = self.apply(cache).map_err(Failure::rejected)?;
                encode_body(&value).map_err(Failure::rejected)
            }
        }
    }

    fn apply(&self, request: CacheRequest) -> Result<Value> {
        let mut caches = self.caches.lock();
        let entries = caches.entry(request.cache).or_default();

        let value = match request.command {
            CacheCommand::Get { key } => entries.get(&slot(&key)?).cloned().unwrap_or(Value::Null),
            CacheCommand::Put { key, value } => {
                entries.insert(slot(&key)?, value);
                Value::Bool(true)
            }
            CacheCommand::Remove { key } => Value::Bool(entries.remove(&slot(&key)?).is_some()),
            CacheCommand::Replace { key, value } => {
                let slot = slot(&key)?;
                let present = entries.contains_key(&slot);
                if present {
                    entries.insert(slot, value);
                }
                Value::Bool(present)
            }
            CacheCommand::CompareAndSet { key, expected, value } => {
                let slot = slot(&key)?;
                let matches = entries.get(&slot) == expected.as_ref();
                if matches {
                    match value {
                        Some(value) => {
                            entries.insert(slot, value);
                        }
                        None => {
                            entries.remove(&slot);
                        }
                    }
                }
                Value::Bool(matches)
            }
            CacheCommand::GetAll { keys } => {
                let mut found = Vec::new();
                for key in keys {
                    if let Some(value) = entries.get(&slot(&key)?) {
                        found.push(Value::Array(vec![key, value.clone()]));
                    }
                }
                Value::Array(found)
            }
            CacheCommand::PutAll { entries: batch } => {
                for (key, value) in batch {
                    entries.insert(slot(&key)?, value);
                }
                Value::Bool(true)
            }
            CacheCommand::RemoveAll { keys } => {
                for key in keys {
                    entries.remove(&slot(&key)?);
                }
                Value::Bool(true)
            }
        };
        Ok(value)
    }
}

fn slot(key: &Value) -> Result<String> {
    if key.is_null() {
        bail!("cache keys must not be null");
    }
    Ok(serde_json::to_string(key)?)
}

enum Failure {
    Rejected(String),
    Denied(String),
}

impl Failure {
    fn rejected(err: impl std::fmt::Display) -> Self {
        Failure::Rejected(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    use super::*;
    use crate::node::ClientId;

    async fn handshake(addr: SocketAddr) -> (OwnedReadHalf, OwnedWriteHalf, BytesMut, NodeId) {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (mut reader, mut writer) = stream.into_split();
        let hello = HandshakeRequest {
            client_id: ClientId::generate(),
            protocol_version: PROTOCOL_VERSION,
        };
        let request = Request {
            correlation_id: 0,
            opcode: Opcode::Handshake,
            flags: Flags::EMPTY,
            payload: encode_body(&hello).expect("encode"),
        };
        write_frame(&mut writer, &request.into_frame()).await.expect("write");
        let mut buf = BytesMut::new();
        let frame = read_frame(&mut reader, &mut buf)
            .await
            .expect("read")
            .expect("frame");
        let body = Response::from_frame(frame)
            .expect("response")
            .into_body()
            .expect("body");
        let welcome: HandshakeResponse = decode_body(&body).expect("decode");
        (reader, writer, buf, welcome.node_id)
    }

    #[tokio::test]
    async fn answers_handshake_and_cache_requests() {
        let cluster = MockCluster::start(1).await.expect("cluster");
        let (mut reader, mut writer, mut buf, node_id) = handshake(cluster.node(0).addr()).await;
        assert_eq!(node_id, cluster.node(0).id());

        let put = CacheRequest {
            cache: None,
            command: CacheCommand::Put {
                key: Value::from("k"),
                value: Value::from(1),
            },
        };
        let request = Request {
            correlation_id: 1,
            opcode: Opcode::CachePut,
            flags: Flags::EMPTY,
            payload: encode_body(&put).expect("encode"),
        };
        write_frame(&mut writer, &request.into_frame()).await.expect("write");
        let frame = read_frame(&mut reader, &mut buf).await.expect("read").expect("frame");
        let response = Response::from_frame(frame).expect("response");
        assert_eq!(response.correlation_id, 1);
        assert_eq!(response.into_body().expect("body"), Bytes::from_static(b"true"));

        assert_eq!(cluster.node(0).cache_len(None), 1);
        assert_eq!(cluster.node(0).served(), 1);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn roster_tracks_leave_and_join() {
        let mut cluster = MockCluster::start(2).await.expect("cluster");
        cluster.add_node().await.expect("third");
        assert_eq!(cluster.shared.roster.lock().len(), 3);

        cluster.node(1).leave();
        assert_eq!(cluster.shared.roster.lock().len(), 2);
        cluster.node(1).join();
        assert_eq!(cluster.shared.roster.lock().len(), 3);

        cluster.node(2).stop().await;
        assert_eq!(cluster.shared.roster.lock().len(), 2);
        assert!(TcpStream::connect(cluster.node(2).addr()).await.is_err());
        cluster.shutdown().await;
    }
}
