//! One multiplexed stream to a cluster node.
//!
//! Requests are written under a writer lock and answered by a background reader
//! task that routes each response frame to its waiter by correlation id, so any
//! number of requests may be in flight and answered in any order. The stream
//! is plain TCP, or TLS when the connection config carries a [`TlsConfig`].

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex as SyncMutex;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::{oneshot, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::{
    codec::{read_frame, write_frame, Flags, Frame, Opcode, Request, Response},
    config::{ConnectionConfig, TlsConfig},
    error::{Delivery, GridClientError, Result},
    message::{decode_body, encode_body, HandshakeRequest, HandshakeResponse, PROTOCOL_VERSION},
    node::{now_millis, ClientId, NodeId},
};

const HANDSHAKE_ID: u64 = 0;

type ReadStream = Box<dyn AsyncRead + Send + Unpin>;
type WriteStream = Box<dyn AsyncWrite + Send + Unpin>;

type Waiter = oneshot::Sender<Result<Response>>;

/// Requests written but not yet answered, shared with the reader task.
struct InFlight {
    node: NodeId,
    pending: SyncMutex<HashMap<u64, Waiter>>,
    closed: AtomicBool,
}

impl InFlight {
    /// Marks the connection unusable and fails every outstanding request.
    fn fail_all(&self, error: impl Fn() -> GridClientError) {
        let drained: Vec<Waiter> = {
            let mut pending = self.pending.lock();
            self.closed.store(true, Ordering::SeqCst);
            pending.drain().map(|(_, waiter)| waiter).collect()
        };
        for waiter in drained {
            let _ = waiter.send(Err(error()));
        }
    }

    fn complete(&self, response: Response) {
        let waiter = self.pending.lock().remove(&response.correlation_id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(Ok(response));
            }
            None => debug!(
                node = %self.node,
                correlation_id = response.correlation_id,
                "discarding response for abandoned request"
            ),
        }
    }
}

pub struct Connection {
    node: NodeId,
    peer: SocketAddr,
    writer: Mutex<WriteStream>,
    in_flight: Arc<InFlight>,
    next_id: AtomicU64,
    last_used: AtomicU64,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Connects to `addr`, negotiates TLS when configured and performs the
    /// handshake, all within `config.connect_timeout`.
    ///
    /// When `expected` is given, a node answering with a different id is
    /// rejected as a stale address.
    pub async fn open(
        addr: SocketAddr,
        expected: Option<NodeId>,
        client_id: ClientId,
        config: &ConnectionConfig,
    ) -> Result<Self> {
        let connect_timeout = config.connect_timeout;
        let establish = Self::establish(addr, expected, client_id, config.tls.as_ref());
        match timeout(connect_timeout, establish).await {
            Ok(result) => result,
            Err(_) => Err(GridClientError::connection(
                expected,
                Delivery::NotSent,
                format!("connecting to {addr} timed out after {connect_timeout:?}"),
            )),
        }
    }

    async fn establish(
        addr: SocketAddr,
        expected: Option<NodeId>,
        client_id: ClientId,
        tls: Option<&TlsConfig>,
    ) -> Result<Self> {
        let (mut reader, mut writer) = connect_stream(addr, expected, tls).await?;
        let mut buf = BytesMut::with_capacity(8 * 1024);

        let node = handshake(&mut reader, &mut writer, &mut buf, client_id)
            .await
            .map_err(|err| match err {
                GridClientError::Connectivity { reason, .. } => GridClientError::connection(
                    expected,
                    Delivery::NotSent,
                    format!("handshake with {addr} failed: {reason}"),
                ),
                other => other,
            })?;

        if let Some(expected) = expected {
            if expected != node {
                return Err(GridClientError::connection(
                    Some(expected),
                    Delivery::NotSent,
                    format!("{addr} now belongs to node {node}"),
                ));
            }
        }

        let in_flight = Arc::new(InFlight {
            node,
            pending: SyncMutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let reader = tokio::spawn(read_responses(reader, buf, Arc::clone(&in_flight)));
        info!(%node, %addr, "connected");

        Ok(Self {
            node,
            peer: addr,
            writer: Mutex::new(writer),
            in_flight,
            next_id: AtomicU64::new(HANDSHAKE_ID + 1),
            last_used: AtomicU64::new(now_millis()),
            reader,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.in_flight.closed.load(Ordering::SeqCst) || self.reader.is_finished()
    }

    /// Number of requests written and still awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.in_flight.pending.lock().len()
    }

    /// Milliseconds since the last request was issued.
    pub fn idle_for(&self) -> Duration {
        Duration::from_millis(now_millis().saturating_sub(self.last_used.load(Ordering::Relaxed)))
    }

    /// Writes one request and returns a handle resolving to its response.
    ///
    /// A write failure leaves the connection broken; the request is reported as
    /// [`Delivery::NotSent`] since the node drops incomplete frames.
    pub async fn send(
        &self,
        opcode: Opcode,
        flags: Flags,
        payload: Bytes,
    ) -> Result<PendingResponse> {
        let correlation_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            // Checked under the pending lock so fail_all cannot miss this waiter.
            let mut pending = self.in_flight.pending.lock();
            if self.in_flight.closed.load(Ordering::SeqCst) {
                return Err(GridClientError::connection(
                    Some(self.node),
                    Delivery::NotSent,
                    "connection is closed",
                ));
            }
            pending.insert(correlation_id, tx);
        }
        let pending = PendingResponse {
            correlation_id,
            node: self.node,
            rx,
            in_flight: Arc::clone(&self.in_flight),
        };
        self.last_used.store(now_millis(), Ordering::Relaxed);

        let mut encoded = BytesMut::new();
        Request {
            correlation_id,
            opcode,
            flags,
            payload,
        }
        .into_frame()
        .encode(&mut encoded)?;

        let mut writer = self.writer.lock().await;
        let mut guard = BrokenOnDrop {
            in_flight: Some(&self.in_flight),
        };
        let written = async {
            writer.write_all(&encoded).await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = written {
            drop(guard);
            return Err(GridClientError::connection(
                Some(self.node),
                Delivery::NotSent,
                format!("write failed: {err}"),
            ));
        }
        guard.disarm();
        Ok(pending)
    }

    /// Sends a request and waits up to `deadline` for its successful body.
    pub async fn request(
        &self,
        opcode: Opcode,
        flags: Flags,
        payload: Bytes,
        deadline: Duration,
    ) -> Result<Bytes> {
        self.send(opcode, flags, payload)
            .await?
            .wait(deadline)
            .await?
            .into_body()
    }

    /// Closes the stream. Outstanding requests fail as connectivity faults with
    /// unknown delivery.
    pub async fn close(&self) {
        let node = self.node;
        self.in_flight.fail_all(|| {
            GridClientError::connection(Some(node), Delivery::Unknown, "connection closed locally")
        });
        self.reader.abort();
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.shutdown().await {
            debug!(node = %self.node, error = %err, "shutdown of connection writer failed");
        }
        debug!(node = %self.node, peer = %self.peer, "connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Breaks the connection if a write is cancelled or fails part way, since the
/// stream may then hold a truncated frame.
struct BrokenOnDrop<'a> {
    in_flight: Option<&'a Arc<InFlight>>,
}

impl BrokenOnDrop<'_> {
    fn disarm(&mut self) {
        self.in_flight = None;
    }
}

impl Drop for BrokenOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            let node = in_flight.node;
            warn!(%node, "request write interrupted; dropping connection");
            in_flight.fail_all(|| {
                GridClientError::connection(
                    Some(node),
                    Delivery::Unknown,
                    "connection broken by interrupted write",
                )
            });
        }
    }
}

/// Response handle for one request. Dropping it abandons the request; a
/// response arriving afterwards is discarded.
pub struct PendingResponse {
    correlation_id: u64,
    node: NodeId,
    rx: oneshot::Receiver<Result<Response>>,
    in_flight: Arc<InFlight>,
}

impl PendingResponse {
    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    pub async fn wait(mut self, deadline: Duration) -> Result<Response> {
        match timeout(deadline, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GridClientError::connection(
                Some(self.node),
                Delivery::Unknown,
                "connection dropped before responding",
            )),
            Err(_) => {
                debug!(
                    node = %self.node,
                    correlation_id = self.correlation_id,
                    ?deadline,
                    "request timed out; abandoning"
                );
                Err(GridClientError::Timeout {
                    node: self.node,
                    after: deadline,
                })
            }
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.in_flight.pending.lock().remove(&self.correlation_id);
    }
}

/// Dials `addr` and, when `tls` is set, wraps the socket before any frame is
/// exchanged. Every failure here is [`Delivery::NotSent`].
async fn connect_stream(
    addr: SocketAddr,
    expected: Option<NodeId>,
    tls: Option<&TlsConfig>,
) -> Result<(ReadStream, WriteStream)> {
    let stream = TcpStream::connect(addr).await.map_err(|err| {
        let reason = format!("connect to {addr} failed: {err}");
        GridClientError::connection(expected, Delivery::NotSent, reason)
    })?;
    let _ = stream.set_nodelay(true);

    let Some(tls) = tls else {
        let (reader, writer) = stream.into_split();
        return Ok((Box::new(reader), Box::new(writer)));
    };
    let name = tls.server_name_for(addr)?;
    let connector = TlsConnector::from(Arc::clone(&tls.client));
    let stream = connector.connect(name, stream).await.map_err(|err| {
        let reason = format!("TLS handshake with {addr} failed: {err}");
        GridClientError::connection(expected, Delivery::NotSent, reason)
    })?;
    debug!(%addr, "TLS session established");
    let (reader, writer) = tokio::io::split(stream);
    Ok((Box::new(reader), Box::new(writer)))
}

async fn handshake(
    reader: &mut ReadStream,
    writer: &mut WriteStream,
    buf: &mut BytesMut,
    client_id: ClientId,
) -> Result<NodeId> {
    let hello = HandshakeRequest {
        client_id,
        protocol_version: PROTOCOL_VERSION,
    };
    let frame = Request {
        correlation_id: HANDSHAKE_ID,
        opcode: Opcode::Handshake,
        flags: Flags::EMPTY,
        payload: encode_body(&hello)?,
    }
    .into_frame();
    write_frame(writer, &frame).await?;

    let Some(frame) = read_frame(reader, buf).await? else {
        return Err(GridClientError::unreachable("closed during handshake"));
    };
    let response = Response::from_frame(frame)?;
    if response.opcode != Opcode::Handshake || response.correlation_id != HANDSHAKE_ID {
        return Err(GridClientError::Protocol(format!(
            "expected handshake response, got {:?} #{}",
            response.opcode, response.correlation_id
        )));
    }
    let body: HandshakeResponse = decode_body(&response.into_body()?)?;
    Ok(body.node_id)
}

async fn read_responses(mut reader: ReadStream, mut buf: BytesMut, in_flight: Arc<InFlight>) {
    let node = in_flight.node;
    let reason = loop {
        let frame: Frame = match read_frame(&mut reader, &mut buf).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break "closed by peer".to_string(),
            Err(err) => break err.to_string(),
        };
        match Response::from_frame(frame) {
            Ok(response) => in_flight.complete(response),
            Err(err) => break err.to_string(),
        }
    };

    let outstanding = in_flight.pending.lock().len();
    if outstanding > 0 {
        warn!(%node, outstanding, %reason, "connection lost with requests in flight");
    } else {
        debug!(%node, %reason, "connection reader stopped");
    }
    in_flight.fail_all(|| {
        GridClientError::connection(Some(node), Delivery::Unknown, reason.clone())
    });
}
