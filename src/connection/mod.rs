pub mod handshake;

use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use anyhow::anyhow;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

use crate::frame::message::{Message, MessageHeader, MessageKind, OwnedMessage, WIRE_HEADER_LEN};
use crate::queue::TsQueue;


/// Upper bound on a single inbound frame body. A header declaring more than
///  this is treated as a transport failure and closes the connection rather
///  than allocating whatever the peer asks for.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;


/// Shared handle to one live connection.
///
/// The socket itself is owned by the connection's I/O task; this handle is
///  what the registry, inbound messages and application code hold on to. It
///  can outlive the socket — a handle whose socket has died reports
///  `is_connected() == false` and is swept out of the registry the next time
///  it is used.
pub struct Connection<K: MessageKind> {
    id: AtomicU32,
    peer_addr: SocketAddr,
    open: AtomicBool,
    outbound: mpsc::UnboundedSender<Message<K>>,
    close: Notify,
}

impl<K: MessageKind> Connection<K> {
    pub(crate) fn new(peer_addr: SocketAddr, outbound: mpsc::UnboundedSender<Message<K>>, open: bool) -> Connection<K> {
        Connection {
            id: AtomicU32::new(0),
            peer_addr,
            open: AtomicBool::new(open),
            outbound,
            close: Notify::new(),
        }
    }

    /// Server-assigned connection id; 0 on the client side.
    pub fn id(&self) -> u32 {
        self.id.load(Ordering::SeqCst)
    }

    /// The remote address this connection was accepted from (server side) or
    ///  resolved to (client side).
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Queues `msg` for delivery. Safe to call from any thread — the socket
    ///  write always happens on the connection's I/O thread, strictly in send
    ///  order. Messages sent to a closed connection are dropped.
    pub fn send(&self, msg: Message<K>) {
        if !self.is_connected() {
            trace!(id = self.id(), "dropping message for closed connection");
            return;
        }
        if self.outbound.send(msg).is_err() {
            trace!(id = self.id(), "dropping message, write pump has shut down");
        }
    }

    /// Requests an orderly close. Idempotent; the I/O task drops the socket
    ///  when it observes the request.
    pub fn disconnect(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.close.notify_one();
    }

    pub(crate) fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::SeqCst);
    }

    pub(crate) fn mark_open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub(crate) async fn wait_close(&self) {
        self.close.notified().await
    }

    #[cfg(test)]
    pub(crate) fn stub(id: u32, open: bool) -> (Arc<Connection<K>>, mpsc::UnboundedReceiver<Message<K>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new("127.0.0.1:0".parse().unwrap(), tx, open));
        conn.set_id(id);
        (conn, rx)
    }
}

impl<K: MessageKind> Debug for Connection<K> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection{{id:{}, peer:{}}}", self.id(), self.peer_addr)
    }
}


/// Continuously reads frames off the socket and pushes them onto the shared
///  inbound queue, tagged with `origin`. Returns only when the peer goes away
///  or a frame is malformed.
pub(crate) async fn read_pump<K, R>(
    mut rd: R,
    origin: Option<Arc<Connection<K>>>,
    inbound: Arc<TsQueue<OwnedMessage<K>>>,
) -> anyhow::Result<()>
where
    K: MessageKind,
    R: AsyncRead + Unpin,
{
    loop {
        let mut raw_header = [0u8; WIRE_HEADER_LEN];
        rd.read_exact(&mut raw_header).await?;
        let header = MessageHeader::<K>::decode(&raw_header)?;

        if header.size() as usize > MAX_FRAME_SIZE {
            return Err(anyhow!("inbound frame of {} bytes exceeds the limit of {} bytes", header.size(), MAX_FRAME_SIZE));
        }

        let mut body = BytesMut::zeroed(header.size() as usize);
        if !body.is_empty() {
            rd.read_exact(&mut body).await?;
        }

        trace!(kind = ?header.kind, size = header.size(), "received frame");
        inbound.push_back(OwnedMessage {
            origin: origin.clone(),
            message: Message::from_wire(header, body),
        });
    }
}

/// Drains the connection's outbound FIFO, writing header bytes then body
///  bytes per message. The single writer per connection — frames are never
///  reordered or interleaved.
pub(crate) async fn write_pump<K, W>(
    mut wr: W,
    mut outbound: mpsc::UnboundedReceiver<Message<K>>,
) -> anyhow::Result<()>
where
    K: MessageKind,
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = outbound.recv().await {
        let mut header = BytesMut::with_capacity(WIRE_HEADER_LEN);
        msg.header().encode(&mut header);
        wr.write_all(&header).await?;
        if !msg.is_empty() {
            wr.write_all(msg.body()).await?;
        }

        trace!(kind = ?msg.kind(), size = msg.len(), "wrote frame");
    }

    Ok(())
}

/// Runs both pumps until one of them ends or the handle requests a close,
///  then marks the handle closed. The socket halves are dropped on return,
///  which closes the socket; messages still queued outbound are discarded.
pub(crate) async fn run_pumps<K, R, W>(
    rd: R,
    wr: W,
    conn: Arc<Connection<K>>,
    origin: Option<Arc<Connection<K>>>,
    outbound: mpsc::UnboundedReceiver<Message<K>>,
    inbound: Arc<TsQueue<OwnedMessage<K>>>,
) where
    K: MessageKind,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    select! {
        r = read_pump(rd, origin, inbound) => {
            if let Err(e) = r {
                debug!(id = conn.id(), error = ?e, "read pump ended");
            }
        }
        w = write_pump(wr, outbound) => {
            if let Err(e) = w {
                debug!(id = conn.id(), error = ?e, "write pump ended");
            }
        }
        _ = conn.wait_close() => {
            trace!(id = conn.id(), "close requested");
        }
    }

    conn.mark_closed();
}
