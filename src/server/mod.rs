use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::anyhow;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime;
use tokio::select;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use crate::connection;
use crate::connection::Connection;
use crate::connection::handshake;
use crate::frame::message::{Message, MessageKind, OwnedMessage};
use crate::queue::TsQueue;


/// Collaborator interface implemented by the embedding application. Connect
///  and validation callbacks run on the server's I/O thread and should return
///  quickly; disconnect and message callbacks run on whichever thread calls
///  [`Server::update`] / the messaging operations.
pub trait ServerHandler<K: MessageKind>: Send + Sync + 'static {
    /// Admission veto, called before the handshake. The connection has no id
    ///  yet at this point. Defaults to deny — embedders opt in to accepting
    ///  connections.
    fn on_client_connect(&self, _client: &Arc<Connection<K>>) -> bool {
        false
    }

    /// Called once the client has passed validation, just before its read
    ///  pump starts.
    fn on_client_validated(&self, _client: &Arc<Connection<K>>) {
    }

    /// Called when a dead connection is detected during a send or broadcast
    ///  sweep, once per connection.
    fn on_client_disconnect(&self, _client: &Arc<Connection<K>>) {
    }

    /// Called by [`Server::update`] for each dispatched inbound message.
    fn on_message(&self, client: &Arc<Connection<K>>, msg: Message<K>);
}


/// Ids handed out to accepted connections start here and increase
///  monotonically for the lifetime of the accept loop.
const FIRST_CLIENT_ID: u32 = 10000;


/// The server-side endpoint: accepts connections, runs admission control and
///  the per-connection handshake, keeps the registry of live connections and
///  dispatches inbound messages to the handler.
///
/// All socket I/O runs on one dedicated thread driving a current-thread
///  runtime; the embedding application interacts from its own thread through
///  [`update`](Server::update) and the messaging operations.
pub struct Server<K: MessageKind> {
    bind_addr: SocketAddr,
    local_addr: Option<SocketAddr>,
    handler: Arc<dyn ServerHandler<K>>,
    inbound: Arc<TsQueue<OwnedMessage<K>>>,
    connections: Arc<Mutex<Vec<Arc<Connection<K>>>>>,
    shutdown: Option<Arc<Notify>>,
    io_thread: Option<thread::JoinHandle<()>>,
}

impl<K: MessageKind> Server<K> {
    pub fn new(bind_addr: SocketAddr, handler: Arc<dyn ServerHandler<K>>) -> Server<K> {
        Server {
            bind_addr,
            local_addr: None,
            handler,
            inbound: Arc::new(TsQueue::new()),
            connections: Arc::new(Mutex::new(Vec::new())),
            shutdown: None,
            io_thread: None,
        }
    }

    /// Binds the listener — failures are reported here, synchronously — and
    ///  starts the accept loop on the dedicated I/O thread.
    pub fn start(&mut self) -> anyhow::Result<()> {
        if self.io_thread.is_some() {
            return Err(anyhow!("server is already running"));
        }

        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let listener = rt.block_on(TcpListener::bind(self.bind_addr))?;
        self.local_addr = Some(listener.local_addr()?);

        let shutdown = Arc::new(Notify::new());
        self.shutdown = Some(shutdown.clone());

        let handler = self.handler.clone();
        let inbound = self.inbound.clone();
        let connections = self.connections.clone();

        self.io_thread = Some(thread::spawn(move || {
            rt.block_on(async move {
                select! {
                    _ = accept_loop(listener, handler, inbound, connections) => {}
                    _ = shutdown.notified() => {}
                }
            });
            // dropping the runtime cancels every connection task it spawned
        }));

        info!(addr = ?self.local_addr, "server started");
        Ok(())
    }

    /// Stops the accept loop, cancels all connection I/O and joins the I/O
    ///  thread. Idempotent; also runs on drop.
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.notify_one();
        }
        if let Some(handle) = self.io_thread.take() {
            if handle.join().is_err() {
                error!("server I/O thread panicked");
            }
            info!("server stopped");
        }
    }

    /// The actual listening address, available once started. Useful when
    ///  binding to port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn num_connections(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Sends `msg` to one client if it is still live. A dead target triggers
    ///  the disconnect hook and is removed from the registry.
    pub fn message_client(&self, client: &Arc<Connection<K>>, msg: Message<K>) {
        if client.is_connected() {
            client.send(msg);
        } else {
            self.handler.on_client_disconnect(client);
            self.connections.lock().unwrap().retain(|c| !Arc::ptr_eq(c, client));
        }
    }

    /// Sends `msg` to every live connection in acceptance order, skipping
    ///  `exclude`. Connections found dead during the sweep trigger the
    ///  disconnect hook and are removed afterwards — removal is deferred so
    ///  the registry is not mutated while it is being iterated.
    pub fn message_all_clients(&self, msg: Message<K>, exclude: Option<&Arc<Connection<K>>>) {
        let mut dead = Vec::new();

        {
            let connections = self.connections.lock().unwrap();
            for client in connections.iter() {
                if client.is_connected() {
                    let excluded = exclude.is_some_and(|e| Arc::ptr_eq(e, client));
                    if !excluded {
                        client.send(msg.clone());
                    }
                } else {
                    dead.push(client.clone());
                }
            }
        }

        if !dead.is_empty() {
            for client in &dead {
                self.handler.on_client_disconnect(client);
            }
            self.connections.lock().unwrap()
                .retain(|c| !dead.iter().any(|d| Arc::ptr_eq(c, d)));
        }
    }

    /// Dispatches up to `max_messages` queued inbound messages to the
    ///  handler, in arrival order. If `block` is set, first waits until at
    ///  least one message is available.
    pub fn update(&self, max_messages: usize, block: bool) {
        if block {
            self.inbound.wait();
        }

        let mut handled = 0;
        while handled < max_messages {
            match self.inbound.pop_front() {
                Some(OwnedMessage { origin: Some(origin), message }) => {
                    self.handler.on_message(&origin, message);
                    handled += 1;
                }
                Some(OwnedMessage { origin: None, .. }) => {
                    // server-side messages are always tagged with their origin
                    warn!("dropping inbound message without origin");
                    handled += 1;
                }
                None => break,
            }
        }
    }
}

impl<K: MessageKind> Drop for Server<K> {
    fn drop(&mut self) {
        self.stop();
    }
}


async fn accept_loop<K: MessageKind>(
    listener: TcpListener,
    handler: Arc<dyn ServerHandler<K>>,
    inbound: Arc<TsQueue<OwnedMessage<K>>>,
    connections: Arc<Mutex<Vec<Arc<Connection<K>>>>>,
) {
    let mut next_id = FIRST_CLIENT_ID;

    loop {
        match listener.accept().await {
            Ok((socket, peer_addr)) => {
                debug!(?peer_addr, "new connection");

                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                let conn = Arc::new(Connection::new(peer_addr, outbound_tx, true));

                if handler.on_client_connect(&conn) {
                    conn.set_id(next_id);
                    next_id += 1;

                    connections.lock().unwrap().push(conn.clone());
                    info!(id = conn.id(), ?peer_addr, "connection approved");

                    tokio::spawn(run_server_connection(socket, outbound_rx, conn, handler.clone(), inbound.clone()));
                } else {
                    info!(?peer_addr, "connection denied");
                    // vetoed sockets are closed right away
                    drop(socket);
                }
            }
            Err(e) => {
                warn!(error = ?e, "error accepting connection");
            }
        }
    }
}

/// Server-side connection state machine: validate the peer, then pump frames
///  until the connection dies.
async fn run_server_connection<K: MessageKind>(
    mut socket: TcpStream,
    outbound: mpsc::UnboundedReceiver<Message<K>>,
    conn: Arc<Connection<K>>,
    handler: Arc<dyn ServerHandler<K>>,
    inbound: Arc<TsQueue<OwnedMessage<K>>>,
) {
    match handshake::server_handshake(&mut socket).await {
        Ok(()) => {
            debug!(id = conn.id(), "client validated");
            handler.on_client_validated(&conn);
        }
        Err(e) => {
            // silent close, nothing is sent back to the peer
            debug!(id = conn.id(), error = ?e, "client failed validation");
            conn.mark_closed();
            return;
        }
    }

    let (rd, wr) = socket.into_split();
    connection::run_pumps(rd, wr, conn.clone(), Some(conn.clone()), outbound, inbound).await;
}


#[cfg(test)]
mod test {
    use crate::test_util::{RecordingHandler, TestKind};

    use super::*;

    fn test_server(handler: Arc<RecordingHandler>) -> Server<TestKind> {
        Server::new("127.0.0.1:0".parse().unwrap(), handler)
    }

    fn queued_message(server: &Server<TestKind>, origin: &Arc<Connection<TestKind>>, payload: u32) {
        let mut msg = Message::new(TestKind::Ping);
        msg.push(payload);
        server.inbound.push_back(OwnedMessage {
            origin: Some(origin.clone()),
            message: msg,
        });
    }

    #[test]
    fn test_update_respects_message_cap() {
        let handler = Arc::new(RecordingHandler::new(true));
        let server = test_server(handler.clone());
        let (origin, _rx) = Connection::stub(10000, true);

        for i in 0..5 {
            queued_message(&server, &origin, i);
        }

        server.update(2, false);

        let messages = handler.messages.lock().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(server.inbound.len(), 3);

        // arrival order is preserved
        let mut first = messages[0].1.clone();
        let mut second = messages[1].1.clone();
        assert_eq!(first.pop::<u32>().unwrap(), 0);
        assert_eq!(second.pop::<u32>().unwrap(), 1);
    }

    #[test]
    fn test_update_drains_short_queue() {
        let handler = Arc::new(RecordingHandler::new(true));
        let server = test_server(handler.clone());
        let (origin, _rx) = Connection::stub(10000, true);

        queued_message(&server, &origin, 1);
        server.update(usize::MAX, false);

        assert_eq!(handler.messages.lock().unwrap().len(), 1);
        assert!(server.inbound.is_empty());
    }

    #[test]
    fn test_broadcast_skips_excluded_connection() {
        let handler = Arc::new(RecordingHandler::new(true));
        let server = test_server(handler.clone());

        let (a, mut a_rx) = Connection::stub(10000, true);
        let (b, mut b_rx) = Connection::stub(10001, true);
        let (c, mut c_rx) = Connection::stub(10002, true);
        for conn in [&a, &b, &c] {
            server.connections.lock().unwrap().push(conn.clone());
        }

        server.message_all_clients(Message::new(TestKind::Broadcast), Some(&b));

        assert!(a_rx.try_recv().is_ok());
        assert!(b_rx.try_recv().is_err());
        assert!(c_rx.try_recv().is_ok());
        assert_eq!(server.num_connections(), 3);
        assert!(handler.disconnected.lock().unwrap().is_empty());
    }

    #[test]
    fn test_broadcast_sweeps_dead_connections() {
        let handler = Arc::new(RecordingHandler::new(true));
        let server = test_server(handler.clone());

        let (live, mut live_rx) = Connection::stub(10000, true);
        let (dead, mut dead_rx) = Connection::stub(10001, false);
        server.connections.lock().unwrap().push(live.clone());
        server.connections.lock().unwrap().push(dead.clone());

        server.message_all_clients(Message::new(TestKind::Broadcast), None);

        assert!(live_rx.try_recv().is_ok());
        assert!(dead_rx.try_recv().is_err());
        assert_eq!(server.num_connections(), 1);
        assert_eq!(*handler.disconnected.lock().unwrap(), vec![10001]);
    }

    #[test]
    fn test_message_client_on_dead_target() {
        let handler = Arc::new(RecordingHandler::new(true));
        let server = test_server(handler.clone());

        let (dead, mut dead_rx) = Connection::stub(10001, false);
        server.connections.lock().unwrap().push(dead.clone());

        server.message_client(&dead, Message::new(TestKind::Ping));

        assert!(dead_rx.try_recv().is_err());
        assert_eq!(server.num_connections(), 0);
        assert_eq!(*handler.disconnected.lock().unwrap(), vec![10001]);
    }

    #[test]
    fn test_message_client_on_live_target() {
        let handler = Arc::new(RecordingHandler::new(true));
        let server = test_server(handler.clone());

        let (live, mut live_rx) = Connection::stub(10000, true);
        server.connections.lock().unwrap().push(live.clone());

        server.message_client(&live, Message::new(TestKind::Ping));

        assert!(live_rx.try_recv().is_ok());
        assert_eq!(server.num_connections(), 1);
        assert!(handler.disconnected.lock().unwrap().is_empty());
    }

    #[test]
    fn test_stop_without_start_is_a_noop() {
        let handler = Arc::new(RecordingHandler::new(true));
        let mut server = test_server(handler);
        server.stop();
        server.stop();
    }
}
