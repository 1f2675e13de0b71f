use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use anyhow::anyhow;
use tokio::net::{self, TcpStream};
use tokio::runtime;
use tokio::select;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, warn};

use crate::connection;
use crate::connection::Connection;
use crate::connection::handshake;
use crate::frame::message::{Message, MessageKind, OwnedMessage};
use crate::queue::TsQueue;


/// The client-side endpoint: owns exactly one connection and the dedicated
///  I/O thread driving it.
pub struct Client<K: MessageKind> {
    inbound: Arc<TsQueue<OwnedMessage<K>>>,
    connection: Option<Arc<Connection<K>>>,
    shutdown: Option<Arc<Notify>>,
    io_thread: Option<thread::JoinHandle<()>>,
}

impl<K: MessageKind> Client<K> {
    pub fn new() -> Client<K> {
        Client {
            inbound: Arc::new(TsQueue::new()),
            connection: None,
            shutdown: None,
            io_thread: None,
        }
    }

    /// Resolves `host:port` and starts the connection's I/O thread.
    ///  Resolution failure is reported here, synchronously; the TCP connect
    ///  and handshake complete asynchronously — poll
    ///  [`is_connected`](Client::is_connected).
    pub fn connect(&mut self, host: &str, port: u16) -> anyhow::Result<()> {
        if self.io_thread.is_some() {
            return Err(anyhow!("client is already connected"));
        }

        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let addrs: Vec<SocketAddr> = rt.block_on(net::lookup_host((host, port)))?.collect();
        let first = match addrs.first() {
            Some(addr) => *addr,
            None => return Err(anyhow!("{}:{} did not resolve to any address", host, port)),
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new(first, outbound_tx, false));
        let shutdown = Arc::new(Notify::new());

        self.connection = Some(conn.clone());
        self.shutdown = Some(shutdown.clone());

        let inbound = self.inbound.clone();
        self.io_thread = Some(thread::spawn(move || {
            rt.block_on(async move {
                select! {
                    _ = run_client_connection(addrs, outbound_rx, conn, inbound) => {}
                    _ = shutdown.notified() => {}
                }
            });
        }));

        Ok(())
    }

    /// Closes the connection if one is active, stops the I/O thread and joins
    ///  it. Idempotent; also runs on drop.
    pub fn disconnect(&mut self) {
        if let Some(conn) = self.connection.take() {
            conn.disconnect();
        }
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.notify_one();
        }
        if let Some(handle) = self.io_thread.take() {
            if handle.join().is_err() {
                error!("client I/O thread panicked");
            }
            debug!("client disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| c.is_connected())
    }

    /// Queues `msg` for delivery to the server, if connected.
    pub fn send(&self, msg: Message<K>) {
        if let Some(conn) = &self.connection {
            conn.send(msg);
        }
    }

    /// The queue of completed inbound messages. The application thread polls
    ///  it or blocks on [`TsQueue::wait`].
    pub fn incoming(&self) -> &TsQueue<OwnedMessage<K>> {
        &self.inbound
    }
}

impl<K: MessageKind> Default for Client<K> {
    fn default() -> Client<K> {
        Client::new()
    }
}

impl<K: MessageKind> Drop for Client<K> {
    fn drop(&mut self) {
        self.disconnect();
    }
}


/// Client-side connection state machine: connect, let the server validate
///  us, then pump frames until the connection dies.
async fn run_client_connection<K: MessageKind>(
    addrs: Vec<SocketAddr>,
    outbound: mpsc::UnboundedReceiver<Message<K>>,
    conn: Arc<Connection<K>>,
    inbound: Arc<TsQueue<OwnedMessage<K>>>,
) {
    let mut socket = None;
    for addr in &addrs {
        match TcpStream::connect(addr).await {
            Ok(s) => {
                socket = Some(s);
                break;
            }
            Err(e) => debug!(?addr, error = ?e, "connect attempt failed"),
        }
    }
    let mut socket = match socket {
        Some(socket) => socket,
        None => {
            warn!(?addrs, "could not connect to any resolved address");
            return;
        }
    };

    conn.mark_open();

    if let Err(e) = handshake::client_handshake(&mut socket).await {
        debug!(error = ?e, "validation failed");
        conn.mark_closed();
        return;
    }

    let (rd, wr) = socket.into_split();
    connection::run_pumps(rd, wr, conn, None, outbound, inbound).await;
}


#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use crate::server::{Server, ServerHandler};
    use crate::test_util::TestKind;

    use super::*;

    struct EchoHandler;

    impl ServerHandler<TestKind> for EchoHandler {
        fn on_client_connect(&self, _client: &Arc<Connection<TestKind>>) -> bool {
            true
        }

        fn on_message(&self, client: &Arc<Connection<TestKind>>, msg: Message<TestKind>) {
            client.send(msg);
        }
    }

    fn await_connected(client: &Client<TestKind>) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !client.is_connected() {
            assert!(Instant::now() < deadline, "client did not connect in time");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_echo_round_trip() {
        let mut server = Server::new("127.0.0.1:0".parse().unwrap(), Arc::new(EchoHandler));
        server.start().unwrap();
        let addr = server.local_addr().unwrap();

        let mut client = Client::new();
        client.connect("127.0.0.1", addr.port()).unwrap();
        await_connected(&client);

        let mut msg = Message::new(TestKind::Echo);
        msg.push(42u32).push_str("hello");
        client.send(msg);

        // blocks until the message has crossed the wire, then echoes it back
        server.update(1, true);

        client.incoming().wait();
        let mut owned = client.incoming().pop_front().unwrap();
        assert!(owned.origin.is_none());
        assert_eq!(owned.message.kind(), TestKind::Echo);
        assert_eq!(owned.message.pop_string().unwrap(), "hello");
        assert_eq!(owned.message.pop::<u32>().unwrap(), 42);

        client.disconnect();
        server.stop();
    }

    #[test]
    fn test_connect_to_unresolvable_host_fails() {
        let mut client: Client<TestKind> = Client::new();
        assert!(client.connect("host.invalid.", 4711).is_err());
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let mut client: Client<TestKind> = Client::new();
        client.disconnect();
        client.disconnect();
        assert!(!client.is_connected());
    }
}
