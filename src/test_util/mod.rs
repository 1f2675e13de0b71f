use std::sync::{Arc, Mutex};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::connection::Connection;
use crate::frame::message::Message;
use crate::server::ServerHandler;


/// Message vocabulary used by this crate's tests — the shape an embedding
///  application's kind enum is expected to have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum TestKind {
    Ping,
    Echo,
    Broadcast,
}


/// [`ServerHandler`] that records every hook invocation for assertions.
pub struct RecordingHandler {
    accept_clients: bool,
    pub connected: Mutex<Vec<u32>>,
    pub validated: Mutex<Vec<u32>>,
    pub disconnected: Mutex<Vec<u32>>,
    pub messages: Mutex<Vec<(u32, Message<TestKind>)>>,
}

impl RecordingHandler {
    pub fn new(accept_clients: bool) -> RecordingHandler {
        RecordingHandler {
            accept_clients,
            connected: Default::default(),
            validated: Default::default(),
            disconnected: Default::default(),
            messages: Default::default(),
        }
    }
}

impl ServerHandler<TestKind> for RecordingHandler {
    fn on_client_connect(&self, client: &Arc<Connection<TestKind>>) -> bool {
        self.connected.lock().unwrap().push(client.id());
        self.accept_clients
    }

    fn on_client_validated(&self, client: &Arc<Connection<TestKind>>) {
        self.validated.lock().unwrap().push(client.id());
    }

    fn on_client_disconnect(&self, client: &Arc<Connection<TestKind>>) {
        self.disconnected.lock().unwrap().push(client.id());
    }

    fn on_message(&self, client: &Arc<Connection<TestKind>>, msg: Message<TestKind>) {
        self.messages.lock().unwrap().push((client.id(), msg));
    }
}
