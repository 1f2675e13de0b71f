pub mod frame;
pub mod queue;
pub mod connection;
pub mod server;
pub mod client;
pub mod test_util;
