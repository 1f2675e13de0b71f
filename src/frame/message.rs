use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::TryFromPrimitive;

use crate::connection::Connection;
use crate::frame::value::WireValue;


/// The application-defined closed vocabulary of message kinds, represented as
///  a `u32` on the wire.
///
/// Embedding applications normally don't implement this by hand: the blanket
///  impl below covers any `#[repr(u32)]` enum deriving num_enum's
///  `IntoPrimitive` and `TryFromPrimitive`.
pub trait MessageKind: Copy + Eq + Debug + Send + Sync + 'static {
    fn to_wire(self) -> u32;

    fn from_wire(raw: u32) -> anyhow::Result<Self>;
}

impl<K> MessageKind for K
where
    K: Copy + Eq + Debug + Send + Sync + 'static + Into<u32> + TryFromPrimitive<Primitive = u32>,
{
    fn to_wire(self) -> u32 {
        self.into()
    }

    fn from_wire(raw: u32) -> anyhow::Result<Self> {
        Self::try_from_primitive(raw)
            .map_err(|_| anyhow!("unknown message kind on the wire: {}", raw))
    }
}


/// Fixed-layout frame header: `[kind: u32 LE][size: u32 LE]`, preceding
///  `size` body bytes on the wire.
pub const WIRE_HEADER_LEN: usize = 2 * size_of::<u32>();

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct MessageHeader<K: MessageKind> {
    pub kind: K,
    size: u32,
}

impl<K: MessageKind> MessageHeader<K> {
    /// Body length in bytes, kept consistent by [`Message`] after every
    ///  mutation.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.kind.to_wire());
        buf.put_u32_le(self.size);
    }

    pub(crate) fn decode(mut raw: &[u8]) -> anyhow::Result<MessageHeader<K>> {
        if raw.len() < WIRE_HEADER_LEN {
            return Err(anyhow!("frame header needs {} bytes, got {}", WIRE_HEADER_LEN, raw.len()));
        }
        let kind = raw.get_u32_le();
        let size = raw.get_u32_le();

        Ok(MessageHeader {
            kind: K::from_wire(kind)?,
            size,
        })
    }
}

impl<K: MessageKind> Debug for MessageHeader<K> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageHeader{{kind:{:?}, size:{}}}", self.kind, self.size)
    }
}


/// One frame of the wire protocol: a typed header plus an opaque byte body.
///
/// The body is written and read exclusively through [`push`](Message::push) /
///  [`pop`](Message::pop) and their string variants, and these have **stack
///  semantics**: values come back out in the exact reverse of the order they
///  went in. Pushing `a, b, c` means popping `c, b, a`. This is the single
///  most error-prone part of the protocol — match every pop sequence
///  inversely against its push sequence.
///
/// `header.size` tracks the body length after every mutation, so a message is
///  wire-ready at any point.
#[derive(Clone)]
pub struct Message<K: MessageKind> {
    header: MessageHeader<K>,
    body: BytesMut,
}

impl<K: MessageKind> Message<K> {
    pub fn new(kind: K) -> Message<K> {
        Message {
            header: MessageHeader { kind, size: 0 },
            body: BytesMut::new(),
        }
    }

    pub(crate) fn from_wire(header: MessageHeader<K>, body: BytesMut) -> Message<K> {
        debug_assert_eq!(header.size as usize, body.len());
        Message { header, body }
    }

    pub fn header(&self) -> &MessageHeader<K> {
        &self.header
    }

    pub fn kind(&self) -> K {
        self.header.kind
    }

    pub fn set_kind(&mut self, kind: K) {
        self.header.kind = kind;
    }

    /// Current body length in bytes.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub(crate) fn body(&self) -> &[u8] {
        &self.body
    }

    /// Appends `value` to the end of the body. Returns `self` so pushes can
    ///  be chained.
    pub fn push<V: WireValue>(&mut self, value: V) -> &mut Message<K> {
        value.put(&mut self.body);
        self.header.size = self.body.len() as u32;
        self
    }

    /// Removes and returns the *last* pushed value — see the type-level note
    ///  on stack ordering.
    pub fn pop<V: WireValue>(&mut self) -> anyhow::Result<V> {
        if self.body.len() < V::WIRE_SIZE {
            return Err(anyhow!("popping {} bytes from a body of {} bytes", V::WIRE_SIZE, self.body.len()));
        }
        let start = self.body.len() - V::WIRE_SIZE;
        let value = V::get(&self.body[start..]);
        self.body.truncate(start);
        self.header.size = self.body.len() as u32;

        Ok(value)
    }

    /// Appends the string's bytes, then its length as a `u64` — the length
    ///  goes *after* the payload so [`pop_string`](Message::pop_string) can
    ///  find it at the tail.
    pub fn push_str(&mut self, s: &str) -> &mut Message<K> {
        self.body.put_slice(s.as_bytes());
        self.push(s.len() as u64)
    }

    pub fn pop_string(&mut self) -> anyhow::Result<String> {
        let len = self.pop::<u64>()? as usize;
        if self.body.len() < len {
            return Err(anyhow!("string of {} bytes exceeds remaining body of {} bytes", len, self.body.len()));
        }
        let tail = self.body.split_off(self.body.len() - len);
        self.header.size = self.body.len() as u32;

        Ok(String::from_utf8(tail.to_vec())?)
    }
}

impl<K: MessageKind> Debug for Message<K> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Message{{kind:{:?}, size:{}}}", self.header.kind, self.header.size)
    }
}


/// A completed inbound message tagged with the connection it arrived on.
///
/// On the server side `origin` is always present; on the client side it is
///  always `None` — there is exactly one connection, known to the caller.
#[derive(Clone)]
pub struct OwnedMessage<K: MessageKind> {
    pub origin: Option<Arc<Connection<K>>>,
    pub message: Message<K>,
}

impl<K: MessageKind> Debug for OwnedMessage<K> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.origin {
            Some(origin) => write!(f, "OwnedMessage{{origin:{}, message:{:?}}}", origin.id(), self.message),
            None => write!(f, "OwnedMessage{{origin:-, message:{:?}}}", self.message),
        }
    }
}
