use bytes::{BufMut, BytesMut};


/// A fixed-width value that can travel inside a message body.
///
/// Implementations write and read an exact number of little-endian bytes.
/// Only primitives with an unambiguous byte layout qualify; anything
/// structured has to be taken apart by the caller. There is deliberately no
/// derive or reflection path, so pushing an unsupported type is a compile
/// error rather than a runtime surprise.
pub trait WireValue: Sized {
    const WIRE_SIZE: usize;

    fn put(&self, buf: &mut BytesMut);

    /// Reads a value from `bytes`, which must hold exactly
    ///  [`WIRE_SIZE`](Self::WIRE_SIZE) bytes.
    fn get(bytes: &[u8]) -> Self;
}

macro_rules! wire_value_impl {
    ($ty:ty, $putter:ident) => {
        impl WireValue for $ty {
            const WIRE_SIZE: usize = size_of::<$ty>();

            fn put(&self, buf: &mut BytesMut) {
                buf.$putter(*self);
            }

            fn get(bytes: &[u8]) -> Self {
                let mut raw = [0u8; size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_le_bytes(raw)
            }
        }
    }
}

wire_value_impl!(u8, put_u8);
wire_value_impl!(u16, put_u16_le);
wire_value_impl!(u32, put_u32_le);
wire_value_impl!(u64, put_u64_le);

wire_value_impl!(i8, put_i8);
wire_value_impl!(i16, put_i16_le);
wire_value_impl!(i32, put_i32_le);
wire_value_impl!(i64, put_i64_le);

wire_value_impl!(f32, put_f32_le);
wire_value_impl!(f64, put_f64_le);
