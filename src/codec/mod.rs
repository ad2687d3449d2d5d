//! Binary Codec: byte-order-aware marshaling for RPC payloads
//!
//! Values are appended to a growable buffer and read back from a cursor:
//! - Fixed-width values are written as their little-endian image, reversed
//!   when the codec is configured for big-endian
//! - Strings and byte blobs carry a 4-byte length prefix (same byte order)
//! - Tuples are the concatenation of their elements, with no schema on the wire
//!
//! The reader must know the static types it expects. [`value`] provides the
//! explicit per-service schema used by the RPC layer.

pub mod value;

pub use value::{FieldType, Schema, Value};

use serde::{Deserialize, Serialize};

/// Length prefix type for variable-length values
pub type Length = u32;

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX: usize = std::mem::size_of::<Length>();

/// Byte order applied to fixed-width values and length prefixes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

/// Codec failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Truncated buffer: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("Value does not fit a length prefix: {0} bytes")]
    TooLong(usize),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),
}

/// A marshaling buffer with a read cursor
#[derive(Debug, Clone, Default)]
pub struct Codec {
    buf: Vec<u8>,
    pos: usize,
    order: ByteOrder,
}

impl Codec {
    /// Empty little-endian codec
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_order(order: ByteOrder) -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            order,
        }
    }

    /// Wrap received bytes for decoding
    pub fn from_bytes(bytes: impl Into<Vec<u8>>, order: ByteOrder) -> Self {
        Self {
            buf: bytes.into(),
            pos: 0,
            order,
        }
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    /// Append a value
    pub fn write<T: Wire>(&mut self, value: &T) -> Result<&mut Self, CodecError> {
        value.encode(self)?;
        Ok(self)
    }

    /// Consume a value of type `T` from the cursor
    pub fn read<T: Wire>(&mut self) -> Result<T, CodecError> {
        T::decode(self)
    }

    /// Append bytes without any prefix or transform
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Consume `len` bytes without any transform
    pub fn read_raw(&mut self, len: usize) -> Result<&[u8], CodecError> {
        let available = self.remaining();
        if len > available {
            return Err(CodecError::Truncated {
                offset: self.pos,
                needed: len,
                available,
            });
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.buf[start..start + len])
    }

    /// Append a fixed-width little-endian image, honoring the byte order
    pub(crate) fn write_fixed(&mut self, le_image: &[u8]) {
        match self.order {
            ByteOrder::Little => self.buf.extend_from_slice(le_image),
            ByteOrder::Big => self.buf.extend(le_image.iter().rev()),
        }
    }

    /// Read a fixed-width value back into its little-endian image
    pub(crate) fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let order = self.order;
        let raw = self.read_raw(N)?;
        let mut image = [0u8; N];
        image.copy_from_slice(raw);
        if order == ByteOrder::Big {
            image.reverse();
        }
        Ok(image)
    }

    fn write_len(&mut self, len: usize) -> Result<(), CodecError> {
        let len = Length::try_from(len).map_err(|_| CodecError::TooLong(len))?;
        self.write_fixed(&len.to_le_bytes());
        Ok(())
    }

    fn read_len(&mut self) -> Result<usize, CodecError> {
        Ok(Length::from_le_bytes(self.read_fixed::<LENGTH_PREFIX>()?) as usize)
    }

    /// Append a length-prefixed byte sequence
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        self.write_len(bytes.len())?;
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Consume a length-prefixed byte sequence
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_len()?;
        if len == 0 {
            return Ok(Vec::new());
        }
        Ok(self.read_raw(len)?.to_vec())
    }

    /// Bytes left after the cursor
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_eof(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// The unread tail of the buffer
    pub fn rest(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// Rewind the read cursor
    pub fn reset(&mut self) {
        self.pos = 0;
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.pos = 0;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Types with a static wire encoding
pub trait Wire {
    fn encode(&self, codec: &mut Codec) -> Result<(), CodecError>;

    fn decode(codec: &mut Codec) -> Result<Self, CodecError>
    where
        Self: Sized;
}

/// Append a string without allocating an owned `String`
pub fn write_str(codec: &mut Codec, value: &str) -> Result<(), CodecError> {
    codec.write_bytes(value.as_bytes())
}

macro_rules! wire_fixed {
    ($($t:ty),*) => {
        $(
            impl Wire for $t {
                fn encode(&self, codec: &mut Codec) -> Result<(), CodecError> {
                    codec.write_fixed(&self.to_le_bytes());
                    Ok(())
                }

                fn decode(codec: &mut Codec) -> Result<Self, CodecError> {
                    Ok(<$t>::from_le_bytes(codec.read_fixed::<{ std::mem::size_of::<$t>() }>()?))
                }
            }
        )*
    };
}

wire_fixed!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl Wire for bool {
    fn encode(&self, codec: &mut Codec) -> Result<(), CodecError> {
        codec.write_fixed(&[u8::from(*self)]);
        Ok(())
    }

    fn decode(codec: &mut Codec) -> Result<Self, CodecError> {
        Ok(codec.read_fixed::<1>()?[0] != 0)
    }
}

impl Wire for String {
    fn encode(&self, codec: &mut Codec) -> Result<(), CodecError> {
        codec.write_bytes(self.as_bytes())
    }

    fn decode(codec: &mut Codec) -> Result<Self, CodecError> {
        String::from_utf8(codec.read_bytes()?).map_err(|_| CodecError::InvalidUtf8)
    }
}

impl Wire for Vec<u8> {
    fn encode(&self, codec: &mut Codec) -> Result<(), CodecError> {
        codec.write_bytes(self)
    }

    fn decode(codec: &mut Codec) -> Result<Self, CodecError> {
        codec.read_bytes()
    }
}

macro_rules! wire_tuple {
    ($($name:ident),+) => {
        impl<$($name: Wire),+> Wire for ($($name,)+) {
            #[allow(non_snake_case)]
            fn encode(&self, codec: &mut Codec) -> Result<(), CodecError> {
                let ($($name,)+) = self;
                $($name.encode(codec)?;)+
                Ok(())
            }

            fn decode(codec: &mut Codec) -> Result<Self, CodecError> {
                Ok(($($name::decode(codec)?,)+))
            }
        }
    };
}

wire_tuple!(A);
wire_tuple!(A, B);
wire_tuple!(A, B, C);
wire_tuple!(A, B, C, D);
wire_tuple!(A, B, C, D, E);

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T: Wire + PartialEq + std::fmt::Debug>(value: T, order: ByteOrder) {
        let mut codec = Codec::with_order(order);
        codec.write(&value).unwrap();
        let mut reader = Codec::from_bytes(codec.into_bytes(), order);
        assert_eq!(reader.read::<T>().unwrap(), value);
        assert!(reader.is_eof());
    }

    #[test]
    fn test_primitives_both_orders() {
        for order in [ByteOrder::Little, ByteOrder::Big] {
            roundtrip(0xABu8, order);
            roundtrip(-5i8, order);
            roundtrip(0xBEEFu16, order);
            roundtrip(-1234i16, order);
            roundtrip(0xDEAD_BEEFu32, order);
            roundtrip(i32::MIN, order);
            roundtrip(u64::MAX - 7, order);
            roundtrip(-9_876_543_210i64, order);
            roundtrip(3.5f32, order);
            roundtrip(-2.25e100f64, order);
            roundtrip(true, order);
            roundtrip(false, order);
        }
    }

    #[test]
    fn test_big_endian_reverses_image() {
        let mut little = Codec::with_order(ByteOrder::Little);
        little.write(&0x0102_0304u32).unwrap();
        assert_eq!(little.as_bytes(), &[0x04, 0x03, 0x02, 0x01]);

        let mut big = Codec::with_order(ByteOrder::Big);
        big.write(&0x0102_0304u32).unwrap();
        assert_eq!(big.as_bytes(), &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_strings_and_bytes() {
        for order in [ByteOrder::Little, ByteOrder::Big] {
            roundtrip(String::from("secure function"), order);
            roundtrip(vec![0u8, 1, 2, 255], order);
            roundtrip(String::new(), order);
            roundtrip(Vec::<u8>::new(), order);
        }
    }

    #[test]
    fn test_empty_value_has_no_body() {
        let mut codec = Codec::new();
        codec.write(&String::new()).unwrap();
        assert_eq!(codec.len(), LENGTH_PREFIX);
        assert_eq!(codec.as_bytes(), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_length_prefix_follows_order() {
        let mut codec = Codec::with_order(ByteOrder::Big);
        write_str(&mut codec, "ab").unwrap();
        assert_eq!(codec.as_bytes(), &[0, 0, 0, 2, b'a', b'b']);
    }

    #[test]
    fn test_tuple_is_concatenation() {
        let mut codec = Codec::new();
        codec.write(&(7i32, String::from("x"), vec![9u8])).unwrap();
        assert_eq!(codec.len(), 4 + 4 + 1 + 4 + 1);

        let mut reader = Codec::from_bytes(codec.into_bytes(), ByteOrder::Little);
        let (a, b, c) = reader.read::<(i32, String, Vec<u8>)>().unwrap();
        assert_eq!(a, 7);
        assert_eq!(b, "x");
        assert_eq!(c, vec![9]);
    }

    #[test]
    fn test_read_past_end() {
        let mut codec = Codec::from_bytes(vec![1, 2], ByteOrder::Little);
        let err = codec.read::<u32>().unwrap_err();
        assert!(matches!(err, CodecError::Truncated { needed: 4, available: 2, .. }));

        // A length prefix promising more than the buffer holds
        let mut codec = Codec::from_bytes(vec![10, 0, 0, 0, b'a'], ByteOrder::Little);
        assert!(codec.read::<String>().is_err());
    }

    #[test]
    fn test_invalid_utf8() {
        let mut codec = Codec::from_bytes(vec![1, 0, 0, 0, 0xFF], ByteOrder::Little);
        assert_eq!(codec.read::<String>().unwrap_err(), CodecError::InvalidUtf8);
    }

    #[test]
    fn test_reset_rewinds_cursor() {
        let mut codec = Codec::new();
        codec.write(&42u16).unwrap();
        let mut reader = Codec::from_bytes(codec.into_bytes(), ByteOrder::Little);
        assert_eq!(reader.read::<u16>().unwrap(), 42);
        reader.reset();
        assert_eq!(reader.remaining(), 2);
        assert_eq!(reader.read::<u16>().unwrap(), 42);
    }
}
