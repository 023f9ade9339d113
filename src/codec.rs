use std::borrow::Cow;
use std::marker::PhantomData;

use crate::error::{Error, Result};

/// Trait for encoding borrowed items into their byte representation.
pub trait BytesEncode {
    type EItem: ?Sized;

    /// Encode an item into bytes
    fn bytes_encode(item: &Self::EItem) -> Result<Cow<'_, [u8]>>;

    /// Equality over encoded bytes, used by the conditional map operations
    fn eq_bytes(l: &[u8], r: &[u8]) -> bool {
        l == r
    }
}

/// Trait for decoding stored bytes into owned items.
///
/// Decoding produces owned values: blobs are copied out of the mapped file
/// while a shard lock is held, so borrowed views cannot escape.
pub trait BytesDecode {
    type DItem;

    /// Decode bytes into an item
    fn bytes_decode(bytes: &[u8]) -> Result<Self::DItem>;
}

/// UTF-8 string codec; encodes `str`, decodes to `String`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Utf8;

/// Raw byte-slice codec; encodes `[u8]`, decodes to `Vec<u8>`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Raw;

/// Fixed-width codec for native values that are plain bytes (numbers, etc.)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plain<T>(PhantomData<T>);

impl<T> Default for Plain<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl BytesEncode for Utf8 {
    type EItem = str;

    fn bytes_encode(item: &str) -> Result<Cow<'_, [u8]>> {
        Ok(Cow::Borrowed(item.as_bytes()))
    }
}

impl BytesDecode for Utf8 {
    type DItem = String;

    fn bytes_decode(bytes: &[u8]) -> Result<String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::Decoding(e.to_string()))
    }
}

impl BytesEncode for Raw {
    type EItem = [u8];

    fn bytes_encode(item: &[u8]) -> Result<Cow<'_, [u8]>> {
        Ok(Cow::Borrowed(item))
    }
}

impl BytesDecode for Raw {
    type DItem = Vec<u8>;

    fn bytes_decode(bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

impl<T> BytesEncode for Plain<T>
where
    T: bytemuck::Pod,
{
    type EItem = T;

    fn bytes_encode(item: &T) -> Result<Cow<'_, [u8]>> {
        Ok(Cow::Borrowed(bytemuck::bytes_of(item)))
    }
}

impl<T> BytesDecode for Plain<T>
where
    T: bytemuck::Pod,
{
    type DItem = T;

    fn bytes_decode(bytes: &[u8]) -> Result<T> {
        if bytes.len() != std::mem::size_of::<T>() {
            return Err(Error::Decoding(format!(
                "invalid byte length for {}: expected {}, got {}",
                std::any::type_name::<T>(),
                std::mem::size_of::<T>(),
                bytes.len()
            )));
        }
        Ok(*bytemuck::from_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_round_trip() {
        let encoded = Utf8::bytes_encode("hello").unwrap();
        assert_eq!(encoded.as_ref(), b"hello");
        assert_eq!(Utf8::bytes_decode(&encoded).unwrap(), "hello");
    }

    #[test]
    fn utf8_rejects_invalid() {
        assert!(Utf8::bytes_decode(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn plain_round_trip() {
        let encoded = Plain::<u64>::bytes_encode(&42u64).unwrap();
        assert_eq!(encoded.len(), 8);
        assert_eq!(Plain::<u64>::bytes_decode(&encoded).unwrap(), 42);
    }

    #[test]
    fn plain_rejects_wrong_width() {
        assert!(Plain::<u64>::bytes_decode(&[0u8; 3]).is_err());
    }

    #[test]
    fn raw_round_trip() {
        let encoded = Raw::bytes_encode(&[1u8, 2, 3][..]).unwrap();
        assert_eq!(Raw::bytes_decode(&encoded).unwrap(), vec![1, 2, 3]);
    }
}
