//! Binary wire primitives shared by the UDP discovery codec, the TCP frame
//! codec and the reputation snapshot format.
//!
//! The format is deliberately simple: fixed-width big-endian integers,
//! 4-byte length-prefixed byte strings and UTF-8 strings, and 4-byte
//! count-prefixed lists. Parsers never panic on hostile input; every
//! underrun or out-of-bounds length surfaces as a [`WireError`].

use bytes::BufMut;
use ethereum_types::{H160, H256, H512};
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("unexpected end of input while reading {0}")]
    UnexpectedEof(&'static str),
    #[error("length prefix of {0} exceeds remaining input")]
    LengthOutOfBounds(&'static str),
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("invalid value for {0}")]
    InvalidValue(&'static str),
    #[error("unexpected trailing bytes")]
    TrailingBytes,
}

impl WireError {
    /// Replaces the type-level context recorded by a primitive decoder with
    /// the field name known at the call site.
    fn with_field(self, name: &'static str) -> Self {
        match self {
            WireError::UnexpectedEof(_) => WireError::UnexpectedEof(name),
            WireError::LengthOutOfBounds(_) => WireError::LengthOutOfBounds(name),
            WireError::InvalidUtf8(_) => WireError::InvalidUtf8(name),
            WireError::InvalidValue(_) => WireError::InvalidValue(name),
            WireError::TrailingBytes => WireError::TrailingBytes,
        }
    }
}

pub trait WireEncode {
    fn encode(&self, buf: &mut dyn BufMut);

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

pub trait WireDecode: Sized {
    /// Decodes a value from the front of `input`, returning it together with
    /// the unconsumed remainder.
    fn decode_unfinished(input: &[u8]) -> Result<(Self, &[u8]), WireError>;

    /// Decodes a value that must span the whole of `input`.
    fn decode(input: &[u8]) -> Result<Self, WireError> {
        let (value, rest) = Self::decode_unfinished(input)?;
        if rest.is_empty() {
            Ok(value)
        } else {
            Err(WireError::TrailingBytes)
        }
    }
}

/// Field-oriented writer. Mirrors the shape of the decoder so encode and
/// decode sites read the same way.
pub struct Encoder<'a> {
    buf: &'a mut dyn BufMut,
}

impl<'a> Encoder<'a> {
    pub fn new(buf: &'a mut dyn BufMut) -> Self {
        Self { buf }
    }

    pub fn encode_field<T: WireEncode>(self, value: &T) -> Self {
        value.encode(self.buf);
        self
    }

    pub fn finish(self) {}
}

/// Field-oriented cursor over a byte slice. Each `decode_field` consumes one
/// value and returns the advanced cursor, so malformed input fails with the
/// name of the field that could not be read.
pub struct Decoder<'a> {
    data: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn decode_field<T: WireDecode>(self, name: &'static str) -> Result<(T, Self), WireError> {
        let (value, rest) =
            T::decode_unfinished(self.data).map_err(|e| e.with_field(name))?;
        Ok((value, Decoder { data: rest }))
    }

    /// Fails unless every byte has been consumed.
    pub fn finish(self) -> Result<(), WireError> {
        if self.data.is_empty() {
            Ok(())
        } else {
            Err(WireError::TrailingBytes)
        }
    }

    /// Returns the unconsumed remainder without checking it is empty.
    pub fn finish_unchecked(self) -> &'a [u8] {
        self.data
    }

    pub fn remaining(&self) -> usize {
        self.data.len()
    }
}

macro_rules! impl_wire_for_uint {
    ($t:ty, $label:literal) => {
        impl WireEncode for $t {
            fn encode(&self, buf: &mut dyn BufMut) {
                buf.put_slice(&self.to_be_bytes());
            }
        }

        impl WireDecode for $t {
            fn decode_unfinished(input: &[u8]) -> Result<(Self, &[u8]), WireError> {
                const N: usize = std::mem::size_of::<$t>();
                if input.len() < N {
                    return Err(WireError::UnexpectedEof($label));
                }
                let mut raw = [0u8; N];
                raw.copy_from_slice(&input[..N]);
                Ok((<$t>::from_be_bytes(raw), &input[N..]))
            }
        }
    };
}

impl_wire_for_uint!(u8, "u8");
impl_wire_for_uint!(u16, "u16");
impl_wire_for_uint!(u32, "u32");
impl_wire_for_uint!(u64, "u64");
impl_wire_for_uint!(i16, "i16");
impl_wire_for_uint!(i32, "i32");
impl_wire_for_uint!(i64, "i64");

impl WireEncode for bool {
    fn encode(&self, buf: &mut dyn BufMut) {
        buf.put_u8(*self as u8);
    }
}

impl WireDecode for bool {
    fn decode_unfinished(input: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (raw, rest) = u8::decode_unfinished(input)?;
        match raw {
            0 => Ok((false, rest)),
            1 => Ok((true, rest)),
            _ => Err(WireError::InvalidValue("bool")),
        }
    }
}

macro_rules! impl_wire_for_hash {
    ($t:ty, $label:literal) => {
        impl WireEncode for $t {
            fn encode(&self, buf: &mut dyn BufMut) {
                buf.put_slice(self.as_bytes());
            }
        }

        impl WireDecode for $t {
            fn decode_unfinished(input: &[u8]) -> Result<(Self, &[u8]), WireError> {
                const N: usize = std::mem::size_of::<$t>();
                if input.len() < N {
                    return Err(WireError::UnexpectedEof($label));
                }
                Ok((<$t>::from_slice(&input[..N]), &input[N..]))
            }
        }
    };
}

impl_wire_for_hash!(H160, "h160");
impl_wire_for_hash!(H256, "h256");
impl_wire_for_hash!(H512, "h512");

impl<const N: usize> WireEncode for [u8; N] {
    fn encode(&self, buf: &mut dyn BufMut) {
        buf.put_slice(self);
    }
}

impl<const N: usize> WireDecode for [u8; N] {
    fn decode_unfinished(input: &[u8]) -> Result<(Self, &[u8]), WireError> {
        if input.len() < N {
            return Err(WireError::UnexpectedEof("fixed bytes"));
        }
        let mut raw = [0u8; N];
        raw.copy_from_slice(&input[..N]);
        Ok((raw, &input[N..]))
    }
}

impl WireEncode for Ipv4Addr {
    fn encode(&self, buf: &mut dyn BufMut) {
        buf.put_slice(&self.octets());
    }
}

impl WireDecode for Ipv4Addr {
    fn decode_unfinished(input: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (raw, rest) = <[u8; 4]>::decode_unfinished(input)
            .map_err(|e| e.with_field("ipv4"))?;
        Ok((Ipv4Addr::from(raw), rest))
    }
}

impl WireEncode for bytes::Bytes {
    fn encode(&self, buf: &mut dyn BufMut) {
        buf.put_u32(self.len() as u32);
        buf.put_slice(self);
    }
}

impl WireDecode for bytes::Bytes {
    fn decode_unfinished(input: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (len, rest) = u32::decode_unfinished(input).map_err(|e| e.with_field("bytes"))?;
        let len = len as usize;
        if len > rest.len() {
            return Err(WireError::LengthOutOfBounds("bytes"));
        }
        Ok((bytes::Bytes::copy_from_slice(&rest[..len]), &rest[len..]))
    }
}

impl WireEncode for String {
    fn encode(&self, buf: &mut dyn BufMut) {
        buf.put_u32(self.len() as u32);
        buf.put_slice(self.as_bytes());
    }
}

impl WireDecode for String {
    fn decode_unfinished(input: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (len, rest) = u32::decode_unfinished(input).map_err(|e| e.with_field("string"))?;
        let len = len as usize;
        if len > rest.len() {
            return Err(WireError::LengthOutOfBounds("string"));
        }
        let value = std::str::from_utf8(&rest[..len])
            .map_err(|_| WireError::InvalidUtf8("string"))?
            .to_owned();
        Ok((value, &rest[len..]))
    }
}

impl<T: WireEncode> WireEncode for Vec<T> {
    fn encode(&self, buf: &mut dyn BufMut) {
        buf.put_u32(self.len() as u32);
        for item in self {
            item.encode(buf);
        }
    }
}

impl<T: WireDecode> WireDecode for Vec<T> {
    fn decode_unfinished(input: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (count, mut rest) =
            u32::decode_unfinished(input).map_err(|e| e.with_field("list"))?;
        let count = count as usize;
        // Every item occupies at least one byte, so a count larger than the
        // remaining input cannot be satisfied.
        if count > rest.len() {
            return Err(WireError::LengthOutOfBounds("list"));
        }
        let mut items = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let (item, advanced) = T::decode_unfinished(rest)?;
            items.push(item);
            rest = advanced;
        }
        Ok((items, rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uint_round_trip() {
        let mut buf = Vec::new();
        Encoder::new(&mut buf)
            .encode_field(&0x1234u16)
            .encode_field(&0xdead_beefu32)
            .encode_field(&u64::MAX)
            .finish();

        let decoder = Decoder::new(&buf);
        let (a, decoder): (u16, _) = decoder.decode_field("a").unwrap();
        let (b, decoder): (u32, _) = decoder.decode_field("b").unwrap();
        let (c, decoder): (u64, _) = decoder.decode_field("c").unwrap();
        decoder.finish().unwrap();

        assert_eq!(a, 0x1234);
        assert_eq!(b, 0xdead_beef);
        assert_eq!(c, u64::MAX);
    }

    #[test]
    fn string_and_bytes_round_trip() {
        let text = "xdag-p2p/0.1.0".to_owned();
        let blob = vec![1u8, 2, 3, 4, 5];

        let mut buf = Vec::new();
        Encoder::new(&mut buf)
            .encode_field(&text)
            .encode_field(&blob)
            .finish();

        let decoder = Decoder::new(&buf);
        let (decoded_text, decoder): (String, _) = decoder.decode_field("text").unwrap();
        let (decoded_blob, decoder): (Vec<u8>, _) = decoder.decode_field("blob").unwrap();
        decoder.finish().unwrap();

        assert_eq!(decoded_text, text);
        assert_eq!(decoded_blob, blob);
    }

    #[test]
    fn list_round_trip() {
        let values: Vec<u32> = vec![1, 2, 3, 0xffff_ffff];
        let encoded = values.encode_to_vec();
        assert_eq!(Vec::<u32>::decode(&encoded).unwrap(), values);
    }

    #[test]
    fn underrun_is_an_error() {
        assert_eq!(
            u32::decode(&[0x01, 0x02]),
            Err(WireError::UnexpectedEof("u32"))
        );
    }

    #[test]
    fn oversized_length_prefix_is_an_error() {
        // Claims 1000 bytes follow, but only 2 do.
        let mut buf = Vec::new();
        buf.put_u32(1000);
        buf.put_slice(&[0xaa, 0xbb]);
        assert_eq!(
            Vec::<u8>::decode(&buf),
            Err(WireError::LengthOutOfBounds("list"))
        );
    }

    #[test]
    fn hostile_list_count_is_an_error() {
        let mut buf = Vec::new();
        buf.put_u32(u32::MAX);
        assert_eq!(
            Vec::<u8>::decode(&buf),
            Err(WireError::LengthOutOfBounds("list"))
        );
    }

    #[test]
    fn invalid_utf8_is_an_error() {
        let mut buf = Vec::new();
        buf.put_u32(2);
        buf.put_slice(&[0xff, 0xfe]);
        assert_eq!(
            String::decode(&buf),
            Err(WireError::InvalidUtf8("string"))
        );
    }

    #[test]
    fn trailing_bytes_are_rejected_by_finish() {
        let mut buf = 7u8.encode_to_vec();
        buf.push(0x00);
        assert_eq!(u8::decode(&buf), Err(WireError::TrailingBytes));
    }
}
