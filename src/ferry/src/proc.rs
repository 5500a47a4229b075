//! Little-endian, length-prefixed codec for RPC inputs and outputs.
//!
//! Integers are fixed width. Strings and byte vectors are a `u32` length followed by the bytes.
//! Sequences are a `u32` element count followed by the elements. `Option<T>` is a one-byte
//! presence flag followed by the value. Bulk descriptors are written inline in their own wire
//! format.
use ferry_na::Address;

use crate::{Error, Result};

#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Result<Self> {
        let mut buf = Vec::new();
        buf.try_reserve(cap)?;
        Ok(Encoder { buf })
    }

    #[inline]
    fn reserve(&mut self, n: usize) -> Result<()> {
        self.buf.try_reserve(n)?;
        Ok(())
    }

    #[inline]
    pub fn put_u8(&mut self, v: u8) -> Result<()> {
        self.put_raw(&[v])
    }

    #[inline]
    pub fn put_u32(&mut self, v: u32) -> Result<()> {
        self.put_raw(&v.to_le_bytes())
    }

    #[inline]
    pub fn put_u64(&mut self, v: u64) -> Result<()> {
        self.put_raw(&v.to_le_bytes())
    }

    /// Write a length in the `u32` prefix format.
    pub fn put_len(&mut self, len: usize) -> Result<()> {
        let len = u32::try_from(len)
            .map_err(|_| Error::EncodeFailed(format!("length {} does not fit in u32", len)))?;
        self.put_u32(len)
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.put_len(bytes.len())?;
        self.put_raw(bytes)
    }

    pub fn put_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.reserve(bytes.len())?;
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    #[inline]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads values written by [`Encoder`].
///
/// A decoder may carry the address of the peer the bytes came from, so that bulk descriptors
/// embedded in a request are bound to the sender.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    peer: Option<Address>,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Decoder {
            buf,
            pos: 0,
            peer: None,
        }
    }

    pub fn with_peer(buf: &'a [u8], peer: Address) -> Self {
        Decoder {
            buf,
            pos: 0,
            peer: Some(peer),
        }
    }

    #[inline]
    pub fn peer(&self) -> Option<&Address> {
        self.peer.as_ref()
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(Error::DecodeFailed(format!(
                "truncated input: need {} bytes at offset {}, {} left",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    #[inline]
    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    #[inline]
    pub fn get_u32(&mut self) -> Result<u32> {
        self.take_array().map(u32::from_le_bytes)
    }

    #[inline]
    pub fn get_u64(&mut self) -> Result<u64> {
        self.take_array().map(u64::from_le_bytes)
    }

    /// Read a `u32` length and check it against what is left.
    pub fn get_len(&mut self) -> Result<usize> {
        let len = self.get_u32()? as usize;
        if len > self.remaining() {
            return Err(Error::DecodeFailed(format!(
                "declared length {} exceeds the {} bytes left",
                len,
                self.remaining()
            )));
        }
        Ok(len)
    }

    pub fn get_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.get_len()?;
        self.take(len)
    }

    /// Fails unless every byte was consumed.
    pub fn finish(&self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(Error::DecodeFailed(format!("{} trailing bytes", n))),
        }
    }
}

/// A record that can cross the wire.
pub trait Proc: Sized {
    fn encode(&self, enc: &mut Encoder) -> Result<()>;
    fn decode(dec: &mut Decoder<'_>) -> Result<Self>;
}

pub fn encode<T: Proc>(value: &T) -> Result<Vec<u8>> {
    let mut enc = Encoder::new();
    value.encode(&mut enc)?;
    Ok(enc.into_bytes())
}

/// Decode a whole buffer into `T`. Trailing bytes are an error.
pub fn decode<T: Proc>(bytes: &[u8], peer: Option<&Address>) -> Result<T> {
    let mut dec = match peer {
        Some(peer) => Decoder::with_peer(bytes, peer.clone()),
        None => Decoder::new(bytes),
    };
    let value = T::decode(&mut dec)?;
    dec.finish()?;
    Ok(value)
}

impl Proc for () {
    fn encode(&self, _enc: &mut Encoder) -> Result<()> {
        Ok(())
    }

    fn decode(_dec: &mut Decoder<'_>) -> Result<Self> {
        Ok(())
    }
}

impl Proc for bool {
    fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.put_u8(*self as u8)
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        match dec.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(Error::DecodeFailed(format!("invalid bool {}", v))),
        }
    }
}

macro_rules! proc_int {
    ($($ty:ty),*) => {
        $(
            impl Proc for $ty {
                #[inline]
                fn encode(&self, enc: &mut Encoder) -> Result<()> {
                    enc.put_raw(&self.to_le_bytes())
                }

                #[inline]
                fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
                    Ok(<$ty>::from_le_bytes(dec.take_array()?))
                }
            }
        )*
    };
}

proc_int!(u8, u16, u32, u64, i32, i64);

impl Proc for String {
    fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.put_bytes(self.as_bytes())
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let bytes = dec.get_bytes()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|e| Error::DecodeFailed(format!("invalid UTF-8 in string: {}", e)))
    }
}

impl<T: Proc> Proc for Vec<T> {
    fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.put_len(self.len())?;
        for item in self {
            item.encode(enc)?;
        }
        Ok(())
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let count = dec.get_u32()? as usize;
        // Elements may be zero-sized, so the count only bounds the preallocation.
        let mut out = Vec::new();
        out.try_reserve(count.min(dec.remaining()))?;
        for _ in 0..count {
            out.push(T::decode(dec)?);
        }
        Ok(out)
    }
}

impl<T: Proc> Proc for Option<T> {
    fn encode(&self, enc: &mut Encoder) -> Result<()> {
        match self {
            Some(v) => {
                enc.put_u8(1)?;
                v.encode(enc)
            }
            None => enc.put_u8(0),
        }
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        match dec.get_u8()? {
            0 => Ok(None),
            1 => T::decode(dec).map(Some),
            v => Err(Error::DecodeFailed(format!("invalid option tag {}", v))),
        }
    }
}

/// Declare a struct and implement [`Proc`] for it, encoding fields in declaration order.
///
/// ```
/// ferry::proc_struct! {
///     #[derive(Debug, Clone, PartialEq)]
///     pub struct OpenIn {
///         pub path: String,
///         pub flags: u32,
///     }
/// }
/// let bytes = ferry::proc::encode(&OpenIn { path: "/tmp/x".into(), flags: 2 }).unwrap();
/// let back: OpenIn = ferry::proc::decode(&bytes, None).unwrap();
/// assert_eq!(back.flags, 2);
/// ```
#[macro_export]
macro_rules! proc_struct {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$fmeta:meta])*
                $fvis:vis $field:ident : $ty:ty
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $(
                $(#[$fmeta])*
                $fvis $field: $ty,
            )*
        }

        impl $crate::proc::Proc for $name {
            fn encode(&self, enc: &mut $crate::proc::Encoder) -> $crate::Result<()> {
                $( $crate::proc::Proc::encode(&self.$field, enc)?; )*
                Ok(())
            }

            fn decode(dec: &mut $crate::proc::Decoder<'_>) -> $crate::Result<Self> {
                Ok($name {
                    $( $field: <$ty as $crate::proc::Proc>::decode(dec)?, )*
                })
            }
        }
    };
}

proc_struct! {
    /// Payload of a reply envelope with a nonzero status.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ErrorRecord {
        pub code: u32,
        pub message: String,
    }
}

impl ErrorRecord {
    pub fn from_error(e: &Error) -> Self {
        ErrorRecord {
            code: e.code().as_u32(),
            message: e.to_string(),
        }
    }

    /// Cut the message to at most `max` bytes, on a character boundary.
    pub fn truncate_message(&mut self, max: usize) {
        if self.message.len() <= max {
            return;
        }
        let mut end = max;
        while !self.message.is_char_boundary(end) {
            end -= 1;
        }
        self.message.truncate(end);
    }

    pub fn into_error(self) -> Error {
        Error::Remote {
            code: self.code.into(),
            message: self.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Code;

    proc_struct! {
        #[derive(Debug, Clone, PartialEq)]
        struct Sample {
            id: u64,
            name: String,
            tags: Vec<u32>,
            hint: Option<i32>,
            flag: bool,
        }
    }

    #[test]
    fn struct_layout_is_little_endian() {
        let s = Sample {
            id: 1,
            name: "ab".into(),
            tags: vec![7],
            hint: None,
            flag: true,
        };
        let bytes = encode(&s).unwrap();
        let mut expect = Vec::new();
        expect.extend_from_slice(&1u64.to_le_bytes());
        expect.extend_from_slice(&2u32.to_le_bytes());
        expect.extend_from_slice(b"ab");
        expect.extend_from_slice(&1u32.to_le_bytes());
        expect.extend_from_slice(&7u32.to_le_bytes());
        expect.extend_from_slice(&[0, 1]);
        assert_eq!(bytes, expect);
        assert_eq!(decode::<Sample>(&bytes, None).unwrap(), s);
    }

    #[test]
    fn truncated_input() {
        let bytes = encode(&String::from("hello")).unwrap();
        let err = decode::<String>(&bytes[..6], None).unwrap_err();
        assert_eq!(err.code(), Code::DecodeFailed);
    }

    #[test]
    fn declared_length_exceeds_buffer() {
        let mut bytes = 100u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"short");
        assert!(matches!(
            decode::<String>(&bytes, None),
            Err(Error::DecodeFailed(msg)) if msg.contains("exceeds")
        ));
    }

    #[test]
    fn invalid_utf8() {
        let mut bytes = 2u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0xff, 0xfe]);
        assert!(matches!(
            decode::<String>(&bytes, None),
            Err(Error::DecodeFailed(msg)) if msg.contains("UTF-8")
        ));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = encode(&5u32).unwrap();
        bytes.push(0);
        assert_eq!(decode::<u32>(&bytes, None).unwrap_err().code(), Code::DecodeFailed);
    }

    #[test]
    fn error_record_becomes_remote_error() {
        let rec = ErrorRecord::from_error(&Error::UnknownOp(0xdeadbeef));
        let bytes = encode(&rec).unwrap();
        let back = decode::<ErrorRecord>(&bytes, None).unwrap().into_error();
        assert_eq!(back.code(), Code::UnknownOp);
    }

    #[test]
    fn integers_of_every_width() {
        let bytes = encode(&(-5i32)).unwrap();
        assert_eq!(decode::<i32>(&bytes, None).unwrap(), -5);
        let bytes = encode(&0xbeefu16).unwrap();
        assert_eq!(bytes, vec![0xef, 0xbe]);
        assert_eq!(decode::<u16>(&bytes, None).unwrap(), 0xbeef);
        assert_eq!(decode::<u8>(&[0xab], None).unwrap(), 0xab);
        let bytes = encode(&i64::MIN).unwrap();
        assert_eq!(decode::<i64>(&bytes, None).unwrap(), i64::MIN);
        assert_eq!(decode::<u64>(&bytes[..7], None).unwrap_err().code(), Code::DecodeFailed);
    }

    #[test]
    fn error_message_cut_on_char_boundary() {
        let mut rec = ErrorRecord {
            code: Code::Internal.as_u32(),
            message: String::from("aé"),
        };
        rec.truncate_message(2);
        assert_eq!(rec.message, "a");
        rec.truncate_message(0);
        assert!(rec.message.is_empty());
    }
}
