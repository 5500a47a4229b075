//! Framing of request and reply messages.
//!
//! ```text
//! request: [u32 rpc_id][u32 payload_len][payload]
//! reply:   [u32 status][u32 rpc_id][u32 payload_len][payload]
//! ```
//!
//! A reply with a nonzero status carries an [`ErrorRecord`](crate::ErrorRecord) as payload.
use crate::proc::{Decoder, Encoder};
use crate::registry::RpcId;
use crate::{Code, Error, Result};

pub const REQUEST_HEADER_LEN: usize = 8;
pub const REPLY_HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request<'a> {
    pub rpc_id: RpcId,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply<'a> {
    pub status: Code,
    pub rpc_id: RpcId,
    pub payload: &'a [u8],
}

fn payload<'a>(dec: &mut Decoder<'a>) -> Result<&'a [u8]> {
    let len = dec.get_u32()? as usize;
    if len != dec.remaining() {
        return Err(Error::DecodeFailed(format!(
            "envelope declares {} payload bytes but carries {}",
            len,
            dec.remaining()
        )));
    }
    dec.take(len)
}

impl<'a> Request<'a> {
    pub fn encode(rpc_id: RpcId, payload: &[u8]) -> Result<Vec<u8>> {
        let mut enc = Encoder::with_capacity(REQUEST_HEADER_LEN + payload.len())?;
        enc.put_u32(rpc_id.0)?;
        enc.put_bytes(payload)?;
        Ok(enc.into_bytes())
    }

    pub fn decode(bytes: &'a [u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        let rpc_id = RpcId(dec.get_u32()?);
        let payload = payload(&mut dec)?;
        Ok(Request { rpc_id, payload })
    }
}

impl<'a> Reply<'a> {
    pub fn encode(status: Code, rpc_id: RpcId, payload: &[u8]) -> Result<Vec<u8>> {
        let mut enc = Encoder::with_capacity(REPLY_HEADER_LEN + payload.len())?;
        enc.put_u32(status.as_u32())?;
        enc.put_u32(rpc_id.0)?;
        enc.put_bytes(payload)?;
        Ok(enc.into_bytes())
    }

    pub fn decode(bytes: &'a [u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        let status = Code::from(dec.get_u32()?);
        let rpc_id = RpcId(dec.get_u32()?);
        let payload = payload(&mut dec)?;
        Ok(Reply {
            status,
            rpc_id,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layout() {
        let bytes = Request::encode(RpcId(0xdeadbeef), b"xyz").unwrap();
        assert_eq!(&bytes[..4], &0xdeadbeefu32.to_le_bytes());
        assert_eq!(&bytes[4..8], &3u32.to_le_bytes());
        let req = Request::decode(&bytes).unwrap();
        assert_eq!(req.rpc_id, RpcId(0xdeadbeef));
        assert_eq!(req.payload, b"xyz");
    }

    #[test]
    fn reply_status_comes_first() {
        let bytes = Reply::encode(Code::UnknownOp, RpcId(1), &[]).unwrap();
        assert_eq!(bytes.len(), REPLY_HEADER_LEN);
        assert_eq!(&bytes[..4], &5u32.to_le_bytes());
        assert_eq!(Reply::decode(&bytes).unwrap().status, Code::UnknownOp);
    }

    #[test]
    fn length_mismatch_is_decode_failure() {
        let mut bytes = Request::encode(RpcId(1), b"abc").unwrap();
        bytes.push(0);
        assert_eq!(Request::decode(&bytes).unwrap_err().code(), Code::DecodeFailed);
        assert!(Request::decode(&bytes[..5]).is_err());
    }
}
