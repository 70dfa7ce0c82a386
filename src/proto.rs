//! The LBS wire protocol: framing, request/response types, and the
//! `tokio_util` codec that turns a `TcpStream` into a stream of
//! [`LbsRequest`]/[`LbsResponse`] values.
//!
//! Frame layout on the wire: a 4-byte big-endian length prefix followed by
//! that many bytes of payload. The payload starts with a 1-byte request/
//! response tag and an 8-byte cookie used by clients to correlate responses
//! with requests (responses are not otherwise ordered across request
//! types), followed by type-specific fields.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtoError;

/// Hard cap on a single frame's payload size, guarding against a
/// malicious/broken peer claiming an enormous length prefix.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const TAG_PARAMS: u8 = 1;
const TAG_GET: u8 = 2;
const TAG_APPEND: u8 = 3;
const TAG_FREE: u8 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LbsRequest {
    Params {
        cookie: u64,
    },
    Get {
        cookie: u64,
        blknum: u64,
    },
    Append {
        cookie: u64,
        count: u64,
        data: Vec<u8>,
    },
    Free {
        cookie: u64,
        n: u64,
    },
}

impl LbsRequest {
    pub fn cookie(&self) -> u64 {
        match self {
            LbsRequest::Params { cookie } => *cookie,
            LbsRequest::Get { cookie, .. } => *cookie,
            LbsRequest::Append { cookie, .. } => *cookie,
            LbsRequest::Free { cookie, .. } => *cookie,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LbsResponse {
    Params {
        cookie: u64,
        blocklen: u32,
        nextblk: u64,
    },
    Get {
        cookie: u64,
        data: Option<Vec<u8>>,
    },
    Append {
        cookie: u64,
        /// `None` means the append failed (e.g. the writer reported a KV
        /// error); the connection is not dropped for this, unlike a
        /// protocol-level length mismatch, which is caught before the
        /// request ever reaches the writer.
        nextblk: Option<u64>,
    },
    Free {
        cookie: u64,
    },
}

/// Codec for the LBS wire protocol. Knows the server's block length so that
/// it can reject a malformed APPEND (wrong payload length) at decode time,
/// exactly as `lbs/dispatch.c`'s `gotrequest` does before the request ever
/// reaches the dispatcher's request-handling switch.
pub struct LbsCodec {
    blocklen: u64,
    /// Length of the frame currently being assembled, once known.
    frame_len: Option<u32>,
}

impl LbsCodec {
    pub fn new(blocklen: u64) -> Self {
        Self {
            blocklen,
            frame_len: None,
        }
    }
}

impl Decoder for LbsCodec {
    type Item = LbsRequest;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<LbsRequest>, ProtoError> {
        let frame_len = match self.frame_len {
            Some(len) => len,
            None => {
                if src.len() < 4 {
                    return Ok(None);
                }
                let len = (&src[..4]).get_u32();
                if len as usize > MAX_FRAME_LEN {
                    return Err(ProtoError::FrameTooLarge {
                        len: len as usize,
                        max: MAX_FRAME_LEN,
                    });
                }
                src.advance(4);
                self.frame_len = Some(len);
                len
            }
        };

        if src.len() < frame_len as usize {
            src.reserve(frame_len as usize - src.len());
            return Ok(None);
        }

        let mut payload = src.split_to(frame_len as usize);
        self.frame_len = None;

        if payload.is_empty() {
            return Err(ProtoError::UnknownRequestType(0));
        }
        let tag = payload.get_u8();
        if payload.remaining() < 8 {
            return Err(ProtoError::UnknownRequestType(tag));
        }
        let cookie = payload.get_u64();

        let req = match tag {
            TAG_PARAMS => LbsRequest::Params { cookie },
            TAG_GET => {
                if payload.remaining() < 8 {
                    return Err(ProtoError::UnknownRequestType(tag));
                }
                let blknum = payload.get_u64();
                LbsRequest::Get { cookie, blknum }
            }
            TAG_APPEND => {
                if payload.remaining() < 8 {
                    return Err(ProtoError::UnknownRequestType(tag));
                }
                let count = payload.get_u64();
                let data = payload.to_vec();
                // `count` is attacker-controlled and unbounded by the frame
                // length check above (only the frame's total byte length is
                // capped, not this field), so a plain `count * blocklen`
                // could overflow.
                let expected = count.checked_mul(self.blocklen).ok_or(
                    ProtoError::AppendCountOverflow {
                        count,
                        blocklen: self.blocklen,
                    },
                )?;
                if data.len() as u64 != expected {
                    return Err(ProtoError::AppendLengthMismatch {
                        got: data.len(),
                        expected: expected as usize,
                    });
                }
                LbsRequest::Append {
                    cookie,
                    count,
                    data,
                }
            }
            TAG_FREE => {
                if payload.remaining() < 8 {
                    return Err(ProtoError::UnknownRequestType(tag));
                }
                let n = payload.get_u64();
                LbsRequest::Free { cookie, n }
            }
            other => return Err(ProtoError::UnknownRequestType(other)),
        };

        Ok(Some(req))
    }
}

impl Encoder<LbsResponse> for LbsCodec {
    type Error = ProtoError;

    fn encode(&mut self, resp: LbsResponse, dst: &mut BytesMut) -> Result<(), ProtoError> {
        let mut payload = BytesMut::new();
        match resp {
            LbsResponse::Params {
                cookie,
                blocklen,
                nextblk,
            } => {
                payload.put_u8(TAG_PARAMS);
                payload.put_u64(cookie);
                payload.put_u32(blocklen);
                payload.put_u64(nextblk);
            }
            LbsResponse::Get { cookie, data } => {
                payload.put_u8(TAG_GET);
                payload.put_u64(cookie);
                match data {
                    Some(bytes) => {
                        payload.put_u8(1);
                        payload.put_u32(bytes.len() as u32);
                        payload.put_slice(&bytes);
                    }
                    None => payload.put_u8(0),
                }
            }
            LbsResponse::Append { cookie, nextblk } => {
                payload.put_u8(TAG_APPEND);
                payload.put_u64(cookie);
                match nextblk {
                    Some(n) => {
                        payload.put_u8(1);
                        payload.put_u64(n);
                    }
                    None => payload.put_u8(0),
                }
            }
            LbsResponse::Free { cookie } => {
                payload.put_u8(TAG_FREE);
                payload.put_u64(cookie);
            }
        }

        if payload.len() > MAX_FRAME_LEN {
            return Err(ProtoError::FrameTooLarge {
                len: payload.len(),
                max: MAX_FRAME_LEN,
            });
        }

        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(blocklen: u64, req: LbsRequest) -> LbsRequest {
        let mut codec = LbsCodec::new(blocklen);
        let mut buf = BytesMut::new();

        // Hand-encode the request the same way a client would, reusing the
        // encoder's framing via a throwaway response-shaped path isn't
        // available (the codec only encodes responses), so build the frame
        // directly here mirroring `LbsCodec::decode`'s expectations.
        let mut payload = BytesMut::new();
        match &req {
            LbsRequest::Params { cookie } => {
                payload.put_u8(TAG_PARAMS);
                payload.put_u64(*cookie);
            }
            LbsRequest::Get { cookie, blknum } => {
                payload.put_u8(TAG_GET);
                payload.put_u64(*cookie);
                payload.put_u64(*blknum);
            }
            LbsRequest::Append {
                cookie,
                count,
                data,
            } => {
                payload.put_u8(TAG_APPEND);
                payload.put_u64(*cookie);
                payload.put_u64(*count);
                payload.put_slice(data);
            }
            LbsRequest::Free { cookie, n } => {
                payload.put_u8(TAG_FREE);
                payload.put_u64(*cookie);
                payload.put_u64(*n);
            }
        }
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);

        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn params_roundtrip() {
        let req = LbsRequest::Params { cookie: 42 };
        assert_eq!(roundtrip(4096, req.clone()), req);
    }

    #[test]
    fn get_roundtrip() {
        let req = LbsRequest::Get {
            cookie: 7,
            blknum: 9001,
        };
        assert_eq!(roundtrip(4096, req.clone()), req);
    }

    #[test]
    fn append_roundtrip_with_correct_length() {
        let req = LbsRequest::Append {
            cookie: 1,
            count: 2,
            data: vec![0xAB; 8192],
        };
        assert_eq!(roundtrip(4096, req.clone()), req);
    }

    #[test]
    fn append_rejects_wrong_length() {
        let mut codec = LbsCodec::new(4096);
        let mut buf = BytesMut::new();
        let mut payload = BytesMut::new();
        payload.put_u8(TAG_APPEND);
        payload.put_u64(1);
        payload.put_u64(2); // claims 2 blocks
        payload.put_slice(&[0u8; 100]); // but sends only 100 bytes
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtoError::AppendLengthMismatch { .. }));
    }

    #[test]
    fn append_rejects_count_that_overflows_against_blocklen() {
        let mut codec = LbsCodec::new(4096);
        let mut buf = BytesMut::new();
        let mut payload = BytesMut::new();
        payload.put_u8(TAG_APPEND);
        payload.put_u64(1);
        payload.put_u64(u64::MAX); // count * blocklen overflows u64
        payload.put_slice(&[0u8; 16]);
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtoError::AppendCountOverflow { .. }));
    }

    #[test]
    fn free_roundtrip() {
        let req = LbsRequest::Free { cookie: 3, n: 200 };
        assert_eq!(roundtrip(4096, req.clone()), req);
    }

    #[test]
    fn decode_waits_for_full_frame() {
        let mut codec = LbsCodec::new(4096);
        let mut buf = BytesMut::new();
        buf.put_u32(100); // claim a 100-byte frame
        buf.put_u8(TAG_PARAMS);
        // Only partial payload delivered so far.
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn encode_decode_response_shapes() {
        let mut codec = LbsCodec::new(4096);
        let mut buf = BytesMut::new();

        codec
            .encode(
                LbsResponse::Params {
                    cookie: 1,
                    blocklen: 4096,
                    nextblk: 10,
                },
                &mut buf,
            )
            .unwrap();
        assert!(!buf.is_empty());

        let mut buf2 = BytesMut::new();
        codec
            .encode(
                LbsResponse::Get {
                    cookie: 2,
                    data: Some(vec![1, 2, 3]),
                },
                &mut buf2,
            )
            .unwrap();
        assert!(!buf2.is_empty());
    }
}
