/*
   Sub-channel chunk frame

   0                   1                   2                   3
   0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                metadata length (32, little endian)            |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                    metadata, UTF-8 JSON (n)                   |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                 payload (metadata.data_length)                |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+

  metadata: {transfer_id, chunk_index, total_chunks, hash, encrypted, data_length}
*/

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const META_LEN_SIZE: usize = 4;

/// One unit of a transfer. The payload is opaque.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub transfer_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub hash: String,
    pub encrypted: bool,
    pub payload: Bytes,
}

#[derive(Serialize, Deserialize)]
struct ChunkMetadata<'a> {
    #[serde(borrow)]
    transfer_id: std::borrow::Cow<'a, str>,
    chunk_index: u32,
    total_chunks: u32,
    #[serde(borrow)]
    hash: std::borrow::Cow<'a, str>,
    encrypted: bool,
    data_length: usize,
}

pub fn encode_chunk(chunk: &Chunk) -> Result<Bytes> {
    let metadata = serde_json::to_vec(&ChunkMetadata {
        transfer_id: chunk.transfer_id.as_str().into(),
        chunk_index: chunk.chunk_index,
        total_chunks: chunk.total_chunks,
        hash: chunk.hash.as_str().into(),
        encrypted: chunk.encrypted,
        data_length: chunk.payload.len(),
    })?;
    let mut buf = BytesMut::with_capacity(META_LEN_SIZE + metadata.len() + chunk.payload.len());
    buf.put_u32_le(metadata.len() as u32);
    buf.extend_from_slice(&metadata);
    buf.extend_from_slice(&chunk.payload);
    Ok(buf.freeze())
}

pub fn decode_chunk(mut buf: Bytes) -> Result<Chunk> {
    if buf.len() < META_LEN_SIZE {
        return Err(Error::InvalidFrame("missing metadata length".into()));
    }
    let meta_len = buf.get_u32_le() as usize;
    if buf.len() < meta_len {
        return Err(Error::InvalidFrame(format!(
            "metadata length {meta_len} exceeds frame of {}",
            buf.len()
        )));
    }
    let payload = buf.split_off(meta_len);
    let metadata: ChunkMetadata = serde_json::from_slice(&buf)?;
    if payload.len() != metadata.data_length {
        return Err(Error::InvalidFrame(format!(
            "payload is {} bytes, metadata says {}",
            payload.len(),
            metadata.data_length
        )));
    }
    Ok(Chunk {
        transfer_id: metadata.transfer_id.into_owned(),
        chunk_index: metadata.chunk_index,
        total_chunks: metadata.total_chunks,
        hash: metadata.hash.into_owned(),
        encrypted: metadata.encrypted,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk() -> Chunk {
        Chunk {
            transfer_id: "t-1".into(),
            chunk_index: 4,
            total_chunks: 10,
            hash: "ab12".into(),
            encrypted: true,
            payload: Bytes::from_static(b"opaque"),
        }
    }

    #[test]
    fn frame_layout() {
        let frame = encode_chunk(&chunk()).unwrap();
        let meta_len = u32::from_le_bytes(frame[..4].try_into().unwrap()) as usize;
        let meta: serde_json::Value = serde_json::from_slice(&frame[4..4 + meta_len]).unwrap();
        assert_eq!(meta["transfer_id"], "t-1");
        assert_eq!(meta["chunk_index"], 4);
        assert_eq!(meta["total_chunks"], 10);
        assert_eq!(meta["encrypted"], true);
        assert_eq!(meta["data_length"], 6);
        assert_eq!(&frame[4 + meta_len..], b"opaque");
        assert_eq!(decode_chunk(frame).unwrap(), chunk());
    }

    #[test]
    fn rejects_truncated_frames() {
        let frame = encode_chunk(&chunk()).unwrap();
        assert!(decode_chunk(frame.slice(..2)).is_err());
        assert!(decode_chunk(frame.slice(..10)).is_err());
        assert!(matches!(
            decode_chunk(frame.slice(..frame.len() - 1)),
            Err(Error::InvalidFrame(_))
        ));
    }

    #[test]
    fn rejects_bad_metadata() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(3);
        buf.extend_from_slice(b"{x}");
        assert!(matches!(decode_chunk(buf.freeze()), Err(Error::Json(_))));
    }
}
