/*
   Primary channel frame

   0                   1                   2                   3
   0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |    tag (8)    |                   body(n)                     |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+

  tag 0: user data, body is opaque
  tag 1: keep-alive, body is the sender's clock in milliseconds (u64 big endian)
*/

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};

pub const TAG_LEN: usize = 1;

/// Wall clock in milliseconds, as carried by keep-alive frames.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Eq, PartialEq, Copy, Clone, Debug)]
#[repr(u8)]
pub enum FrameTag {
    UserData = 0,
    KeepAlive = 1,
    Unknown = 255,
}

impl From<u8> for FrameTag {
    fn from(value: u8) -> Self {
        match value {
            0 => FrameTag::UserData,
            1 => FrameTag::KeepAlive,
            _ => FrameTag::Unknown,
        }
    }
}

impl From<FrameTag> for u8 {
    fn from(tag: FrameTag) -> u8 {
        tag as u8
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PrimaryFrame {
    UserData(Bytes),
    KeepAlive { timestamp_ms: u64 },
}

impl PrimaryFrame {
    pub fn encode(&self) -> Bytes {
        match self {
            PrimaryFrame::UserData(data) => {
                let mut buf = BytesMut::with_capacity(TAG_LEN + data.len());
                buf.put_u8(FrameTag::UserData.into());
                buf.extend_from_slice(data);
                buf.freeze()
            }
            PrimaryFrame::KeepAlive { timestamp_ms } => {
                let mut buf = BytesMut::with_capacity(TAG_LEN + 8);
                buf.put_u8(FrameTag::KeepAlive.into());
                buf.put_u64(*timestamp_ms);
                buf.freeze()
            }
        }
    }
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        if buf.is_empty() {
            return Err(Error::InvalidFrame("empty primary frame".into()));
        }
        match FrameTag::from(buf.get_u8()) {
            FrameTag::UserData => Ok(PrimaryFrame::UserData(buf)),
            FrameTag::KeepAlive => {
                if buf.len() < 8 {
                    return Err(Error::InvalidFrame("short keep-alive".into()));
                }
                Ok(PrimaryFrame::KeepAlive {
                    timestamp_ms: buf.get_u64(),
                })
            }
            FrameTag::Unknown => Err(Error::InvalidFrame("unknown primary frame tag".into())),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_tag_from_u8() {
        assert_eq!(FrameTag::from(1), FrameTag::KeepAlive);
        assert_eq!(FrameTag::from(9), FrameTag::Unknown);
    }

    #[test]
    fn keepalive_layout() {
        let frame = PrimaryFrame::KeepAlive {
            timestamp_ms: 0x0102_0304_0506_0708,
        };
        let encoded = frame.encode();
        assert_eq!(&encoded[..], &[1, 1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(PrimaryFrame::decode(encoded).unwrap(), frame);
    }

    #[test]
    fn user_data_keeps_body_verbatim() {
        let encoded = PrimaryFrame::UserData(Bytes::from_static(b"\x01abc")).encode();
        assert_eq!(&encoded[..], b"\x00\x01abc");
        assert_eq!(
            PrimaryFrame::decode(encoded).unwrap(),
            PrimaryFrame::UserData(Bytes::from_static(b"\x01abc"))
        );
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(PrimaryFrame::decode(Bytes::new()).is_err());
        assert!(PrimaryFrame::decode(Bytes::from_static(&[1, 0, 0])).is_err());
        assert!(PrimaryFrame::decode(Bytes::from_static(&[7])).is_err());
    }
}
