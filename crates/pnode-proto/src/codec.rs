//! Codec for the session-id stream on the control connection

use crate::messages::{SessionId, SESSION_ID_LEN};
use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// Splits the control stream into 36-byte session identifiers
///
/// The gateway writes ids back to back with no framing, and TCP is free to
/// deliver them split or coalesced. The decoder only yields complete strides
/// and keeps any remainder buffered for the next read.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionIdCodec;

impl SessionIdCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for SessionIdCodec {
    type Item = SessionId;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<SessionId>, Self::Error> {
        while src.len() >= SESSION_ID_LEN {
            let stride = src.split_to(SESSION_ID_LEN);

            match SessionId::from_bytes(&stride) {
                Ok(id) => return Ok(Some(id)),
                Err(e) => {
                    // A garbled stride only costs that one session
                    warn!(error = %e, "Skipping malformed session id on control stream");
                }
            }
        }

        src.reserve(SESSION_ID_LEN - src.len());
        Ok(None)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<SessionId>, Self::Error> {
        match self.decode(buf)? {
            Some(id) => Ok(Some(id)),
            None => {
                if !buf.is_empty() {
                    warn!(
                        remaining = buf.len(),
                        "Discarding partial session id at end of control stream"
                    );
                    buf.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<SessionId> for SessionIdCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: SessionId, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(SESSION_ID_LEN);
        dst.put_slice(item.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::FramedRead;

    fn ids(count: usize) -> Vec<SessionId> {
        (0..count)
            .map(|_| uuid::Uuid::new_v4().to_string().parse().unwrap())
            .collect()
    }

    fn concat(ids: &[SessionId]) -> Vec<u8> {
        ids.iter().flat_map(|id| id.as_bytes().to_vec()).collect()
    }

    #[test]
    fn test_decode_exact_multiple() {
        let expected = ids(3);
        let mut buf = BytesMut::from(&concat(&expected)[..]);
        let mut codec = SessionIdCodec::new();

        let mut decoded = Vec::new();
        while let Some(id) = codec.decode(&mut buf).unwrap() {
            decoded.push(id);
        }

        assert_eq!(decoded, expected);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_holds_partial_stride() {
        let expected = ids(2);
        let bytes = concat(&expected);
        let mut codec = SessionIdCodec::new();

        let mut buf = BytesMut::from(&bytes[..50]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(expected[0].clone()));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 14);

        buf.extend_from_slice(&bytes[50..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(expected[1].clone()));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_skips_malformed_stride() {
        let good = ids(1);
        let mut bytes = vec![0xffu8; SESSION_ID_LEN];
        bytes.extend_from_slice(&concat(&good));

        let mut buf = BytesMut::from(&bytes[..]);
        let mut codec = SessionIdCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(good[0].clone()));
    }

    #[test]
    fn test_decode_keeps_non_uuid_ids() {
        let raw = "session id with spaces/and:symbols!";
        let raw = format!("{}{}", raw, "#".repeat(SESSION_ID_LEN - raw.len()));

        let mut buf = BytesMut::from(raw.as_bytes());
        let mut codec = SessionIdCodec::new();
        let id = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(id.as_str(), raw);
    }

    #[test]
    fn test_decode_eof_discards_remainder() {
        let mut buf = BytesMut::from(&b"0123456789"[..]);
        let mut codec = SessionIdCodec::new();

        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_framed_read_over_fragmented_stream() {
        let expected = ids(4);
        let bytes = concat(&expected);
        let (mut writer, reader) = tokio::io::duplex(64);

        let feeder = tokio::spawn(async move {
            // Deliberately misaligned chunk sizes
            for chunk in bytes.chunks(7) {
                writer.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let decoded: Vec<SessionId> = FramedRead::new(reader, SessionIdCodec::new())
            .map(|item| item.unwrap())
            .collect()
            .await;

        feeder.await.unwrap();
        assert_eq!(decoded, expected);
    }
}
