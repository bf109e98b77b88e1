//! Chunk framing: splitting arbitrary-length payloads into fixed-header
//! frames and reassembling them on the receive side.
//!
//! A frame is `[4B length][32B correlation-id][1B is_final][payload]`.
//! Payloads larger than the chunk size are split into several frames
//! sharing one correlation id; all but the last are marked non-final.
//! Frames for different ids may interleave freely on one channel, so
//! reassembly buffers are keyed by id and dropped on the final chunk.

use std::collections::HashMap;

use crate::{decode_padded, encode_padded, Result, WireError, ID_WIDTH, MAX_MESSAGE_BYTES};

/// Size of the fixed frame header: length + id + final flag.
pub const FRAME_HEADER_BYTES: usize = 4 + ID_WIDTH + 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Byte length of the chunk that follows this header.
    pub len: u32,
    /// Correlation id shared by every chunk of one logical message.
    pub stream_id: String,
    /// Set on the last (or only) chunk of a message.
    pub is_final: bool,
}

impl FrameHeader {
    pub fn encode(&self) -> Result<[u8; FRAME_HEADER_BYTES]> {
        let mut out = [0u8; FRAME_HEADER_BYTES];
        out[..4].copy_from_slice(&self.len.to_le_bytes());
        let id = encode_padded(&self.stream_id, ID_WIDTH, "stream id")?;
        out[4..4 + ID_WIDTH].copy_from_slice(&id);
        out[FRAME_HEADER_BYTES - 1] = u8::from(self.is_final);
        Ok(out)
    }

    pub fn decode(raw: &[u8; FRAME_HEADER_BYTES]) -> Result<Self> {
        let len = u32::from_le_bytes(raw[..4].try_into().expect("4-byte slice"));
        let stream_id = decode_padded(&raw[4..4 + ID_WIDTH], "stream id")?;
        Ok(Self {
            len,
            stream_id,
            is_final: raw[FRAME_HEADER_BYTES - 1] == 1,
        })
    }
}

/// Split `payload` into ready-to-send frames of at most `chunk_size`
/// payload bytes each.
///
/// A payload of exactly `chunk_size` bytes still yields a single final
/// frame; no empty trailing chunk is emitted. An empty payload yields
/// one final frame with a zero-length chunk.
pub fn split_chunks(stream_id: &str, payload: &[u8], chunk_size: usize) -> Result<Vec<Vec<u8>>> {
    assert!(chunk_size > 0, "chunk_size must be positive");
    if payload.len() > MAX_MESSAGE_BYTES {
        return Err(WireError::MessageTooLarge {
            len: payload.len(),
            max: MAX_MESSAGE_BYTES,
        });
    }

    let mut frames = Vec::with_capacity(payload.len() / chunk_size + 1);
    let mut offset = 0usize;
    loop {
        let take = chunk_size.min(payload.len() - offset);
        let is_final = offset + take == payload.len();
        let header = FrameHeader {
            len: take as u32,
            stream_id: stream_id.to_owned(),
            is_final,
        }
        .encode()?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES + take);
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&payload[offset..offset + take]);
        frames.push(frame);

        offset += take;
        if is_final {
            break;
        }
    }
    Ok(frames)
}

/// Receive-side reassembly of interleaved chunk streams.
///
/// Feed each decoded header+chunk pair to [`Reassembler::push`]; a
/// completed message is returned once its final chunk arrives. Partial
/// buffers for ids whose sender died are the caller's to expire (the
/// peer runtime sweeps them together with its correlation pipes).
#[derive(Debug, Default)]
pub struct Reassembler {
    partial: HashMap<String, Vec<u8>>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the fully reassembled payload when `header.is_final`,
    /// `None` while more chunks are pending for this id.
    pub fn push(&mut self, header: &FrameHeader, chunk: &[u8]) -> Result<Option<Vec<u8>>> {
        debug_assert_eq!(header.len as usize, chunk.len());

        let buffered = self.partial.get(&header.stream_id).map_or(0, Vec::len);
        if buffered + chunk.len() > MAX_MESSAGE_BYTES {
            self.partial.remove(&header.stream_id);
            return Err(WireError::MessageTooLarge {
                len: buffered + chunk.len(),
                max: MAX_MESSAGE_BYTES,
            });
        }

        if header.is_final {
            let payload = match self.partial.remove(&header.stream_id) {
                Some(mut buf) => {
                    buf.extend_from_slice(chunk);
                    buf
                }
                None => chunk.to_vec(),
            };
            return Ok(Some(payload));
        }

        self.partial
            .entry(header.stream_id.clone())
            .or_default()
            .extend_from_slice(chunk);
        Ok(None)
    }

    /// Number of ids with partially buffered chunks.
    pub fn pending(&self) -> usize {
        self.partial.len()
    }

    /// Drop all partial buffers (connection teardown).
    pub fn clear(&mut self) {
        self.partial.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(payload: &[u8], chunk_size: usize) -> Vec<u8> {
        let frames = split_chunks("stream-a", payload, chunk_size).unwrap();
        let mut asm = Reassembler::new();
        let mut out = None;
        for frame in &frames {
            let header =
                FrameHeader::decode(frame[..FRAME_HEADER_BYTES].try_into().unwrap()).unwrap();
            assert!(out.is_none(), "message completed before last frame");
            out = asm.push(&header, &frame[FRAME_HEADER_BYTES..]).unwrap();
        }
        assert_eq!(asm.pending(), 0);
        out.expect("final chunk must complete the message")
    }

    #[test]
    fn roundtrip_across_chunk_counts() {
        let chunk = 64usize;
        for len in [0, 1, chunk - 1, chunk, chunk + 1, 3 * chunk, 10 * chunk] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            assert_eq!(roundtrip(&payload, chunk), payload, "len={len}");
        }
    }

    #[test]
    fn exact_chunk_size_is_a_single_final_frame() {
        let payload = vec![7u8; 64];
        let frames = split_chunks("id", &payload, 64).unwrap();
        assert_eq!(frames.len(), 1);
        let header = FrameHeader::decode(frames[0][..FRAME_HEADER_BYTES].try_into().unwrap()).unwrap();
        assert!(header.is_final);
        assert_eq!(header.len, 64);
    }

    #[test]
    fn interleaved_ids_reassemble_independently() {
        let a: Vec<u8> = vec![1u8; 150];
        let b: Vec<u8> = vec![2u8; 150];
        let frames_a = split_chunks("aaaa", &a, 64).unwrap();
        let frames_b = split_chunks("bbbb", &b, 64).unwrap();

        let mut asm = Reassembler::new();
        let mut done = Vec::new();
        // Interleave: a0 b0 a1 b1 a2 b2.
        for (fa, fb) in frames_a.iter().zip(frames_b.iter()) {
            for frame in [fa, fb] {
                let header =
                    FrameHeader::decode(frame[..FRAME_HEADER_BYTES].try_into().unwrap()).unwrap();
                if let Some(payload) = asm.push(&header, &frame[FRAME_HEADER_BYTES..]).unwrap() {
                    done.push((header.stream_id.clone(), payload));
                }
            }
        }
        assert_eq!(done.len(), 2);
        assert_eq!(done[0], ("aaaa".to_owned(), a));
        assert_eq!(done[1], ("bbbb".to_owned(), b));
    }

    #[test]
    fn oversized_reassembly_is_rejected() {
        let mut asm = Reassembler::new();
        let chunk = vec![0u8; 1024];
        let header = FrameHeader {
            len: chunk.len() as u32,
            stream_id: "big".into(),
            is_final: false,
        };
        for _ in 0..(MAX_MESSAGE_BYTES / chunk.len()) {
            asm.push(&header, &chunk).unwrap();
        }
        let err = asm.push(&header, &chunk).unwrap_err();
        assert!(matches!(err, WireError::MessageTooLarge { .. }));
        // The offending buffer is dropped so the id can be reused.
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn overlong_stream_id_is_rejected() {
        let header = FrameHeader {
            len: 0,
            stream_id: "x".repeat(ID_WIDTH + 1),
            is_final: true,
        };
        assert!(matches!(
            header.encode(),
            Err(WireError::TooLong { what: "stream id", .. })
        ));
    }
}
