use crate::error::{Result, TunnelError};
use crate::fec::FecCodec;
use crate::{FRAME_HEADER_SIZE, MAX_FRAME_BODY, PREAMBLE, RS_DATA_BYTES, SYNC_WORD};

/// Kind-byte flag marking an FEC-protected body
const FEC_FLAG: u8 = 0x80;

/// Proper CRC-8 using polynomial 0xD5 (x^8 + x^7 + x^6 + x^4 + x^2 + 1)
/// Detects all single-bit errors, many multi-bit patterns, and burst errors up to 7 bits
fn crc8(data: &[u8]) -> u8 {
    const POLYNOMIAL: u8 = 0xD5;
    let mut crc = 0u8;

    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            if (crc & 0x80) != 0 {
                crc = (crc << 1) ^ POLYNOMIAL;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Handshake message, sent in the clear
    Handshake = 1,
    /// AEAD-sealed session traffic
    Sealed = 2,
    /// Unauthenticated payload (modem test transfers)
    Plain = 3,
}

impl FrameKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(FrameKind::Handshake),
            2 => Some(FrameKind::Sealed),
            3 => Some(FrameKind::Plain),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    /// Body is a Reed-Solomon codeword
    pub fec: bool,
    pub body: Vec<u8>,
}

impl Frame {
    /// Wire value of the kind byte, also used as AEAD associated data.
    pub fn kind_byte(&self) -> u8 {
        kind_byte(self.kind, self.fec)
    }
}

/// Kind byte for `kind`, with the FEC flag when `fec` is set.
pub fn kind_byte(kind: FrameKind, fec: bool) -> u8 {
    kind as u8 | if fec { FEC_FLAG } else { 0 }
}

pub struct FrameEncoder;

impl FrameEncoder {
    /// Serialize a frame: preamble + sync word + kind + length + CRC-8 + body
    pub fn encode(frame: &Frame) -> Result<Vec<u8>> {
        if frame.body.len() > MAX_FRAME_BODY {
            return Err(TunnelError::Frame(format!(
                "body of {} bytes exceeds {}",
                frame.body.len(),
                MAX_FRAME_BODY
            )));
        }

        let kind = frame.kind_byte();
        let len = frame.body.len() as u8;

        let mut encoded = Vec::with_capacity(PREAMBLE.len() + FRAME_HEADER_SIZE + frame.body.len());
        encoded.extend_from_slice(&PREAMBLE);
        encoded.extend_from_slice(&SYNC_WORD);
        encoded.push(kind);
        encoded.push(len);
        encoded.push(crc8(&[kind, len]));
        encoded.extend_from_slice(&frame.body);
        Ok(encoded)
    }

    /// Wrap `inner` in a frame, FEC-encoding it first when a codec is given.
    pub fn build(kind: FrameKind, inner: &[u8], fec: Option<&mut FecCodec>) -> Result<Vec<u8>> {
        let frame = match fec {
            Some(codec) => Frame {
                kind,
                fec: true,
                body: codec.encode(inner)?,
            },
            None => Frame {
                kind,
                fec: false,
                body: inner.to_vec(),
            },
        };
        Self::encode(&frame)
    }

    /// Largest `inner` that fits one frame.
    pub fn max_inner(fec: bool) -> usize {
        if fec {
            RS_DATA_BYTES
        } else {
            MAX_FRAME_BODY
        }
    }
}

#[derive(Debug)]
enum DeframeState {
    /// Matching the sync word; holds the number of sync bytes matched
    Hunting(usize),
    Header(Vec<u8>),
    Body { kind: FrameKind, fec: bool, len: usize, body: Vec<u8> },
}

/// Streaming deframer fed with demodulated bytes
///
/// Scans for the sync word, validates the header CRC, then collects the body.
/// Preamble and inter-frame noise are skipped while hunting.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DeframeState,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DeframeState::Hunting(0),
        }
    }

    /// Feed one byte. Yields a complete frame, a header error, or nothing yet.
    pub fn push(&mut self, byte: u8) -> Option<Result<Frame>> {
        match &mut self.state {
            DeframeState::Hunting(matched) => {
                if byte == SYNC_WORD[*matched] {
                    *matched += 1;
                    if *matched == SYNC_WORD.len() {
                        self.state = DeframeState::Header(Vec::with_capacity(3));
                    }
                } else {
                    *matched = usize::from(byte == SYNC_WORD[0]);
                }
                None
            }
            DeframeState::Header(header) => {
                header.push(byte);
                if header.len() < 3 {
                    return None;
                }
                let (kind_raw, len, crc) = (header[0], header[1], header[2]);
                self.state = DeframeState::Hunting(0);

                if crc8(&[kind_raw, len]) != crc {
                    return Some(Err(TunnelError::Frame("header CRC mismatch".into())));
                }
                let kind = match FrameKind::from_u8(kind_raw & !FEC_FLAG) {
                    Some(kind) => kind,
                    None => {
                        return Some(Err(TunnelError::Frame(format!(
                            "unknown frame kind {:#04x}",
                            kind_raw
                        ))))
                    }
                };
                let fec = kind_raw & FEC_FLAG != 0;
                let len = len as usize;
                if len == 0 {
                    return Some(Ok(Frame { kind, fec, body: Vec::new() }));
                }
                self.state = DeframeState::Body {
                    kind,
                    fec,
                    len,
                    body: Vec::with_capacity(len),
                };
                None
            }
            DeframeState::Body { kind, fec, len, body } => {
                body.push(byte);
                if body.len() < *len {
                    return None;
                }
                let frame = Frame {
                    kind: *kind,
                    fec: *fec,
                    body: std::mem::take(body),
                };
                self.state = DeframeState::Hunting(0);
                Some(Ok(frame))
            }
        }
    }

    /// True while a header or body is partially received.
    pub fn in_frame(&self) -> bool {
        !matches!(self.state, DeframeState::Hunting(_))
    }

    /// Abandon any partial frame. Returns true when one was dropped.
    pub fn reset(&mut self) -> bool {
        let dropped = self.in_frame();
        self.state = DeframeState::Hunting(0);
        dropped
    }
}

/// Recover the inner bytes of a frame, running FEC when the frame carries it.
///
/// Returns the inner bytes and the number of corrected bytes.
pub fn open_frame(frame: &mut Frame, fec: &mut FecCodec) -> Result<(Vec<u8>, usize)> {
    if !frame.fec {
        return Ok((frame.body.clone(), 0));
    }
    let corrected = fec.decode(&mut frame.body)?;
    let data_len = FecCodec::data_len(frame.body.len());
    Ok((frame.body[..data_len].to_vec(), corrected))
}
