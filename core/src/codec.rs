use crate::error::{Result, TunnelError};
use crate::MAX_PAYLOAD_SIZE;

/// Voice compression boundary
///
/// The engine hands each codec frame of microphone PCM to `encode` and the
/// resulting bytes travel as one sealed voice frame. `decode` must accept
/// anything `encode` produced.
pub trait VoiceCodec: Send {
    /// PCM samples per encoded frame; encoded output must fit one sealed frame.
    fn frame_samples(&self) -> usize;

    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>>;

    fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>>;

    /// Forwarded from the `codecMode` configuration key.
    fn set_mode(&mut self, mode: u8) -> Result<()>;
}

/// Uncompressed PCM
///
/// Mode 0 sends 16-bit little-endian samples, mode 1 sends the high byte of
/// each sample (8-bit PCM, twice the samples per frame).
#[derive(Debug, Default, Clone)]
pub struct RawPcmCodec {
    mode: u8,
}

impl RawPcmCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn bytes_per_sample(&self) -> usize {
        if self.mode == 1 {
            1
        } else {
            2
        }
    }
}

impl VoiceCodec for RawPcmCodec {
    fn frame_samples(&self) -> usize {
        // Largest even byte count that fits one frame
        (MAX_PAYLOAD_SIZE & !1) / self.bytes_per_sample()
    }

    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
        if pcm.len() > self.frame_samples() {
            return Err(TunnelError::Codec(format!(
                "frame of {} samples exceeds {}",
                pcm.len(),
                self.frame_samples()
            )));
        }
        let payload = match self.mode {
            1 => pcm.iter().map(|&s| (s >> 8) as u8).collect(),
            _ => pcm.iter().flat_map(|s| s.to_le_bytes()).collect(),
        };
        Ok(payload)
    }

    fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>> {
        match self.mode {
            1 => Ok(payload.iter().map(|&b| ((b as i8) as i16) << 8).collect()),
            _ => {
                if payload.len() % 2 != 0 {
                    return Err(TunnelError::Codec(format!(
                        "odd payload length {} for 16-bit PCM",
                        payload.len()
                    )));
                }
                Ok(payload
                    .chunks_exact(2)
                    .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
                    .collect())
            }
        }
    }

    fn set_mode(&mut self, mode: u8) -> Result<()> {
        if mode > 1 {
            return Err(TunnelError::Codec(format!("unsupported codec mode {}", mode)));
        }
        self.mode = mode;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_fits_payload() {
        let mut codec = RawPcmCodec::new();
        assert_eq!(codec.frame_samples(), 99);
        let pcm = vec![-1234i16; codec.frame_samples()];
        assert!(codec.encode(&pcm).unwrap().len() <= MAX_PAYLOAD_SIZE);

        codec.set_mode(1).unwrap();
        assert_eq!(codec.frame_samples(), 198);
        let pcm = vec![500i16; codec.frame_samples()];
        assert!(codec.encode(&pcm).unwrap().len() <= MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn test_pcm16_is_lossless() {
        let mut codec = RawPcmCodec::new();
        let pcm: Vec<i16> = (0..99).map(|i| (i * 331 - 16000) as i16).collect();
        let payload = codec.encode(&pcm).unwrap();
        assert_eq!(codec.decode(&payload).unwrap(), pcm);
    }

    #[test]
    fn test_pcm8_keeps_high_byte() {
        let mut codec = RawPcmCodec::new();
        codec.set_mode(1).unwrap();
        let payload = codec.encode(&[0x1234, -0x1234, 0]).unwrap();
        assert_eq!(codec.decode(&payload).unwrap(), vec![0x1200, -0x1300, 0]);
    }

    #[test]
    fn test_rejects_bad_input() {
        let mut codec = RawPcmCodec::new();
        assert!(codec.encode(&vec![0i16; 100]).is_err());
        assert!(matches!(codec.decode(&[1, 2, 3]), Err(TunnelError::Codec(_))));
        assert!(codec.set_mode(7).is_err());
        assert_eq!(codec.frame_samples(), 99);
    }
}
