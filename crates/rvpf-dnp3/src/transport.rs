use rvpf_core::ProtocolError;

/// Largest payload of one transport segment (frame payload minus the
/// transport header byte).
pub const MAX_SEGMENT_PAYLOAD: usize = 249;

const FIR_BIT: u8 = 0x80;
const FIN_BIT: u8 = 0x40;
const SEQ_MASK: u8 = 0x3F;

pub fn segment_header(fir: bool, fin: bool, seq: u8) -> u8 {
    (u8::from(fir) << 7) | (u8::from(fin) << 6) | (seq & SEQ_MASK)
}

pub fn next_transport_seq(seq: u8) -> u8 {
    (seq + 1) & SEQ_MASK
}

/// Splits outbound fragments into transport segments, advancing the
/// per-association 6-bit sequence counter.
#[derive(Debug, Default)]
pub struct Segmenter {
    seq: u8,
}

impl Segmenter {
    pub fn new() -> Self {
        Segmenter { seq: 0 }
    }

    pub fn split(&mut self, fragment: &[u8]) -> Vec<Vec<u8>> {
        let chunks: Vec<&[u8]> = if fragment.is_empty() {
            vec![&[]]
        } else {
            fragment.chunks(MAX_SEGMENT_PAYLOAD).collect()
        };
        let last = chunks.len() - 1;
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let mut segment = Vec::with_capacity(chunk.len() + 1);
                segment.push(segment_header(i == 0, i == last, self.seq));
                segment.extend_from_slice(chunk);
                self.seq = next_transport_seq(self.seq);
                segment
            })
            .collect()
    }
}

/// Rebuilds application fragments from inbound transport segments.
///
/// A FIR segment resets the buffer; sequence numbers must be contiguous
/// modulo 64; FIN completes the fragment. Gap, duplicate, or overflow
/// aborts the fragment under assembly and reports `TransportDesync`.
#[derive(Debug)]
pub struct Reassembler {
    buffer: Vec<u8>,
    expected_seq: Option<u8>,
    max_fragment_size: usize,
}

impl Reassembler {
    pub fn new(max_fragment_size: usize) -> Self {
        Reassembler {
            buffer: Vec::new(),
            expected_seq: None,
            max_fragment_size,
        }
    }

    pub fn push(&mut self, segment: &[u8]) -> Result<Option<Vec<u8>>, ProtocolError> {
        if segment.is_empty() {
            return Err(ProtocolError::TransportDesync);
        }
        let header = segment[0];
        let fir = header & FIR_BIT != 0;
        let fin = header & FIN_BIT != 0;
        let seq = header & SEQ_MASK;

        if fir {
            self.buffer.clear();
        } else {
            match self.expected_seq {
                Some(expected) if expected == seq => {}
                _ => {
                    self.abort();
                    return Err(ProtocolError::TransportDesync);
                }
            }
        }

        self.buffer.extend_from_slice(&segment[1..]);
        if self.buffer.len() > self.max_fragment_size {
            self.abort();
            return Err(ProtocolError::TransportDesync);
        }

        if fin {
            self.expected_seq = None;
            return Ok(Some(std::mem::take(&mut self.buffer)));
        }
        self.expected_seq = Some(next_transport_seq(seq));
        Ok(None)
    }

    fn abort(&mut self) {
        self.buffer.clear();
        self.expected_seq = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_segment_round_trip() {
        let mut segmenter = Segmenter::new();
        let mut reassembler = Reassembler::new(2048);
        let fragment = vec![0xC0, 0x01, 0x3C, 0x01, 0x06];

        let segments = segmenter.split(&fragment);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0][0], segment_header(true, true, 0));
        assert_eq!(reassembler.push(&segments[0]).unwrap(), Some(fragment));
    }

    #[test]
    fn multi_segment_round_trip() {
        let mut segmenter = Segmenter::new();
        let mut reassembler = Reassembler::new(2048);
        let fragment: Vec<u8> = (0..600).map(|i| i as u8).collect();

        let segments = segmenter.split(&fragment);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0][0] & FIR_BIT, FIR_BIT);
        assert_eq!(segments[2][0] & FIN_BIT, FIN_BIT);

        assert!(reassembler.push(&segments[0]).unwrap().is_none());
        assert!(reassembler.push(&segments[1]).unwrap().is_none());
        assert_eq!(reassembler.push(&segments[2]).unwrap(), Some(fragment));
    }

    #[test]
    fn sequence_wraps_at_sixty_three() {
        let mut segmenter = Segmenter { seq: 63 };
        let fragment: Vec<u8> = (0..500).map(|i| i as u8).collect();
        let segments = segmenter.split(&fragment);
        assert_eq!(segments[0][0] & SEQ_MASK, 63);
        assert_eq!(segments[1][0] & SEQ_MASK, 0);

        let mut reassembler = Reassembler::new(2048);
        assert!(reassembler.push(&segments[0]).unwrap().is_none());
        assert_eq!(reassembler.push(&segments[1]).unwrap(), Some(fragment));
    }

    #[test]
    fn gap_aborts_assembly() {
        let mut segmenter = Segmenter::new();
        let fragment: Vec<u8> = vec![0xAA; 600];
        let segments = segmenter.split(&fragment);

        let mut reassembler = Reassembler::new(2048);
        assert!(reassembler.push(&segments[0]).unwrap().is_none());
        assert_eq!(
            reassembler.push(&segments[2]).unwrap_err(),
            ProtocolError::TransportDesync
        );
        // A fresh FIR recovers the stream.
        let recovered = segmenter.split(&[1, 2, 3]);
        assert_eq!(reassembler.push(&recovered[0]).unwrap(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn duplicate_aborts_assembly() {
        let mut segmenter = Segmenter::new();
        let segments = segmenter.split(&vec![0x55; 600]);

        let mut reassembler = Reassembler::new(2048);
        assert!(reassembler.push(&segments[0]).unwrap().is_none());
        assert!(reassembler.push(&segments[1]).unwrap().is_none());
        assert!(reassembler.push(&segments[1]).is_err());
    }

    #[test]
    fn oversized_fragment_aborts_assembly() {
        let mut segmenter = Segmenter::new();
        let segments = segmenter.split(&vec![0x11; 600]);

        let mut reassembler = Reassembler::new(256);
        assert!(reassembler.push(&segments[0]).unwrap().is_none());
        assert!(reassembler.push(&segments[1]).is_err());
    }

    #[test]
    fn non_fir_without_start_is_desync() {
        let mut reassembler = Reassembler::new(2048);
        let segment = [segment_header(false, true, 5), 0x01];
        assert!(reassembler.push(&segment).is_err());
    }
}
