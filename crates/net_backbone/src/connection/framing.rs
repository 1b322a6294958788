//! Transmission units and logical packets.
//!
//! On the wire every unit is a little-endian `u32` length followed by that
//! many bytes. After the handshake a unit body is Blowfish ciphertext whose
//! plaintext is:
//!
//! ```text
//! u32 logical_length | logical packets ... | zero padding to 8 bytes
//! ```
//!
//! and each logical packet is `u16 size | u16 code | size - 2 bytes of body`.

use crate::crypto::{padded_len, SessionCipher};
use crate::error::{ConnectionError, ProtocolError};
use crate::packet::ReadOnlyPacket;
use byteorder::{ByteOrder, LittleEndian};

const LENGTH_PREFIX: usize = 4;
const LOGICAL_HEADER: usize = 2;

/// Largest transmission unit accepted by default.
pub const DEFAULT_MAX_UNIT_SIZE: usize = 1024 * 1024;

/// Reassembles transmission units from arbitrarily split reads.
pub(crate) struct FrameDecoder {
    buffer: Vec<u8>,
    max_unit_size: usize,
}

impl FrameDecoder {
    pub(crate) fn new(max_unit_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_unit_size,
        }
    }

    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pops the next complete unit body, if one has fully arrived.
    ///
    /// A length of zero or above the limit is rejected as soon as the prefix
    /// is readable, without waiting for the body.
    pub(crate) fn next_unit(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        if self.buffer.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let length = LittleEndian::read_u32(&self.buffer[..LENGTH_PREFIX]) as usize;
        if length == 0 || length > self.max_unit_size {
            return Err(ProtocolError::UnitSize {
                length,
                max: self.max_unit_size,
            });
        }

        let end = LENGTH_PREFIX + length;
        if self.buffer.len() < end {
            return Ok(None);
        }

        let unit = self.buffer[LENGTH_PREFIX..end].to_vec();
        self.buffer.drain(..end);
        Ok(Some(unit))
    }

    /// Called when the stream ends; any partially received unit is an error.
    pub(crate) fn finish(&self) -> Result<(), ProtocolError> {
        match self.buffer.len() {
            0 => Ok(()),
            n if n < LENGTH_PREFIX => Err(ProtocolError::Truncated {
                declared: LENGTH_PREFIX,
                available: n,
            }),
            n => Err(ProtocolError::Truncated {
                declared: LittleEndian::read_u32(&self.buffer[..LENGTH_PREFIX]) as usize,
                available: n - LENGTH_PREFIX,
            }),
        }
    }
}

/// Prefixes `body` with its length.
pub(crate) fn encode_unit(body: &[u8]) -> Vec<u8> {
    let mut unit = vec![0u8; LENGTH_PREFIX];
    LittleEndian::write_u32(&mut unit, body.len() as u32);
    unit.extend_from_slice(body);
    unit
}

/// Appends one packet (code plus body) to a logical packet stream.
pub(crate) fn append_logical(out: &mut Vec<u8>, packet: &[u8]) -> Result<(), ConnectionError> {
    if packet.len() < LOGICAL_HEADER {
        return Err(ConnectionError::MissingCode);
    }
    let size = u16::try_from(packet.len()).map_err(|_| ConnectionError::PacketTooLarge(packet.len()))?;

    let mut header = [0u8; LOGICAL_HEADER];
    LittleEndian::write_u16(&mut header, size);
    out.extend_from_slice(&header);
    out.extend_from_slice(packet);
    Ok(())
}

/// Encrypts a logical packet stream into a complete transmission unit.
pub(crate) fn seal(cipher: &SessionCipher, logical: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let plain_len = LENGTH_PREFIX + logical.len();
    let mut body = vec![0u8; padded_len(plain_len)];
    LittleEndian::write_u32(&mut body[..LENGTH_PREFIX], logical.len() as u32);
    body[LENGTH_PREFIX..plain_len].copy_from_slice(logical);

    cipher.encrypt(&mut body)?;
    Ok(encode_unit(&body))
}

/// Decrypts one unit body and splits it into `(code, body)` packets.
pub(crate) fn open(
    cipher: &SessionCipher,
    mut body: Vec<u8>,
) -> Result<Vec<(u16, ReadOnlyPacket)>, ProtocolError> {
    cipher.decrypt(&mut body)?;

    let logical_len = LittleEndian::read_u32(&body[..LENGTH_PREFIX]) as usize;
    let available = body.len() - LENGTH_PREFIX;
    if logical_len > available {
        return Err(ProtocolError::Truncated {
            declared: logical_len,
            available,
        });
    }

    split_logical(&body[LENGTH_PREFIX..LENGTH_PREFIX + logical_len])
}

/// Splits a logical packet stream. Every declared size must fit exactly.
pub(crate) fn split_logical(mut bytes: &[u8]) -> Result<Vec<(u16, ReadOnlyPacket)>, ProtocolError> {
    let mut packets = Vec::new();

    while !bytes.is_empty() {
        if bytes.len() < LOGICAL_HEADER {
            return Err(ProtocolError::Truncated {
                declared: LOGICAL_HEADER,
                available: bytes.len(),
            });
        }

        let size = LittleEndian::read_u16(bytes) as usize;
        let rest = &bytes[LOGICAL_HEADER..];
        if size < 2 {
            return Err(ProtocolError::MalformedPacket(format!(
                "logical packet of {size} byte(s) has no packet code"
            )));
        }
        if size > rest.len() {
            return Err(ProtocolError::Truncated {
                declared: size,
                available: rest.len(),
            });
        }

        let code = LittleEndian::read_u16(rest);
        packets.push((code, ReadOnlyPacket::new(rest[2..size].to_vec())));
        bytes = &rest[size..];
    }

    Ok(packets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketRead;

    fn cipher() -> SessionCipher {
        SessionCipher::new(b"unit-key").unwrap()
    }

    #[test]
    fn decoder_waits_for_whole_units() {
        let unit = encode_unit(b"hello");
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_UNIT_SIZE);

        decoder.extend(&unit[..3]);
        assert_eq!(decoder.next_unit().unwrap(), None);
        decoder.extend(&unit[3..7]);
        assert_eq!(decoder.next_unit().unwrap(), None);
        decoder.extend(&unit[7..]);
        decoder.extend(&encode_unit(b"next"));

        assert_eq!(decoder.next_unit().unwrap().as_deref(), Some(&b"hello"[..]));
        assert_eq!(decoder.next_unit().unwrap().as_deref(), Some(&b"next"[..]));
        assert_eq!(decoder.next_unit().unwrap(), None);
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn truncated_stream_is_an_error_at_end_of_input() {
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_UNIT_SIZE);
        let mut prefix = [0u8; 4];
        LittleEndian::write_u32(&mut prefix, 100);
        decoder.extend(&prefix);
        decoder.extend(&[1, 2, 3]);

        assert_eq!(decoder.next_unit().unwrap(), None);
        assert_eq!(
            decoder.finish(),
            Err(ProtocolError::Truncated {
                declared: 100,
                available: 3
            })
        );
    }

    #[test]
    fn oversize_and_empty_units_fail_immediately() {
        let mut decoder = FrameDecoder::new(64);
        decoder.extend(&encode_unit(&[0u8; 65]));
        assert!(matches!(decoder.next_unit(), Err(ProtocolError::UnitSize { length: 65, .. })));

        let mut decoder = FrameDecoder::new(64);
        decoder.extend(&[0, 0, 0, 0]);
        assert!(matches!(decoder.next_unit(), Err(ProtocolError::UnitSize { length: 0, .. })));
    }

    #[test]
    fn sealed_units_open_into_the_same_packets() {
        let mut logical = Vec::new();
        append_logical(&mut logical, &[0x01, 0x00, b'h', b'i']).unwrap();
        append_logical(&mut logical, &[0x02, 0x00]).unwrap();

        let unit = seal(&cipher(), &logical).unwrap();
        let length = LittleEndian::read_u32(&unit) as usize;
        assert_eq!(length % 8, 0);
        assert_eq!(unit.len(), 4 + length);

        let mut packets = open(&cipher(), unit[4..].to_vec()).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].0, 0x0001);
        assert_eq!(packets[0].1.read_array(2).unwrap(), b"hi");
        assert_eq!(packets[1].0, 0x0002);
        assert_eq!(packets[1].1.left(), 0);
    }

    #[test]
    fn logical_length_beyond_the_unit_is_rejected() {
        let mut body = vec![0u8; 16];
        LittleEndian::write_u32(&mut body, 13);
        cipher().encrypt(&mut body).unwrap();

        assert!(matches!(
            open(&cipher(), body),
            Err(ProtocolError::Truncated {
                declared: 13,
                available: 12
            })
        ));
    }

    #[test]
    fn unaligned_ciphertext_is_rejected() {
        assert!(matches!(
            open(&cipher(), vec![0u8; 12]),
            Err(ProtocolError::BadPadding(12))
        ));
    }

    #[test]
    fn logical_sizes_must_fit() {
        assert!(matches!(
            split_logical(&[10, 0, 1, 0, 0]),
            Err(ProtocolError::Truncated { declared: 10, .. })
        ));
        assert!(matches!(split_logical(&[1, 0, 9]), Err(ProtocolError::MalformedPacket(_))));
        assert!(matches!(split_logical(&[4]), Err(ProtocolError::Truncated { .. })));
        assert!(split_logical(&[]).unwrap().is_empty());
    }

    #[test]
    fn oversize_logical_packets_are_refused() {
        let mut out = Vec::new();
        let big = vec![0u8; u16::MAX as usize + 1];
        assert_eq!(
            append_logical(&mut out, &big),
            Err(ConnectionError::PacketTooLarge(u16::MAX as usize + 1))
        );
        assert!(out.is_empty());
    }
}
