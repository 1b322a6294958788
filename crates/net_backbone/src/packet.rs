//! Binary packet codec.
//!
//! A [`Packet`] is a growable byte buffer with a write cursor and an
//! independent read cursor, so one buffer can be written once and read many
//! times. [`ReadOnlyPacket`] is the immutable, cheaply clonable view handed to
//! packet handlers; every clone carries its own read cursor.
//!
//! All reading goes through the [`PacketRead`] trait. Reads never touch bytes
//! past the written length: a read that does not fit returns
//! [`PacketError::Underflow`] and leaves the cursor where it was.

use crate::error::PacketError;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// Upper bound on the number of bytes a single [`Packet`] may hold.
pub const MAX_PACKET_SIZE: usize = 128 * 1024;

/// Text encodings available to the length-prefixed string codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    /// Japanese code page used by the game client (Shift_JIS superset).
    Cp932,
    /// Western code page.
    Cp1252,
}

impl Encoding {
    /// Display name used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            Encoding::Utf8 => "UTF-8",
            Encoding::Cp932 => "CP932",
            Encoding::Cp1252 => "CP1252",
        }
    }

    fn codec(self) -> &'static encoding_rs::Encoding {
        match self {
            Encoding::Utf8 => encoding_rs::UTF_8,
            Encoding::Cp932 => encoding_rs::SHIFT_JIS,
            Encoding::Cp1252 => encoding_rs::WINDOWS_1252,
        }
    }

    /// Encodes `text`, failing if any character has no mapping.
    pub fn encode(self, text: &str) -> Result<Cow<'_, [u8]>, PacketError> {
        if self == Encoding::Utf8 {
            return Ok(Cow::Borrowed(text.as_bytes()));
        }

        let (bytes, _, had_errors) = self.codec().encode(text);
        if had_errors {
            return Err(PacketError::Encoding(self.name()));
        }
        Ok(bytes)
    }

    /// Decodes `bytes`, failing on malformed input.
    pub fn decode(self, bytes: &[u8]) -> Result<String, PacketError> {
        let (text, had_errors) = self.codec().decode_without_bom_handling(bytes);
        if had_errors {
            return Err(PacketError::Encoding(self.name()));
        }
        Ok(text.into_owned())
    }
}

macro_rules! typed_reads {
    ($($read:ident, $peek:ident => $ty:ty, $len:expr, $conv:expr;)*) => {
        $(
            fn $read(&mut self) -> Result<$ty, PacketError> {
                let bytes = self.take($len)?;
                Ok($conv(bytes))
            }

            fn $peek(&self) -> Result<$ty, PacketError> {
                let bytes = self.peek_bytes($len)?;
                Ok($conv(bytes))
            }
        )*
    };
}

/// Cursor-based reading shared by [`Packet`] and [`ReadOnlyPacket`].
pub trait PacketRead {
    /// All written bytes of the packet.
    fn bytes(&self) -> &[u8];

    /// Current read cursor.
    fn read_position(&self) -> usize;

    #[doc(hidden)]
    fn set_read_position(&mut self, position: usize);

    /// Number of written bytes.
    fn size(&self) -> usize {
        self.bytes().len()
    }

    /// Number of bytes not yet read.
    fn left(&self) -> usize {
        self.size().saturating_sub(self.read_position())
    }

    /// Moves the read cursor to an absolute position within the written bytes.
    fn seek_read(&mut self, position: usize) -> Result<(), PacketError> {
        if position > self.size() {
            return Err(PacketError::Seek {
                position,
                size: self.size(),
            });
        }
        self.set_read_position(position);
        Ok(())
    }

    /// Moves the read cursor back to the first byte.
    fn rewind(&mut self) {
        self.set_read_position(0);
    }

    fn skip(&mut self, count: usize) -> Result<(), PacketError> {
        self.take(count).map(|_| ())
    }

    /// Returns the next `count` bytes without advancing.
    fn peek_bytes(&self, count: usize) -> Result<&[u8], PacketError> {
        let left = self.left();
        if count > left {
            return Err(PacketError::Underflow {
                needed: count,
                left,
            });
        }
        let start = self.read_position();
        Ok(&self.bytes()[start..start + count])
    }

    /// Returns the next `count` bytes and advances past them.
    fn take(&mut self, count: usize) -> Result<&[u8], PacketError> {
        let start = self.read_position();
        self.peek_bytes(count)?;
        self.set_read_position(start + count);
        Ok(&self.bytes()[start..start + count])
    }

    fn read_array(&mut self, count: usize) -> Result<Vec<u8>, PacketError> {
        self.take(count).map(<[u8]>::to_vec)
    }

    typed_reads! {
        read_u8, peek_u8 => u8, 1, |b: &[u8]| b[0];
        read_i8, peek_i8 => i8, 1, |b: &[u8]| b[0] as i8;
        read_u16_le, peek_u16_le => u16, 2, LittleEndian::read_u16;
        read_u16_be, peek_u16_be => u16, 2, BigEndian::read_u16;
        read_i16_le, peek_i16_le => i16, 2, LittleEndian::read_i16;
        read_u32_le, peek_u32_le => u32, 4, LittleEndian::read_u32;
        read_u32_be, peek_u32_be => u32, 4, BigEndian::read_u32;
        read_i32_le, peek_i32_le => i32, 4, LittleEndian::read_i32;
        read_u64_le, peek_u64_le => u64, 8, LittleEndian::read_u64;
        read_i64_le, peek_i64_le => i64, 8, LittleEndian::read_i64;
        read_f32_le, peek_f32_le => f32, 4, LittleEndian::read_f32;
    }

    /// Reads a string prefixed with a 16-bit little-endian byte count.
    ///
    /// The text ends at the first null byte, if the count includes one. On
    /// any failure the read cursor is left unchanged.
    fn read_string16(&mut self, encoding: Encoding) -> Result<String, PacketError> {
        let start = self.read_position();
        let result = (|| {
            let count = self.read_u16_le()? as usize;
            let raw = self.take(count)?;
            let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            encoding.decode(&raw[..end])
        })();

        if result.is_err() {
            self.set_read_position(start);
        }
        result
    }
}

/// A mutable packet being built for sending.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    data: Vec<u8>,
    write_pos: usize,
    read_pos: usize,
    capacity: usize,
}

impl Packet {
    /// Creates an empty packet bounded by [`MAX_PACKET_SIZE`].
    pub fn new() -> Self {
        Self::with_capacity(MAX_PACKET_SIZE)
    }

    /// Creates an empty packet that refuses to grow past `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::new(),
            write_pos: 0,
            read_pos: 0,
            capacity: capacity.min(MAX_PACKET_SIZE),
        }
    }

    /// Starts a packet with its 16-bit packet code already written.
    pub fn with_code(code: u16) -> Self {
        let mut packet = Self::new();
        // Two bytes always fit an empty packet.
        let _ = packet.write_packet_code(code);
        packet
    }

    /// Most bytes this packet will accept.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Offset the next write lands at.
    pub fn write_position(&self) -> usize {
        self.write_pos
    }

    /// Moves the write cursor, e.g. to back-patch a length field.
    pub fn seek_write(&mut self, position: usize) -> Result<(), PacketError> {
        if position > self.data.len() {
            return Err(PacketError::Seek {
                position,
                size: self.data.len(),
            });
        }
        self.write_pos = position;
        Ok(())
    }

    /// Moves the write cursor to the end of the written bytes.
    pub fn end(&mut self) {
        self.write_pos = self.data.len();
    }

    /// Drops every byte and resets both cursors, keeping the capacity.
    pub fn clear(&mut self) {
        self.data.clear();
        self.write_pos = 0;
        self.read_pos = 0;
    }

    /// The written bytes, code included.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Converts the packet into a shared read-only view, read cursor at the start.
    pub fn freeze(self) -> ReadOnlyPacket {
        ReadOnlyPacket::new(self.data)
    }

    pub fn write_array(&mut self, bytes: &[u8]) -> Result<(), PacketError> {
        let end = self.write_pos + bytes.len();
        if end > self.capacity {
            return Err(PacketError::Overflow {
                needed: bytes.len(),
                offset: self.write_pos,
                capacity: self.capacity,
            });
        }
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[self.write_pos..end].copy_from_slice(bytes);
        self.write_pos = end;
        Ok(())
    }

    /// Writes `count` zero bytes.
    /// Appends `count` zero bytes, typically a field to back-patch later.
    pub fn write_blank(&mut self, count: usize) -> Result<(), PacketError> {
        self.write_array(&vec![0u8; count])
    }

    /// Writes the 16-bit little-endian packet code.
    pub fn write_packet_code(&mut self, code: u16) -> Result<(), PacketError> {
        self.write_u16_le(code)
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), PacketError> {
        self.write_array(&[value])
    }

    pub fn write_i8(&mut self, value: i8) -> Result<(), PacketError> {
        self.write_array(&[value as u8])
    }

    pub fn write_u16_le(&mut self, value: u16) -> Result<(), PacketError> {
        let mut buf = [0u8; 2];
        LittleEndian::write_u16(&mut buf, value);
        self.write_array(&buf)
    }

    pub fn write_u16_be(&mut self, value: u16) -> Result<(), PacketError> {
        let mut buf = [0u8; 2];
        BigEndian::write_u16(&mut buf, value);
        self.write_array(&buf)
    }

    pub fn write_i16_le(&mut self, value: i16) -> Result<(), PacketError> {
        let mut buf = [0u8; 2];
        LittleEndian::write_i16(&mut buf, value);
        self.write_array(&buf)
    }

    pub fn write_u32_le(&mut self, value: u32) -> Result<(), PacketError> {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.write_array(&buf)
    }

    pub fn write_u32_be(&mut self, value: u32) -> Result<(), PacketError> {
        let mut buf = [0u8; 4];
        BigEndian::write_u32(&mut buf, value);
        self.write_array(&buf)
    }

    pub fn write_i32_le(&mut self, value: i32) -> Result<(), PacketError> {
        let mut buf = [0u8; 4];
        LittleEndian::write_i32(&mut buf, value);
        self.write_array(&buf)
    }

    pub fn write_u64_le(&mut self, value: u64) -> Result<(), PacketError> {
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, value);
        self.write_array(&buf)
    }

    pub fn write_i64_le(&mut self, value: i64) -> Result<(), PacketError> {
        let mut buf = [0u8; 8];
        LittleEndian::write_i64(&mut buf, value);
        self.write_array(&buf)
    }

    pub fn write_f32_le(&mut self, value: f32) -> Result<(), PacketError> {
        let mut buf = [0u8; 4];
        LittleEndian::write_f32(&mut buf, value);
        self.write_array(&buf)
    }

    /// Writes a string with a 16-bit little-endian byte count.
    ///
    /// # Arguments
    ///
    /// * `encoding` - Code page the text is converted to
    /// * `text` - The string to write
    /// * `null_terminate` - Appends a zero byte, included in the count
    ///
    /// # Returns
    ///
    /// `Ok(())`, or an error if the text has no mapping in `encoding`, is
    /// longer than a `u16` count allows, or would overflow the packet. Nothing
    /// is written on error.
    pub fn write_string16(
        &mut self,
        encoding: Encoding,
        text: &str,
        null_terminate: bool,
    ) -> Result<(), PacketError> {
        let encoded = encoding.encode(text)?;
        let count = encoded.len() + usize::from(null_terminate);
        let count = u16::try_from(count).map_err(|_| PacketError::StringTooLong(count))?;

        let needed = 2 + count as usize;
        if self.write_pos + needed > self.capacity {
            return Err(PacketError::Overflow {
                needed,
                offset: self.write_pos,
                capacity: self.capacity,
            });
        }

        self.write_u16_le(count)?;
        self.write_array(&encoded)?;
        if null_terminate {
            self.write_u8(0)?;
        }
        Ok(())
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("size", &self.data.len())
            .field("write_pos", &self.write_pos)
            .field("read_pos", &self.read_pos)
            .finish()
    }
}

impl PacketRead for Packet {
    fn bytes(&self) -> &[u8] {
        &self.data
    }

    fn read_position(&self) -> usize {
        self.read_pos
    }

    fn set_read_position(&mut self, position: usize) {
        self.read_pos = position;
    }
}

/// Immutable packet view. Clones share the bytes but not the read cursor.
#[derive(Clone)]
pub struct ReadOnlyPacket {
    data: Arc<[u8]>,
    read_pos: usize,
}

impl ReadOnlyPacket {
    /// Wraps `data` with the read cursor at the start.
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            data: data.into(),
            read_pos: 0,
        }
    }
}

impl From<Packet> for ReadOnlyPacket {
    fn from(packet: Packet) -> Self {
        packet.freeze()
    }
}

impl fmt::Debug for ReadOnlyPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadOnlyPacket")
            .field("size", &self.data.len())
            .field("read_pos", &self.read_pos)
            .finish()
    }
}

impl PacketRead for ReadOnlyPacket {
    fn bytes(&self) -> &[u8] {
        &self.data
    }

    fn read_position(&self) -> usize {
        self.read_pos
    }

    fn set_read_position(&mut self, position: usize) {
        self.read_pos = position;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_keep_their_values_at_the_boundaries() {
        let mut p = Packet::new();
        p.write_u8(0).unwrap();
        p.write_u8(u8::MAX).unwrap();
        p.write_i8(i8::MIN).unwrap();
        p.write_u16_le(u16::MAX).unwrap();
        p.write_u16_be(0x1234).unwrap();
        p.write_i16_le(i16::MIN).unwrap();
        p.write_u32_le(u32::MAX).unwrap();
        p.write_u32_be(0xDEADBEEF).unwrap();
        p.write_i32_le(-1).unwrap();
        p.write_u64_le(u64::MAX).unwrap();
        p.write_i64_le(i64::MIN).unwrap();
        p.write_f32_le(1.5).unwrap();

        let mut r = p.freeze();
        assert_eq!(r.read_u8().unwrap(), 0);
        assert_eq!(r.read_u8().unwrap(), u8::MAX);
        assert_eq!(r.read_i8().unwrap(), i8::MIN);
        assert_eq!(r.read_u16_le().unwrap(), u16::MAX);
        assert_eq!(r.read_u16_be().unwrap(), 0x1234);
        assert_eq!(r.read_i16_le().unwrap(), i16::MIN);
        assert_eq!(r.read_u32_le().unwrap(), u32::MAX);
        assert_eq!(r.read_u32_be().unwrap(), 0xDEADBEEF);
        assert_eq!(r.read_i32_le().unwrap(), -1);
        assert_eq!(r.read_u64_le().unwrap(), u64::MAX);
        assert_eq!(r.read_i64_le().unwrap(), i64::MIN);
        assert_eq!(r.read_f32_le().unwrap(), 1.5);
        assert_eq!(r.left(), 0);
    }

    #[test]
    fn byte_order_is_explicit() {
        let mut p = Packet::new();
        p.write_u16_le(0x0102).unwrap();
        p.write_u16_be(0x0102).unwrap();
        assert_eq!(p.as_slice(), &[0x02, 0x01, 0x01, 0x02]);
    }

    #[test]
    fn underflow_leaves_cursor_untouched() {
        let mut p = Packet::new();
        p.write_u16_le(7).unwrap();

        assert_eq!(p.read_u32_le(), Err(PacketError::Underflow { needed: 4, left: 2 }));
        assert_eq!(p.read_position(), 0);
        assert_eq!(p.read_u16_le().unwrap(), 7);
        assert!(p.read_u8().is_err());
    }

    #[test]
    fn peek_does_not_advance() {
        let mut p = Packet::with_code(0x1001);
        p.write_u32_le(42).unwrap();

        assert_eq!(p.peek_u16_le().unwrap(), 0x1001);
        assert_eq!(p.left(), 6);
        assert_eq!(p.read_u16_le().unwrap(), 0x1001);
        assert_eq!(p.peek_u32_le().unwrap(), 42);
        assert_eq!(p.left(), 4);
    }

    #[test]
    fn strings_round_trip_including_empty_and_max_length() {
        let longest = "a".repeat(u16::MAX as usize);

        let mut p = Packet::new();
        p.write_string16(Encoding::Utf8, "", false).unwrap();
        p.write_string16(Encoding::Utf8, "alice", true).unwrap();
        p.write_string16(Encoding::Utf8, &longest, false).unwrap();

        let mut r = p.freeze();
        assert_eq!(r.read_string16(Encoding::Utf8).unwrap(), "");
        assert_eq!(r.peek_u16_le().unwrap(), 6);
        assert_eq!(r.read_string16(Encoding::Utf8).unwrap(), "alice");
        assert_eq!(r.read_string16(Encoding::Utf8).unwrap(), longest);
    }

    #[test]
    fn string_longer_than_prefix_is_rejected() {
        let too_long = "a".repeat(u16::MAX as usize);
        let mut p = Packet::new();
        assert_eq!(
            p.write_string16(Encoding::Utf8, &too_long, true),
            Err(PacketError::StringTooLong(u16::MAX as usize + 1))
        );
        assert_eq!(p.size(), 0);
    }

    #[test]
    fn cp932_strings_use_their_own_byte_encoding() {
        let mut p = Packet::new();
        p.write_string16(Encoding::Cp932, "テスト", false).unwrap();
        assert_eq!(p.peek_u16_le().unwrap(), 6);

        let mut r = p.freeze();
        assert_eq!(r.read_string16(Encoding::Cp932).unwrap(), "テスト");
    }

    #[test]
    fn truncated_string_restores_cursor() {
        let mut p = Packet::new();
        p.write_u16_le(10).unwrap();
        p.write_array(b"abc").unwrap();

        assert!(p.read_string16(Encoding::Utf8).is_err());
        assert_eq!(p.read_position(), 0);
    }

    #[test]
    fn writes_past_capacity_fail() {
        let mut p = Packet::with_capacity(4);
        p.write_u32_le(1).unwrap();
        assert!(matches!(p.write_u8(1), Err(PacketError::Overflow { .. })));
        assert_eq!(p.size(), 4);
    }

    #[test]
    fn seek_write_back_patches_a_field() {
        let mut p = Packet::new();
        p.write_u16_le(0).unwrap();
        p.write_array(b"body").unwrap();
        p.seek_write(0).unwrap();
        p.write_u16_le(4).unwrap();
        p.end();
        p.write_u8(9).unwrap();

        assert_eq!(p.as_slice(), &[4, 0, b'b', b'o', b'd', b'y', 9]);
        assert!(p.seek_write(100).is_err());
    }

    #[test]
    fn read_only_clones_have_independent_cursors() {
        let mut p = Packet::new();
        p.write_u32_le(0xAABBCCDD).unwrap();
        let first = p.freeze();
        let mut second = first.clone();

        assert_eq!(second.read_u32_le().unwrap(), 0xAABBCCDD);
        assert_eq!(second.left(), 0);
        assert_eq!(first.left(), 4);

        second.rewind();
        assert_eq!(second.read_u8().unwrap(), 0xDD);
    }
}
