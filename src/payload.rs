//! A minimal flat payload buffer: bytes + object-reference offsets + a
//! cursor. This is *not* a higher-level parcel/string/handle type
//! system -- just enough for the RPC Protocol Descriptor to write an
//! interface-name header and for `demos/` and tests to build readable
//! request/response bytes. Primitives only; no generic container or
//! derive machinery on top.

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

pub struct Payload {
    cursor: Cursor<Vec<u8>>,
    offsets: Vec<usize>,
}

impl Payload {
    pub fn new() -> Self {
        Self {
            cursor: Cursor::new(Vec::new()),
            offsets: Vec::new(),
        }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            cursor: Cursor::new(data),
            offsets: Vec::new(),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.cursor.into_inner()
    }

    pub fn bytes(&self) -> &[u8] {
        self.cursor.get_ref()
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn len(&self) -> usize {
        self.cursor.get_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_unread_data(&self) -> bool {
        (self.cursor.position() as usize) < self.len()
    }

    /// Record the current write position as an embedded object reference.
    pub fn mark_object_offset(&mut self) {
        self.offsets.push(self.cursor.position() as usize);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.cursor.write_i32::<LittleEndian>(v).expect("writing to a Vec cannot fail");
    }

    pub fn write_u32(&mut self, v: u32) {
        self.cursor.write_u32::<LittleEndian>(v).expect("writing to a Vec cannot fail");
    }

    pub fn write_u64(&mut self, v: u64) {
        self.cursor.write_u64::<LittleEndian>(v).expect("writing to a Vec cannot fail");
    }

    /// Write raw bytes, zero-padded to a 4-byte boundary.
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.cursor.write_all(data).expect("writing to a Vec cannot fail");
        let padding = (4 - (data.len() % 4)) % 4;
        for _ in 0..padding {
            self.cursor.write_u8(0).expect("writing to a Vec cannot fail");
        }
    }

    /// Android-style length-prefixed, null-terminated, 4-byte-padded
    /// UTF-16 string -- the wire shape `write_rpc_header` needs.
    pub fn write_str16(&mut self, s: &str) {
        let units: Vec<u16> = s.encode_utf16().collect();
        self.write_i32(units.len() as i32);
        for unit in &units {
            self.cursor.write_u16::<LittleEndian>(*unit).expect("writing to a Vec cannot fail");
        }
        self.cursor.write_u16::<LittleEndian>(0).expect("writing to a Vec cannot fail");
        let written = units.len() * 2 + 2;
        let padding = (4 - (written % 4)) % 4;
        for _ in 0..padding {
            self.cursor.write_u8(0).expect("writing to a Vec cannot fail");
        }
    }

    pub fn read_i32(&mut self) -> std::io::Result<i32> {
        self.cursor.read_i32::<LittleEndian>()
    }

    pub fn read_u32(&mut self) -> std::io::Result<u32> {
        self.cursor.read_u32::<LittleEndian>()
    }

    pub fn read_bytes(&mut self, len: usize) -> std::io::Result<Vec<u8>> {
        let padded = len + ((4 - (len % 4)) % 4);
        let mut data = vec![0u8; padded];
        self.cursor.read_exact(&mut data)?;
        data.truncate(len);
        Ok(data)
    }

    pub fn read_str16(&mut self) -> std::io::Result<String> {
        let len = self.read_i32()? as usize;
        let mut units = vec![0u16; len];
        for unit in &mut units {
            *unit = self.cursor.read_u16::<LittleEndian>()?;
        }
        let _terminator = self.cursor.read_u16::<LittleEndian>()?;
        let written = len * 2 + 2;
        let padding = (4 - (written % 4)) % 4;
        let mut pad_buf = vec![0u8; padding];
        self.cursor.read_exact(&mut pad_buf)?;
        String::from_utf16(&units).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn str16_round_trips() {
        let mut p = Payload::new();
        p.write_str16("hello");
        p.write_i32(42);
        let mut p = Payload::from_bytes(p.into_bytes());
        assert_eq!(p.read_str16().unwrap(), "hello");
        assert_eq!(p.read_i32().unwrap(), 42);
    }

    #[test]
    fn bytes_pad_to_four() {
        let mut p = Payload::new();
        p.write_bytes(b"AB");
        assert_eq!(p.len(), 4);
    }
}
