mod reader;
mod writer;

pub use reader::{Reader, ReaderError};
pub use writer::Writer;

use crate::crypto::{Hash, HASH_SIZE};

// All multibyte integers are written in network byte order.
pub trait Serializer {
    fn write(&self, writer: &mut Writer);

    fn read(reader: &mut Reader) -> Result<Self, ReaderError>
    where
        Self: Sized;

    fn size(&self) -> usize {
        let mut writer = Writer::new();
        self.write(&mut writer);
        writer.total_write()
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(self.size());
        self.write(&mut writer);
        writer.into_bytes()
    }

    // Reject trailing garbage: a valid message consumes the whole buffer
    fn from_bytes(bytes: &[u8]) -> Result<Self, ReaderError>
    where
        Self: Sized,
    {
        let mut reader = Reader::new(bytes);
        let value = Self::read(&mut reader)?;
        if reader.size() != 0 {
            return Err(ReaderError::InvalidSize);
        }
        Ok(value)
    }
}

impl Serializer for u8 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u8(*self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_u8()
    }

    fn size(&self) -> usize {
        1
    }
}

impl Serializer for u16 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u16(*self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_u16()
    }

    fn size(&self) -> usize {
        2
    }
}

impl Serializer for u32 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(*self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_u32()
    }

    fn size(&self) -> usize {
        4
    }
}

impl Serializer for u64 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(*self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_u64()
    }

    fn size(&self) -> usize {
        8
    }
}

// TTL fields are relative and may be negative on the wire
impl Serializer for i32 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(*self as u32);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(reader.read_u32()? as i32)
    }

    fn size(&self) -> usize {
        4
    }
}

impl Serializer for Hash {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_hash()
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_hash(self);
    }

    fn size(&self) -> usize {
        HASH_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_round_trip() {
        let mut writer = Writer::new();
        0xABu8.write(&mut writer);
        0x1234u16.write(&mut writer);
        0xDEADBEEFu32.write(&mut writer);
        (-5000i32).write(&mut writer);

        let bytes = writer.into_bytes();
        // network byte order
        assert_eq!(&bytes[1..3], &[0x12, 0x34]);

        let mut reader = Reader::new(&bytes);
        assert_eq!(u8::read(&mut reader).unwrap(), 0xAB);
        assert_eq!(u16::read(&mut reader).unwrap(), 0x1234);
        assert_eq!(u32::read(&mut reader).unwrap(), 0xDEADBEEF);
        assert_eq!(i32::read(&mut reader).unwrap(), -5000);
        assert_eq!(reader.size(), 0);
    }

    #[test]
    fn test_from_bytes_rejects_trailing_garbage() {
        let bytes = [0u8; 5];
        assert!(u32::from_bytes(&bytes).is_err());
    }
}
