use thiserror::Error;

use crate::crypto::{Hash, HASH_SIZE};

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("Not enough bytes left in buffer")]
    InvalidSize,
    #[error("Invalid value encountered")]
    InvalidValue,
    #[error("Unknown packet id {0}")]
    UnknownPacketId(u16),
}

// Cursor over a received frame, all reads are bounds checked
pub struct Reader<'a> {
    bytes: &'a [u8],
    total: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, total: 0 }
    }

    pub fn read_bytes_ref(&mut self, size: usize) -> Result<&'a [u8], ReaderError> {
        if self.size() < size {
            return Err(ReaderError::InvalidSize);
        }
        let bytes = &self.bytes[self.total..self.total + size];
        self.total += size;
        Ok(bytes)
    }

    pub fn read_bytes(&mut self, size: usize) -> Result<Vec<u8>, ReaderError> {
        Ok(self.read_bytes_ref(size)?.to_vec())
    }

    pub fn read_u8(&mut self) -> Result<u8, ReaderError> {
        let bytes = self.read_bytes_ref(1)?;
        Ok(bytes[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, ReaderError> {
        let bytes = self.read_bytes_ref(2)?;
        Ok(u16::from_be_bytes(bytes.try_into().map_err(|_| ReaderError::InvalidValue)?))
    }

    pub fn read_u32(&mut self) -> Result<u32, ReaderError> {
        let bytes = self.read_bytes_ref(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().map_err(|_| ReaderError::InvalidValue)?))
    }

    pub fn read_u64(&mut self) -> Result<u64, ReaderError> {
        let bytes = self.read_bytes_ref(8)?;
        Ok(u64::from_be_bytes(bytes.try_into().map_err(|_| ReaderError::InvalidValue)?))
    }

    pub fn read_hash(&mut self) -> Result<Hash, ReaderError> {
        let bytes = self.read_bytes_ref(HASH_SIZE)?;
        let bytes: [u8; HASH_SIZE] = bytes.try_into().map_err(|_| ReaderError::InvalidValue)?;
        Ok(Hash::new(bytes))
    }

    // How many bytes are left to read
    pub fn size(&self) -> usize {
        self.bytes.len() - self.total
    }

    pub fn total_read(&self) -> usize {
        self.total
    }
}
