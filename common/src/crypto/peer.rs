use serde::{Deserialize, Serialize};
use std::fmt::{Display, Error, Formatter};

use super::{Hash, HASH_SIZE};
use crate::serializer::{Reader, ReaderError, Serializer, Writer};

pub const PEER_ID_SIZE: usize = HASH_SIZE;

// Identity of a peer on the overlay: the hash of its public key.
// Value type, nothing owns a peer.
#[derive(Eq, PartialEq, PartialOrd, Ord, Clone, Debug, Hash, Serialize, Deserialize)]
pub struct PeerId(Hash);

impl PeerId {
    pub const fn new(hash: Hash) -> Self {
        PeerId(hash)
    }

    pub const fn zero() -> Self {
        PeerId(Hash::zero())
    }

    pub fn as_hash(&self) -> &Hash {
        &self.0
    }

    pub fn into_hash(self) -> Hash {
        self.0
    }
}

impl From<Hash> for PeerId {
    fn from(hash: Hash) -> Self {
        PeerId(hash)
    }
}

impl Serializer for PeerId {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(PeerId(reader.read_hash()?))
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_hash(&self.0);
    }

    fn size(&self) -> usize {
        PEER_ID_SIZE
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        // first 8 bytes are enough to recognize a peer in logs
        write!(f, "{}", &self.0.to_hex()[..16])
    }
}
