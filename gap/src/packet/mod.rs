//! Peer-to-peer wire messages of the routing protocol.
//!
//! Frames are length-prefixed: `{size: u16, type: u16}` followed by the
//! body, all fields in network byte order.

use bytes::Bytes;
use gap_common::{
    crypto::{Hash, PeerId, HASH_SIZE},
    serializer::{Reader, ReaderError, Serializer, Writer},
};

use crate::config::MAX_BUFFER_SIZE;

pub const QUERY_PACKET_ID: u16 = 16;
pub const REPLY_PACKET_ID: u16 = 17;

/// Frame header: size (including the header itself) and message type.
pub const HEADER_SIZE: usize = 4;

/// Query frame with a single key: header + type + priority + ttl +
/// return address + primary key.
pub const QUERY_BASE_SIZE: usize = HEADER_SIZE + 4 + 4 + 4 + HASH_SIZE + HASH_SIZE;

/// Reply frame with an empty payload: header + primary key.
pub const REPLY_BASE_SIZE: usize = HEADER_SIZE + HASH_SIZE;

/// Most keys a single query frame can carry.
pub const MAX_QUERY_KEYS: usize = (MAX_BUFFER_SIZE - QUERY_BASE_SIZE) / HASH_SIZE + 1;

/// Block type tag carried in queries and replies. The store gives the
/// values their meaning; the router only passes them through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockType(pub u32);

impl BlockType {
    /// Wildcard matching any block type.
    pub const ANY: BlockType = BlockType(0);
}

impl Serializer for BlockType {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(BlockType(reader.read_u32()?))
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_u32(self.0);
    }

    fn size(&self) -> usize {
        4
    }
}

/// Request for content. `keys[0]` is the primary key and the sole index
/// used for routing; further keys are disjuncts for the blockstore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPacket {
    pub block_type: BlockType,
    /// How important this request claims to be. Arbitrary on the wire,
    /// capped by sender trust before anything believes it.
    pub priority: u32,
    /// Relative time to live in milliseconds, may be negative.
    pub ttl: i32,
    /// Where replies should be routed.
    pub return_to: PeerId,
    pub keys: Vec<Hash>,
}

impl QueryPacket {
    pub fn primary_key(&self) -> &Hash {
        &self.keys[0]
    }

    pub fn wire_size(&self) -> usize {
        QUERY_BASE_SIZE + (self.keys.len() - 1) * HASH_SIZE
    }

    fn read_body(reader: &mut Reader) -> Result<Self, ReaderError> {
        let block_type = BlockType::read(reader)?;
        let priority = reader.read_u32()?;
        let ttl = reader.read_u32()? as i32;
        let return_to = PeerId::read(reader)?;

        // remaining bytes must be a whole, non-empty set of keys
        let remaining = reader.size();
        if remaining < HASH_SIZE || remaining % HASH_SIZE != 0 {
            return Err(ReaderError::InvalidSize);
        }
        let count = remaining / HASH_SIZE;
        let mut keys = Vec::with_capacity(count);
        for _ in 0..count {
            keys.push(reader.read_hash()?);
        }

        Ok(Self {
            block_type,
            priority,
            ttl,
            return_to,
            keys,
        })
    }

    fn write_body(&self, writer: &mut Writer) {
        self.block_type.write(writer);
        writer.write_u32(self.priority);
        writer.write_u32(self.ttl as u32);
        self.return_to.write(writer);
        for key in &self.keys {
            writer.write_hash(key);
        }
    }
}

/// Search result routed back along the indirection chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyPacket {
    pub primary_key: Hash,
    pub payload: Bytes,
}

impl ReplyPacket {
    pub fn wire_size(&self) -> usize {
        REPLY_BASE_SIZE + self.payload.len()
    }

    fn read_body(reader: &mut Reader) -> Result<Self, ReaderError> {
        let primary_key = reader.read_hash()?;
        let payload = Bytes::from(reader.read_bytes(reader.size())?);
        Ok(Self {
            primary_key,
            payload,
        })
    }

    fn write_body(&self, writer: &mut Writer) {
        writer.write_hash(&self.primary_key);
        writer.write_bytes(&self.payload);
    }
}

/// A framed message as it travels between peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Query(QueryPacket),
    Reply(ReplyPacket),
}

impl Packet {
    pub fn wire_size(&self) -> usize {
        match self {
            Packet::Query(query) => query.wire_size(),
            Packet::Reply(reply) => reply.wire_size(),
        }
    }
}

impl Serializer for Packet {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let size = reader.read_u16()? as usize;
        let id = reader.read_u16()?;
        if size > MAX_BUFFER_SIZE || size != reader.size() + HEADER_SIZE {
            return Err(ReaderError::InvalidSize);
        }
        match id {
            QUERY_PACKET_ID => Ok(Packet::Query(QueryPacket::read_body(reader)?)),
            REPLY_PACKET_ID => Ok(Packet::Reply(ReplyPacket::read_body(reader)?)),
            id => Err(ReaderError::UnknownPacketId(id)),
        }
    }

    fn write(&self, writer: &mut Writer) {
        let size = self.wire_size();
        debug_assert!(size <= MAX_BUFFER_SIZE);
        writer.write_u16(size as u16);
        match self {
            Packet::Query(query) => {
                writer.write_u16(QUERY_PACKET_ID);
                query.write_body(writer);
            }
            Packet::Reply(reply) => {
                writer.write_u16(REPLY_PACKET_ID);
                reply.write_body(writer);
            }
        }
    }

    fn size(&self) -> usize {
        self.wire_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gap_common::crypto::hash;

    fn sample_query(keys: usize) -> QueryPacket {
        QueryPacket {
            block_type: BlockType(7),
            priority: 42,
            ttl: -3000,
            return_to: PeerId::new(hash(b"origin")),
            keys: (0..keys).map(|i| hash(&[i as u8])).collect(),
        }
    }

    #[test]
    fn test_query_round_trip() {
        let query = sample_query(3);
        let packet = Packet::Query(query.clone());
        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), QUERY_BASE_SIZE + 2 * HASH_SIZE);

        match Packet::from_bytes(&bytes).unwrap() {
            Packet::Query(parsed) => assert_eq!(parsed, query),
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_reply_round_trip() {
        let reply = ReplyPacket {
            primary_key: hash(b"key"),
            payload: Bytes::from_static(b"some content block"),
        };
        let packet = Packet::Reply(reply.clone());
        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), REPLY_BASE_SIZE + reply.payload.len());

        match Packet::from_bytes(&bytes).unwrap() {
            Packet::Reply(parsed) => assert_eq!(parsed, reply),
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_single_key_query_is_144_bytes() {
        let query = sample_query(1);
        assert_eq!(Packet::Query(query).to_bytes().len(), 144);
    }

    #[test]
    fn test_malformed_sizes_rejected() {
        let mut bytes = Packet::Query(sample_query(2)).to_bytes();

        // truncated key material
        bytes.truncate(bytes.len() - 7);
        assert!(Packet::from_bytes(&bytes).is_err());

        // header size disagreeing with the frame
        let mut bytes = Packet::Query(sample_query(1)).to_bytes();
        bytes[0] = 0;
        bytes[1] = 10;
        assert!(Packet::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_unknown_packet_id_rejected() {
        let mut bytes = Packet::Reply(ReplyPacket {
            primary_key: hash(b"k"),
            payload: Bytes::new(),
        })
        .to_bytes();
        bytes[3] = 99;
        assert!(matches!(
            Packet::from_bytes(&bytes),
            Err(ReaderError::UnknownPacketId(99))
        ));
    }
}
