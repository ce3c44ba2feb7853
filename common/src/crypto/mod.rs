pub mod hash;
pub mod peer;

pub use hash::{hash, Hash, HASH_SIZE};
pub use peer::PeerId;
