use thiserror::Error;

#[derive(Debug, Error)]
pub enum GapError {
    #[error("Too many keys for one query frame")]
    TooManyKeys,

    #[error("Out of resources to satisfy the request")]
    OutOfResources,
}

/// Outcome of a successfully admitted local GET.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetStatus {
    /// The query was admitted; results arrive through blockstore puts.
    Started,
    /// The one and only answer for this key was already relayed, there
    /// is nothing left to ask the network for.
    AlreadyAnswered,
}

/// Blockstore rejection. Anything else the store wants to signal is its
/// own business; the router only cares that the value was not accepted.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Value rejected as invalid")]
    Invalid,
    #[error("Store temporarily unavailable")]
    Unavailable,
}
