//! Status codes for navigation mesh operations.

/// Result type for navigation mesh operations.
pub type Result<T> = std::result::Result<T, Status>;

/// Failure detail for a navigation mesh operation.
///
/// Every fallible operation either succeeds or reports exactly one of
/// these. Lookups that can merely miss (a tile that is not loaded, a
/// polygon query with no hits) return `Option`/empty results instead of
/// an error.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Operation failed for an unspecified reason.
    #[error("operation failed")]
    Failure,
    /// A provided parameter was invalid.
    #[error("invalid parameter")]
    InvalidParam,
    /// Input data did not start with the expected magic number.
    #[error("wrong magic number")]
    WrongMagic,
    /// Input data was built with an incompatible format version.
    #[error("wrong version")]
    WrongVersion,
    /// A fixed-size slot array or pool was exhausted.
    #[error("out of memory")]
    OutOfMemory,
    /// A tile already occupies the target (x, y, layer) location.
    #[error("tile location already occupied")]
    AlreadyOccupied,
    /// A bounded queue or output buffer cannot take more entries.
    #[error("buffer too small")]
    BufferTooSmall,
}

impl From<std::io::Error> for Status {
    fn from(_: std::io::Error) -> Self {
        // Only produced by cursor reads over in-memory payloads, where a
        // short read means the payload was truncated.
        Status::InvalidParam
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_strings() {
        assert_eq!(Status::WrongMagic.to_string(), "wrong magic number");
        assert_eq!(Status::AlreadyOccupied.to_string(), "tile location already occupied");
    }
}
