//! Error types for the event log.

/// Error type for event log operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Seek target lies past the end of the log.
    #[error("offset {offset} is beyond the high water mark {high_water_mark}")]
    OffsetOutOfRange { offset: u64, high_water_mark: u64 },

    /// Commit of an offset that was never delivered to this consumer.
    #[error("cannot commit offset {offset} for group '{group}': not yet polled")]
    CommitAhead { group: String, offset: u64 },

    /// The log was closed and accepts no further appends.
    #[error("event log is closed")]
    Closed,
}

/// Result type alias for event log operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_ahead_names_group() {
        let err = Error::CommitAhead {
            group: "attribution".into(),
            offset: 7,
        };
        let msg = err.to_string();
        assert!(msg.contains("attribution"));
        assert!(msg.contains('7'));
    }
}
