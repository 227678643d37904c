use std::fmt;

/// Outcome label attached to every message a persister settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandledCode {
    /// Written to the sink and acked
    Ok,
    /// Payload could not be decoded
    BadMessage,
    /// `id` attribute required but absent
    MissingId,
    /// Replaced by a later message with the same id in the same batch
    DuplicateId,
    /// Sink failed with a retryable error; nacked for redelivery
    RepeatableError,
    /// Sink rejected the batch outright
    NonRepeatableError,
}

impl HandledCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::BadMessage => "bad_message",
            Self::MissingId => "missing_id",
            Self::DuplicateId => "duplicate_id",
            Self::RepeatableError => "repeatable_error",
            Self::NonRepeatableError => "non_repeatable_error",
        }
    }
}

impl fmt::Display for HandledCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
