//! Error taxonomy shared by every layer of the sync stack.

use thiserror::Error;

/// Coarse classification used for logging and for deciding what to surface
/// to the user.
///
/// Nothing in this subsystem is fatal to the process; the kind only decides
/// whether a failure is reported, dropped or retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Handshake or transport failure. Reported, session goes `disconnected`.
    Connection,
    /// Undecodable or schema-invalid frame. Logged and dropped.
    MalformedMessage,
    /// Edit offset outside the buffer. Logged loudly, operation skipped.
    OutOfRange,
    /// Snapshot read/write failure. Logged, merge and broadcast continue.
    Persistence,
    /// Send attempted while the session is not `connected`.
    NotConnected,
}

/// Errors raised by the replicated text store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TextError {
    #[error("edit at offset {offset} (len {len}) exceeds document length {doc_len}")]
    OutOfRange {
        offset: usize,
        len: usize,
        doc_len: usize,
    },

    #[error("offset {offset} does not fall on a UTF-8 character boundary")]
    NotCharBoundary { offset: usize },

    #[error("update blob could not be decoded: {0}")]
    Decode(String),

    #[error("update blob rejected by merge: {0}")]
    Apply(String),
}

impl TextError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TextError::OutOfRange { .. } | TextError::NotCharBoundary { .. } => {
                ErrorKind::OutOfRange
            }
            TextError::Decode(_) | TextError::Apply(_) => ErrorKind::MalformedMessage,
        }
    }
}
