use thiserror::Error;

use crate::schema::Tag;

/// Broad category of a codec failure.
///
/// Neither category is ever retried: corrupt input stays corrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller asked for something the schema cannot express.
    InvalidArgument,
    /// The byte sequence does not describe a valid value list.
    CorruptData,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("type {0} is not registered in the schema")]
    UnregisteredType(String),

    #[error("type {0} is already registered")]
    DuplicateType(String),

    #[error("schema has no free tags left")]
    SchemaFull,

    #[error("array of {0} elements exceeds the encodable maximum")]
    ArrayTooLong(usize),

    #[error("record of {0} bytes exceeds the encodable maximum")]
    RecordTooLong(usize),

    #[error("unknown tag {0}")]
    UnknownTag(Tag),

    #[error("negative array element count {0}")]
    NegativeArrayLength(i32),

    #[error("truncated input: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("malformed {type_name} record: {reason}")]
    Malformed {
        type_name: &'static str,
        reason: String,
    },

    #[error("arrays nested deeper than {0} levels")]
    TooDeep(usize),

    #[error("value nests arrays deeper than {0} levels")]
    NestingTooDeep(usize),
}

impl CodecError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnregisteredType(_)
            | Self::DuplicateType(_)
            | Self::SchemaFull
            | Self::ArrayTooLong(_)
            | Self::RecordTooLong(_)
            | Self::NestingTooDeep(_) => ErrorKind::InvalidArgument,
            Self::UnknownTag(_)
            | Self::NegativeArrayLength(_)
            | Self::Truncated { .. }
            | Self::Malformed { .. }
            | Self::TooDeep(_) => ErrorKind::CorruptData,
        }
    }

    pub fn is_corrupt_data(&self) -> bool {
        self.kind() == ErrorKind::CorruptData
    }

    pub(crate) fn malformed(type_name: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            type_name,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;
