//! Type registry shared by the encoding and decoding sides.
//!
//! Tags are handed out in registration order and never reused, so two
//! processes that register the same types in the same order agree on every
//! tag. Build the schema once at startup and share it by reference; encode
//! and decode only ever read it.

use std::collections::HashMap;
use std::fmt;

use crate::error::{CodecError, Result};

/// Small integer identifying a value's type on the wire.
pub type Tag = u16;

/// Tag of the empty record written for a null value.
pub const NULL_TAG: Tag = 0;

/// Tag of the record announcing an array and its element count.
pub const ARRAY_TAG: Tag = 1;

const FIRST_TYPE_TAG: Tag = 2;

/// Built-in scalar types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Char,
    String,
    Bytes,
}

impl ScalarKind {
    /// Registration order used by [`Schema::standard`].
    pub const ALL: [ScalarKind; 14] = [
        ScalarKind::Bool,
        ScalarKind::I8,
        ScalarKind::U8,
        ScalarKind::I16,
        ScalarKind::U16,
        ScalarKind::I32,
        ScalarKind::U32,
        ScalarKind::I64,
        ScalarKind::U64,
        ScalarKind::F32,
        ScalarKind::F64,
        ScalarKind::Char,
        ScalarKind::String,
        ScalarKind::Bytes,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::I8 => "i8",
            Self::U8 => "u8",
            Self::I16 => "i16",
            Self::U16 => "u16",
            Self::I32 => "i32",
            Self::U32 => "u32",
            Self::I64 => "i64",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::Char => "char",
            Self::String => "string",
            Self::Bytes => "bytes",
        }
    }

    /// Encoded body size for fixed-width kinds.
    pub(crate) fn fixed_width(&self) -> Option<usize> {
        match self {
            Self::Bool | Self::I8 | Self::U8 => Some(1),
            Self::I16 | Self::U16 => Some(2),
            Self::I32 | Self::U32 | Self::F32 | Self::Char => Some(4),
            Self::I64 | Self::U64 | Self::F64 => Some(8),
            Self::String | Self::Bytes => None,
        }
    }
}

/// Identity of a registrable type.
///
/// `Named` covers application types whose bodies are opaque bytes produced
/// by the application itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKey {
    Scalar(ScalarKind),
    Named(String),
}

impl From<ScalarKind> for TypeKey {
    fn from(kind: ScalarKind) -> Self {
        Self::Scalar(kind)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(kind) => f.write_str(kind.name()),
            Self::Named(name) => write!(f, "named:{}", name),
        }
    }
}

/// Append-only mapping between types and tags.
#[derive(Debug, Clone)]
pub struct Schema {
    entries: Vec<TypeKey>,
    scalars: HashMap<ScalarKind, Tag>,
    named: HashMap<String, Tag>,
}

impl Schema {
    /// A schema with no registered types. Only null and arrays encode.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            scalars: HashMap::new(),
            named: HashMap::new(),
        }
    }

    /// A schema with every built-in scalar registered in [`ScalarKind::ALL`] order.
    pub fn standard() -> Self {
        let mut schema = Self::empty();
        for kind in ScalarKind::ALL {
            schema.scalars.insert(kind, FIRST_TYPE_TAG + schema.entries.len() as Tag);
            schema.entries.push(TypeKey::Scalar(kind));
        }
        schema
    }

    /// Register a type, returning its tag.
    ///
    /// Registering a type twice is an error rather than a no-op: a second
    /// registration means two components disagree about the schema.
    pub fn register(&mut self, key: impl Into<TypeKey>) -> Result<Tag> {
        let key = key.into();
        if self.contains(&key) {
            return Err(CodecError::DuplicateType(key.to_string()));
        }

        let tag = usize::from(FIRST_TYPE_TAG)
            .checked_add(self.entries.len())
            .and_then(|t| Tag::try_from(t).ok())
            .ok_or(CodecError::SchemaFull)?;

        match &key {
            TypeKey::Scalar(kind) => {
                self.scalars.insert(*kind, tag);
            }
            TypeKey::Named(name) => {
                self.named.insert(name.clone(), tag);
            }
        }
        self.entries.push(key);
        Ok(tag)
    }

    pub fn register_named(&mut self, name: impl Into<String>) -> Result<Tag> {
        self.register(TypeKey::Named(name.into()))
    }

    pub fn contains(&self, key: &TypeKey) -> bool {
        match key {
            TypeKey::Scalar(kind) => self.scalars.contains_key(kind),
            TypeKey::Named(name) => self.named.contains_key(name),
        }
    }

    pub fn type_of(&self, tag: Tag) -> Option<&TypeKey> {
        let index = tag.checked_sub(FIRST_TYPE_TAG)?;
        self.entries.get(usize::from(index))
    }

    pub(crate) fn scalar_tag(&self, kind: ScalarKind) -> Option<Tag> {
        self.scalars.get(&kind).copied()
    }

    pub(crate) fn named_tag(&self, name: &str) -> Option<Tag> {
        self.named.get(name).copied()
    }

    /// Number of registered types, excluding the reserved null and array tags.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::standard()
    }
}
