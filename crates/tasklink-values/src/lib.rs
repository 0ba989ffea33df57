//! tasklink-values: tagged binary packing of call arguments and results.
//!
//! Values are written as self-describing records whose type tags come from a
//! [`Schema`]. Both ends of a call must use schemas with identical
//! registration order; no per-type code generation is needed.
//!
//! ```
//! use tasklink_values::{Schema, Value, decode, encode};
//!
//! let schema = Schema::standard();
//! let args = vec![Value::from(1), Value::from("a"), Value::Null];
//! let bytes = encode(&schema, &args).unwrap();
//! assert_eq!(decode(&schema, &bytes).unwrap(), args);
//! ```

pub mod codec;
pub mod error;
pub mod schema;
pub mod value;

pub use codec::{decode, encode};
pub use error::{CodecError, ErrorKind};
pub use schema::{ARRAY_TAG, NULL_TAG, ScalarKind, Schema, Tag, TypeKey};
pub use value::Value;
