//! Structural schemas and the payload codec.
//!
//! Every encoded event carries the fingerprint of the schema it was written with. Consumers look
//! that fingerprint up in a [`SchemaCache`] to discover the source schema before decoding into
//! their own (possibly projected) type.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, ErrorKind, Result};

/// Length of the schema fingerprint prefixed to every encoded payload
pub const SCHEMA_HASH_LEN: usize = 16;

/// A structural schema, compared by shape rather than by Rust type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Schema {
    Null,
    Boolean,
    Int,
    Long,
    Float,
    Double,
    String,
    Bytes,
    Array { items: Box<Schema> },
    Map { values: Box<Schema> },
    Record { name: String, fields: Vec<Field> },
    Union { variants: Vec<Schema> },
}

/// A named field of a record schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub schema: Schema,
}

impl Field {
    pub fn new(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }
}

impl Schema {
    pub fn record(name: impl Into<String>, fields: Vec<Field>) -> Self {
        Schema::Record {
            name: name.into(),
            fields,
        }
    }

    pub fn array(items: Schema) -> Self {
        Schema::Array {
            items: Box::new(items),
        }
    }

    pub fn map(values: Schema) -> Self {
        Schema::Map {
            values: Box::new(values),
        }
    }

    pub fn nullable(schema: Schema) -> Self {
        Schema::Union {
            variants: vec![Schema::Null, schema],
        }
    }

    /// Stable fingerprint of the schema structure.
    pub fn fingerprint(&self) -> SchemaHash {
        // serializing a schema cannot fail: it only holds strings, vectors and unit variants
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        let mut hash = [0u8; SCHEMA_HASH_LEN];
        hash.copy_from_slice(&digest[..SCHEMA_HASH_LEN]);
        SchemaHash(hash)
    }

    /// Whether data written with `self` can be read as `target`.
    ///
    /// Records match by name and the target may project a subset of the source fields. Int and
    /// float widen to long and double.
    pub fn is_compatible_with(&self, target: &Schema) -> bool {
        if self == target {
            return true;
        }
        match (self, target) {
            (Schema::Int, Schema::Long) | (Schema::Float, Schema::Double) => true,
            (Schema::Array { items: src }, Schema::Array { items: dst }) => {
                src.is_compatible_with(dst)
            }
            (Schema::Map { values: src }, Schema::Map { values: dst }) => {
                src.is_compatible_with(dst)
            }
            (
                Schema::Record {
                    name: src_name,
                    fields: src_fields,
                },
                Schema::Record {
                    name: dst_name,
                    fields: dst_fields,
                },
            ) => {
                src_name == dst_name
                    && dst_fields.iter().all(|dst| {
                        src_fields
                            .iter()
                            .find(|src| src.name == dst.name)
                            .is_some_and(|src| src.schema.is_compatible_with(&dst.schema))
                    })
            }
            (Schema::Union { variants }, _) => {
                variants.iter().all(|v| v.is_compatible_with(target))
            }
            (_, Schema::Union { variants }) => variants.iter().any(|v| self.is_compatible_with(v)),
            _ => false,
        }
    }
}

/// Fingerprint of a [`Schema`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaHash([u8; SCHEMA_HASH_LEN]);

impl SchemaHash {
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        let head = payload.get(..SCHEMA_HASH_LEN)?;
        let mut hash = [0u8; SCHEMA_HASH_LEN];
        hash.copy_from_slice(head);
        Some(SchemaHash(hash))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for SchemaHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// A payload type with a declared structural schema.
pub trait Typed: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn schema() -> Schema;
}

impl Typed for String {
    fn schema() -> Schema {
        Schema::String
    }
}

impl Typed for i32 {
    fn schema() -> Schema {
        Schema::Int
    }
}

impl Typed for i64 {
    fn schema() -> Schema {
        Schema::Long
    }
}

impl Typed for f64 {
    fn schema() -> Schema {
        Schema::Double
    }
}

impl Typed for bool {
    fn schema() -> Schema {
        Schema::Boolean
    }
}

impl Typed for Vec<u8> {
    fn schema() -> Schema {
        Schema::Bytes
    }
}

/// Known schemas by fingerprint, used to discover the writer schema of each payload.
#[derive(Debug, Default, Clone)]
pub struct SchemaCache {
    schemas: HashMap<SchemaHash, Schema>,
}

impl SchemaCache {
    pub fn new(schemas: impl IntoIterator<Item = Schema>) -> Self {
        Self {
            schemas: schemas
                .into_iter()
                .map(|schema| (schema.fingerprint(), schema))
                .collect(),
        }
    }

    /// Source schema of an encoded payload, `None` if the payload is too short or unknown.
    pub fn get(&self, payload: &[u8]) -> Option<&Schema> {
        SchemaHash::from_payload(payload).and_then(|hash| self.schemas.get(&hash))
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

fn serialization_error(message: impl Into<String>) -> Error {
    Error::DefaultError(ErrorKind::SerializationError(message.into()))
}

/// Encodes a value as fingerprint of `schema` followed by the serialized body.
pub fn encode<T: Serialize>(schema: &Schema, value: &T) -> Result<Vec<u8>> {
    let mut payload = schema.fingerprint().as_bytes().to_vec();
    serde_json::to_writer(&mut payload, value)
        .map_err(|e| serialization_error(format!("encoding against {schema:?}: {e}")))?;
    Ok(payload)
}

/// Decodes payloads into `T`, resolving each payload's source schema through the cache.
pub struct DatumDecoder<T> {
    target: Schema,
    cache: Arc<SchemaCache>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for DatumDecoder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatumDecoder")
            .field("target", &self.target)
            .finish()
    }
}

impl<T: DeserializeOwned> DatumDecoder<T> {
    pub fn new(target: Schema, cache: Arc<SchemaCache>) -> Self {
        Self {
            target,
            cache,
            _marker: PhantomData,
        }
    }

    pub fn decode(&self, payload: &[u8]) -> Result<T> {
        let source = self
            .cache
            .get(payload)
            .ok_or_else(|| serialization_error("Fail to find source schema."))?;
        if !source.is_compatible_with(&self.target) {
            return Err(serialization_error(format!(
                "source schema {source:?} cannot be read as {:?}",
                self.target
            )));
        }
        serde_json::from_slice(&payload[SCHEMA_HASH_LEN..])
            .map_err(|e| serialization_error(format!("decoding payload: {e}")))
    }
}
