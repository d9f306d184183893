use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::document::Document;

/// Errors from document mapping.
#[derive(Debug, Error)]
pub enum MapperError {
    /// The value did not serialize to a document (JSON object).
    #[error("value did not serialize to a document")]
    NotADocument,

    /// Underlying serde failure.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// A trait for moving typed records to and from store documents.
pub trait DocumentMapper: Clone + Send + Sync + 'static {
    /// Serializes a record into a document.
    ///
    /// # Errors
    /// Returns an error when the record does not map to a document shape.
    fn serialize<T: Serialize>(&self, record: &T) -> Result<Document, MapperError>;

    /// Deserializes a record from a document.
    ///
    /// # Errors
    /// Returns an error when the document does not match the record type.
    fn deserialize<T: DeserializeOwned>(&self, document: Document) -> Result<T, MapperError>;
}

/// The serde-json-backed default mapper.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonMapper;

impl JsonMapper {
    /// Creates a new `JsonMapper`.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl DocumentMapper for JsonMapper {
    fn serialize<T: Serialize>(&self, record: &T) -> Result<Document, MapperError> {
        match serde_json::to_value(record)? {
            Value::Object(map) => Ok(Document::from(map)),
            _ => Err(MapperError::NotADocument),
        }
    }

    fn deserialize<T: DeserializeOwned>(&self, document: Document) -> Result<T, MapperError> {
        Ok(serde_json::from_value(Value::from(document))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq, Serialize)]
    struct Record {
        name: String,
        priority: i32,
    }

    #[test]
    fn test_round_trip() {
        let mapper = JsonMapper::new();
        let record = Record {
            name: "ping".into(),
            priority: 1000,
        };

        let document = mapper.serialize(&record).unwrap();
        assert_eq!(document.get_str("name"), Some("ping"));

        let back: Record = mapper.deserialize(document).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_rejects_non_document_values() {
        let mapper = JsonMapper::new();
        assert!(matches!(
            mapper.serialize(&42),
            Err(MapperError::NotADocument)
        ));
    }
}
