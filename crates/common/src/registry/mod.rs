//! Document registry contract shared by the agent and the scheduler.
//!
//! Collections are slash-separated paths (`devices`, `deviceGroups/g1/devices`);
//! documents are flat JSON objects keyed by id.

use std::cmp::Ordering;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod http;
mod memory;

pub use http::HttpRegistry;
pub use memory::MemoryRegistry;

pub type Fields = serde_json::Map<String, Value>;

/// Live result sets of a query, one item per change, until dropped.
pub type Snapshots = BoxStream<'static, Result<Vec<Document>, RegistryError>>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("registry returned {status} for {path}")]
    Status { status: u16, path: String },
    #[error("cannot decode document: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid document path: {0}")]
    InvalidPath(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub fields: Fields,
}

impl Document {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, RegistryError> {
        Ok(serde_json::from_value(Value::Object(self.fields.clone()))?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "<")]
    Lt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self { field: field.to_string(), op: FilterOp::Eq, value: value.into() }
    }

    pub fn lt(field: &str, value: impl Into<Value>) -> Self {
        Self { field: field.to_string(), op: FilterOp::Lt, value: value.into() }
    }

    /// Documents missing the field never match.
    pub fn matches(&self, fields: &Fields) -> bool {
        let Some(actual) = fields.get(&self.field) else {
            return false;
        };
        match self.op {
            FilterOp::Eq => actual == &self.value,
            FilterOp::Lt => compare_values(actual, &self.value) == Some(Ordering::Less),
        }
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Convert a serializable value into top-level document fields.
pub fn to_fields<T: Serialize>(value: &T) -> Result<Fields, RegistryError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => {
            let mut map = Fields::new();
            map.insert("value".to_string(), other);
            Ok(map)
        }
    }
}

/// Build fields from a `json!({...})` literal; non-objects yield no fields.
pub fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        _ => Fields::new(),
    }
}

#[async_trait]
pub trait Registry: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, RegistryError>;

    async fn query(&self, collection: &str, filters: &[Filter]) -> Result<Vec<Document>, RegistryError>;

    /// Write a document. With `merge`, only the given top-level fields are replaced.
    async fn set(&self, collection: &str, id: &str, fields: Fields, merge: bool) -> Result<(), RegistryError>;

    /// Create a document with a generated id.
    async fn add(&self, collection: &str, fields: Fields) -> Result<String, RegistryError>;

    /// Current result set first, then a new one after every change.
    async fn listen(&self, collection: &str, filters: &[Filter]) -> Result<Snapshots, RegistryError>;

    /// Live view of one document; `None` while it does not exist.
    async fn listen_document(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<BoxStream<'static, Result<Option<Document>, RegistryError>>, RegistryError> {
        let id = id.to_string();
        let snapshots = self.listen(collection, &[]).await?;
        Ok(snapshots
            .map(move |snap| snap.map(|docs| docs.into_iter().find(|d| d.id == id)))
            .boxed())
    }
}
