//! Records as seen by the indexing tree

use serde::{Deserialize, Serialize};

/// An element that can be indexed by a storage tree.
///
/// Only `id` is mandatory; the remaining attributes are routing keys used by
/// branch indexers and may be absent.
pub trait IndexedElement: Send + Sync {
    /// Application assigned id; `0` is reserved and never indexable
    fn id(&self) -> i64;

    fn platform_ident(&self) -> Option<i64> {
        None
    }

    fn sensor_type_ident(&self) -> Option<i64> {
        None
    }

    fn method_ident(&self) -> Option<i64> {
        None
    }

    /// Name of the record kind, used by the object type indexer
    fn type_name(&self) -> &str;

    /// Creation time in milliseconds since the Unix epoch
    fn timestamp_millis(&self) -> Option<i64> {
        None
    }
}

/// Plain record metadata carrying every routing attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordInfo {
    pub id: i64,
    pub platform_ident: Option<i64>,
    pub sensor_type_ident: Option<i64>,
    pub method_ident: Option<i64>,
    pub type_name: String,
    pub timestamp_millis: Option<i64>,
}

impl RecordInfo {
    pub fn new(id: i64, type_name: impl Into<String>) -> Self {
        Self {
            id,
            platform_ident: None,
            sensor_type_ident: None,
            method_ident: None,
            type_name: type_name.into(),
            timestamp_millis: None,
        }
    }

    pub fn with_platform(mut self, platform_ident: i64) -> Self {
        self.platform_ident = Some(platform_ident);
        self
    }

    pub fn with_sensor_type(mut self, sensor_type_ident: i64) -> Self {
        self.sensor_type_ident = Some(sensor_type_ident);
        self
    }

    pub fn with_method(mut self, method_ident: i64) -> Self {
        self.method_ident = Some(method_ident);
        self
    }

    pub fn with_timestamp(mut self, timestamp_millis: i64) -> Self {
        self.timestamp_millis = Some(timestamp_millis);
        self
    }
}

impl IndexedElement for RecordInfo {
    fn id(&self) -> i64 {
        self.id
    }

    fn platform_ident(&self) -> Option<i64> {
        self.platform_ident
    }

    fn sensor_type_ident(&self) -> Option<i64> {
        self.sensor_type_ident
    }

    fn method_ident(&self) -> Option<i64> {
        self.method_ident
    }

    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn timestamp_millis(&self) -> Option<i64> {
        self.timestamp_millis
    }
}
