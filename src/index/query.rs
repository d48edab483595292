//! Index queries
//!
//! Branches read the routing attributes to decide which children to visit,
//! leaves read `min_id` and the id filters.

use ahash::AHashSet;

/// Read side of a query against a storage tree
pub trait IndexQuery: Send + Sync {
    /// Smallest id to return; `0` means unbounded
    fn min_id(&self) -> i64;

    fn platform_ident(&self) -> Option<i64>;

    fn sensor_type_ident(&self) -> Option<i64>;

    fn method_ident(&self) -> Option<i64>;

    /// Record kinds to visit; `None` visits all
    fn object_types(&self) -> Option<&[String]>;

    /// Lower time bound in milliseconds (inclusive)
    fn from_date(&self) -> Option<i64>;

    /// Upper time bound in milliseconds (inclusive)
    fn to_date(&self) -> Option<i64>;

    /// When present, only these ids are returned
    fn include_ids(&self) -> Option<&AHashSet<i64>> {
        None
    }

    /// Ids that are never returned
    fn exclude_ids(&self) -> Option<&AHashSet<i64>> {
        None
    }

    /// Check one id against the include/exclude filters
    fn accepts_id(&self, id: i64) -> bool {
        if let Some(excluded) = self.exclude_ids() {
            if excluded.contains(&id) {
                return false;
            }
        }
        match self.include_ids() {
            Some(included) => included.contains(&id),
            None => true,
        }
    }
}

/// Query with routing attributes and a minimum id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicIndexQuery {
    pub min_id: i64,
    pub platform_ident: Option<i64>,
    pub sensor_type_ident: Option<i64>,
    pub method_ident: Option<i64>,
    pub object_types: Option<Vec<String>>,
    pub from_date: Option<i64>,
    pub to_date: Option<i64>,
}

impl BasicIndexQuery {
    /// Query matching everything
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_id(mut self, min_id: i64) -> Self {
        self.min_id = min_id;
        self
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

    pub fn with_object_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.object_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_time_range(mut self, from: Option<i64>, to: Option<i64>) -> Self {
        self.from_date = from;
        self.to_date = to;
        self
    }
}

impl IndexQuery for BasicIndexQuery {
    fn min_id(&self) -> i64 {
        self.min_id
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

    fn object_types(&self) -> Option<&[String]> {
        self.object_types.as_deref()
    }

    fn from_date(&self) -> Option<i64> {
        self.from_date
    }

    fn to_date(&self) -> Option<i64> {
        self.to_date
    }
}

/// Storage query: a basic query plus id include/exclude filters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageIndexQuery {
    pub base: BasicIndexQuery,
    pub include_ids: Option<AHashSet<i64>>,
    pub exclude_ids: Option<AHashSet<i64>>,
}

impl StorageIndexQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_base(base: BasicIndexQuery) -> Self {
        Self {
            base,
            ..Default::default()
        }
    }

    pub fn with_min_id(mut self, min_id: i64) -> Self {
        self.base.min_id = min_id;
        self
    }

    pub fn with_include_ids(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.include_ids = Some(ids.into_iter().collect());
        self
    }

    pub fn with_exclude_ids(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.exclude_ids = Some(ids.into_iter().collect());
        self
    }
}

impl IndexQuery for StorageIndexQuery {
    fn min_id(&self) -> i64 {
        self.base.min_id
    }

    fn platform_ident(&self) -> Option<i64> {
        self.base.platform_ident
    }

    fn sensor_type_ident(&self) -> Option<i64> {
        self.base.sensor_type_ident
    }

    fn method_ident(&self) -> Option<i64> {
        self.base.method_ident
    }

    fn object_types(&self) -> Option<&[String]> {
        self.base.object_types.as_deref()
    }

    fn from_date(&self) -> Option<i64> {
        self.base.from_date
    }

    fn to_date(&self) -> Option<i64> {
        self.base.to_date
    }

    fn include_ids(&self) -> Option<&AHashSet<i64>> {
        self.include_ids.as_ref()
    }

    fn exclude_ids(&self) -> Option<&AHashSet<i64>> {
        self.exclude_ids.as_ref()
    }
}
