//! Element types the indexing tree works with

mod record;

pub use record::{IndexedElement, RecordInfo};
