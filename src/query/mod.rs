pub mod answer;
pub mod cache;
pub mod reducer;
pub mod registry;
pub mod tools;
pub mod types;

pub use cache::MetadataCache;
pub use reducer::{Accumulator, Outcome};
pub use registry::QueryRegistry;
pub use types::{
    BoundingBox, PageId, PageMeta, Pointer, Query, QueryCompletion, QueryId, QueryResponse,
    QueryStatus, SelectedPage, TraceStep,
};
