pub mod adapters;
pub mod registry;

pub use adapters::{AdapterRegistry, AttributeAdapter, is_url};
pub use registry::{SchemaRegistry, TableSummary};
