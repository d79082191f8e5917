pub mod catalog;
pub mod database;
pub mod table;

pub use catalog::{Catalog, ForeignKey, TableDescriptor, Tier};
pub use database::Database;
pub use table::Table;
