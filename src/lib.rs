// ============================================================================
// Loris: schema-driven data entry for laboratory databases
// ============================================================================

pub mod auth;
pub mod config;
pub mod context;
pub mod core;
pub mod declare;
pub mod diagram;
pub mod forms;
pub mod lab;
pub mod permission;
pub mod pipeline;
pub mod schema;
pub mod settings;
pub mod storage;
pub mod web;

// Re-export main types for convenience
pub use config::AppConfig;
pub use context::{AppContext, ContextError};
pub use core::{DbError, Result, Value};
pub use forms::{FormDescriptor, FormFactory, ValidationErrors};
pub use pipeline::{InsertError, InsertPipeline};
pub use storage::{Database, Tier};
pub use web::build_router;
