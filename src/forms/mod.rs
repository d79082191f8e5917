//! Form descriptors derived from table headings.
//!
//! A form is a serializable tree of [`FormField`]s. Each leaf carries the
//! widget metadata the client renders and a [`PostProcess`] step that turns
//! the submitted text back into a stored [`Value`](crate::core::Value).

pub mod config_form;
pub mod decode;
pub mod descriptor;
pub mod field;
pub mod form;

pub use config_form::build_config_form;
pub use descriptor::{
    Choice, ChoiceSource, FieldMeta, FieldNode, FormDescriptor, FormField, JsonShape, PostProcess,
    Validator, WidgetKind,
};
pub use field::{FieldContext, FieldFactory};
pub use form::{FormCache, FormFactory};

use crate::core::DbError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Choice value that asks for a new parent row to be created.
pub const NEW_ENTRY: &str = "<new>";
pub const NEW_ENTRY_LABEL: &str = "<add new entry>";
pub const NULL_CHOICE: &str = "NULL";
/// Name of the selection field inside a parent sub-form.
pub const EXISTING_ENTRIES: &str = "existing_entries";
/// Nesting bound for parent sub-forms, part lists and settings sub-forms.
pub const MAX_FORM_DEPTH: usize = 4;

/// Failure converting one submitted value.
#[derive(Error, Debug)]
pub enum FieldError {
    #[error(transparent)]
    Type(#[from] DbError),

    #[error("cannot read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot decode '{path}': {reason}")]
    Decode { path: String, reason: String },

    #[error("invalid JSON: {0}")]
    Json(String),

    #[error("{0}")]
    Shape(String),

    #[error("'{0}' is not a valid choice")]
    Choice(String),

    #[error("file extension '{0}' is not supported")]
    UnsupportedExtension(String),
}

/// Validation messages keyed by field path (`subject.existing_entries`,
/// `EmergencyContact.0.phone`).
#[derive(Error, Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationErrors {
    pub errors: BTreeMap<String, Vec<String>>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.entry(path.into()).or_default().push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn get(&self, path: &str) -> Option<&[String]> {
        self.errors.get(path).map(Vec::as_slice)
    }

    /// Take over `other`'s messages with their paths nested under `prefix`.
    pub fn merge(&mut self, prefix: &str, other: ValidationErrors) {
        for (path, messages) in other.errors {
            self.errors
                .entry(format!("{}.{}", prefix, path))
                .or_default()
                .extend(messages);
        }
    }

    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (path, messages) in &self.errors {
            for message in messages {
                if !first {
                    write!(f, "; ")?;
                }
                write!(f, "{}: {}", path, message)?;
                first = false;
            }
        }
        Ok(())
    }
}
