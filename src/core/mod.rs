pub mod error;
pub mod types;
pub mod value;

pub use error::{DbError, Result};
pub use types::{
    Attribute, AttributeType, DefaultValue, Heading, NONES, Restriction, Row, TemporalKind,
    is_none_text, parse_temporal,
};
pub use value::{Attachment, Value};
