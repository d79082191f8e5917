use super::{DbError, Result, Value};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// One stored row, keyed by attribute name.
pub type Row = BTreeMap<String, Value>;

/// Attribute-equality restriction (`table & {"subject_id": 3}`).
pub type Restriction = BTreeMap<String, Value>;

/// Values treated as "nothing submitted".
pub const NONES: [&str; 5] = ["", "None", "null", "NONE", "NULL"];

pub fn is_none_text(text: &str) -> bool {
    NONES.contains(&text.trim())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporalKind {
    Date,
    DateTime,
    Timestamp,
    Time,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttributeType {
    Integer,
    Decimal,
    Float,
    String { max_length: Option<usize>, fixed: bool },
    Enum { choices: Vec<String> },
    Bool,
    Temporal { temporal: TemporalKind },
    Blob { store: Option<String> },
    Attach { store: Option<String> },
    Filepath { store: Option<String> },
    Uuid,
    /// Custom adapter type (`<name>`) stored as `storage`.
    Adapted { adapter: String, storage: Box<AttributeType> },
    /// SQL type with no widget mapping.
    Unsupported { sql_type: String },
}

impl AttributeType {
    /// Underlying storage type, following adapters.
    pub fn base(&self) -> &AttributeType {
        match self {
            Self::Adapted { storage, .. } => storage.base(),
            other => other,
        }
    }

    pub fn is_blob(&self) -> bool {
        matches!(self.base(), Self::Blob { .. })
    }

    pub fn is_attachment(&self) -> bool {
        matches!(self.base(), Self::Attach { .. })
    }

    pub fn is_binary(&self) -> bool {
        self.is_blob() || self.is_attachment()
    }

    pub fn accepts(&self, value: &Value) -> bool {
        match (self.base(), value) {
            (_, Value::Null) => true,
            (Self::Integer, Value::Integer(_)) => true,
            (Self::Integer, Value::Float(f)) => f.fract() == 0.0,
            (Self::Decimal | Self::Float, Value::Float(_) | Value::Integer(_)) => true,
            (Self::String { max_length, fixed }, Value::Text(s)) => match max_length {
                Some(n) if *fixed => s.chars().count() == *n,
                Some(n) => s.chars().count() <= *n,
                None => true,
            },
            (Self::Enum { choices }, Value::Text(s)) => choices.iter().any(|c| c == s),
            (Self::Bool, Value::Boolean(_)) => true,
            (Self::Temporal { temporal: TemporalKind::Date }, Value::Date(_)) => true,
            (
                Self::Temporal { temporal: TemporalKind::DateTime | TemporalKind::Timestamp },
                Value::DateTime(_),
            ) => true,
            (Self::Temporal { temporal: TemporalKind::Time }, Value::Time(_)) => true,
            (Self::Blob { .. }, Value::Blob(_)) => true,
            (Self::Attach { .. }, Value::Attachment(_)) => true,
            (Self::Filepath { .. }, Value::Text(_)) => true,
            (Self::Uuid, Value::Uuid(_)) => true,
            _ => false,
        }
    }

    /// Convert submitted JSON (usually text from a form) into a typed value.
    pub fn coerce(&self, json: &serde_json::Value) -> Result<Value> {
        use serde_json::Value as Json;

        let text = match json {
            Json::Null => return Ok(Value::Null),
            Json::String(s) if is_none_text(s) => return Ok(Value::Null),
            Json::String(s) => s.trim().to_string(),
            other => other.to_string(),
        };
        let mismatch = |what: &str| {
            DbError::TypeMismatch(format!("'{}' is not a valid {}", text, what))
        };

        let value = match self.base() {
            Self::Integer => match json {
                Json::Number(n) if n.is_i64() => Value::Integer(n.as_i64().unwrap_or_default()),
                _ => Value::Integer(text.parse().map_err(|_| mismatch("integer"))?),
            },
            Self::Decimal | Self::Float => match json {
                Json::Number(n) => Value::Float(n.as_f64().ok_or_else(|| mismatch("number"))?),
                _ => Value::Float(text.parse().map_err(|_| mismatch("number"))?),
            },
            Self::Bool => match json {
                Json::Bool(b) => Value::Boolean(*b),
                _ => match text.to_ascii_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" => Value::Boolean(true),
                    "0" | "false" | "no" | "off" => Value::Boolean(false),
                    _ => return Err(mismatch("boolean")),
                },
            },
            Self::Temporal { temporal } => parse_temporal(*temporal, &text)
                .ok_or_else(|| mismatch("date/time"))?,
            Self::Uuid => Value::Uuid(Uuid::parse_str(&text).map_err(|_| mismatch("uuid"))?),
            Self::Blob { .. } => Value::Blob(json.clone()),
            Self::String { .. } | Self::Enum { .. } | Self::Filepath { .. } => Value::Text(text),
            Self::Attach { .. } => {
                return Err(DbError::TypeMismatch(
                    "attachments must be submitted as files".to_string(),
                ));
            }
            Self::Adapted { .. } | Self::Unsupported { .. } => Value::Text(text),
        };

        Ok(value)
    }
}

pub fn parse_temporal(kind: TemporalKind, text: &str) -> Option<Value> {
    match kind {
        TemporalKind::Date => NaiveDate::parse_from_str(text, "%Y-%m-%d").ok().map(Value::Date),
        TemporalKind::DateTime | TemporalKind::Timestamp => ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
            .map(Value::DateTime),
        TemporalKind::Time => ["%H:%M:%S", "%H:%M"]
            .iter()
            .find_map(|fmt| NaiveTime::parse_from_str(text, fmt).ok())
            .map(Value::Time),
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer => write!(f, "INTEGER"),
            Self::Decimal => write!(f, "DECIMAL"),
            Self::Float => write!(f, "FLOAT"),
            Self::String { .. } => write!(f, "STRING"),
            Self::Enum { .. } => write!(f, "ENUM"),
            Self::Bool => write!(f, "BOOL"),
            Self::Temporal { .. } => write!(f, "TEMPORAL"),
            Self::Blob { .. } => write!(f, "BLOB"),
            Self::Attach { .. } => write!(f, "ATTACH"),
            Self::Filepath { .. } => write!(f, "FILEPATH"),
            Self::Uuid => write!(f, "UUID"),
            Self::Adapted { adapter, .. } => write!(f, "ADAPTED<{}>", adapter),
            Self::Unsupported { sql_type } => write!(f, "UNSUPPORTED({})", sql_type),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultValue {
    Null,
    CurrentTimestamp,
    Value(Value),
}

#[derive(Debug, Clone, Serialize)]
pub struct Attribute {
    pub name: String,
    pub attr_type: AttributeType,
    pub sql_type: String,
    pub nullable: bool,
    pub default: Option<DefaultValue>,
    pub in_key: bool,
    pub comment: String,
    pub auto_increment: bool,
}

impl Attribute {
    pub fn new(name: impl Into<String>, attr_type: AttributeType, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attr_type,
            sql_type: sql_type.into(),
            nullable: false,
            default: None,
            in_key: false,
            comment: String::new(),
            auto_increment: false,
        }
    }

    pub fn primary(mut self) -> Self {
        self.in_key = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self.default = Some(DefaultValue::Null);
        self
    }

    pub fn with_default(mut self, default: DefaultValue) -> Self {
        if default == DefaultValue::Null {
            self.nullable = true;
        }
        self.default = Some(default);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    /// A default exists and is something other than NULL.
    pub fn has_nonnull_default(&self) -> bool {
        matches!(
            self.default,
            Some(DefaultValue::Value(_)) | Some(DefaultValue::CurrentTimestamp)
        )
    }

    /// Value written when the attribute is missing from an insert.
    pub fn default_value(&self) -> Option<Value> {
        match &self.default {
            Some(DefaultValue::Null) => Some(Value::Null),
            Some(DefaultValue::Value(v)) => Some(v.clone()),
            Some(DefaultValue::CurrentTimestamp) => {
                Some(Value::DateTime(chrono::Local::now().naive_local()))
            }
            None if self.nullable => Some(Value::Null),
            None => None,
        }
    }

    pub fn validate(&self, value: &Value) -> Result<()> {
        if value.is_null() {
            if !self.nullable {
                return Err(DbError::ConstraintViolation(format!(
                    "Attribute '{}' cannot be NULL",
                    self.name
                )));
            }
            return Ok(());
        }

        if !self.attr_type.accepts(value) {
            return Err(DbError::TypeMismatch(format!(
                "Attribute '{}' expects type {} ({}), got {}",
                self.name,
                self.attr_type,
                self.sql_type,
                value.type_name()
            )));
        }

        Ok(())
    }
}

/// Ordered attributes of one table.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Heading {
    attributes: Vec<Attribute>,
}

impl Heading {
    pub fn new(attributes: Vec<Attribute>) -> Self {
        Self { attributes }
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|attr| attr.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn primary_key(&self) -> Vec<&str> {
        self.attributes
            .iter()
            .filter(|attr| attr.in_key)
            .map(|attr| attr.name.as_str())
            .collect()
    }

    pub fn secondary_attributes(&self) -> Vec<&str> {
        self.attributes
            .iter()
            .filter(|attr| !attr.in_key)
            .map(|attr| attr.name.as_str())
            .collect()
    }

    pub fn non_blobs(&self) -> Vec<&str> {
        self.attributes
            .iter()
            .filter(|attr| !attr.attr_type.is_binary())
            .map(|attr| attr.name.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn varchar(n: usize) -> AttributeType {
        AttributeType::String { max_length: Some(n), fixed: false }
    }

    #[test]
    fn test_type_compatibility() {
        assert!(AttributeType::Integer.accepts(&Value::Integer(42)));
        assert!(AttributeType::Integer.accepts(&Value::Null));
        assert!(!AttributeType::Integer.accepts(&Value::Text("hello".into())));
        assert!(varchar(3).accepts(&Value::Text("abc".into())));
        assert!(!varchar(3).accepts(&Value::Text("abcd".into())));
    }

    #[test]
    fn test_coerce_from_form_text() {
        assert_eq!(AttributeType::Integer.coerce(&json!("7")).unwrap(), Value::Integer(7));
        assert_eq!(AttributeType::Bool.coerce(&json!("0")).unwrap(), Value::Boolean(false));
        assert_eq!(AttributeType::Float.coerce(&json!("None")).unwrap(), Value::Null);
        let date = AttributeType::Temporal { temporal: TemporalKind::Date }
            .coerce(&json!("2021-03-04"))
            .unwrap();
        assert_eq!(date, Value::Date(NaiveDate::from_ymd_opt(2021, 3, 4).unwrap()));
        assert!(AttributeType::Integer.coerce(&json!("seven")).is_err());
    }

    #[test]
    fn test_adapted_accepts_storage_values() {
        let adapted = AttributeType::Adapted {
            adapter: "truebool".into(),
            storage: Box::new(AttributeType::Bool),
        };
        assert!(adapted.accepts(&Value::Boolean(true)));
        assert!(!adapted.accepts(&Value::Integer(1)));
    }

    #[test]
    fn test_not_null_validation() {
        let attr = Attribute::new("name", varchar(10), "varchar(10)");
        assert!(attr.validate(&Value::Null).is_err());
        assert!(attr.clone().nullable().validate(&Value::Null).is_ok());
    }
}
