//! Custom attribute types (`<name>` in table definitions).
//!
//! An adapter names the storage type its values are written as and checks or
//! converts each value before it reaches the store.

use crate::core::{DbError, Result, Value};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

lazy_static::lazy_static! {
    static ref URL_REGEX: Regex = Regex::new(concat!(
        r"(?i)^(?:http|ftp)s?://",
        r"(?:(?:[A-Z0-9](?:[A-Z0-9-]{0,61}[A-Z0-9])?\.)+(?:[A-Z]{2,6}\.?|[A-Z0-9-]{2,}\.?)|",
        r"localhost|",
        r"\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})",
        r"(?::\d+)?",
        r"(?:/?|[/?]\S+)$",
    ))
    .unwrap();
}

pub fn is_url(text: &str) -> bool {
    URL_REGEX.is_match(text)
}

pub trait AttributeAdapter: Send + Sync {
    /// Declared storage type, e.g. `varchar(511)` or `attach@attachstore`.
    fn attribute_type(&self) -> &str;

    /// Check and convert a value before it is written.
    fn put(&self, value: Value) -> Result<Value>;

    /// Convert a stored value back for display.
    fn get(&self, value: Value) -> Value {
        value
    }
}

fn expect_text(adapter: &str, value: Value) -> Result<Value> {
    match value {
        Value::Null | Value::Text(_) => Ok(value),
        other => Err(DbError::TypeMismatch(format!(
            "{} attribute expects a string, got {}",
            adapter,
            other.type_name()
        ))),
    }
}

/// Boolean stored as `bool`; accepts numeric flags.
pub struct TrueBool;

impl AttributeAdapter for TrueBool {
    fn attribute_type(&self) -> &str {
        "bool"
    }

    fn put(&self, value: Value) -> Result<Value> {
        match value {
            Value::Null => Ok(Value::Null),
            Value::Float(f) if f.is_nan() => Ok(Value::Null),
            Value::Boolean(_) => Ok(value),
            Value::Integer(i) => Ok(Value::Boolean(i != 0)),
            Value::Float(f) => Ok(Value::Boolean(f != 0.0)),
            Value::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => Ok(Value::Boolean(true)),
                "0" | "false" | "no" => Ok(Value::Boolean(false)),
                _ => Err(DbError::TypeMismatch(format!("'{}' is not a boolean", s))),
            },
            other => Err(DbError::TypeMismatch(format!(
                "truebool attribute cannot store {}",
                other.type_name()
            ))),
        }
    }
}

/// Chromosome description.
pub struct Chromosome;

impl AttributeAdapter for Chromosome {
    fn attribute_type(&self) -> &str {
        "varchar(511)"
    }

    fn put(&self, value: Value) -> Result<Value> {
        expect_text("chromosome", value)
    }
}

pub struct Link;

impl AttributeAdapter for Link {
    fn attribute_type(&self) -> &str {
        "varchar(511)"
    }

    fn put(&self, value: Value) -> Result<Value> {
        let value = expect_text("link", value)?;
        if let Value::Text(url) = &value
            && !is_url(url)
        {
            return Err(DbError::TypeMismatch(format!("string {} is not a url", url)));
        }
        Ok(value)
    }
}

pub struct FlyIdentifier;

impl AttributeAdapter for FlyIdentifier {
    fn attribute_type(&self) -> &str {
        "varchar(255)"
    }

    fn put(&self, value: Value) -> Result<Value> {
        expect_text("fly identifier", value)
    }
}

/// Crossing schema document kept as an attachment.
pub struct CrossSchema;

impl AttributeAdapter for CrossSchema {
    fn attribute_type(&self) -> &str {
        "attach@attachstore"
    }

    fn put(&self, value: Value) -> Result<Value> {
        match value {
            Value::Null | Value::Attachment(_) => Ok(value),
            other => Err(DbError::TypeMismatch(format!(
                "crossschema attribute expects a file, got {}",
                other.type_name()
            ))),
        }
    }
}

/// Comma-separated tags, stored normalised as `a, b, c`.
pub struct Tags;

impl AttributeAdapter for Tags {
    fn attribute_type(&self) -> &str {
        "varchar(4000)"
    }

    fn put(&self, value: Value) -> Result<Value> {
        match expect_text("tags", value)? {
            Value::Text(text) => {
                let tags: Vec<&str> = text
                    .split(',')
                    .map(str::trim)
                    .filter(|tag| !tag.is_empty())
                    .collect();
                if tags.is_empty() {
                    Ok(Value::Null)
                } else {
                    Ok(Value::Text(tags.join(", ")))
                }
            }
            other => Ok(other),
        }
    }
}

/// Short identifier used as the key of manual lookup tables.
pub struct LookupName;

impl AttributeAdapter for LookupName {
    fn attribute_type(&self) -> &str {
        "varchar(63)"
    }

    fn put(&self, value: Value) -> Result<Value> {
        match expect_text("lookup name", value)? {
            Value::Text(text) => {
                let name = text.trim();
                if name.is_empty() || crate::core::is_none_text(name) {
                    return Err(DbError::ConstraintViolation(
                        "lookup name cannot be empty".to_string(),
                    ));
                }
                Ok(Value::Text(name.to_string()))
            }
            other => Ok(other),
        }
    }
}

/// Named adapters available to table definitions.
#[derive(Clone)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn AttributeAdapter>>,
}

impl AdapterRegistry {
    pub fn empty() -> Self {
        Self {
            adapters: BTreeMap::new(),
        }
    }

    pub fn register(mut self, name: impl Into<String>, adapter: Arc<dyn AttributeAdapter>) -> Self {
        self.adapters.insert(name.into(), adapter);
        self
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn AttributeAdapter>> {
        self.adapters
            .get(name)
            .ok_or_else(|| DbError::ParseError(format!("unknown attribute adapter <{}>", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }

    /// Run the named adapter's `put`.
    pub fn put(&self, name: &str, value: Value) -> Result<Value> {
        self.get(name)?.put(value)
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        let truebool: Arc<dyn AttributeAdapter> = Arc::new(TrueBool);
        Self::empty()
            .register("truebool", truebool.clone())
            .register("bool", truebool)
            .register("chr", Arc::new(Chromosome))
            .register("link", Arc::new(Link))
            .register("flyidentifier", Arc::new(FlyIdentifier))
            .register("crossschema", Arc::new(CrossSchema))
            .register("tags", Arc::new(Tags))
            .register("lookupname", Arc::new(LookupName))
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.adapters.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_requires_url() {
        let registry = AdapterRegistry::default();
        assert!(registry.put("link", Value::from("https://example.org/fly")).is_ok());
        assert!(registry.put("link", Value::from("localhost")).is_err());
        assert_eq!(registry.put("link", Value::Null).unwrap(), Value::Null);
    }

    #[test]
    fn test_truebool_from_flags() {
        let registry = AdapterRegistry::default();
        assert_eq!(registry.put("truebool", Value::Integer(0)).unwrap(), Value::Boolean(false));
        assert_eq!(registry.put("bool", Value::from("1")).unwrap(), Value::Boolean(true));
        assert_eq!(registry.put("truebool", Value::Float(f64::NAN)).unwrap(), Value::Null);
    }

    #[test]
    fn test_tags_normalised() {
        let registry = AdapterRegistry::default();
        assert_eq!(
            registry.put("tags", Value::from(" a,b ,, c")).unwrap(),
            Value::from("a, b, c")
        );
        assert_eq!(registry.put("tags", Value::from(" , ")).unwrap(), Value::Null);
    }

    #[test]
    fn test_unknown_adapter() {
        assert!(AdapterRegistry::default().get("folder").is_err());
    }
}
