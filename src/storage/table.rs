use super::TableDescriptor;
use crate::core::{DbError, Restriction, Result, Row, Value};
use std::collections::BTreeMap;

/// Row storage for one table, keyed by primary-key values.
#[derive(Debug, Clone)]
pub struct Table {
    descriptor: TableDescriptor,
    rows: BTreeMap<Vec<Value>, Row>,
}

impl Table {
    pub fn new(descriptor: TableDescriptor) -> Self {
        Self {
            descriptor,
            rows: BTreeMap::new(),
        }
    }

    pub fn descriptor(&self) -> &TableDescriptor {
        &self.descriptor
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn key_of(&self, row: &Row) -> Vec<Value> {
        self.descriptor
            .primary_key()
            .iter()
            .map(|attr| row.get(*attr).cloned().unwrap_or(Value::Null))
            .collect()
    }

    fn format_key(&self, key: &[Value]) -> String {
        let parts: Vec<String> = self
            .descriptor
            .primary_key()
            .iter()
            .zip(key)
            .map(|(attr, value)| format!("{}={}", attr, value))
            .collect();
        parts.join(", ")
    }

    /// Fill defaults, reject unknown attributes and validate types.
    pub fn complete_row(&self, mut row: Row) -> Result<Row> {
        let heading = self.descriptor.heading();

        if let Some(unknown) = row.keys().find(|name| !heading.contains(name)) {
            return Err(DbError::AttributeNotFound(unknown.clone(), self.descriptor.name().to_string()));
        }

        for attr in heading.attributes() {
            let value = match row.remove(&attr.name) {
                Some(Value::Null) | None if attr.auto_increment => self.next_auto_increment(&attr.name),
                Some(Value::Null) | None => attr.default_value().ok_or_else(|| {
                    DbError::ConstraintViolation(format!(
                        "Attribute '{}' of '{}' requires a value",
                        attr.name,
                        self.descriptor.name()
                    ))
                })?,
                Some(value) => value,
            };
            attr.validate(&value)?;
            row.insert(attr.name.clone(), value);
        }

        Ok(row)
    }

    pub fn insert(&mut self, row: Row) -> Result<Vec<Value>> {
        let row = self.complete_row(row)?;
        let key = self.key_of(&row);

        if self.rows.contains_key(&key) {
            return Err(DbError::DuplicateEntry {
                table: self.descriptor.name().to_string(),
                key: self.format_key(&key),
            });
        }

        self.rows.insert(key.clone(), row);
        Ok(key)
    }

    /// Overwrite the listed attributes of every row matching `restriction`.
    pub fn update(&mut self, restriction: &Restriction, values: &Row) -> Result<usize> {
        let heading = self.descriptor.heading();
        for (name, value) in values {
            let attr = heading
                .get(name)
                .ok_or_else(|| DbError::AttributeNotFound(name.clone(), self.descriptor.name().to_string()))?;
            if attr.in_key {
                return Err(DbError::ConstraintViolation(format!(
                    "primary key attribute '{}' cannot be updated",
                    name
                )));
            }
            attr.validate(value)?;
        }

        let mut updated = 0;
        for row in self.rows.values_mut() {
            if matches(row, restriction) {
                for (name, value) in values {
                    row.insert(name.clone(), value.clone());
                }
                updated += 1;
            }
        }
        Ok(updated)
    }

    pub fn delete(&mut self, restriction: &Restriction) -> Vec<Row> {
        let keys: Vec<Vec<Value>> = self
            .rows
            .iter()
            .filter(|(_, row)| matches(row, restriction))
            .map(|(key, _)| key.clone())
            .collect();

        keys.iter().filter_map(|key| self.rows.remove(key)).collect()
    }

    pub fn scan(&self) -> impl Iterator<Item = &Row> {
        self.rows.values()
    }

    pub fn restrict<'a>(&'a self, restriction: &'a Restriction) -> impl Iterator<Item = &'a Row> + 'a {
        self.rows.values().filter(move |row| matches(row, restriction))
    }

    pub fn contains(&self, restriction: &Restriction) -> bool {
        self.restrict(restriction).next().is_some()
    }

    fn next_auto_increment(&self, attr: &str) -> Value {
        let next = self.max_of(attr).and_then(|v| v.as_i64()).map_or(1, |max| max + 1);
        Value::Integer(next)
    }

    pub fn max_of(&self, attr: &str) -> Option<Value> {
        self.rows
            .values()
            .filter_map(|row| row.get(attr))
            .filter(|value| !value.is_null())
            .max()
            .cloned()
    }
}

fn matches(row: &Row, restriction: &Restriction) -> bool {
    restriction
        .iter()
        .all(|(name, value)| row.get(name).is_some_and(|stored| stored == value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Attribute, AttributeType, Heading};
    use crate::storage::Tier;

    fn subjects() -> Table {
        Table::new(TableDescriptor::new(
            "subjects.Subject",
            Heading::new(vec![
                Attribute::new("subject_id", AttributeType::Integer, "int").primary(),
                Attribute::new("age", AttributeType::Float, "float").nullable(),
            ]),
            Tier::Manual,
        ))
    }

    #[test]
    fn test_insert_fills_defaults_and_rejects_duplicates() {
        let mut table = subjects();
        table
            .insert(Row::from([("subject_id".to_string(), Value::Integer(1))]))
            .unwrap();
        let stored = table.scan().next().unwrap();
        assert_eq!(stored.get("age"), Some(&Value::Null));

        let err = table
            .insert(Row::from([("subject_id".to_string(), Value::Integer(1))]))
            .unwrap_err();
        assert!(matches!(err, DbError::DuplicateEntry { .. }));
    }

    #[test]
    fn test_update_counts_rows() {
        let mut table = subjects();
        table
            .insert(Row::from([("subject_id".to_string(), Value::Integer(1))]))
            .unwrap();
        let restriction = Restriction::from([("subject_id".to_string(), Value::Integer(1))]);
        let values = Row::from([("age".to_string(), Value::Float(3.5))]);
        assert_eq!(table.update(&restriction, &values).unwrap(), 1);

        let missing = Restriction::from([("subject_id".to_string(), Value::Integer(9))]);
        assert_eq!(table.update(&missing, &values).unwrap(), 0);
    }

    #[test]
    fn test_auto_increment_fills_missing_key() {
        let mut attr = Attribute::new("recording_id", AttributeType::Integer, "int auto_increment").primary();
        attr.auto_increment = true;
        let mut table = Table::new(TableDescriptor::new(
            "recordings.Recording",
            Heading::new(vec![attr]),
            Tier::Manual,
        ));

        let first = table.insert(Row::new()).unwrap();
        let second = table.insert(Row::new()).unwrap();
        assert_eq!(first, vec![Value::Integer(1)]);
        assert_eq!(second, vec![Value::Integer(2)]);
    }

    #[test]
    fn test_max_of() {
        let mut table = subjects();
        assert_eq!(table.max_of("subject_id"), None);
        for id in [3, 1, 2] {
            table
                .insert(Row::from([("subject_id".to_string(), Value::Integer(id))]))
                .unwrap();
        }
        assert_eq!(table.max_of("subject_id"), Some(Value::Integer(3)));
    }
}
