use crate::core::{DbError, Heading, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Table tier, mirroring how lab tables are declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Manual,
    Lookup,
    Part,
    Imported,
    Computed,
}

/// Metadata for one table: `schema.Table` or `schema.Table.Part`.
#[derive(Debug, Clone, Serialize)]
pub struct TableDescriptor {
    name: String,
    heading: Heading,
    tier: Tier,
    parts: Vec<String>,
}

impl TableDescriptor {
    pub fn new(name: impl Into<String>, heading: Heading, tier: Tier) -> Self {
        Self {
            name: name.into(),
            heading,
            tier,
            parts: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn heading(&self) -> &Heading {
        &self.heading
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn schema(&self) -> &str {
        self.name.split('.').next().unwrap_or_default()
    }

    /// Last path segment (`Subject` for `subjects.Subject`).
    pub fn table_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or_default()
    }

    pub fn master(&self) -> Option<&str> {
        if self.tier == Tier::Part {
            self.name.rfind('.').map(|idx| &self.name[..idx])
        } else {
            None
        }
    }

    pub fn part_tables(&self) -> &[String] {
        &self.parts
    }

    pub fn primary_key(&self) -> Vec<&str> {
        self.heading.primary_key()
    }

    /// Single-column primary key with at most one secondary attribute.
    pub fn is_manual_lookup(&self) -> bool {
        self.heading.primary_key().len() == 1 && self.heading.secondary_attributes().len() <= 1
    }
}

/// Directed edge child -> parent.
#[derive(Debug, Clone, Serialize)]
pub struct ForeignKey {
    pub child: String,
    pub parent: String,
    /// child attribute -> parent attribute
    pub attr_map: BTreeMap<String, String>,
    /// At least one attribute is renamed on the way to the parent.
    pub aliased: bool,
    pub nullable: bool,
}

impl ForeignKey {
    pub fn new(child: impl Into<String>, parent: impl Into<String>, attr_map: BTreeMap<String, String>) -> Self {
        let aliased = attr_map.iter().any(|(child_attr, parent_attr)| child_attr != parent_attr);
        Self {
            child: child.into(),
            parent: parent.into(),
            attr_map,
            aliased,
            nullable: false,
        }
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Parent attribute referenced by a child attribute.
    pub fn parent_attr(&self, child_attr: &str) -> Option<&str> {
        self.attr_map.get(child_attr).map(String::as_str)
    }

    /// Child attribute referencing a parent attribute.
    pub fn child_attr(&self, parent_attr: &str) -> Option<&str> {
        self.attr_map
            .iter()
            .find(|(_, parent)| parent.as_str() == parent_attr)
            .map(|(child, _)| child.as_str())
    }
}

/// Table metadata and the foreign-key graph.
/// Immutable after creation: cloning is cheap and copy-on-write.
#[derive(Clone, Default)]
pub struct Catalog {
    tables: Arc<BTreeMap<String, TableDescriptor>>,
    foreign_keys: Arc<Vec<ForeignKey>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table and its outgoing foreign keys; returns a new catalog.
    pub fn with_table(self, descriptor: TableDescriptor, foreign_keys: Vec<ForeignKey>) -> Result<Self> {
        let name = descriptor.name().to_string();

        if self.tables.contains_key(&name) {
            return Err(DbError::TableExists(name));
        }

        for attr in descriptor.heading().attributes() {
            if attr.in_key && attr.nullable {
                return Err(DbError::ConstraintViolation(format!(
                    "primary key attribute '{}' of '{}' cannot be nullable",
                    attr.name, name
                )));
            }
        }
        if descriptor.primary_key().is_empty() {
            return Err(DbError::ConstraintViolation(format!(
                "table '{}' has no primary key",
                name
            )));
        }

        for fk in &foreign_keys {
            self.check_foreign_key(&descriptor, fk)?;
        }

        let mut tables = (*self.tables).clone();
        if descriptor.tier() == Tier::Part {
            let master = descriptor
                .master()
                .ok_or_else(|| DbError::ParseError(format!("part table '{}' has no master", name)))?
                .to_string();
            let master_descriptor = tables
                .get_mut(&master)
                .ok_or_else(|| DbError::TableNotFound(master.clone()))?;
            master_descriptor.parts.push(name.clone());
        }
        tables.insert(name, descriptor);

        let mut fks = (*self.foreign_keys).clone();
        fks.extend(foreign_keys);

        Ok(Self {
            tables: Arc::new(tables),
            foreign_keys: Arc::new(fks),
        })
    }

    /// Add a reference between two declared tables, e.g. to close a cycle.
    pub fn with_foreign_key(self, fk: ForeignKey) -> Result<Self> {
        let child = self.get_table(&fk.child)?.clone();
        self.check_foreign_key(&child, &fk)?;

        let mut fks = (*self.foreign_keys).clone();
        fks.push(fk);
        Ok(Self {
            tables: self.tables,
            foreign_keys: Arc::new(fks),
        })
    }

    fn check_foreign_key(&self, descriptor: &TableDescriptor, fk: &ForeignKey) -> Result<()> {
        let parent = if fk.parent == descriptor.name() {
            descriptor
        } else {
            self.get_table(&fk.parent)?
        };
        let parent_key = parent.primary_key();

        for (child_attr, parent_attr) in &fk.attr_map {
            if !descriptor.heading().contains(child_attr) {
                return Err(DbError::AttributeNotFound(child_attr.clone(), descriptor.name().to_string()));
            }
            if !parent_key.contains(&parent_attr.as_str()) {
                return Err(DbError::ForeignKeyViolation(format!(
                    "'{}.{}' must reference a primary key attribute of '{}', not '{}'",
                    descriptor.name(),
                    child_attr,
                    fk.parent,
                    parent_attr
                )));
            }
        }
        if fk.attr_map.len() != parent_key.len() {
            return Err(DbError::ForeignKeyViolation(format!(
                "reference from '{}' must cover the full primary key of '{}'",
                descriptor.name(),
                fk.parent
            )));
        }
        Ok(())
    }

    pub fn get_table(&self, name: &str) -> Result<&TableDescriptor> {
        self.tables
            .get(name)
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn list_tables(&self) -> Vec<&str> {
        self.tables.keys().map(|s| s.as_str()).collect()
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.tables.values()
    }

    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    /// Outgoing references of `table`.
    pub fn parents(&self, table: &str) -> Vec<&ForeignKey> {
        self.foreign_keys.iter().filter(|fk| fk.child == table).collect()
    }

    /// Incoming references to `table`.
    pub fn children(&self, table: &str) -> Vec<&ForeignKey> {
        self.foreign_keys.iter().filter(|fk| fk.parent == table).collect()
    }

    /// The reference carrying `attr` of `table`, if the attribute is foreign.
    pub fn foreign_key_for(&self, table: &str, attr: &str) -> Option<&ForeignKey> {
        self.foreign_keys
            .iter()
            .find(|fk| fk.child == table && fk.attr_map.contains_key(attr))
    }

    /// Remove a table; fails while other tables still reference it.
    pub fn without_table(self, name: &str) -> Result<Self> {
        let descriptor = self.get_table(name)?;
        if let Some(fk) = self.children(name).into_iter().find(|fk| fk.child != name && !descriptor.parts.contains(&fk.child)) {
            return Err(DbError::ForeignKeyViolation(format!(
                "table '{}' is still referenced by '{}'",
                name, fk.child
            )));
        }

        let mut removed = vec![name.to_string()];
        removed.extend(descriptor.parts.iter().cloned());

        let mut tables = (*self.tables).clone();
        for table in &removed {
            tables.remove(table);
        }
        if let Some(master) = name.rfind('.').map(|idx| &name[..idx])
            && let Some(master_descriptor) = tables.get_mut(master)
        {
            master_descriptor.parts.retain(|part| part != name);
        }

        let fks = self
            .foreign_keys
            .iter()
            .filter(|fk| !removed.contains(&fk.child))
            .cloned()
            .collect();

        Ok(Self {
            tables: Arc::new(tables),
            foreign_keys: Arc::new(fks),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Attribute, AttributeType};

    fn lookup(name: &str, key: &str) -> TableDescriptor {
        TableDescriptor::new(
            name,
            Heading::new(vec![
                Attribute::new(key, AttributeType::String { max_length: Some(63), fixed: false }, "varchar(63)").primary(),
            ]),
            Tier::Manual,
        )
    }

    #[test]
    fn test_copy_on_write() {
        let catalog = Catalog::new();
        let first = catalog.clone().with_table(lookup("core.A", "a"), vec![]).unwrap();
        assert!(!catalog.table_exists("core.A"));
        assert!(first.table_exists("core.A"));
    }

    #[test]
    fn test_alias_must_target_parent_key() {
        let catalog = Catalog::new().with_table(lookup("core.A", "a"), vec![]).unwrap();
        let child = TableDescriptor::new(
            "core.B",
            Heading::new(vec![
                Attribute::new("b", AttributeType::Integer, "int").primary(),
                Attribute::new("other", AttributeType::String { max_length: Some(63), fixed: false }, "varchar(63)"),
            ]),
            Tier::Manual,
        );
        let bad = ForeignKey::new("core.B", "core.A", BTreeMap::from([("other".into(), "missing".into())]));
        assert!(catalog.clone().with_table(child.clone(), vec![bad]).is_err());

        let good = ForeignKey::new("core.B", "core.A", BTreeMap::from([("other".into(), "a".into())]));
        assert!(good.aliased);
        let catalog = catalog.with_table(child, vec![good]).unwrap();
        assert_eq!(catalog.parents("core.B").len(), 1);
        assert_eq!(catalog.children("core.A").len(), 1);
        assert!(catalog.foreign_key_for("core.B", "other").is_some());
    }

    #[test]
    fn test_nullable_primary_key_rejected() {
        let table = TableDescriptor::new(
            "core.C",
            Heading::new(vec![Attribute::new("c", AttributeType::Integer, "int").primary().nullable()]),
            Tier::Manual,
        );
        assert!(Catalog::new().with_table(table, vec![]).is_err());
    }
}
