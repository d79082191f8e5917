use crate::core::{DbError, Result};
use crate::storage::{Catalog, ForeignKey, TableDescriptor, Tier};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

/// Listing entry for one registered table.
#[derive(Debug, Clone, Serialize)]
pub struct TableSummary {
    pub name: String,
    pub schema: String,
    pub tier: Tier,
    pub primary_key: Vec<String>,
    pub parts: Vec<String>,
}

/// Snapshot of the catalog taken at the last refresh, grouped by schema.
#[derive(Clone, Default)]
pub struct SchemaRegistry {
    catalog: Catalog,
    schemata: BTreeMap<String, Vec<String>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-read tables from `catalog`, leaving out reserved schemas.
    pub fn refresh(&mut self, catalog: &Catalog, skip_schemas: &[String]) {
        let mut schemata: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for table in catalog.tables() {
            let schema = table.schema();
            if skip_schemas.iter().any(|skip| skip == schema) {
                continue;
            }
            schemata.entry(schema.to_string()).or_default().push(table.name().to_string());
        }

        self.catalog = catalog.clone();
        self.schemata = schemata;
        info!(schemata = self.schemata.len(), tables = self.len(), "schema registry refreshed");
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn schemata(&self) -> impl Iterator<Item = &str> {
        self.schemata.keys().map(String::as_str)
    }

    /// Master and part tables of `schema`, in name order.
    pub fn tables_in(&self, schema: &str) -> Vec<&str> {
        self.schemata
            .get(schema)
            .map(|tables| tables.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.schemata.values().flatten().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.schemata.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.schemata.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        let schema = name.split('.').next().unwrap_or_default();
        self.schemata
            .get(schema)
            .is_some_and(|tables| tables.iter().any(|table| table == name))
    }

    /// Look up a registered table (`schema.Table` or `schema.Table.Part`).
    pub fn resolve(&self, name: &str) -> Result<&TableDescriptor> {
        if !self.contains(name) {
            return Err(DbError::TableNotFound(name.to_string()));
        }
        self.catalog.get_table(name)
    }

    pub fn parents(&self, table: &str) -> Vec<&ForeignKey> {
        self.catalog.parents(table)
    }

    pub fn children(&self, table: &str) -> Vec<&ForeignKey> {
        self.catalog.children(table)
    }

    pub fn summaries(&self) -> Vec<TableSummary> {
        self.table_names()
            .filter_map(|name| self.catalog.get_table(name).ok())
            .map(|table| TableSummary {
                name: table.name().to_string(),
                schema: table.schema().to_string(),
                tier: table.tier(),
                primary_key: table.primary_key().iter().map(|s| s.to_string()).collect(),
                parts: table.part_tables().to_vec(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Attribute, AttributeType, Heading};

    fn catalog() -> Catalog {
        let key = |name: &str| Heading::new(vec![Attribute::new(name, AttributeType::Integer, "int").primary()]);
        Catalog::new()
            .with_table(TableDescriptor::new("core.A", key("a"), Tier::Manual), vec![])
            .unwrap()
            .with_table(TableDescriptor::new("core.A.Part", key("a"), Tier::Part), vec![])
            .unwrap()
            .with_table(TableDescriptor::new("mysql.Users", key("u"), Tier::Manual), vec![])
            .unwrap()
    }

    #[test]
    fn test_refresh_skips_reserved_schemas() {
        let mut registry = SchemaRegistry::new();
        registry.refresh(&catalog(), &["mysql".to_string()]);

        assert_eq!(registry.schemata().collect::<Vec<_>>(), vec!["core"]);
        assert_eq!(registry.tables_in("core"), vec!["core.A", "core.A.Part"]);
        assert!(registry.resolve("core.A.Part").is_ok());
        assert!(registry.resolve("mysql.Users").is_err());
    }

    #[test]
    fn test_registry_is_a_snapshot() {
        let mut registry = SchemaRegistry::new();
        registry.refresh(&Catalog::new(), &[]);
        assert!(registry.is_empty());
        registry.refresh(&catalog(), &[]);
        assert_eq!(registry.len(), 3);
    }
}
