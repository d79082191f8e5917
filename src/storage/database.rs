use super::{Catalog, ForeignKey, Table, TableDescriptor};
use crate::core::{DbError, Restriction, Result, Row, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

/// In-memory relational store: catalog, row storage and a single-level
/// transaction over a snapshot of the row data.
pub struct Database {
    catalog: Catalog,
    tables: HashMap<String, Table>,
    /// Row data captured by `begin`, restored by `rollback`.
    snapshot: Option<(Catalog, HashMap<String, Table>)>,
}

impl Database {
    pub fn new() -> Self {
        Self {
            catalog: Catalog::new(),
            tables: HashMap::new(),
            snapshot: None,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn declare(&mut self, descriptor: TableDescriptor, foreign_keys: Vec<ForeignKey>) -> Result<()> {
        let name = descriptor.name().to_string();
        self.catalog = self.catalog.clone().with_table(descriptor, foreign_keys)?;
        let descriptor = self.catalog.get_table(&name)?.clone();
        self.tables.insert(name.clone(), Table::new(descriptor));
        // the master's descriptor changed (new part), keep the stored copy in sync
        if let Some(master) = self.catalog.get_table(&name)?.master().map(str::to_string) {
            let master_descriptor = self.catalog.get_table(&master)?.clone();
            if let Some(table) = self.tables.get_mut(&master) {
                let rows: Vec<Row> = table.scan().cloned().collect();
                let mut rebuilt = Table::new(master_descriptor);
                for row in rows {
                    rebuilt.insert(row)?;
                }
                *table = rebuilt;
            }
        }
        info!(table = %name, "declared table");
        Ok(())
    }

    /// Record a reference after both tables exist. Existing rows are not
    /// checked.
    pub fn add_foreign_key(&mut self, fk: ForeignKey) -> Result<()> {
        let (child, parent) = (fk.child.clone(), fk.parent.clone());
        self.catalog = self.catalog.clone().with_foreign_key(fk)?;
        info!(child = %child, parent = %parent, "added foreign key");
        Ok(())
    }

    pub fn drop_table(&mut self, name: &str) -> Result<()> {
        let parts = self.catalog.get_table(name)?.part_tables().to_vec();
        self.catalog = self.catalog.clone().without_table(name)?;
        self.tables.remove(name);
        for part in parts {
            self.tables.remove(&part);
        }
        Ok(())
    }

    fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))
    }

    /// Insert one row; returns its primary key as a restriction.
    pub fn insert1(&mut self, table_name: &str, row: Row) -> Result<Restriction> {
        let row = self.table(table_name)?.complete_row(row)?;
        self.check_references(table_name, &row)?;

        let table = self.table_mut(table_name)?;
        table.insert(row.clone())?;

        let key: Restriction = table
            .descriptor()
            .primary_key()
            .iter()
            .filter_map(|attr| row.get(*attr).map(|v| (attr.to_string(), v.clone())))
            .collect();
        debug!(table = %table_name, key = ?key, "inserted row");
        Ok(key)
    }

    fn check_references(&self, table_name: &str, row: &Row) -> Result<()> {
        for fk in self.catalog.parents(table_name) {
            let mut restriction = Restriction::new();
            for (child_attr, parent_attr) in &fk.attr_map {
                match row.get(child_attr) {
                    Some(value) if !value.is_null() => {
                        restriction.insert(parent_attr.clone(), value.clone());
                    }
                    _ => break,
                }
            }
            if restriction.len() != fk.attr_map.len() {
                continue;
            }
            if !self.table(&fk.parent)?.contains(&restriction) {
                return Err(DbError::ForeignKeyViolation(format!(
                    "'{}' references non-existent key {:?} in '{}'",
                    table_name, restriction, fk.parent
                )));
            }
        }
        Ok(())
    }

    /// Update secondary attributes of the rows matching `restriction`.
    pub fn update1(&mut self, table_name: &str, restriction: &Restriction, values: Row) -> Result<usize> {
        let mut candidate = self
            .fetch(table_name, restriction)?
            .into_iter()
            .next()
            .ok_or_else(|| DbError::MissingRow(table_name.to_string()))?;
        candidate.extend(values.clone());
        self.check_references(table_name, &candidate)?;

        let updated = self.table_mut(table_name)?.update(restriction, &values)?;
        if updated == 0 {
            return Err(DbError::MissingRow(table_name.to_string()));
        }
        debug!(table = %table_name, updated, "updated rows");
        Ok(updated)
    }

    /// Delete matching rows and, recursively, every dependent row.
    /// Returns the number of rows removed per table.
    pub fn delete(&mut self, table_name: &str, restriction: &Restriction) -> Result<BTreeMap<String, usize>> {
        let mut counts = BTreeMap::new();
        let mut pending = vec![(table_name.to_string(), restriction.clone())];

        while let Some((name, restriction)) = pending.pop() {
            let deleted = self.table_mut(&name)?.delete(&restriction);
            if deleted.is_empty() {
                continue;
            }
            *counts.entry(name.clone()).or_insert(0) += deleted.len();

            for fk in self.catalog.children(&name) {
                for row in &deleted {
                    let child_restriction: Restriction = fk
                        .attr_map
                        .iter()
                        .filter_map(|(child_attr, parent_attr)| {
                            row.get(parent_attr).map(|v| (child_attr.clone(), v.clone()))
                        })
                        .collect();
                    pending.push((fk.child.clone(), child_restriction));
                }
            }
        }

        info!(table = %table_name, deleted = ?counts, "deleted rows");
        Ok(counts)
    }

    pub fn fetch(&self, table_name: &str, restriction: &Restriction) -> Result<Vec<Row>> {
        Ok(self.table(table_name)?.restrict(restriction).cloned().collect())
    }

    /// Fetch exactly one row.
    pub fn fetch1(&self, table_name: &str, restriction: &Restriction) -> Result<Row> {
        let mut rows = self.fetch(table_name, restriction)?;
        match rows.len() {
            1 => Ok(rows.remove(0)),
            0 => Err(DbError::MissingRow(table_name.to_string())),
            n => Err(DbError::ConstraintViolation(format!(
                "expected one row in '{}', restriction matched {}",
                table_name, n
            ))),
        }
    }

    /// Distinct projections of the matching rows onto `attrs`.
    pub fn project(&self, table_name: &str, attrs: &[&str], restriction: &Restriction) -> Result<Vec<Row>> {
        let table = self.table(table_name)?;
        for attr in attrs {
            if !table.descriptor().heading().contains(attr) {
                return Err(DbError::AttributeNotFound(attr.to_string(), table_name.to_string()));
            }
        }

        let mut seen = BTreeSet::new();
        let mut projected = Vec::new();
        for row in table.restrict(restriction) {
            let proj: Row = attrs
                .iter()
                .filter_map(|attr| row.get(*attr).map(|v| (attr.to_string(), v.clone())))
                .collect();
            let key: Vec<Value> = proj.values().cloned().collect();
            if seen.insert(key) {
                projected.push(proj);
            }
        }
        Ok(projected)
    }

    /// Natural join of `tables`, blobs left out. A later table only brings
    /// its primary key and the secondary attributes not already joined, so
    /// tables link through keys and references rather than through
    /// dependent attributes that happen to share a name.
    pub fn safe_join(&self, tables: &[&str]) -> Result<Vec<Row>> {
        let Some((first, rest)) = tables.split_first() else {
            return Ok(Vec::new());
        };
        let heading = self.table(first)?.descriptor().heading();
        let mut secondary: BTreeSet<String> = heading.secondary_attributes().into_iter().map(String::from).collect();
        let mut joined = self.project(first, &heading.non_blobs(), &Restriction::new())?;

        for name in rest {
            let heading = self.table(name)?.descriptor().heading();
            let keep: Vec<&str> = heading
                .non_blobs()
                .into_iter()
                .filter(|attr| heading.get(attr).is_some_and(|a| a.in_key) || !secondary.contains(*attr))
                .collect();
            let right = self.project(name, &keep, &Restriction::new())?;
            secondary.extend(heading.secondary_attributes().into_iter().map(String::from));

            let mut next = Vec::new();
            for left in &joined {
                for row in &right {
                    let matches = row
                        .iter()
                        .all(|(attr, value)| left.get(attr).is_none_or(|other| other == value));
                    if matches {
                        let mut merged = left.clone();
                        merged.extend(row.clone());
                        next.push(merged);
                    }
                }
            }
            joined = next;
        }
        debug!(tables = ?tables, rows = joined.len(), "joined tables");
        Ok(joined)
    }

    pub fn len(&self, table_name: &str) -> Result<usize> {
        Ok(self.table(table_name)?.row_count())
    }

    pub fn count(&self, table_name: &str, restriction: &Restriction) -> Result<usize> {
        Ok(self.table(table_name)?.restrict(restriction).count())
    }

    pub fn max_of(&self, table_name: &str, attr: &str) -> Result<Option<Value>> {
        Ok(self.table(table_name)?.max_of(attr))
    }

    pub fn in_transaction(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn begin(&mut self) -> Result<()> {
        if self.snapshot.is_some() {
            return Err(DbError::TransactionError("transaction already in progress".into()));
        }
        self.snapshot = Some((self.catalog.clone(), self.tables.clone()));
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.snapshot
            .take()
            .map(|_| ())
            .ok_or_else(|| DbError::TransactionError("no transaction in progress".into()))
    }

    pub fn rollback(&mut self) -> Result<()> {
        let (catalog, tables) = self
            .snapshot
            .take()
            .ok_or_else(|| DbError::TransactionError("no transaction in progress".into()))?;
        self.catalog = catalog;
        self.tables = tables;
        Ok(())
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Attribute, AttributeType, Heading};
    use crate::storage::Tier;

    fn setup() -> Database {
        let mut db = Database::new();
        db.declare(
            TableDescriptor::new(
                "lab.Person",
                Heading::new(vec![
                    Attribute::new("person", AttributeType::String { max_length: Some(31), fixed: false }, "varchar(31)").primary(),
                ]),
                Tier::Manual,
            ),
            vec![],
        )
        .unwrap();
        db.declare(
            TableDescriptor::new(
                "lab.Note",
                Heading::new(vec![
                    Attribute::new("note_id", AttributeType::Integer, "int").primary(),
                    Attribute::new("person", AttributeType::String { max_length: Some(31), fixed: false }, "varchar(31)"),
                ]),
                Tier::Manual,
            ),
            vec![ForeignKey::new(
                "lab.Note",
                "lab.Person",
                BTreeMap::from([("person".to_string(), "person".to_string())]),
            )],
        )
        .unwrap();
        db
    }

    fn person(name: &str) -> Row {
        Row::from([("person".to_string(), Value::from(name))])
    }

    fn note(id: i64, name: &str) -> Row {
        Row::from([
            ("note_id".to_string(), Value::Integer(id)),
            ("person".to_string(), Value::from(name)),
        ])
    }

    #[test]
    fn test_foreign_key_checked_on_insert() {
        let mut db = setup();
        db.insert1("lab.Person", person("alice")).unwrap();
        db.insert1("lab.Note", note(1, "alice")).unwrap();
        let err = db.insert1("lab.Note", note(2, "ghost")).unwrap_err();
        assert!(matches!(err, DbError::ForeignKeyViolation(_)));
    }

    #[test]
    fn test_delete_cascades() {
        let mut db = setup();
        db.insert1("lab.Person", person("alice")).unwrap();
        db.insert1("lab.Note", note(1, "alice")).unwrap();
        db.insert1("lab.Note", note(2, "alice")).unwrap();

        let counts = db.delete("lab.Person", &person("alice")).unwrap();
        assert_eq!(counts.get("lab.Person"), Some(&1));
        assert_eq!(counts.get("lab.Note"), Some(&2));
        assert_eq!(db.len("lab.Note").unwrap(), 0);
    }

    #[test]
    fn test_rollback_restores_rows() {
        let mut db = setup();
        db.insert1("lab.Person", person("alice")).unwrap();
        db.begin().unwrap();
        db.insert1("lab.Person", person("bob")).unwrap();
        assert_eq!(db.len("lab.Person").unwrap(), 2);
        db.rollback().unwrap();
        assert_eq!(db.len("lab.Person").unwrap(), 1);
        assert!(db.commit().is_err());
    }

    #[test]
    fn test_update_missing_row_is_error() {
        let mut db = setup();
        let restriction = Restriction::from([("note_id".to_string(), Value::Integer(5))]);
        let err = db
            .update1("lab.Note", &restriction, Row::from([("person".to_string(), Value::from("x"))]))
            .unwrap_err();
        assert!(matches!(err, DbError::MissingRow(_)));
    }

    #[test]
    fn test_project_is_distinct() {
        let mut db = setup();
        db.insert1("lab.Person", person("alice")).unwrap();
        db.insert1("lab.Note", note(1, "alice")).unwrap();
        db.insert1("lab.Note", note(2, "alice")).unwrap();
        let projected = db.project("lab.Note", &["person"], &Restriction::new()).unwrap();
        assert_eq!(projected.len(), 1);
    }

    #[test]
    fn test_safe_join_ignores_shared_dependent_attributes() {
        let adapters = crate::schema::AdapterRegistry::default();
        let mut db = Database::new();
        crate::declare::declare(&mut db, "lab.Rig", Tier::Manual, "rig : varchar(15)\n---\nlabel : varchar(31)", &adapters)
            .unwrap();
        crate::declare::declare(
            &mut db,
            "lab.Session",
            Tier::Manual,
            "session_id : int\n---\n-> Rig\nlabel : varchar(31)",
            &adapters,
        )
        .unwrap();
        db.insert1("lab.Rig", Row::from([("rig".into(), Value::from("r1")), ("label".into(), Value::from("left"))]))
            .unwrap();
        for (id, label) in [(1, "baseline"), (2, "drug")] {
            db.insert1(
                "lab.Session",
                Row::from([
                    ("session_id".into(), Value::Integer(id)),
                    ("rig".into(), Value::from("r1")),
                    ("label".into(), Value::from(label)),
                ]),
            )
            .unwrap();
        }

        let joined = db.safe_join(&["lab.Rig", "lab.Session"]).unwrap();
        assert_eq!(joined.len(), 2);
        assert!(joined.iter().all(|row| row["label"] == Value::from("left")));
        assert_eq!(joined[0]["session_id"], Value::Integer(1));
        assert!(db.safe_join(&[]).unwrap().is_empty());
    }
}
