//! Writes validated form submissions: new parent entries first, then the
//! master row, then part-table entries.

use crate::core::{DbError, Restriction, Row};
use crate::forms::{EXISTING_ENTRIES, FieldError, FieldNode, FormDescriptor, NEW_ENTRY, ValidationErrors};
use crate::schema::AdapterRegistry;
use crate::storage::Database;
use serde_json::Value as Json;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum InsertError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("field '{field}': {source}")]
    Field {
        field: String,
        #[source]
        source: FieldError,
    },

    #[error("could not insert new entry into '{table}': {source}")]
    Parent {
        table: String,
        #[source]
        source: Box<InsertError>,
    },

    #[error(transparent)]
    Database(#[from] DbError),

    #[error("no entry of '{0}' was updated")]
    NothingUpdated(String),

    #[error("entry of '{master}' was saved, but writing part table '{table}' failed: {source}")]
    PartInsert {
        master: String,
        table: String,
        #[source]
        source: Box<InsertError>,
    },
}

struct PartEntries<'f> {
    table: &'f str,
    form: &'f FormDescriptor,
    entries: &'f Json,
}

pub struct InsertPipeline<'a> {
    adapters: &'a AdapterRegistry,
}

impl<'a> InsertPipeline<'a> {
    pub fn new(adapters: &'a AdapterRegistry) -> Self {
        Self { adapters }
    }

    /// Insert a submission, or update the row selected by `existing`.
    /// Returns the master's primary key. Part entries are written after the
    /// master; if one fails the master stays written.
    pub fn insert(
        &self,
        db: &mut Database,
        form: &FormDescriptor,
        submission: &Json,
        existing: Option<&Restriction>,
    ) -> Result<Restriction, InsertError> {
        match existing {
            Some(_) => form.validate_edit(submission)?,
            None => form.validate(submission)?,
        }
        let values = Json::Object(form.extract(submission));

        let (row, parts) = self.assemble(db, form, &values, existing.is_some())?;
        let key = match existing {
            Some(restriction) => self.update(db, &form.table, restriction, row)?,
            None => db.insert1(&form.table, row)?,
        };
        info!(table = %form.table, key = ?key, edit = existing.is_some(), "saved entry");

        for part in parts {
            for entry in part.entries.as_array().into_iter().flatten() {
                self.write_part(db, &part, entry, &key, existing.is_some())
                    .map_err(|source| InsertError::PartInsert {
                        master: form.table.clone(),
                        table: part.table.to_string(),
                        source: Box::new(source),
                    })?;
            }
        }

        Ok(key)
    }

    /// Like [`insert`](Self::insert), rolling back every write on failure.
    pub fn insert_atomic(
        &self,
        db: &mut Database,
        form: &FormDescriptor,
        submission: &Json,
        existing: Option<&Restriction>,
    ) -> Result<Restriction, InsertError> {
        db.begin()?;
        match self.insert(db, form, submission, existing) {
            Ok(key) => {
                db.commit()?;
                Ok(key)
            }
            Err(err) => {
                db.rollback()?;
                warn!(table = %form.table, error = %err, "rolled back submission");
                Err(err)
            }
        }
    }

    /// Row for `form`'s table. `<new>` parent selections are inserted here.
    fn assemble<'f>(
        &self,
        db: &mut Database,
        form: &'f FormDescriptor,
        values: &'f Json,
        edit: bool,
    ) -> Result<(Row, Vec<PartEntries<'f>>), InsertError> {
        let descriptor = db.catalog().get_table(&form.table)?.clone();
        let heading = descriptor.heading();
        let mut row = Row::new();
        let mut parts = Vec::new();

        for field in &form.fields {
            let raw = values.get(field.name()).unwrap_or(&Json::Null);
            if let FieldNode::PartList { table, form, .. } = &field.node {
                parts.push(PartEntries {
                    table,
                    form,
                    entries: raw,
                });
                continue;
            }
            let Some(attr) = heading.get(field.name()) else {
                continue;
            };
            if edit && attr.in_key {
                continue;
            }

            let value = match &field.node {
                FieldNode::ParentForm {
                    parent,
                    parent_attr,
                    form: parent_form,
                    ..
                } if creates_parent(raw) => {
                    let parent_error = |source: InsertError| InsertError::Parent {
                        table: parent.clone(),
                        source: Box::new(source),
                    };
                    let (parent_row, _) = self.assemble(db, parent_form, raw, false).map_err(parent_error)?;
                    let parent_key = db
                        .insert1(parent, parent_row)
                        .map_err(|err| parent_error(err.into()))?;
                    info!(table = %parent, key = ?parent_key, "inserted new parent entry");
                    parent_key
                        .get(parent_attr)
                        .cloned()
                        .ok_or_else(|| DbError::AttributeNotFound(parent_attr.clone(), parent.clone()))?
                }
                _ => field.process(raw, self.adapters).map_err(|source| InsertError::Field {
                    field: field.name().to_string(),
                    source,
                })?,
            };

            // null leaves defaults to the store on insert; on edit it keeps
            // stored uploads and attributes that cannot be cleared
            if value.is_null() && (!edit || attr.attr_type.is_binary() || !attr.nullable) {
                continue;
            }
            row.insert(attr.name.clone(), value);
        }

        Ok((row, parts))
    }

    fn update(&self, db: &mut Database, table: &str, restriction: &Restriction, row: Row) -> Result<Restriction, InsertError> {
        match db.update1(table, restriction, row) {
            Ok(_) => {}
            Err(DbError::MissingRow(_)) => return Err(InsertError::NothingUpdated(table.to_string())),
            Err(err) => return Err(err.into()),
        }
        let stored = db.fetch(table, restriction)?;
        let Some(stored) = stored.first() else {
            return Err(InsertError::NothingUpdated(table.to_string()));
        };
        Ok(primary_key_of(db, table, stored)?)
    }

    /// Insert a part entry carrying the master key; in edit mode an entry
    /// whose key already exists is updated instead.
    fn write_part(
        &self,
        db: &mut Database,
        part: &PartEntries<'_>,
        entry: &Json,
        master_key: &Restriction,
        edit: bool,
    ) -> Result<(), InsertError> {
        let (mut row, _) = self.assemble(db, part.form, entry, false)?;
        row.extend(master_key.clone());

        if edit {
            let part_key = primary_key_of(db, part.table, &row)?;
            let complete = part_key.len() == db.catalog().get_table(part.table)?.primary_key().len();
            if complete && db.count(part.table, &part_key)? > 0 {
                row.retain(|attr, _| !part_key.contains_key(attr));
                db.update1(part.table, &part_key, row)?;
                return Ok(());
            }
        }
        db.insert1(part.table, row)?;
        Ok(())
    }
}

fn creates_parent(raw: &Json) -> bool {
    raw.get(EXISTING_ENTRIES)
        .and_then(Json::as_str)
        .is_some_and(|chosen| chosen.trim() == NEW_ENTRY)
}

fn primary_key_of(db: &Database, table: &str, row: &Row) -> Result<Restriction, DbError> {
    Ok(db
        .catalog()
        .get_table(table)?
        .primary_key()
        .iter()
        .filter_map(|attr| row.get(*attr).map(|value| (attr.to_string(), value.clone())))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::core::Value;
    use crate::declare::declare;
    use crate::forms::FormFactory;
    use crate::storage::Tier;
    use serde_json::json;

    fn setup() -> (Database, AdapterRegistry) {
        let adapters = AdapterRegistry::default();
        let mut db = Database::new();
        declare(
            &mut db,
            "lab.Species",
            Tier::Manual,
            "species : varchar(63)\n---\nspecies_comment = null : varchar(255)",
            &adapters,
        )
        .unwrap();
        declare(
            &mut db,
            "lab.Animal",
            Tier::Manual,
            "animal_id : int\n---\n-> Species\nweight = null : float",
            &adapters,
        )
        .unwrap();
        declare(
            &mut db,
            "lab.Animal.Tag",
            Tier::Part,
            "-> master\ntag : varchar(15)\n---\ncolor : enum('red', 'blue')",
            &adapters,
        )
        .unwrap();
        (db, adapters)
    }

    fn form(db: &Database) -> FormDescriptor {
        FormFactory::new(db, &AppConfig::default()).build("lab.Animal").unwrap()
    }

    fn key(id: i64) -> Restriction {
        Restriction::from([("animal_id".to_string(), Value::Integer(id))])
    }

    #[test]
    fn test_new_parent_inserted_before_child() {
        let (mut db, adapters) = setup();
        let form = form(&db);
        let submission = json!({
            "animal_id": "1",
            "species": {"existing_entries": "<new>", "species": "zebrafish", "species_comment": "danio"},
            "weight": "2.5"
        });

        let saved = InsertPipeline::new(&adapters).insert(&mut db, &form, &submission, None).unwrap();
        assert_eq!(saved, key(1));

        let species = db.fetch1("lab.Species", &Restriction::new()).unwrap();
        assert_eq!(species["species"], Value::from("zebrafish"));
        let animal = db.fetch1("lab.Animal", &key(1)).unwrap();
        assert_eq!(animal["species"], Value::from("zebrafish"));
    }

    #[test]
    fn test_invalid_submission_writes_nothing() {
        let (mut db, adapters) = setup();
        let form = form(&db);
        let submission = json!({"animal_id": "", "species": {"existing_entries": "<new>", "species": ""}});

        let err = InsertPipeline::new(&adapters).insert(&mut db, &form, &submission, None).unwrap_err();
        let InsertError::Validation(errors) = err else {
            panic!("expected validation errors");
        };
        assert!(errors.get("animal_id").is_some());
        assert!(errors.get("species.species").is_some());
        assert_eq!(db.len("lab.Species").unwrap(), 0);
    }

    #[test]
    fn test_part_failure_keeps_master() {
        let (mut db, adapters) = setup();
        let form = form(&db);
        let submission = json!({
            "animal_id": "1",
            "species": {"existing_entries": "<new>", "species": "mouse"},
            "Tag": [{"tag": "a", "color": "red"}, {"tag": "a", "color": "blue"}]
        });
        let pipeline = InsertPipeline::new(&adapters);

        let err = pipeline.insert(&mut db, &form, &submission, None).unwrap_err();
        assert!(matches!(err, InsertError::PartInsert { ref table, .. } if table == "lab.Animal.Tag"));
        assert_eq!(db.len("lab.Animal").unwrap(), 1);
        assert_eq!(db.len("lab.Animal.Tag").unwrap(), 1);
    }

    #[test]
    fn test_atomic_insert_rolls_back() {
        let (mut db, adapters) = setup();
        let form = form(&db);
        let submission = json!({
            "animal_id": "1",
            "species": {"existing_entries": "<new>", "species": "mouse"},
            "Tag": [{"tag": "a", "color": "red"}, {"tag": "a", "color": "blue"}]
        });

        assert!(InsertPipeline::new(&adapters).insert_atomic(&mut db, &form, &submission, None).is_err());
        assert_eq!(db.len("lab.Animal").unwrap(), 0);
        assert_eq!(db.len("lab.Species").unwrap(), 0);
        assert!(!db.in_transaction());
    }

    #[test]
    fn test_edit_of_missing_row_fails() {
        let (mut db, adapters) = setup();
        db.insert1("lab.Species", Row::from([("species".to_string(), Value::from("mouse"))])).unwrap();
        let mut form = form(&db);
        form.refresh_choices(&db).unwrap();
        let submission = json!({"animal_id": "9", "species": "mouse", "weight": "1.0"});

        let err = InsertPipeline::new(&adapters)
            .insert(&mut db, &form, &submission, Some(&key(9)))
            .unwrap_err();
        assert!(matches!(err, InsertError::NothingUpdated(_)));
    }
}
