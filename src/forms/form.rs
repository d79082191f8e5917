use super::descriptor::{FieldMeta, FieldNode, FormDescriptor, FormField, PostProcess};
use super::field::{FieldContext, FieldFactory};
use super::MAX_FORM_DEPTH;
use crate::config::AppConfig;
use crate::core::Result;
use crate::storage::Database;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

pub struct FormFactory<'a> {
    db: &'a Database,
    fields: FieldFactory<'a>,
}

impl<'a> FormFactory<'a> {
    pub fn new(db: &'a Database, config: &'a AppConfig) -> Self {
        Self {
            db,
            fields: FieldFactory::new(db, config),
        }
    }

    pub fn build(&self, table: &str) -> Result<FormDescriptor> {
        self.build_with_skip(table, &[], 0)
    }

    /// Form for `table` without the attributes in `skip`. Part tables become
    /// entry lists whose forms leave out the master's key.
    pub fn build_with_skip(&self, table: &str, skip: &[&str], depth: usize) -> Result<FormDescriptor> {
        let descriptor = self.db.catalog().get_table(table)?;
        let ctx = FieldContext {
            new_parent: false,
            depth,
        };

        let mut form = FormDescriptor::new(table);
        for attr in descriptor.heading().attributes() {
            if skip.contains(&attr.name.as_str()) {
                continue;
            }
            if let Some(field) = self.fields.create_field(descriptor, attr, ctx) {
                form.fields.push(field);
            }
        }

        if depth < MAX_FORM_DEPTH {
            let master_key = descriptor.primary_key();
            for part in descriptor.part_tables() {
                let part_descriptor = self.db.catalog().get_table(part)?;
                let part_form = self.build_with_skip(part, &master_key, depth + 1)?;
                form.fields.push(FormField::new(
                    FieldNode::PartList {
                        meta: FieldMeta::new(part_descriptor.table_name()),
                        table: part.clone(),
                        form: part_form,
                        min_entries: 1,
                    },
                    PostProcess::Identity,
                ));
            }
        }

        Ok(form)
    }
}

/// Built forms by table name. A hit only refreshes foreign-key choices.
#[derive(Default)]
pub struct FormCache {
    forms: RwLock<HashMap<String, Arc<RwLock<FormDescriptor>>>>,
}

impl FormCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_build(&self, db: &Database, config: &AppConfig, table: &str) -> Result<Arc<RwLock<FormDescriptor>>> {
        let cached = self.forms.read()?.get(table).cloned();
        if let Some(form) = cached {
            form.write()?.refresh_choices(db)?;
            debug!(table = %table, "reusing cached form");
            return Ok(form);
        }

        let built = Arc::new(RwLock::new(FormFactory::new(db, config).build(table)?));
        let mut forms = self.forms.write()?;
        let form = forms.entry(table.to_string()).or_insert(built).clone();
        debug!(table = %table, "built form");
        Ok(form)
    }

    pub fn invalidate_all(&self) -> Result<()> {
        let mut forms = self.forms.write()?;
        let dropped = forms.len();
        forms.clear();
        info!(dropped, "form cache invalidated");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.forms.read().map(|forms| forms.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
