use super::descriptor::{
    Choice, ChoiceSource, FieldMeta, FieldNode, FormDescriptor, FormField, PostProcess, Validator,
    WidgetKind, empty_parent_error,
};
use super::{EXISTING_ENTRIES, MAX_FORM_DEPTH, NULL_CHOICE};
use crate::config::AppConfig;
use crate::core::{Attribute, AttributeType, DefaultValue, Restriction, TemporalKind, Value};
use crate::storage::{Database, ForeignKey, TableDescriptor};
use serde_json::Value as Json;
use tracing::warn;
use uuid::Uuid;

/// Where a field is being built.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldContext {
    /// Inside a "create new parent" sub-form.
    pub new_parent: bool,
    pub depth: usize,
}

impl FieldContext {
    pub fn top_level() -> Self {
        Self::default()
    }

    fn nested(self, new_parent: bool) -> Self {
        Self {
            new_parent,
            depth: self.depth + 1,
        }
    }
}

/// Maps one attribute to a form field. Reads the database only to count and
/// list foreign-key candidates.
pub struct FieldFactory<'a> {
    db: &'a Database,
    config: &'a AppConfig,
}

impl<'a> FieldFactory<'a> {
    pub fn new(db: &'a Database, config: &'a AppConfig) -> Self {
        Self { db, config }
    }

    /// `None` when the attribute type has no widget.
    pub fn create_field(&self, table: &TableDescriptor, attr: &Attribute, ctx: FieldContext) -> Option<FormField> {
        let meta = self.meta_for(attr, ctx);

        if !ctx.new_parent
            && let Some(fk) = self.db.catalog().foreign_key_for(table.name(), &attr.name)
            && let Some(field) = self.reference_field(attr, fk, meta.clone(), ctx)
        {
            return Some(field);
        }

        if let AttributeType::Adapted { adapter, storage } = &attr.attr_type {
            let mut field = self.typed_field(table, attr, storage, meta, ctx)?;
            field.post_process = PostProcess::Adapter {
                adapter: adapter.clone(),
                inner: Box::new(field.post_process),
            };
            return Some(field);
        }
        self.typed_field(table, attr, &attr.attr_type, meta, ctx)
    }

    fn meta_for(&self, attr: &Attribute, ctx: FieldContext) -> FieldMeta {
        let required = !ctx.new_parent && !(attr.nullable || attr.has_nonnull_default() || attr.auto_increment);
        let presence = if ctx.new_parent {
            if attr.in_key { Validator::RequiredIfNew } else { Validator::Optional }
        } else if required {
            Validator::Required
        } else {
            Validator::Optional
        };

        let default = match &attr.default {
            _ if ctx.new_parent || attr.nullable => None,
            Some(DefaultValue::Value(value)) => Some(value.to_json()),
            _ => None,
        };

        let mut meta = FieldMeta::new(attr.name.clone())
            .with_description(&attr.comment)
            .required(required)
            .with_default(default)
            .with_validator(presence);
        meta.nullable = attr.nullable;
        meta.primary_key = attr.in_key;
        meta
    }

    /// Dropdown, parent sub-form or disabled field for a foreign key; `None`
    /// when the parent has more candidates than the dropdown limit.
    fn reference_field(&self, attr: &Attribute, fk: &ForeignKey, mut meta: FieldMeta, ctx: FieldContext) -> Option<FormField> {
        let parent_attr = fk.parent_attr(&attr.name)?;
        let parent = self.db.catalog().get_table(&fk.parent).ok()?;

        let count = match self.db.project(&fk.parent, &[parent_attr], &Restriction::new()) {
            Ok(rows) => rows.len(),
            Err(err) => {
                warn!(table = %fk.child, attribute = %attr.name, error = %err, "cannot list foreign key candidates");
                return None;
            }
        };
        if count > self.config.fk_dropdown_limit {
            return None;
        }

        let coerce = PostProcess::Coerce {
            attr_type: attr.attr_type.clone(),
        };

        if parent.is_manual_lookup() && fk.attr_map.len() == 1 && ctx.depth < MAX_FORM_DEPTH {
            return Some(self.parent_form(attr, parent, parent_attr, meta, ctx));
        }

        let source = ChoiceSource::ForeignKey {
            parent: fk.parent.clone(),
            parent_attr: parent_attr.to_string(),
            nullable: attr.nullable,
            new_entry: false,
        };
        if count == 0 {
            return Some(FormField::new(
                FieldNode::Disabled {
                    error: empty_parent_error(&source),
                    meta,
                    source: Some(source),
                },
                coerce,
            ));
        }

        let choices = source.load(self.db).ok()?;
        if attr.nullable {
            meta.default = Some(Json::String(NULL_CHOICE.to_string()));
        }
        Some(FormField::new(FieldNode::Select { meta, choices, source }, coerce))
    }

    /// Existing-entry selection plus the parent's own fields for `<new>`.
    fn parent_form(
        &self,
        attr: &Attribute,
        parent: &TableDescriptor,
        parent_attr: &str,
        meta: FieldMeta,
        ctx: FieldContext,
    ) -> FormField {
        let source = ChoiceSource::ForeignKey {
            parent: parent.name().to_string(),
            parent_attr: parent_attr.to_string(),
            nullable: attr.nullable,
            new_entry: true,
        };
        let choices = source.load(self.db).unwrap_or_default();

        let mut select_meta = FieldMeta::new(EXISTING_ENTRIES)
            .with_description(&format!("choose an existing {} or add a new entry", meta.label))
            .required(meta.required)
            .with_validator(Validator::ParentSelection {
                primary_key: parent_attr.to_string(),
            });
        select_meta.nullable = attr.nullable;
        if attr.nullable {
            select_meta.default = Some(Json::String(NULL_CHOICE.to_string()));
        }

        let parent_key_type = parent
            .heading()
            .get(parent_attr)
            .map(|key| key.attr_type.clone())
            .unwrap_or_else(|| attr.attr_type.clone());

        let mut form = FormDescriptor::new(parent.name());
        form.fields.push(FormField::new(
            FieldNode::Select {
                meta: select_meta,
                choices,
                source,
            },
            PostProcess::Coerce {
                attr_type: parent_key_type,
            },
        ));
        let nested = ctx.nested(true);
        for parent_attribute in parent.heading().attributes() {
            if let Some(field) = self.create_field(parent, parent_attribute, nested) {
                form.fields.push(field);
            }
        }

        FormField::new(
            FieldNode::ParentForm {
                meta,
                parent: parent.name().to_string(),
                parent_attr: parent_attr.to_string(),
                form,
            },
            PostProcess::Identity,
        )
    }

    fn typed_field(
        &self,
        table: &TableDescriptor,
        attr: &Attribute,
        attr_type: &AttributeType,
        mut meta: FieldMeta,
        ctx: FieldContext,
    ) -> Option<FormField> {
        let coerce = PostProcess::Coerce {
            attr_type: attr_type.clone(),
        };
        let input = |meta: FieldMeta, widget: WidgetKind, post_process: PostProcess| {
            Some(FormField::new(FieldNode::Input { meta, widget }, post_process))
        };
        let select = |meta: FieldMeta, choices: Vec<Choice>, post_process: PostProcess| {
            Some(FormField::new(
                FieldNode::Select {
                    meta,
                    choices,
                    source: ChoiceSource::Static,
                },
                post_process,
            ))
        };
        let null_choice = || attr.nullable.then(|| Choice::new(NULL_CHOICE, NULL_CHOICE));

        match attr_type {
            AttributeType::Integer => {
                if !ctx.new_parent && meta.default.is_none() {
                    meta.default = self.auto_default(table, attr);
                }
                input(meta, WidgetKind::Integer, coerce)
            }
            AttributeType::Decimal | AttributeType::Float => input(meta, WidgetKind::Float, coerce),
            AttributeType::String { max_length, fixed } => {
                meta = meta.with_validator(Validator::Length {
                    min: max_length.filter(|_| *fixed),
                    max: *max_length,
                });
                let widget = match max_length {
                    Some(n) if *n < self.config.textarea_startlength => WidgetKind::Text,
                    _ => WidgetKind::TextArea,
                };
                input(meta, widget, coerce)
            }
            AttributeType::Enum { choices } => {
                let choices = null_choice()
                    .into_iter()
                    .chain(choices.iter().map(|choice| Choice::new(choice.clone(), choice.clone())))
                    .collect();
                select(meta, choices, coerce)
            }
            AttributeType::Bool => {
                let choices = null_choice()
                    .into_iter()
                    .chain([Choice::new("1", "True"), Choice::new("0", "False")])
                    .collect();
                select(meta, choices, coerce)
            }
            AttributeType::Temporal { temporal } => {
                let fill_now = !ctx.new_parent
                    && !attr.nullable
                    && meta.default.is_none()
                    && attr.default != Some(DefaultValue::CurrentTimestamp);
                let now = chrono::Local::now().naive_local();
                let (widget, default) = match temporal {
                    TemporalKind::Date => (WidgetKind::Date, Value::Date(now.date())),
                    TemporalKind::DateTime | TemporalKind::Timestamp => {
                        (WidgetKind::DateTime, Value::Text(now.format("%Y-%m-%d %H:%M").to_string()))
                    }
                    TemporalKind::Time => (WidgetKind::Time, Value::Text(now.format("%H:%M").to_string())),
                };
                if fill_now {
                    meta.default = Some(default.to_json());
                }
                input(meta, widget, coerce)
            }
            AttributeType::Blob { .. } => {
                meta = meta.with_validator(Validator::Extension {
                    allowed: self.config.extensions.clone(),
                });
                input(meta, WidgetKind::BlobUpload, PostProcess::DecodeFile)
            }
            AttributeType::Attach { .. } => {
                meta = meta.with_validator(Validator::Extension {
                    allowed: self.config.attach_extensions.clone(),
                });
                input(meta, WidgetKind::FileUpload, PostProcess::ReadAttachment)
            }
            AttributeType::Filepath { .. } => {
                meta = meta.with_validator(Validator::FilePath);
                input(meta, WidgetKind::FilePath, coerce)
            }
            AttributeType::Uuid => {
                if !ctx.new_parent {
                    meta.default = Some(Json::String(Uuid::new_v4().to_string()));
                }
                input(meta, WidgetKind::Uuid, coerce)
            }
            AttributeType::Adapted { storage, .. } => self.typed_field(table, attr, storage, meta, ctx),
            AttributeType::Unsupported { sql_type } => {
                warn!(
                    table = %table.name(),
                    attribute = %attr.name,
                    sql_type = %sql_type,
                    "no widget for attribute type, field skipped"
                );
                None
            }
        }
    }

    /// Next key for a single-column integer primary key: 1 for an empty
    /// table, otherwise max + 1.
    fn auto_default(&self, table: &TableDescriptor, attr: &Attribute) -> Option<Json> {
        if !attr.in_key || table.primary_key() != [attr.name.as_str()] {
            return None;
        }
        let next = match self.db.max_of(table.name(), &attr.name) {
            Ok(Some(max)) => max.as_i64()? + 1,
            Ok(None) => 1,
            Err(_) => return None,
        };
        Some(Json::from(next))
    }
}
