use super::{
    EXISTING_ENTRIES, FieldError, NEW_ENTRY, NEW_ENTRY_LABEL, NULL_CHOICE, ValidationErrors, decode,
};
use crate::core::{Attachment, AttributeType, Restriction, Result, Row, Value, is_none_text};
use crate::schema::AdapterRegistry;
use crate::storage::Database;
use serde::Serialize;
use serde_json::{Map, Value as Json};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WidgetKind {
    Integer,
    Float,
    Text,
    TextArea,
    Select,
    Date,
    DateTime,
    Time,
    BlobUpload,
    FileUpload,
    FilePath,
    Uuid,
    Checkbox,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Choice {
    pub value: String,
    pub label: String,
}

impl Choice {
    pub fn new(value: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            label: label.into(),
        }
    }

    fn plain(value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            label: value.clone(),
            value,
        }
    }

    fn is_candidate(&self) -> bool {
        self.value != NULL_CHOICE && self.value != NEW_ENTRY
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Validator {
    Required,
    Optional,
    /// Required only while a new parent entry is being created.
    RequiredIfNew,
    /// `<new>` needs the parent key filled in, an existing choice needs it empty.
    ParentSelection { primary_key: String },
    Length { min: Option<usize>, max: Option<usize> },
    Extension { allowed: Vec<String> },
    JsonSerializable,
    FilePath,
}

impl Validator {
    /// Message for a non-empty submitted value that fails this validator.
    fn check(&self, raw: &Json) -> Option<String> {
        match self {
            Self::Length { min, max } => {
                let length = submitted_text(raw)?.chars().count();
                match (min, max) {
                    (Some(min), Some(max)) if min == max && length != *max => {
                        Some(format!("Field must be exactly {} characters long.", max))
                    }
                    (Some(min), _) if length < *min => {
                        Some(format!("Field must be at least {} characters long.", min))
                    }
                    (_, Some(max)) if length > *max => {
                        Some(format!("Field cannot be longer than {} characters.", max))
                    }
                    _ => None,
                }
            }
            Self::Extension { allowed } => {
                let path = submitted_text(raw)?;
                let extension = decode::extension_of(&path).unwrap_or_default();
                if allowed.iter().any(|ext| ext.eq_ignore_ascii_case(&extension)) {
                    None
                } else {
                    Some(format!(
                        "File extension '{}' not allowed, expected one of: {}.",
                        extension,
                        allowed.join(", ")
                    ))
                }
            }
            Self::JsonSerializable => parse_json(raw).err().map(|err| err.to_string()),
            Self::FilePath => {
                let path = submitted_text(raw)?;
                if Path::new(&path).exists() {
                    None
                } else {
                    Some(format!("Path '{}' does not exist.", path))
                }
            }
            Self::Required | Self::Optional | Self::RequiredIfNew | Self::ParentSelection { .. } => None,
        }
    }
}

/// Where a select field gets its choices from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChoiceSource {
    Static,
    ForeignKey {
        parent: String,
        parent_attr: String,
        nullable: bool,
        /// Offer `<new>` to create a parent entry.
        new_entry: bool,
    },
}

impl ChoiceSource {
    /// Current choices: `NULL` for nullable references, then the distinct
    /// parent key values, then `<new>` when new entries are allowed.
    pub fn load(&self, db: &Database) -> Result<Vec<Choice>> {
        let Self::ForeignKey {
            parent,
            parent_attr,
            nullable,
            new_entry,
        } = self
        else {
            return Ok(Vec::new());
        };

        let mut choices = Vec::new();
        if *nullable {
            choices.push(Choice::plain(NULL_CHOICE));
        }
        for row in db.project(parent, &[parent_attr.as_str()], &Restriction::new())? {
            if let Some(value) = row.get(parent_attr) {
                choices.push(Choice::plain(choice_text(value)));
            }
        }
        if *new_entry {
            choices.push(Choice::new(NEW_ENTRY, NEW_ENTRY_LABEL));
        }
        Ok(choices)
    }
}

/// Render metadata shared by every field variant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldMeta {
    pub name: String,
    pub label: String,
    pub description: String,
    pub required: bool,
    pub nullable: bool,
    pub primary_key: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Json>,
    pub validators: Vec<Validator>,
}

impl FieldMeta {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let label = name.replace('_', " ");
        Self {
            description: label.clone(),
            label,
            name,
            required: false,
            nullable: false,
            primary_key: false,
            default: None,
            validators: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        if !description.trim().is_empty() {
            self.description = description.trim().to_string();
        }
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn with_default(mut self, default: Option<Json>) -> Self {
        self.default = default;
        self
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validators.push(validator);
        self
    }

    fn has_validator(&self, validator: &Validator) -> bool {
        self.validators.contains(validator)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonShape {
    Any,
    List,
    Tuple,
    Set,
    Dict,
}

impl JsonShape {
    fn reconstruct(self, json: Json) -> std::result::Result<Json, FieldError> {
        match (self, json) {
            (Self::Any, json) => Ok(json),
            (Self::List | Self::Tuple, json @ Json::Array(_)) => Ok(json),
            (Self::Dict, json @ Json::Object(_)) => Ok(json),
            (Self::Set, Json::Array(items)) => {
                let mut seen = BTreeSet::new();
                Ok(Json::Array(
                    items
                        .into_iter()
                        .filter(|item| seen.insert(item.to_string()))
                        .collect(),
                ))
            }
            (Self::Dict, other) => Err(FieldError::Shape(format!("expected an object, got {}", other))),
            (_, other) => Err(FieldError::Shape(format!("expected a list, got {}", other))),
        }
    }
}

/// Conversion from submitted JSON to a stored value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PostProcess {
    Identity,
    Coerce { attr_type: AttributeType },
    /// Run `inner`, then the named adapter's `put`.
    Adapter { adapter: String, inner: Box<PostProcess> },
    /// Decode an uploaded file by extension.
    DecodeFile,
    /// Read an uploaded file into an attachment.
    ReadAttachment,
    Json { shape: JsonShape },
    /// Choices are indices into `values`.
    EnumLookup { values: Vec<Json> },
}

impl PostProcess {
    pub fn apply(&self, raw: &Json, adapters: &AdapterRegistry) -> std::result::Result<Value, FieldError> {
        match self {
            Self::Identity => Ok(match raw {
                Json::String(s) if is_none_text(s) => Value::Null,
                other => Value::from_json(other),
            }),
            Self::Coerce { attr_type } => Ok(attr_type.coerce(raw)?),
            Self::Adapter { adapter, inner } => {
                let value = inner.apply(raw, adapters)?;
                Ok(adapters.put(adapter, value)?)
            }
            Self::DecodeFile => match submitted_text(raw) {
                Some(path) => Ok(Value::Blob(decode::decode_file(&path)?)),
                None => Ok(Value::Null),
            },
            Self::ReadAttachment => match submitted_text(raw) {
                Some(path) => read_attachment(&path),
                None => Ok(Value::Null),
            },
            Self::Json { shape } => {
                if is_empty_value(raw) {
                    return Ok(Value::Null);
                }
                Ok(Value::Blob(shape.reconstruct(parse_json(raw)?)?))
            }
            Self::EnumLookup { values } => lookup_enum(values, raw),
        }
    }

    /// Checks `apply` would do without touching the filesystem or adapters.
    pub fn check(&self, raw: &Json) -> std::result::Result<(), FieldError> {
        match self {
            Self::Coerce { attr_type } => attr_type.coerce(raw).map(|_| ()).map_err(Into::into),
            Self::Json { shape } => shape.reconstruct(parse_json(raw)?).map(|_| ()),
            Self::EnumLookup { values } => lookup_enum(values, raw).map(|_| ()),
            Self::Adapter { inner, .. } => inner.check(raw),
            Self::Identity | Self::DecodeFile | Self::ReadAttachment => Ok(()),
        }
    }
}

fn read_attachment(path: &str) -> std::result::Result<Value, FieldError> {
    let bytes = fs::read(path).map_err(|source| FieldError::Io {
        path: path.to_string(),
        source,
    })?;
    let filename = Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(path)
        .to_string();
    Ok(Value::Attachment(Attachment { filename, bytes }))
}

fn parse_json(raw: &Json) -> std::result::Result<Json, FieldError> {
    match raw {
        Json::String(text) => serde_json::from_str(text).map_err(|err| FieldError::Json(err.to_string())),
        other => Ok(other.clone()),
    }
}

fn lookup_enum(values: &[Json], raw: &Json) -> std::result::Result<Value, FieldError> {
    let Some(text) = submitted_text(raw) else {
        return Ok(Value::Null);
    };
    text.parse::<usize>()
        .ok()
        .and_then(|idx| values.get(idx))
        .map(Value::from_json)
        .ok_or(FieldError::Choice(text))
}

/// Submitted scalar as trimmed text; `None` for nulls and the `NONES`.
pub(crate) fn submitted_text(raw: &Json) -> Option<String> {
    match raw {
        Json::String(s) if is_none_text(s) => None,
        Json::String(s) => Some(s.trim().to_string()),
        Json::Number(n) => Some(n.to_string()),
        Json::Bool(b) => Some(b.to_string()),
        Json::Null | Json::Array(_) | Json::Object(_) => None,
    }
}

pub(crate) fn is_empty_value(raw: &Json) -> bool {
    match raw {
        Json::Null => true,
        Json::String(s) => is_none_text(s),
        Json::Array(items) => items.iter().all(is_empty_value),
        Json::Object(map) => map.values().all(is_empty_value),
        Json::Number(_) | Json::Bool(_) => false,
    }
}

/// How a stored value appears as a select choice.
pub(crate) fn choice_text(value: &Value) -> String {
    match value {
        Value::Null => NULL_CHOICE.to_string(),
        Value::Boolean(true) => "1".to_string(),
        Value::Boolean(false) => "0".to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum FieldNode {
    Input {
        meta: FieldMeta,
        widget: WidgetKind,
    },
    Select {
        meta: FieldMeta,
        choices: Vec<Choice>,
        source: ChoiceSource,
    },
    /// Pick an existing parent entry or fill in a new one.
    ParentForm {
        meta: FieldMeta,
        parent: String,
        parent_attr: String,
        form: FormDescriptor,
    },
    /// Repeated entries of a part table.
    PartList {
        meta: FieldMeta,
        table: String,
        form: FormDescriptor,
        min_entries: usize,
    },
    SubForm {
        meta: FieldMeta,
        form: FormDescriptor,
    },
    List {
        meta: FieldMeta,
        item: Box<FormField>,
        min_entries: usize,
    },
    /// Reference to a parent table without entries.
    Disabled {
        meta: FieldMeta,
        error: String,
        #[serde(skip)]
        source: Option<ChoiceSource>,
    },
}

impl FieldNode {
    pub fn meta(&self) -> &FieldMeta {
        match self {
            Self::Input { meta, .. }
            | Self::Select { meta, .. }
            | Self::ParentForm { meta, .. }
            | Self::PartList { meta, .. }
            | Self::SubForm { meta, .. }
            | Self::List { meta, .. }
            | Self::Disabled { meta, .. } => meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut FieldMeta {
        match self {
            Self::Input { meta, .. }
            | Self::Select { meta, .. }
            | Self::ParentForm { meta, .. }
            | Self::PartList { meta, .. }
            | Self::SubForm { meta, .. }
            | Self::List { meta, .. }
            | Self::Disabled { meta, .. } => meta,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormField {
    #[serde(flatten)]
    pub node: FieldNode,
    pub post_process: PostProcess,
}

impl FormField {
    pub fn new(node: FieldNode, post_process: PostProcess) -> Self {
        Self { node, post_process }
    }

    pub fn name(&self) -> &str {
        &self.node.meta().name
    }

    pub fn meta(&self) -> &FieldMeta {
        self.node.meta()
    }

    pub fn is_upload(&self) -> bool {
        matches!(
            self.node,
            FieldNode::Input {
                widget: WidgetKind::BlobUpload | WidgetKind::FileUpload,
                ..
            }
        )
    }

    pub fn choices(&self) -> Option<&[Choice]> {
        match &self.node {
            FieldNode::Select { choices, .. } => Some(choices),
            _ => None,
        }
    }

    /// Convert an extracted value. Parent forms yield the chosen key and fail
    /// on `<new>`, which has to be resolved by inserting the parent first.
    pub fn process(&self, raw: &Json, adapters: &AdapterRegistry) -> std::result::Result<Value, FieldError> {
        match &self.node {
            FieldNode::Input { .. } | FieldNode::Select { .. } | FieldNode::Disabled { .. } => {
                self.post_process.apply(raw, adapters)
            }
            FieldNode::ParentForm { form, .. } => {
                let chosen = raw.get(EXISTING_ENTRIES).unwrap_or(raw);
                if submitted_text(chosen).as_deref() == Some(NEW_ENTRY) {
                    return Err(FieldError::Choice(NEW_ENTRY.to_string()));
                }
                match form.fields.first() {
                    Some(select) => select.process(chosen, adapters),
                    None => Ok(Value::Null),
                }
            }
            FieldNode::SubForm { form, .. } => Ok(Value::Blob(Json::Object(form.process(raw, adapters)?))),
            FieldNode::PartList { form, .. } => {
                let mut entries = Vec::new();
                for entry in raw.as_array().into_iter().flatten() {
                    entries.push(Json::Object(form.process(entry, adapters)?));
                }
                Ok(if entries.is_empty() { Value::Null } else { Value::Blob(Json::Array(entries)) })
            }
            FieldNode::List { item, .. } => {
                let mut items = Vec::new();
                for raw_item in raw.as_array().into_iter().flatten() {
                    let value = item.process(raw_item, adapters)?;
                    if !value.is_null() {
                        items.push(value.to_json());
                    }
                }
                Ok(if items.is_empty() { Value::Null } else { Value::Blob(Json::Array(items)) })
            }
        }
    }

    fn validate(&self, raw: &Json, path: String, new_parent: bool, edit: bool, errors: &mut ValidationErrors) {
        let meta = self.meta();
        let empty = is_empty_value(raw);
        let required = meta.required || (new_parent && meta.has_validator(&Validator::RequiredIfNew));

        match &self.node {
            FieldNode::Input { .. } | FieldNode::Select { .. } => {
                if empty {
                    // an empty upload on edit keeps the stored file
                    if required && !(edit && self.is_upload()) {
                        errors.add(path, "This field is required.");
                    }
                    return;
                }
                for validator in &meta.validators {
                    if let Some(message) = validator.check(raw) {
                        errors.add(path.clone(), message);
                    }
                }
                if let Some(choices) = self.choices() {
                    let text = submitted_text(raw).unwrap_or_default();
                    if !choices.iter().any(|choice| choice.value == text) {
                        errors.add(path, "Not a valid choice.");
                        return;
                    }
                }
                if let Err(err) = self.post_process.check(raw) {
                    errors.add(path, err.to_string());
                }
            }
            FieldNode::ParentForm { form, .. } => {
                let wrapped = wrap_selection(raw);
                let chosen = wrapped.get(EXISTING_ENTRIES).unwrap_or(&Json::Null);
                let select_path = format!("{}.{}", path, EXISTING_ENTRIES);

                match submitted_text(chosen) {
                    None if required => errors.add(select_path, "This field is required."),
                    None => {}
                    Some(text) if text == NEW_ENTRY => {
                        for field in form.fields.iter().filter(|f| f.name() != EXISTING_ENTRIES) {
                            let value = wrapped.get(field.name()).unwrap_or(&Json::Null);
                            field.validate(value, format!("{}.{}", path, field.name()), true, false, errors);
                        }
                    }
                    Some(text) => {
                        let Some(select) = form.fields.first() else { return };
                        if !select.choices().unwrap_or_default().iter().any(|c| c.value == text) {
                            errors.add(select_path, "Not a valid choice.");
                        }
                        for validator in &select.meta().validators {
                            if let Validator::ParentSelection { primary_key } = validator
                                && !is_empty_value(wrapped.get(primary_key).unwrap_or(&Json::Null))
                            {
                                errors.add(
                                    format!("{}.{}", path, primary_key),
                                    "Leave empty when selecting an existing entry.",
                                );
                            }
                        }
                    }
                }
            }
            FieldNode::PartList { form, .. } => match raw {
                Json::Array(entries) => {
                    for (idx, entry) in entries.iter().enumerate() {
                        if !is_empty_value(entry) {
                            form.validate_into(entry, &format!("{}.{}", path, idx), false, edit, errors);
                        }
                    }
                }
                Json::Null => {}
                _ => errors.add(path, "Expected a list of entries."),
            },
            FieldNode::SubForm { form, .. } => {
                if empty && required {
                    errors.add(path, "This field is required.");
                } else {
                    form.validate_into(raw, &path, new_parent, edit, errors);
                }
            }
            FieldNode::List { item, .. } => match raw {
                Json::Array(items) => {
                    if required && items.iter().all(is_empty_value) {
                        errors.add(path.clone(), "This field is required.");
                    }
                    for (idx, raw_item) in items.iter().enumerate() {
                        if !is_empty_value(raw_item) {
                            item.validate(raw_item, format!("{}.{}", path, idx), new_parent, edit, errors);
                        }
                    }
                }
                _ if empty => {
                    if required {
                        errors.add(path, "This field is required.");
                    }
                }
                _ => errors.add(path, "Expected a list."),
            },
            FieldNode::Disabled { error, .. } => {
                if required {
                    errors.add(path, error.clone());
                }
            }
        }
    }

    fn extract(&self, raw: &Json) -> Json {
        match &self.node {
            FieldNode::Input {
                widget: WidgetKind::Checkbox,
                ..
            } => Json::Bool(match raw {
                Json::Bool(b) => *b,
                other => submitted_text(other).is_some_and(|text| {
                    matches!(text.to_ascii_lowercase().as_str(), "1" | "true" | "on" | "y" | "yes")
                }),
            }),
            FieldNode::Input { .. } | FieldNode::Select { .. } | FieldNode::Disabled { .. } => {
                if is_empty_value(raw) { Json::Null } else { raw.clone() }
            }
            FieldNode::ParentForm { form, .. } => Json::Object(form.extract(&wrap_selection(raw))),
            FieldNode::SubForm { form, .. } => Json::Object(form.extract(raw)),
            FieldNode::PartList { form, .. } => {
                let entries: Vec<Json> = raw
                    .as_array()
                    .into_iter()
                    .flatten()
                    .filter(|entry| !is_empty_value(entry))
                    .map(|entry| Json::Object(form.extract(entry)))
                    .collect();
                if entries.is_empty() { Json::Null } else { Json::Array(entries) }
            }
            FieldNode::List { item, .. } => {
                let items: Vec<Json> = raw
                    .as_array()
                    .into_iter()
                    .flatten()
                    .map(|raw_item| item.extract(raw_item))
                    .filter(|value| !is_empty_value(value))
                    .collect();
                if items.is_empty() { Json::Null } else { Json::Array(items) }
            }
        }
    }
}

/// A parent selection may be submitted as the bare choice.
fn wrap_selection(raw: &Json) -> Json {
    match raw {
        Json::Object(_) => raw.clone(),
        Json::Null => Json::Object(Map::new()),
        other => serde_json::json!({ EXISTING_ENTRIES: other }),
    }
}

fn refresh_field(field: &mut FormField, db: &Database) -> Result<()> {
    match &mut field.node {
        FieldNode::ParentForm { form, .. } | FieldNode::PartList { form, .. } | FieldNode::SubForm { form, .. } => {
            return form.refresh_choices(db);
        }
        FieldNode::List { item, .. } => return refresh_field(item, db),
        _ => {}
    }

    let (meta, source) = match &field.node {
        FieldNode::Select {
            meta,
            source: source @ ChoiceSource::ForeignKey { .. },
            ..
        } => (meta.clone(), source.clone()),
        FieldNode::Disabled {
            meta,
            source: Some(source),
            ..
        } => (meta.clone(), source.clone()),
        _ => return Ok(()),
    };

    let choices = source.load(db)?;
    let new_entry = matches!(source, ChoiceSource::ForeignKey { new_entry: true, .. });
    field.node = if new_entry || choices.iter().any(Choice::is_candidate) {
        FieldNode::Select { meta, choices, source }
    } else {
        FieldNode::Disabled {
            error: empty_parent_error(&source),
            meta,
            source: Some(source),
        }
    };
    Ok(())
}

pub(crate) fn empty_parent_error(source: &ChoiceSource) -> String {
    match source {
        ChoiceSource::ForeignKey { parent, .. } => {
            format!("No entries in '{}'; insert one there first.", parent)
        }
        ChoiceSource::Static => "No choices available.".to_string(),
    }
}

/// Form for one table: its own attributes followed by part-table lists.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormDescriptor {
    pub table: String,
    pub fields: Vec<FormField>,
}

impl FormDescriptor {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&FormField> {
        self.fields.iter().find(|field| field.name() == name)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(FormField::name).collect()
    }

    /// Check a submission, collecting every failure by field path.
    pub fn validate(&self, submission: &Json) -> std::result::Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        self.validate_into(submission, "", false, false, &mut errors);
        errors.into_result()
    }

    /// Like [`validate`](Self::validate) for an edit of a stored row: upload
    /// fields may be left empty.
    pub fn validate_edit(&self, submission: &Json) -> std::result::Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        self.validate_into(submission, "", false, true, &mut errors);
        errors.into_result()
    }

    fn validate_into(&self, submission: &Json, prefix: &str, new_parent: bool, edit: bool, errors: &mut ValidationErrors) {
        for field in &self.fields {
            let raw = submission.get(field.name()).unwrap_or(&Json::Null);
            let path = if prefix.is_empty() {
                field.name().to_string()
            } else {
                format!("{}.{}", prefix, field.name())
            };
            field.validate(raw, path, new_parent, edit, errors);
        }
    }

    /// Submitted values with empties normalized to null. Empty part entries
    /// and list items are dropped; a list left empty becomes null.
    pub fn extract(&self, submission: &Json) -> Map<String, Json> {
        self.fields
            .iter()
            .map(|field| {
                let raw = submission.get(field.name()).unwrap_or(&Json::Null);
                (field.name().to_string(), field.extract(raw))
            })
            .collect()
    }

    /// Convert extracted values of every field to JSON.
    pub fn process(&self, values: &Json, adapters: &AdapterRegistry) -> std::result::Result<Map<String, Json>, FieldError> {
        let mut processed = Map::new();
        for field in &self.fields {
            let raw = values.get(field.name()).unwrap_or(&Json::Null);
            processed.insert(field.name().to_string(), field.process(raw, adapters)?.to_json());
        }
        Ok(processed)
    }

    /// Form values for a stored row. Uploads are never populated; parent
    /// selections are wrapped as `{existing_entries: value}`.
    pub fn populate(&self, row: &Row) -> Map<String, Json> {
        let mut values = Map::new();
        for field in &self.fields {
            let Some(value) = row.get(field.name()) else { continue };
            let populated = match &field.node {
                FieldNode::Input {
                    widget: WidgetKind::BlobUpload | WidgetKind::FileUpload,
                    ..
                } => continue,
                FieldNode::Select { .. } => Json::String(choice_text(value)),
                FieldNode::ParentForm { .. } => serde_json::json!({ EXISTING_ENTRIES: choice_text(value) }),
                FieldNode::Input { .. } | FieldNode::Disabled { .. } => value.to_json(),
                FieldNode::PartList { .. } | FieldNode::SubForm { .. } | FieldNode::List { .. } => continue,
            };
            values.insert(field.name().to_string(), populated);
        }
        values
    }

    /// Populate from the stored row matching `restriction`, including its
    /// part-table entries.
    pub fn load(&self, db: &Database, restriction: &Restriction) -> Result<Json> {
        let row = db.fetch1(&self.table, restriction)?;
        let mut values = self.populate(&row);

        let key: Restriction = db
            .catalog()
            .get_table(&self.table)?
            .primary_key()
            .iter()
            .filter_map(|attr| row.get(*attr).map(|value| (attr.to_string(), value.clone())))
            .collect();

        for field in &self.fields {
            if let FieldNode::PartList { table, form, .. } = &field.node {
                let entries = db
                    .fetch(table, &key)?
                    .iter()
                    .map(|part_row| Json::Object(form.populate(part_row)))
                    .collect();
                values.insert(field.name().to_string(), Json::Array(entries));
            }
        }
        Ok(Json::Object(values))
    }

    /// Re-read foreign-key choices, leaving everything else as built.
    pub fn refresh_choices(&mut self, db: &Database) -> Result<()> {
        for field in &mut self.fields {
            refresh_field(field, db)?;
        }
        Ok(())
    }
}
