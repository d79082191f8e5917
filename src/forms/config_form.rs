//! Settings forms built from a JSON description instead of a table.
//!
//! ```json
//! {
//!     "gain": "float",
//!     "threshold": ["float", 0.5],
//!     "mode": [["fast", "slow"], null],
//!     "channels": "list---int",
//!     "stimulus": {"duration": "float", "_iterate": true},
//!     "_descriptions": {"gain": "amplifier gain"}
//! }
//! ```
//!
//! A two-element array is `[type, default]`; such a field is required unless
//! the default is null. Keys starting with `_` are directives.

use super::descriptor::{
    Choice, ChoiceSource, FieldMeta, FieldNode, FormDescriptor, FormField, JsonShape, PostProcess,
    Validator, WidgetKind,
};
use super::{MAX_FORM_DEPTH, NULL_CHOICE};
use crate::config::AppConfig;
use crate::core::{AttributeType, DbError, Result};
use serde_json::Value as Json;
use std::fs;

const ARRAY_TYPES: [&str; 4] = ["numpy.array", "numpy.recarray", "pandas.DataFrame", "pandas.Series"];

pub fn build_config_form(name: &str, spec: &Json, config: &AppConfig) -> Result<FormDescriptor> {
    build_form(name, spec, config, 0)
}

fn build_form(name: &str, spec: &Json, config: &AppConfig, depth: usize) -> Result<FormDescriptor> {
    let object = spec
        .as_object()
        .ok_or_else(|| DbError::ParseError(format!("settings form '{}' must be an object", name)))?;
    let descriptions = object.get("_descriptions").and_then(Json::as_object);

    let mut form = FormDescriptor::new(name);
    for (key, value) in object {
        if key.starts_with('_') {
            continue;
        }

        let (kind, default) = match value {
            Json::Array(pair) if pair.len() == 2 => (&pair[0], pair[1].clone()),
            Json::Array(_) => {
                return Err(DbError::ParseError(format!(
                    "'{}': a list must be [type, default]",
                    key
                )));
            }
            other => (other, Json::Null),
        };
        let required = !matches!(value, Json::Array(_)) || !default.is_null();

        let mut meta = FieldMeta::new(key.clone()).required(required);
        if let Some(description) = descriptions.and_then(|d| d.get(key)).and_then(Json::as_str) {
            meta = meta.with_description(description);
        }
        meta = meta.with_validator(if required { Validator::Required } else { Validator::Optional });
        if !default.is_null() {
            meta.default = Some(default.clone());
        }

        form.fields.push(config_field(key, kind, &default, meta, config, depth)?);
    }
    Ok(form)
}

fn config_field(
    key: &str,
    kind: &Json,
    default: &Json,
    mut meta: FieldMeta,
    config: &AppConfig,
    depth: usize,
) -> Result<FormField> {
    let input = |meta: FieldMeta, widget: WidgetKind, post_process: PostProcess| -> Result<FormField> {
        Ok(FormField::new(FieldNode::Input { meta, widget }, post_process))
    };

    match kind {
        Json::Array(values) => enum_field(meta, values, default),
        Json::Object(nested) => {
            if depth >= MAX_FORM_DEPTH {
                return Err(DbError::ParseError(format!("'{}' is nested too deeply", key)));
            }
            let iterate = nested.get("_iterate").and_then(Json::as_bool).unwrap_or(false);
            let form = build_form(key, kind, config, depth + 1)?;
            if !iterate {
                return Ok(FormField::new(FieldNode::SubForm { meta, form }, PostProcess::Identity));
            }

            let item = FormField::new(
                FieldNode::SubForm {
                    meta: FieldMeta::new(key),
                    form,
                },
                PostProcess::Identity,
            );
            meta.default = None;
            Ok(FormField::new(
                FieldNode::List {
                    meta,
                    item: Box::new(item),
                    min_entries: 1,
                },
                PostProcess::Identity,
            ))
        }
        Json::String(kind) => {
            if let Some(inner) = kind.strip_prefix("list---").or_else(|| kind.strip_prefix("tuple---")) {
                let item = config_field(key, &Json::String(inner.to_string()), &Json::Null, FieldMeta::new(key), config, depth)?;
                return Ok(FormField::new(
                    FieldNode::List {
                        meta,
                        item: Box::new(item),
                        min_entries: 1,
                    },
                    PostProcess::Identity,
                ));
            }
            if let Some(rest) = kind.strip_prefix("folder---") {
                return folder_field(key, rest, meta);
            }

            let coerce = |attr_type: AttributeType| PostProcess::Coerce { attr_type };
            let json = |meta: FieldMeta, shape: JsonShape| {
                input(meta.with_validator(Validator::JsonSerializable), WidgetKind::Json, PostProcess::Json { shape })
            };
            match kind.as_str() {
                "list" => json(meta, JsonShape::List),
                "dict" => json(meta, JsonShape::Dict),
                "set" => json(meta, JsonShape::Set),
                "tuple" => json(meta, JsonShape::Tuple),
                "str" => input(meta, WidgetKind::Text, PostProcess::Identity),
                "int" => input(meta, WidgetKind::Integer, coerce(AttributeType::Integer)),
                "float" => input(meta, WidgetKind::Float, coerce(AttributeType::Float)),
                "bool" => {
                    meta.required = false;
                    meta.validators = vec![Validator::Optional];
                    input(meta, WidgetKind::Checkbox, coerce(AttributeType::Bool))
                }
                "json" => {
                    meta = meta.with_validator(Validator::Extension {
                        allowed: vec!["json".to_string()],
                    });
                    input(meta, WidgetKind::BlobUpload, PostProcess::DecodeFile)
                }
                "file" => {
                    meta = meta.with_validator(Validator::Extension {
                        allowed: config.attach_extensions.clone(),
                    });
                    input(meta, WidgetKind::FileUpload, PostProcess::Identity)
                }
                array if ARRAY_TYPES.contains(&array) => {
                    meta = meta.with_validator(Validator::Extension {
                        allowed: config.extensions.clone(),
                    });
                    input(meta, WidgetKind::BlobUpload, PostProcess::DecodeFile)
                }
                other => Err(DbError::ParseError(format!("'{}': unknown settings type '{}'", key, other))),
            }
        }
        other => Err(DbError::ParseError(format!("'{}': cannot build a field from {}", key, other))),
    }
}

/// Choice among literal values; submitted as the index of the value.
fn enum_field(mut meta: FieldMeta, values: &[Json], default: &Json) -> Result<FormField> {
    let mut choices = Vec::new();
    if default.is_null() {
        choices.push(Choice::new(NULL_CHOICE, NULL_CHOICE));
    }
    for (idx, value) in values.iter().enumerate() {
        let label = match value {
            Json::String(s) => s.trim().to_string(),
            other => other.to_string(),
        };
        choices.push(Choice::new(idx.to_string(), label));
    }
    meta.default = values
        .iter()
        .position(|value| value == default)
        .map(|idx| Json::String(idx.to_string()));

    Ok(FormField::new(
        FieldNode::Select {
            meta,
            choices,
            source: ChoiceSource::Static,
        },
        PostProcess::EnumLookup {
            values: values.to_vec(),
        },
    ))
}

/// `folder---<path>---<extension>`: choose one file of the folder.
fn folder_field(key: &str, spec: &str, meta: FieldMeta) -> Result<FormField> {
    let (folder, extension) = spec
        .split_once("---")
        .ok_or_else(|| DbError::ParseError(format!("'{}': expected folder---<path>---<extension>", key)))?;

    let mut files: Vec<String> = fs::read_dir(folder)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case(extension.trim_start_matches('.')))
        })
        .filter_map(|path| path.to_str().map(str::to_string))
        .collect();
    files.sort();

    let choices = files
        .into_iter()
        .map(|path| {
            let label = path.rsplit('/').next().unwrap_or(&path).to_string();
            Choice::new(path, label)
        })
        .collect();

    Ok(FormField::new(
        FieldNode::Select {
            meta,
            choices,
            source: ChoiceSource::Static,
        },
        PostProcess::Identity,
    ))
}
