//! Table definition language.
//!
//! ```text
//! experimenter : varchar(31)  # short user-name
//! ---
//! first_name : varchar(63)
//! email = null : varchar(255)
//! -> [nullable] core.LookupName
//! -> Experimenter.proj(supervisor='experimenter')
//! ```
//!
//! Lines above `---` form the primary key. `->` copies the primary key of the
//! referenced table (renamed through `.proj(new='old')`) and records a
//! foreign key.

pub mod types;

pub use types::{match_type, parse_enum_choices};

use crate::core::{Attribute, AttributeType, DbError, DefaultValue, Heading, Result};
use crate::schema::AdapterRegistry;
use crate::storage::{Catalog, Database, ForeignKey, TableDescriptor, Tier};
use std::collections::BTreeMap;
use tracing::debug;

/// Parsed table: descriptor plus its outgoing foreign keys.
#[derive(Debug, Clone)]
pub struct TableDefinition {
    pub descriptor: TableDescriptor,
    pub foreign_keys: Vec<ForeignKey>,
}

/// Parse `definition` and declare the table in `db`.
pub fn declare(
    db: &mut Database,
    name: &str,
    tier: Tier,
    definition: &str,
    adapters: &AdapterRegistry,
) -> Result<()> {
    let parsed = parse_definition(name, tier, definition, db.catalog(), adapters)?;
    db.declare(parsed.descriptor, parsed.foreign_keys)
}

pub fn parse_definition(
    name: &str,
    tier: Tier,
    definition: &str,
    catalog: &Catalog,
    adapters: &AdapterRegistry,
) -> Result<TableDefinition> {
    check_table_name(name, tier)?;

    let mut attributes: Vec<Attribute> = Vec::new();
    let mut foreign_keys = Vec::new();
    let mut in_key = true;

    for (line_idx, raw_line) in definition.lines().enumerate() {
        let line_no = line_idx + 1;
        let line = raw_line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if line.starts_with("---") {
            if !in_key {
                return Err(line_error(line_no, "duplicate '---' separator"));
            }
            in_key = false;
            continue;
        }

        if let Some(reference) = line.strip_prefix("->") {
            let (fk, inherited) = parse_reference(name, tier, reference, in_key, catalog, line_no)?;
            for attr in inherited {
                if !attributes.iter().any(|existing| existing.name == attr.name) {
                    attributes.push(attr);
                }
            }
            foreign_keys.push(fk);
            continue;
        }

        let attr = parse_attribute(line, in_key, adapters, line_no)?;
        if attributes.iter().any(|existing| existing.name == attr.name) {
            return Err(line_error(line_no, &format!("duplicate attribute '{}'", attr.name)));
        }
        attributes.push(attr);
    }

    let heading = Heading::new(attributes);
    let primary_key = heading.primary_key();
    if primary_key.is_empty() {
        return Err(DbError::ParseError(format!("table '{}' declares no primary key", name)));
    }
    if let Some(auto) = heading.attributes().iter().find(|attr| attr.auto_increment)
        && primary_key.len() != 1
    {
        return Err(DbError::ParseError(format!(
            "auto_increment attribute '{}' must be the only primary key attribute of '{}'",
            auto.name, name
        )));
    }

    debug!(table = %name, attributes = heading.len(), references = foreign_keys.len(), "parsed definition");
    Ok(TableDefinition {
        descriptor: TableDescriptor::new(name, heading, tier),
        foreign_keys,
    })
}

fn check_table_name(name: &str, tier: Tier) -> Result<()> {
    let segments: Vec<&str> = name.split('.').collect();
    let expected = if tier == Tier::Part { 3 } else { 2 };
    if segments.len() != expected || !segments.iter().all(|s| is_identifier(s)) {
        let shape = if tier == Tier::Part { "schema.Table.Part" } else { "schema.Table" };
        return Err(DbError::ParseError(format!(
            "table name '{}' must have the form {}",
            name, shape
        )));
    }
    Ok(())
}

fn parse_attribute(line: &str, in_key: bool, adapters: &AdapterRegistry, line_no: usize) -> Result<Attribute> {
    let (body, comment) = match find_unquoted(line, '#') {
        Some(idx) => (&line[..idx], line[idx + 1..].trim()),
        None => (line, ""),
    };

    let colon = find_unquoted(body, ':')
        .ok_or_else(|| line_error(line_no, "expected 'name : type'"))?;
    let (lhs, sql_type) = (&body[..colon], body[colon + 1..].trim());

    let (name, default) = match find_unquoted(lhs, '=') {
        Some(idx) => (lhs[..idx].trim(), Some(lhs[idx + 1..].trim())),
        None => (lhs.trim(), None),
    };
    if !is_identifier(name) {
        return Err(line_error(line_no, &format!("invalid attribute name '{}'", name)));
    }
    if sql_type.is_empty() {
        return Err(line_error(line_no, &format!("attribute '{}' has no type", name)));
    }

    let (sql_type, auto_increment) = strip_auto_increment(sql_type);
    let attr_type = match_type(sql_type, Some(adapters)).map_err(|err| line_error(line_no, &err.to_string()))?;

    if auto_increment && (!in_key || attr_type != AttributeType::Integer) {
        return Err(line_error(
            line_no,
            &format!("auto_increment requires an integer primary key attribute, not '{}'", name),
        ));
    }

    let mut attr = Attribute::new(name, attr_type, sql_type).with_comment(comment);
    attr.in_key = in_key;
    attr.auto_increment = auto_increment;

    if let Some(literal) = default {
        let default = parse_default(&attr, literal).map_err(|err| line_error(line_no, &err.to_string()))?;
        if in_key && default == DefaultValue::Null {
            return Err(line_error(
                line_no,
                &format!("primary key attribute '{}' cannot be nullable", name),
            ));
        }
        attr = attr.with_default(default);
    }

    Ok(attr)
}

fn strip_auto_increment(sql_type: &str) -> (&str, bool) {
    let lower = sql_type.to_ascii_lowercase();
    match lower.strip_suffix("auto_increment") {
        Some(rest) => (sql_type[..rest.len()].trim(), true),
        None => (sql_type, false),
    }
}

fn parse_default(attr: &Attribute, literal: &str) -> Result<DefaultValue> {
    if literal.eq_ignore_ascii_case("null") {
        return Ok(DefaultValue::Null);
    }
    if literal.eq_ignore_ascii_case("current_timestamp") {
        return Ok(DefaultValue::CurrentTimestamp);
    }

    let unquoted = literal
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| literal.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
        .unwrap_or(literal);

    let value = attr
        .attr_type
        .coerce(&serde_json::Value::String(unquoted.to_string()))?;
    if value.is_null() {
        return Ok(DefaultValue::Null);
    }
    attr.validate(&value)?;
    Ok(DefaultValue::Value(value))
}

fn parse_reference(
    child: &str,
    tier: Tier,
    reference: &str,
    in_key: bool,
    catalog: &Catalog,
    line_no: usize,
) -> Result<(ForeignKey, Vec<Attribute>)> {
    let mut rest = reference.trim();
    let mut nullable = false;

    if let Some(options) = rest.strip_prefix('[') {
        let close = options
            .find(']')
            .ok_or_else(|| line_error(line_no, "unterminated reference options"))?;
        for option in options[..close].split(',').map(str::trim) {
            match option.to_ascii_lowercase().as_str() {
                "nullable" => nullable = true,
                other => return Err(line_error(line_no, &format!("unknown reference option '{}'", other))),
            }
        }
        rest = options[close + 1..].trim();
    }

    if nullable && in_key {
        return Err(line_error(line_no, "primary key references cannot be nullable"));
    }

    let (target, renames) = match rest.find(".proj(") {
        Some(idx) => {
            let args = rest[idx + ".proj(".len()..]
                .strip_suffix(')')
                .ok_or_else(|| line_error(line_no, "unterminated .proj("))?;
            (&rest[..idx], parse_renames(args, line_no)?)
        }
        None => (rest, BTreeMap::new()),
    };

    let parent_name = resolve_table(child, tier, target.trim(), catalog)
        .ok_or_else(|| line_error(line_no, &format!("referenced table '{}' is not declared", target.trim())))?;
    let parent = catalog.get_table(&parent_name)?;

    // old name -> new name
    let by_old: BTreeMap<&str, &str> = renames.iter().map(|(new, old)| (old.as_str(), new.as_str())).collect();
    for old in by_old.keys() {
        if !parent.primary_key().contains(old) {
            return Err(line_error(
                line_no,
                &format!("'{}' is not a primary key attribute of '{}'", old, parent_name),
            ));
        }
    }

    let mut attr_map = BTreeMap::new();
    let mut inherited = Vec::new();
    for parent_attr in parent.heading().attributes().iter().filter(|attr| attr.in_key) {
        let child_name = by_old.get(parent_attr.name.as_str()).copied().unwrap_or(parent_attr.name.as_str());

        let mut attr = parent_attr.clone();
        attr.name = child_name.to_string();
        attr.in_key = in_key;
        attr.auto_increment = false;
        attr.default = None;
        attr.nullable = false;
        if nullable {
            attr = attr.nullable();
        }

        attr_map.insert(child_name.to_string(), parent_attr.name.clone());
        inherited.push(attr);
    }

    let fk = ForeignKey::new(child, parent_name, attr_map).nullable(nullable);
    Ok((fk, inherited))
}

fn parse_renames(args: &str, line_no: usize) -> Result<BTreeMap<String, String>> {
    let mut renames = BTreeMap::new();
    for pair in args.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (new, old) = pair
            .split_once('=')
            .ok_or_else(|| line_error(line_no, &format!("expected new='old' in projection, got '{}'", pair)))?;
        let old = old.trim().trim_matches(|c| c == '\'' || c == '"');
        let new = new.trim();
        if !is_identifier(new) || !is_identifier(old) {
            return Err(line_error(line_no, &format!("invalid projection '{}'", pair)));
        }
        renames.insert(new.to_string(), old.to_string());
    }
    Ok(renames)
}

/// Resolve a reference target: `master` inside part tables, fully qualified
/// names, names relative to the child's schema, or a unique bare table name.
fn resolve_table(child: &str, tier: Tier, target: &str, catalog: &Catalog) -> Option<String> {
    let schema = child.split('.').next().unwrap_or_default();

    if target == "master" && tier == Tier::Part {
        return child.rfind('.').map(|idx| child[..idx].to_string());
    }

    if catalog.table_exists(target) {
        return Some(target.to_string());
    }

    let relative = format!("{}.{}", schema, target);
    if catalog.table_exists(&relative) {
        return Some(relative);
    }

    if target.contains('.') {
        return None;
    }

    let mut candidates = catalog
        .tables()
        .filter(|table| table.master().is_none() && table.table_name() == target);
    match (candidates.next(), candidates.next()) {
        (Some(table), None) => Some(table.name().to_string()),
        _ => None,
    }
}

fn find_unquoted(text: &str, needle: char) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (idx, ch) in text.char_indices() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => {}
            None if ch == '\'' || ch == '"' => quote = Some(ch),
            None if ch == needle => return Some(idx),
            None => {}
        }
    }
    None
}

fn is_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    let Some(first) = chars.next() else {
        return false;
    };

    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }

    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

fn line_error(line_no: usize, message: &str) -> DbError {
    DbError::ParseError(format!("line {}: {}", line_no, message))
}
