use crate::core::{AttributeType, DbError, Result, TemporalKind};
use crate::schema::AdapterRegistry;

/// Map a declared type string to its semantic type tag.
///
/// Adapted types (`<name>`) resolve through `adapters`; an adapter's own
/// storage type is matched without adapters.
pub fn match_type(sql_type: &str, adapters: Option<&AdapterRegistry>) -> Result<AttributeType> {
    let raw = sql_type.trim();
    let lower = raw.to_ascii_lowercase();

    if let Some(name) = lower.strip_prefix('<').and_then(|rest| rest.strip_suffix('>')) {
        let adapters = adapters.ok_or_else(|| {
            DbError::ParseError(format!("adapter type {} cannot nest another adapter", raw))
        })?;
        let storage = match_type(adapters.get(name)?.attribute_type(), None)?;
        return Ok(AttributeType::Adapted {
            adapter: name.to_string(),
            storage: Box::new(storage),
        });
    }

    if lower.starts_with("enum") {
        return Ok(AttributeType::Enum {
            choices: parse_enum_choices(raw)?,
        });
    }

    let (base, store) = match lower.split_once('@') {
        Some((base, store)) => (base.trim(), Some(store.trim().to_string())),
        None => (lower.as_str(), None),
    };
    let base = base.strip_suffix("unsigned").map_or(base, str::trim);
    let (head, args) = split_args(base);

    let attr_type = match head {
        "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" => AttributeType::Integer,
        "decimal" | "numeric" => AttributeType::Decimal,
        "float" | "double" | "real" => AttributeType::Float,
        "varchar" => AttributeType::String {
            max_length: Some(parse_length(raw, args)?),
            fixed: false,
        },
        "char" => AttributeType::String {
            max_length: Some(parse_length(raw, args)?),
            fixed: true,
        },
        "tinytext" | "text" | "mediumtext" | "longtext" => AttributeType::String {
            max_length: None,
            fixed: false,
        },
        "bool" | "boolean" => AttributeType::Bool,
        "date" => AttributeType::Temporal { temporal: TemporalKind::Date },
        "datetime" => AttributeType::Temporal { temporal: TemporalKind::DateTime },
        "timestamp" => AttributeType::Temporal { temporal: TemporalKind::Timestamp },
        "time" => AttributeType::Temporal { temporal: TemporalKind::Time },
        "tinyblob" | "blob" | "mediumblob" | "longblob" => AttributeType::Blob { store },
        "attach" => AttributeType::Attach { store },
        "filepath" => {
            if store.is_none() {
                return Err(DbError::ParseError(format!("{} requires a store (filepath@store)", raw)));
            }
            AttributeType::Filepath { store }
        }
        "uuid" => AttributeType::Uuid,
        _ => AttributeType::Unsupported {
            sql_type: raw.to_string(),
        },
    };

    Ok(attr_type)
}

fn split_args(base: &str) -> (&str, Option<&str>) {
    match base.find('(') {
        Some(open) => {
            let close = base.rfind(')').unwrap_or(base.len());
            (base[..open].trim(), Some(base[open + 1..close.max(open + 1)].trim()))
        }
        None => (base.trim(), None),
    }
}

fn parse_length(raw: &str, args: Option<&str>) -> Result<usize> {
    args.and_then(|n| n.parse().ok())
        .ok_or_else(|| DbError::ParseError(format!("{} requires a length", raw)))
}

/// `enum('F', 'M', "U")` -> `["F", "M", "U"]`
pub fn parse_enum_choices(sql_type: &str) -> Result<Vec<String>> {
    let inner = match (sql_type.find('('), sql_type.rfind(')')) {
        (Some(open), Some(close)) if close > open => &sql_type[open + 1..close],
        _ => return Err(DbError::ParseError(format!("malformed enum type {}", sql_type))),
    };

    let mut choices = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for ch in inner.chars() {
        match (quote, ch) {
            (None, '\'' | '"') => quote = Some(ch),
            (Some(q), c) if c == q => quote = None,
            (None, ',') => {
                choices.push(current.trim().to_string());
                current.clear();
            }
            (None, c) if c.is_whitespace() => {}
            (_, c) => current.push(c),
        }
    }
    if quote.is_some() {
        return Err(DbError::ParseError(format!("unterminated literal in {}", sql_type)));
    }
    choices.push(current.trim().to_string());

    if choices.iter().any(String::is_empty) {
        return Err(DbError::ParseError(format!("empty choice in {}", sql_type)));
    }
    Ok(choices)
}
