//! Blob upload decoders, dispatched by file extension.

use super::FieldError;
use regex::Regex;
use serde_json::{Map, Number, Value as Json};
use std::fs;
use std::path::Path;

lazy_static::lazy_static! {
    static ref NPY_DESCR: Regex = Regex::new(r"'descr'\s*:\s*'([^']+)'").unwrap();
    static ref NPY_FORTRAN: Regex = Regex::new(r"'fortran_order'\s*:\s*(True|False)").unwrap();
    static ref NPY_SHAPE: Regex = Regex::new(r"'shape'\s*:\s*\(([^)]*)\)").unwrap();
}

const NPY_MAGIC: &[u8] = b"\x93NUMPY";

/// Lower-cased extension of `path`, without the dot.
pub fn extension_of(path: &str) -> Option<String> {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
}

/// Read and decode an uploaded file: `.npy` arrays become nested lists,
/// `.csv` tables become a list of records, `.pkl` and `.json` become the
/// object they hold.
pub fn decode_file(path: &str) -> Result<Json, FieldError> {
    let bytes = fs::read(path).map_err(|source| FieldError::Io {
        path: path.to_string(),
        source,
    })?;
    let decode_err = |reason: String| FieldError::Decode {
        path: path.to_string(),
        reason,
    };

    match extension_of(path).as_deref() {
        Some("npy") => decode_npy(&bytes).map_err(decode_err),
        Some("csv") => decode_csv(&bytes).map_err(decode_err),
        Some("pkl") => serde_pickle::from_slice::<Json>(&bytes, serde_pickle::DeOptions::new())
            .map_err(|err| decode_err(err.to_string())),
        Some("json") => serde_json::from_slice(&bytes).map_err(|err| decode_err(err.to_string())),
        other => Err(FieldError::UnsupportedExtension(other.unwrap_or_default().to_string())),
    }
}

pub fn decode_csv(bytes: &[u8]) -> Result<Json, String> {
    let mut reader = csv::Reader::from_reader(bytes);
    let headers = reader.headers().map_err(|err| err.to_string())?.clone();

    let mut records = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| err.to_string())?;
        let mut object = Map::new();
        for (header, cell) in headers.iter().zip(record.iter()) {
            object.insert(header.to_string(), csv_cell(cell));
        }
        records.push(Json::Object(object));
    }
    Ok(Json::Array(records))
}

fn csv_cell(cell: &str) -> Json {
    let cell = cell.trim();
    if cell.is_empty() {
        return Json::Null;
    }
    if let Ok(i) = cell.parse::<i64>() {
        return Json::from(i);
    }
    if let Ok(f) = cell.parse::<f64>()
        && let Some(n) = Number::from_f64(f)
    {
        return Json::Number(n);
    }
    Json::String(cell.to_string())
}

#[derive(Debug, Clone, Copy)]
enum NpyKind {
    Float,
    Int,
    UInt,
    Bool,
}

pub fn decode_npy(bytes: &[u8]) -> Result<Json, String> {
    if bytes.len() < 10 || !bytes.starts_with(NPY_MAGIC) {
        return Err("not an npy file".to_string());
    }

    let (header_len, header_start): (usize, usize) = match bytes[6] {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 => {
            let raw = bytes.get(8..12).ok_or("truncated npy header")?;
            (u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize, 12)
        }
        version => return Err(format!("unsupported npy version {}", version)),
    };
    let data_start = header_start.checked_add(header_len).ok_or("truncated npy header")?;
    let header = bytes.get(header_start..data_start).ok_or("truncated npy header")?;
    let header = String::from_utf8_lossy(header);
    let data = &bytes[data_start..];

    let descr = capture(&NPY_DESCR, &header, "descr")?;
    let fortran = capture(&NPY_FORTRAN, &header, "fortran_order")? == "True";
    let shape: Vec<usize> = capture(&NPY_SHAPE, &header, "shape")?
        .split(',')
        .map(str::trim)
        .filter(|dim| !dim.is_empty())
        .map(|dim| dim.parse::<usize>().map_err(|_| format!("bad dimension '{}'", dim)))
        .collect::<Result<_, _>>()?;

    let mut chars = descr.chars();
    let big_endian = match chars.next() {
        Some('<' | '|' | '=') => false,
        Some('>') => true,
        _ => return Err(format!("unsupported dtype '{}'", descr)),
    };
    let kind = match chars.next() {
        Some('f') => NpyKind::Float,
        Some('i') => NpyKind::Int,
        Some('u') => NpyKind::UInt,
        Some('b') => NpyKind::Bool,
        _ => return Err(format!("unsupported dtype '{}'", descr)),
    };
    let size: usize = chars
        .as_str()
        .parse()
        .map_err(|_| format!("unsupported dtype '{}'", descr))?;
    if !(1..=8).contains(&size) {
        return Err(format!("unsupported element size {} in '{}'", size, descr));
    }

    let count = shape
        .iter()
        .try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
        .ok_or("npy shape is too large")?;
    let needed = count.checked_mul(size).ok_or("npy shape is too large")?;
    if data.len() < needed {
        return Err(format!("expected {} bytes of data, found {}", needed, data.len()));
    }

    let values = data
        .chunks_exact(size)
        .take(count)
        .map(|chunk| npy_element(chunk, kind, big_endian))
        .collect::<Result<Vec<_>, _>>()?;

    if shape.is_empty() {
        return Ok(values.into_iter().next().unwrap_or(Json::Null));
    }
    Ok(reshape(&values, &shape, fortran, &mut Vec::new()))
}

fn capture<'h>(regex: &Regex, header: &'h str, key: &str) -> Result<&'h str, String> {
    regex
        .captures(header)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| format!("npy header has no '{}'", key))
}

fn npy_element(chunk: &[u8], kind: NpyKind, big_endian: bool) -> Result<Json, String> {
    let mut buf = [0u8; 8];
    let n = chunk.len();
    if n > 8 {
        return Err(format!("unsupported element size {}", n));
    }
    // widen to 8 bytes little-endian
    if big_endian {
        for (i, byte) in chunk.iter().rev().enumerate() {
            buf[i] = *byte;
        }
    } else {
        buf[..n].copy_from_slice(chunk);
    }
    let negative = buf[n - 1] & 0x80 != 0;

    let value = match (kind, n) {
        (NpyKind::Float, 8) => Number::from_f64(f64::from_le_bytes(buf)).map_or(Json::Null, Json::Number),
        (NpyKind::Float, 4) => {
            let f = f32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
            Number::from_f64(f as f64).map_or(Json::Null, Json::Number)
        }
        (NpyKind::Int, _) => {
            if negative {
                for byte in buf.iter_mut().skip(n) {
                    *byte = 0xff;
                }
            }
            Json::from(i64::from_le_bytes(buf))
        }
        (NpyKind::UInt, _) => Json::from(u64::from_le_bytes(buf)),
        (NpyKind::Bool, 1) => Json::Bool(buf[0] != 0),
        _ => return Err(format!("unsupported element size {} for {:?}", n, kind)),
    };
    Ok(value)
}

fn reshape(values: &[Json], shape: &[usize], fortran: bool, index: &mut Vec<usize>) -> Json {
    let depth = index.len();
    if depth == shape.len() {
        let position = if fortran {
            let mut stride = 1;
            let mut position = 0;
            for (i, dim) in index.iter().zip(shape) {
                position += i * stride;
                stride *= dim;
            }
            position
        } else {
            index.iter().zip(shape).fold(0, |acc, (i, dim)| acc * dim + i)
        };
        return values.get(position).cloned().unwrap_or(Json::Null);
    }

    let mut items = Vec::with_capacity(shape[depth]);
    for i in 0..shape[depth] {
        index.push(i);
        items.push(reshape(values, shape, fortran, index));
        index.pop();
    }
    Json::Array(items)
}
