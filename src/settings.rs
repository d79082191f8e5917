//! Named bundles of form inputs, kept in one JSON file per table.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("settings I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("settings file '{path}' is not valid: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no saved settings with id {0}")]
    NotFound(Uuid),

    #[error("invalid settings name '{0}'")]
    InvalidName(String),

    #[error("settings lock poisoned")]
    Lock,
}

pub type SettingsResult<T> = std::result::Result<T, SettingsError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsBundle {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub name: String,
    pub date: NaiveDate,
    pub experiment_form: Json,
    /// Settings forms by name.
    #[serde(flatten)]
    pub forms: BTreeMap<String, Json>,
}

/// File-backed store under `folder`: `_saved_settings_<schema.Table>.json`.
pub struct SettingsStore {
    folder: PathBuf,
    lock: Mutex<()>,
}

impl SettingsStore {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path_for(&self, table: &str) -> PathBuf {
        self.folder.join(format!("_saved_settings_{}.json", table))
    }

    pub fn list(&self, table: &str) -> SettingsResult<Vec<SettingsBundle>> {
        let _guard = self.lock.lock().map_err(|_| SettingsError::Lock)?;
        self.read(&self.path_for(table))
    }

    pub fn save(
        &self,
        table: &str,
        name: &str,
        experiment_form: Json,
        forms: BTreeMap<String, Json>,
    ) -> SettingsResult<SettingsBundle> {
        let name = name.trim();
        if name.is_empty() || crate::core::is_none_text(name) {
            return Err(SettingsError::InvalidName(name.to_string()));
        }

        let bundle = SettingsBundle {
            id: Uuid::new_v4(),
            name: name.to_string(),
            date: chrono::Local::now().date_naive(),
            experiment_form,
            forms,
        };

        let _guard = self.lock.lock().map_err(|_| SettingsError::Lock)?;
        let path = self.path_for(table);
        let mut bundles = self.read(&path)?;
        bundles.push(bundle.clone());
        self.write(&path, &bundles)?;

        info!(table = %table, id = %bundle.id, name = %bundle.name, "saved settings");
        Ok(bundle)
    }

    pub fn load(&self, table: &str, id: Uuid) -> SettingsResult<SettingsBundle> {
        self.list(table)?
            .into_iter()
            .find(|bundle| bundle.id == id)
            .ok_or(SettingsError::NotFound(id))
    }

    pub fn delete(&self, table: &str, id: Uuid) -> SettingsResult<SettingsBundle> {
        let _guard = self.lock.lock().map_err(|_| SettingsError::Lock)?;
        let path = self.path_for(table);
        let mut bundles = self.read(&path)?;
        let idx = bundles
            .iter()
            .position(|bundle| bundle.id == id)
            .ok_or(SettingsError::NotFound(id))?;
        let removed = bundles.remove(idx);
        self.write(&path, &bundles)?;

        info!(table = %table, id = %id, "deleted settings");
        Ok(removed)
    }

    fn read(&self, path: &Path) -> SettingsResult<Vec<SettingsBundle>> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(SettingsError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_str(&text).map_err(|source| SettingsError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write to a temporary file, sync, then rename over the old file.
    fn write(&self, path: &Path, bundles: &[SettingsBundle]) -> SettingsResult<()> {
        let io_err = |source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        };

        fs::create_dir_all(&self.folder).map_err(io_err)?;
        let temp_path = path.with_extension("tmp");
        let temp_file = File::create(&temp_path).map_err(io_err)?;
        let mut writer = BufWriter::new(temp_file);
        serde_json::to_writer_pretty(&mut writer, bundles).map_err(|source| SettingsError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        writer.flush().map_err(io_err)?;
        writer.get_mut().sync_all().map_err(io_err)?;
        fs::rename(&temp_path, path).map_err(io_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_save_list_load_delete() {
        let dir = TempDir::new().unwrap();
        let store = SettingsStore::new(dir.path());
        let forms = BTreeMap::from([("analysis".to_string(), json!({"gain": "2"}))]);

        let saved = store.save("lab.Recording", "baseline", json!({"rate": "30"}), forms).unwrap();
        assert!(store.path_for("lab.Recording").exists());

        let listed = store.list("lab.Recording").unwrap();
        assert_eq!(listed, vec![saved.clone()]);
        assert_eq!(store.load("lab.Recording", saved.id).unwrap().forms["analysis"], json!({"gain": "2"}));

        store.delete("lab.Recording", saved.id).unwrap();
        assert!(store.list("lab.Recording").unwrap().is_empty());
        assert!(matches!(store.load("lab.Recording", saved.id), Err(SettingsError::NotFound(_))));
    }

    #[test]
    fn test_bundle_file_layout() {
        let dir = TempDir::new().unwrap();
        let store = SettingsStore::new(dir.path());
        store.save("lab.Recording", "a", json!({}), BTreeMap::new()).unwrap();

        let text = fs::read_to_string(store.path_for("lab.Recording")).unwrap();
        let parsed: Json = serde_json::from_str(&text).unwrap();
        let entry = &parsed[0];
        assert!(entry["_id"].is_string());
        assert_eq!(entry["name"], json!("a"));
        assert!(entry.get("experiment_form").is_some());
    }

    #[test]
    fn test_blank_name_rejected() {
        let dir = TempDir::new().unwrap();
        let store = SettingsStore::new(dir.path());
        assert!(matches!(
            store.save("lab.Recording", "  ", json!({}), BTreeMap::new()),
            Err(SettingsError::InvalidName(_))
        ));
    }
}
