use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Application configuration, read from a JSON file with environment
/// overrides (`LORIS_CONFIG`, `LORIS_HOST`, `LORIS_PORT`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,

    /// Extensions accepted for blob uploads.
    pub extensions: Vec<String>,
    /// Extensions accepted for attachment uploads.
    pub attach_extensions: Vec<String>,
    /// Foreign keys with more parent candidates than this get no dropdown.
    pub fk_dropdown_limit: usize,
    /// varchar lengths from which a text area is used.
    pub textarea_startlength: usize,

    pub user_schema: String,
    pub user_table: String,
    /// Owner column, e.g. `experimenter`.
    pub user_name: String,
    pub user_active: Option<String>,

    /// Group assignment table (`schema.Table`), if groups are used.
    pub group_table: Option<String>,
    pub group_name: String,
    pub group_member: String,

    pub administrators: Vec<String>,
    pub admin_password: String,
    pub skip_schemas: Vec<String>,

    pub tmp_folder: PathBuf,
    pub settings_folder: PathBuf,

    /// Settings forms per table: `{"schema.Table": {"form_name": {...}}}`.
    pub config_forms: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            extensions: strings(&["npy", "csv", "pkl", "json"]),
            attach_extensions: strings(&[
                "pdf", "png", "jpg", "jpeg", "tif", "tiff", "txt", "csv", "json", "npy", "pkl", "zip", "tar",
            ]),
            fk_dropdown_limit: 200,
            textarea_startlength: 512,
            user_schema: "experimenters".to_string(),
            user_table: "Experimenter".to_string(),
            user_name: "experimenter".to_string(),
            user_active: None,
            group_table: None,
            group_name: "group_name".to_string(),
            group_member: "experimenter".to_string(),
            administrators: strings(&["admin"]),
            admin_password: "adminpass".to_string(),
            skip_schemas: strings(&["mysql", "sys", "performance_schema", "information_schema"]),
            tmp_folder: PathBuf::from("tmp"),
            settings_folder: PathBuf::from("settings"),
            config_forms: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    /// Load from `path`, else from `LORIS_CONFIG`, else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let path = path
            .map(Path::to_path_buf)
            .or_else(|| env::var("LORIS_CONFIG").ok().map(PathBuf::from));

        let mut config = match path {
            Some(path) => {
                let text = fs::read_to_string(&path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                Self::from_json_str(&text)
                    .with_context(|| format!("invalid config file {}", path.display()))?
            }
            None => Self::default(),
        };

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("config must be a JSON object")
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(host) = env::var("LORIS_HOST") {
            self.host = host;
        }
        if let Ok(port) = env::var("LORIS_PORT") {
            self.port = port.parse::<u16>().context("LORIS_PORT must be a valid u16")?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.fk_dropdown_limit == 0 {
            bail!("fk_dropdown_limit must be greater than zero");
        }
        if self.textarea_startlength == 0 {
            bail!("textarea_startlength must be greater than zero");
        }
        if self.user_name.trim().is_empty() {
            bail!("user_name must name the owner column");
        }
        if let Some(group_table) = &self.group_table
            && group_table.split('.').count() != 2
        {
            bail!("group_table must have the form schema.Table, got '{}'", group_table);
        }
        for (table, forms) in &self.config_forms {
            if let Some(reserved) = forms
                .keys()
                .find(|name| ["_id", "name", "date", "experiment_form"].contains(&name.as_str()))
            {
                bail!("settings form '{}' of '{}' uses a reserved name", reserved, table);
            }
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Full name of the user table, e.g. `experimenters.Experimenter`.
    pub fn user_table_name(&self) -> String {
        format!("{}.{}", self.user_schema, self.user_table)
    }

    pub fn is_administrator(&self, user: &str) -> bool {
        self.administrators.iter().any(|admin| admin == user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = AppConfig::from_json_str(r#"{"fk_dropdown_limit": 10, "administrators": ["root"]}"#).unwrap();
        assert_eq!(config.fk_dropdown_limit, 10);
        assert!(config.is_administrator("root"));
        assert!(!config.is_administrator("admin"));
        assert_eq!(config.textarea_startlength, AppConfig::default().textarea_startlength);
    }

    #[test]
    fn test_zero_dropdown_limit_rejected() {
        let config = AppConfig::from_json_str(r#"{"fk_dropdown_limit": 0}"#).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"user_table": "Member", "group_table": "lab.Group"}}"#).unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.user_table_name(), "experimenters.Member");
        assert_eq!(config.group_table.as_deref(), Some("lab.Group"));
    }
}
