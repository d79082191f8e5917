//! Shared application state: configuration, the store and every cache
//! derived from its schema.

use crate::auth::{AuthError, AuthManager, Role};
use crate::config::AppConfig;
use crate::core::{DbError, Restriction, Value};
use crate::declare;
use crate::diagram;
use crate::forms::{FieldError, FormCache, FormDescriptor, ValidationErrors, build_config_form};
use crate::permission::PermissionWalker;
use crate::pipeline::{InsertError, InsertPipeline};
use crate::schema::{AdapterRegistry, SchemaRegistry, TableSummary};
use crate::settings::{SettingsBundle, SettingsError, SettingsStore};
use crate::storage::{Database, Tier};
use serde_json::{Map, Value as Json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Name of the row identifier carried by listed rows.
pub const ROW_ID: &str = "_id";

#[derive(Error, Debug)]
pub enum ContextError {
    #[error(transparent)]
    Database(#[from] DbError),

    #[error(transparent)]
    Insert(#[from] InsertError),

    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    #[error(transparent)]
    Field(#[from] FieldError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("user '{user}' may not change entries of '{table}'")]
    PermissionDenied { table: String, user: String },

    #[error("'{0}' requires administrator rights")]
    AdminOnly(String),

    #[error("'{table}' has no settings form named '{form}'")]
    UnknownForm { table: String, form: String },

    #[error("invalid row id: {0}")]
    InvalidRowId(String),

    #[error("no group table is configured")]
    NoGroupTable,

    #[error("nothing to join")]
    EmptyJoin,

    #[error("invalid upload name '{0}'")]
    InvalidUpload(String),

    #[error("upload I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type ContextResult<T> = std::result::Result<T, ContextError>;

pub struct AppContext {
    config: AppConfig,
    adapters: AdapterRegistry,
    db: RwLock<Database>,
    registry: RwLock<SchemaRegistry>,
    forms: FormCache,
    settings: SettingsStore,
    auth: AuthManager,
    uploads: Mutex<Vec<PathBuf>>,
}

impl AppContext {
    /// Every configured administrator gets an account with the configured
    /// admin password.
    pub async fn new(config: AppConfig, db: Database) -> ContextResult<Self> {
        let mut admins = config.administrators.iter();
        let first = admins.next().map_or("admin", String::as_str);
        let auth = AuthManager::with_admin(first, &config.admin_password)?;
        for admin in admins {
            auth.create_user(admin, &config.admin_password, Role::Admin).await?;
        }

        let mut registry = SchemaRegistry::new();
        registry.refresh(db.catalog(), &config.skip_schemas);

        Ok(Self {
            settings: SettingsStore::new(&config.settings_folder),
            adapters: AdapterRegistry::default(),
            db: RwLock::new(db),
            registry: RwLock::new(registry),
            forms: FormCache::new(),
            auth,
            uploads: Mutex::new(Vec::new()),
            config,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn auth(&self) -> &AuthManager {
        &self.auth
    }

    pub fn database(&self) -> &RwLock<Database> {
        &self.db
    }

    /// Re-read the schema, drop cached forms and remove uploaded temp files.
    pub async fn refresh(&self) -> ContextResult<()> {
        {
            let db = self.db.read().await;
            self.reload_schema(&db).await?;
        }

        let uploads: Vec<PathBuf> = self
            .uploads
            .lock()
            .map_err(DbError::from)?
            .drain(..)
            .collect();
        for path in &uploads {
            let target = path.parent().filter(|dir| dir.starts_with(&self.config.tmp_folder)).unwrap_or(path);
            let removed = if target.is_dir() {
                tokio::fs::remove_dir_all(target).await
            } else {
                tokio::fs::remove_file(target).await
            };
            if let Err(err) = removed {
                warn!(path = %target.display(), error = %err, "could not remove upload");
            }
        }

        let tables = self.registry.read().await.len();
        info!(tables, removed_uploads = uploads.len(), "refreshed");
        Ok(())
    }

    async fn reload_schema(&self, db: &Database) -> ContextResult<()> {
        self.registry.write().await.refresh(db.catalog(), &self.config.skip_schemas);
        self.forms.invalidate_all()?;
        Ok(())
    }

    pub async fn tables(&self) -> Vec<TableSummary> {
        self.registry.read().await.summaries()
    }

    async fn ensure_registered(&self, table: &str) -> ContextResult<()> {
        if !self.registry.read().await.contains(table) {
            return Err(DbError::TableNotFound(table.to_string()).into());
        }
        Ok(())
    }

    pub async fn form_for(&self, table: &str) -> ContextResult<FormDescriptor> {
        self.ensure_registered(table).await?;
        let db = self.db.read().await;
        self.cached_form(&db, table)
    }

    fn cached_form(&self, db: &Database, table: &str) -> ContextResult<FormDescriptor> {
        let form = self.forms.get_or_build(db, &self.config, table)?;
        let form = form.read().map_err(DbError::from)?.clone();
        Ok(form)
    }

    /// Every row without its blob attributes, each carrying its primary key
    /// under `_id`.
    pub async fn rows(&self, table: &str) -> ContextResult<Vec<Json>> {
        self.ensure_registered(table).await?;
        let db = self.db.read().await;
        let descriptor = db.catalog().get_table(table)?;
        let non_blobs = descriptor.heading().non_blobs();
        let primary_key = descriptor.primary_key();

        let rows = db.project(table, &non_blobs, &Restriction::new())?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let id: Map<String, Json> = primary_key
                    .iter()
                    .filter_map(|attr| row.get(*attr).map(|value| (attr.to_string(), value.to_json())))
                    .collect();
                let mut object: Map<String, Json> =
                    row.iter().map(|(attr, value)| (attr.clone(), value.to_json())).collect();
                object.insert(ROW_ID.to_string(), Json::Object(id));
                Json::Object(object)
            })
            .collect())
    }

    /// Turn a submitted `_id` object back into a primary-key restriction.
    pub async fn restriction_for(&self, table: &str, id: &Json) -> ContextResult<Restriction> {
        let db = self.db.read().await;
        let descriptor = db.catalog().get_table(table)?;
        let object = id
            .as_object()
            .ok_or_else(|| ContextError::InvalidRowId(format!("expected an object, got {}", id)))?;

        let mut restriction = Restriction::new();
        for attr in descriptor.primary_key() {
            let raw = object
                .get(attr)
                .ok_or_else(|| ContextError::InvalidRowId(format!("missing key attribute '{}'", attr)))?;
            let attribute = descriptor
                .heading()
                .get(attr)
                .ok_or_else(|| DbError::AttributeNotFound(attr.to_string(), table.to_string()))?;
            restriction.insert(attr.to_string(), attribute.attr_type.coerce(raw)?);
        }
        Ok(restriction)
    }

    /// Form values of one stored row, for editing.
    pub async fn load_row(&self, table: &str, id: &Json) -> ContextResult<Json> {
        self.ensure_registered(table).await?;
        let restriction = self.restriction_for(table, id).await?;
        let db = self.db.read().await;
        let form = self.cached_form(&db, table)?;
        Ok(form.load(&db, &restriction)?)
    }

    pub async fn insert(&self, table: &str, submission: &Json) -> ContextResult<Restriction> {
        self.ensure_registered(table).await?;
        let mut db = self.db.write().await;
        let form = self.cached_form(&db, table)?;
        let key = InsertPipeline::new(&self.adapters).insert_atomic(&mut db, &form, submission, None)?;
        Ok(key)
    }

    pub async fn update(&self, table: &str, id: &Json, submission: &Json, user: &str) -> ContextResult<Restriction> {
        self.ensure_registered(table).await?;
        let restriction = self.restriction_for(table, id).await?;
        let mut db = self.db.write().await;
        self.check_permission(&db, table, &restriction, user)?;

        let form = self.cached_form(&db, table)?;
        let key = InsertPipeline::new(&self.adapters).insert_atomic(&mut db, &form, submission, Some(&restriction))?;
        Ok(key)
    }

    /// Delete one row and, cascading, every row depending on it.
    pub async fn delete(&self, table: &str, id: &Json, user: &str) -> ContextResult<BTreeMap<String, usize>> {
        self.ensure_registered(table).await?;
        let restriction = self.restriction_for(table, id).await?;
        let mut db = self.db.write().await;
        self.check_permission(&db, table, &restriction, user)?;

        if db.count(table, &restriction)? == 0 {
            return Err(DbError::MissingRow(table.to_string()).into());
        }
        let deleted = db.delete(table, &restriction)?;
        info!(table = %table, user = %user, deleted = ?deleted, "deleted entry");
        Ok(deleted)
    }

    fn check_permission(&self, db: &Database, table: &str, restriction: &Restriction, user: &str) -> ContextResult<()> {
        if !PermissionWalker::new(db, &self.config).user_has_permission(table, restriction, user)? {
            warn!(table = %table, user = %user, "permission denied");
            return Err(ContextError::PermissionDenied {
                table: table.to_string(),
                user: user.to_string(),
            });
        }
        Ok(())
    }

    pub async fn table_diagram(&self, table: &str) -> ContextResult<String> {
        self.ensure_registered(table).await?;
        Ok(diagram::table_diagram(self.registry.read().await.catalog(), table)?)
    }

    pub async fn schema_diagram(&self, schema: Option<&str>, essential_only: bool) -> ContextResult<String> {
        Ok(diagram::schema_diagram(&*self.registry.read().await, schema, essential_only)?)
    }

    /// Log in, refusing users marked inactive in the user table.
    pub async fn login(&self, username: &str, password: &str) -> ContextResult<Uuid> {
        if let Some(active_column) = &self.config.user_active
            && !self.config.is_administrator(username)
        {
            let db = self.db.read().await;
            let user_table = self.config.user_table_name();
            if db.catalog().table_exists(&user_table) {
                let restriction = Restriction::from([(self.config.user_name.clone(), Value::from(username))]);
                let inactive = db.fetch(&user_table, &restriction)?.iter().any(|row| {
                    matches!(row.get(active_column), Some(Value::Boolean(false) | Value::Integer(0)))
                });
                if inactive {
                    return Err(AuthError::Inactive(username.to_string()).into());
                }
            }
        }
        Ok(self.auth.login(username, password).await?)
    }

    fn require_admin(&self, acting_user: &str, action: &str) -> ContextResult<()> {
        if !self.config.is_administrator(acting_user) {
            return Err(ContextError::AdminOnly(action.to_string()));
        }
        Ok(())
    }

    pub async fn create_user(&self, acting_user: &str, username: &str, password: &str) -> ContextResult<()> {
        self.require_admin(acting_user, "creating users")?;
        self.auth.create_user(username, password, Role::Experimenter).await?;
        info!(user = %username, by = %acting_user, "created user");
        Ok(())
    }

    pub async fn list_users(&self, acting_user: &str) -> ContextResult<Vec<String>> {
        self.require_admin(acting_user, "listing users")?;
        Ok(self.auth.list_users().await)
    }

    /// Remove an account and its sessions. The last administrator stays.
    pub async fn delete_user(&self, acting_user: &str, username: &str) -> ContextResult<()> {
        self.require_admin(acting_user, "deleting users")?;
        self.auth.delete_user(username).await?;
        info!(user = %username, by = %acting_user, "deleted user");
        Ok(())
    }

    /// Replace the password of `username` after checking the current one.
    pub async fn change_password(&self, username: &str, old_password: &str, new_password: &str) -> ContextResult<()> {
        self.auth.authenticate(username, old_password).await?;
        self.auth.update_password(username, new_password).await?;
        info!(user = %username, "changed password");
        Ok(())
    }

    /// Group assignment rows of the configured group table.
    pub async fn groups(&self) -> ContextResult<Vec<Json>> {
        let group_table = self.config.group_table.as_deref().ok_or(ContextError::NoGroupTable)?;
        self.rows(group_table).await
    }

    /// Add a user to a group through the group table's form. A new group
    /// may be started by anyone; an existing one only grows through its
    /// members or an administrator.
    pub async fn register_group(&self, acting_user: &str, submission: &Json) -> ContextResult<Restriction> {
        let group_table = self.config.group_table.as_deref().ok_or(ContextError::NoGroupTable)?;
        self.ensure_registered(group_table).await?;

        if !self.config.is_administrator(acting_user) {
            let db = self.db.read().await;
            let group_name = &self.config.group_name;
            let attribute = db
                .catalog()
                .get_table(group_table)?
                .heading()
                .get(group_name)
                .ok_or_else(|| DbError::AttributeNotFound(group_name.clone(), group_table.to_string()))?;
            let raw = submission.get(group_name).unwrap_or(&Json::Null);
            if !raw.is_null() {
                let group = attribute.attr_type.coerce(raw)?;
                let exists = db.count(group_table, &Restriction::from([(group_name.clone(), group.clone())]))? > 0;
                let member = PermissionWalker::new(&db, &self.config).groups_of(acting_user)?.contains(&group);
                if exists && !member {
                    return Err(ContextError::PermissionDenied {
                        table: group_table.to_string(),
                        user: acting_user.to_string(),
                    });
                }
            }
        }

        let key = self.insert(group_table, submission).await?;
        info!(table = %group_table, key = ?key, by = %acting_user, "registered group member");
        Ok(key)
    }

    /// Declare a table from a definition and reload the schema.
    /// Administrators only.
    pub async fn declare_table(&self, acting_user: &str, name: &str, tier: Tier, definition: &str) -> ContextResult<()> {
        self.require_admin(acting_user, "declaring tables")?;
        let mut db = self.db.write().await;
        declare::declare(&mut db, name, tier, definition, &self.adapters)?;
        self.reload_schema(&db).await?;
        info!(table = %name, tier = ?tier, by = %acting_user, "declared table");
        Ok(())
    }

    /// Join `tables` on keys and references (see [`Database::safe_join`]),
    /// keeping the rows that match every attribute of `restriction`.
    pub async fn join(&self, tables: &[String], restriction: &Map<String, Json>) -> ContextResult<Vec<Json>> {
        if tables.is_empty() {
            return Err(ContextError::EmptyJoin);
        }
        for table in tables {
            self.ensure_registered(table).await?;
        }
        let db = self.db.read().await;

        let mut wanted = Restriction::new();
        for (attr, raw) in restriction {
            let attribute = tables
                .iter()
                .filter_map(|table| db.catalog().get_table(table).ok())
                .find_map(|descriptor| descriptor.heading().get(attr))
                .ok_or_else(|| DbError::AttributeNotFound(attr.clone(), tables.join(" * ")))?;
            wanted.insert(attr.clone(), attribute.attr_type.coerce(raw)?);
        }

        let names: Vec<&str> = tables.iter().map(String::as_str).collect();
        Ok(db
            .safe_join(&names)?
            .into_iter()
            .filter(|row| wanted.iter().all(|(attr, value)| row.get(attr) == Some(value)))
            .map(|row| Json::Object(row.into_iter().map(|(attr, value)| (attr, value.to_json())).collect()))
            .collect())
    }

    /// Write an uploaded file to `tmp_folder/<uuid>/<filename>`.
    pub async fn store_upload(&self, filename: &str, bytes: &[u8]) -> ContextResult<PathBuf> {
        let name = Path::new(filename);
        if filename.is_empty() || name.file_name().and_then(|n| n.to_str()) != Some(filename) {
            return Err(ContextError::InvalidUpload(filename.to_string()));
        }

        let dir = self.config.tmp_folder.join(Uuid::new_v4().to_string());
        let path = dir.join(filename);
        let io_err = |source| ContextError::Io {
            path: path.clone(),
            source,
        };
        tokio::fs::create_dir_all(&dir).await.map_err(io_err)?;
        tokio::fs::write(&path, bytes).await.map_err(io_err)?;

        self.uploads.lock().map_err(DbError::from)?.push(path.clone());
        info!(path = %path.display(), size = bytes.len(), "stored upload");
        Ok(path)
    }

    fn settings_forms(&self, table: &str) -> ContextResult<BTreeMap<String, FormDescriptor>> {
        let Some(specs) = self.config.config_forms.get(table) else {
            return Ok(BTreeMap::new());
        };
        let mut forms = BTreeMap::new();
        for (name, spec) in specs {
            forms.insert(name.clone(), build_config_form(name, spec, &self.config)?);
        }
        Ok(forms)
    }

    /// Settings forms configured for `table`.
    pub async fn settings_form_descriptors(&self, table: &str) -> ContextResult<BTreeMap<String, FormDescriptor>> {
        self.ensure_registered(table).await?;
        self.settings_forms(table)
    }

    /// Validate every settings form, then store the extracted inputs together
    /// with the (possibly partial) experiment form inputs as a named bundle.
    pub async fn save_settings(
        &self,
        table: &str,
        name: &str,
        experiment_form: &Json,
        forms: &Map<String, Json>,
    ) -> ContextResult<SettingsBundle> {
        let experiment = self.form_for(table).await?;
        let descriptors = self.settings_forms(table)?;
        if let Some(unknown) = forms.keys().find(|form| !descriptors.contains_key(*form)) {
            return Err(ContextError::UnknownForm {
                table: table.to_string(),
                form: unknown.clone(),
            });
        }

        let mut errors = ValidationErrors::new();
        let mut extracted = BTreeMap::new();
        for (form_name, descriptor) in &descriptors {
            let submission = forms.get(form_name).unwrap_or(&Json::Null);
            match descriptor.validate(submission) {
                Ok(()) => {
                    extracted.insert(form_name.clone(), Json::Object(descriptor.extract(submission)));
                }
                Err(found) => errors.merge(form_name, found),
            }
        }
        errors.into_result()?;

        let experiment_values = Json::Object(experiment.extract(experiment_form));
        Ok(self.settings.save(table, name, experiment_values, extracted)?)
    }

    pub async fn list_settings(&self, table: &str) -> ContextResult<Vec<SettingsBundle>> {
        self.ensure_registered(table).await?;
        Ok(self.settings.list(table)?)
    }

    pub async fn load_settings(&self, table: &str, id: Uuid) -> ContextResult<SettingsBundle> {
        self.ensure_registered(table).await?;
        Ok(self.settings.load(table, id)?)
    }

    pub async fn delete_settings(&self, table: &str, id: Uuid) -> ContextResult<SettingsBundle> {
        self.ensure_registered(table).await?;
        Ok(self.settings.delete(table, id)?)
    }

    /// A saved bundle's settings forms converted to typed values.
    pub async fn settings_values(&self, table: &str, id: Uuid) -> ContextResult<Map<String, Json>> {
        let bundle = self.load_settings(table, id).await?;
        let descriptors = self.settings_forms(table)?;

        let mut values = Map::new();
        for (form_name, inputs) in &bundle.forms {
            let Some(descriptor) = descriptors.get(form_name) else {
                warn!(table = %table, form = %form_name, "saved settings form is no longer configured");
                continue;
            };
            values.insert(form_name.clone(), Json::Object(descriptor.process(inputs, &self.adapters)?));
        }
        Ok(values)
    }
}
