use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use ration_core::{
    attribute, regenerate, AllocationPlan, Attribution, AttributionOutcome, BundleKind,
    EngineConfig, InventoryItem, Recipient, RecipientId,
};
use ration_store_sqlite::{
    IntegrityReport, PlanLineRow, RecipientRecord, SchemaStatus, SqliteStore, StoredPlan,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

mod regenerator;

pub use regenerator::{RegenerationHandle, RegenerationStatus, Regenerator};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Outcome of one full trigger: the persisted plan and the attribution pass
/// that ran against it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegenerationResult {
    pub run_id: String,
    pub generated_at: String,
    pub plan: AllocationPlan,
    pub attribution: AttributionOutcome,
}

#[derive(Debug, Clone)]
pub struct RationApi {
    db_path: PathBuf,
}

impl RationApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = SqliteStore::open(&self.db_path)?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = SqliteStore::open(&self.db_path)?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Run the `SQLite` health probes.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or probed.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = SqliteStore::open(&self.db_path)?;
        store.integrity_check()
    }

    /// Copy the database to `out_file` through the online backup API.
    ///
    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup(&self, out_file: &Path) -> Result<()> {
        let store = self.open_store()?;
        store.backup_database(out_file)
    }

    /// Insert or replace one inventory item.
    ///
    /// # Errors
    /// Returns an error when the item is malformed or persistence fails.
    pub fn upsert_item(&self, item: InventoryItem) -> Result<InventoryItem> {
        let mut store = self.open_store()?;
        store.upsert_item(&item)?;
        Ok(item)
    }

    /// Remove one inventory item. Returns whether it existed.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub fn remove_item(&self, name: &str) -> Result<bool> {
        let mut store = self.open_store()?;
        store.remove_item(name)
    }

    /// # Errors
    /// Returns an error when the inventory cannot be read.
    pub fn list_items(&self) -> Result<Vec<InventoryItem>> {
        self.open_store()?.list_items()
    }

    /// Insert or replace one recipient.
    ///
    /// # Errors
    /// Returns an error when the recipient has no resolvable tier or persistence fails.
    pub fn upsert_recipient(&self, record: RecipientRecord) -> Result<RecipientRecord> {
        let mut store = self.open_store()?;
        store.upsert_recipient(&record)?;
        Ok(record)
    }

    /// Remove one recipient. Returns whether it existed.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub fn remove_recipient(&self, id: &RecipientId) -> Result<bool> {
        let mut store = self.open_store()?;
        store.remove_recipient(id)
    }

    /// # Errors
    /// Returns an error when recipients cannot be read.
    pub fn list_recipients(&self) -> Result<Vec<RecipientRecord>> {
        self.open_store()?.list_recipients()
    }

    /// Current engine configuration, or the defaults when none was saved.
    ///
    /// # Errors
    /// Returns an error when the stored configuration cannot be read.
    pub fn config(&self) -> Result<EngineConfig> {
        self.open_store()?.load_config()
    }

    /// Validate and persist a new engine configuration.
    ///
    /// # Errors
    /// Returns an error listing every violated rule, or when persistence fails.
    pub fn set_config(&self, config: EngineConfig) -> Result<EngineConfig> {
        let mut store = self.open_store()?;
        store.save_config(&config)?;
        Ok(config)
    }

    /// Read a YAML or JSON configuration document and persist it.
    ///
    /// Fields missing from the document keep their default values.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed, the
    /// configuration is invalid, or persistence fails.
    pub fn import_config(&self, path: &Path) -> Result<EngineConfig> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;
        let config = parse_config_document(&raw)
            .with_context(|| format!("failed to parse configuration file {}", path.display()))?;
        self.set_config(config)
    }

    /// Run the engine over the stored snapshot, attribute every eligible
    /// recipient against the new plan, and persist both together.
    ///
    /// When the engine rejects its inputs, or any write fails, the previous
    /// plan and its attributions are left untouched.
    ///
    /// # Errors
    /// Returns an error when the snapshot cannot be loaded, the engine rejects
    /// it, or persistence fails.
    pub fn regenerate(&self) -> Result<RegenerationResult> {
        let mut store = self.open_store()?;
        let items = store.list_items()?;
        let recipients = load_recipients(&store)?;
        let config = store.load_config()?;

        let plan = regenerate(&items, &recipients, &config)?;
        let previous = store.list_attributions()?;
        let attribution = attribute_recipients(&plan, &recipients, &previous);
        let stored = store.replace_plan_and_attributions(&plan, &attribution.attributions)?;

        info!(
            run_id = %stored.run_id,
            plan_id = %stored.plan.plan_id,
            attributed = attribution.attributions.len(),
            pending = attribution.pending.len(),
            "regenerated allocation plan"
        );
        Ok(RegenerationResult {
            run_id: stored.run_id,
            generated_at: stored.generated_at,
            plan: stored.plan,
            attribution,
        })
    }

    /// Attribute pending recipients to the current plan without regenerating it.
    ///
    /// # Errors
    /// Returns an error when no plan exists yet, or when loading or
    /// persistence fails.
    pub fn attribute(&self) -> Result<AttributionOutcome> {
        let mut store = self.open_store()?;
        let stored = store
            .current_plan()?
            .ok_or_else(|| anyhow!("no allocation plan has been generated yet"))?;
        let recipients = load_recipients(&store)?;
        let previous = store.list_attributions()?;
        let outcome = attribute_recipients(&stored.plan, &recipients, &previous);
        store.replace_attributions(&outcome.attributions)?;
        Ok(outcome)
    }

    /// # Errors
    /// Returns an error when the stored plan cannot be read.
    pub fn current_plan(&self) -> Result<Option<StoredPlan>> {
        self.open_store()?.current_plan()
    }

    /// # Errors
    /// Returns an error when the stored bundle lines cannot be read.
    pub fn plan_lines(&self, bundle: Option<BundleKind>) -> Result<Vec<PlanLineRow>> {
        self.open_store()?.plan_lines(bundle)
    }

    /// # Errors
    /// Returns an error when attributions cannot be read.
    pub fn list_attributions(&self) -> Result<Vec<Attribution>> {
        self.open_store()?.list_attributions()
    }
}

/// Parse an engine configuration from YAML. JSON documents parse as well.
///
/// # Errors
/// Returns an error when the document is not a valid configuration.
pub fn parse_config_document(raw: &str) -> Result<EngineConfig> {
    serde_yaml::from_str(raw).context("invalid engine configuration document")
}

fn load_recipients(store: &SqliteStore) -> Result<Vec<Recipient>> {
    let recipients = store
        .list_recipients()?
        .iter()
        .map(RecipientRecord::to_recipient)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(recipients)
}

fn attribute_recipients(
    plan: &AllocationPlan,
    recipients: &[Recipient],
    previous: &[Attribution],
) -> AttributionOutcome {
    let outcome = attribute(plan, recipients, previous);
    if !outcome.skipped.is_empty() {
        warn!(
            plan_id = %plan.plan_id,
            skipped = outcome.skipped.len(),
            "some recipients could not be attributed"
        );
    }
    outcome
}

/// JSON view of an error chain for front ends.
#[must_use]
pub fn error_chain(err: &anyhow::Error) -> serde_json::Value {
    serde_json::Value::Array(
        err.chain().map(|cause| serde_json::Value::String(cause.to_string())).collect(),
    )
}
