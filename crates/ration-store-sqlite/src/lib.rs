use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use ration_core::{
    AllocationError, AllocationPlan, Attribution, BundleKind, BundleRef, EngineConfig,
    InventoryItem, LineQuantity, PreferenceTag, Recipient, RecipientFingerprint, RecipientId,
    SizeTier,
};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, Transaction};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS inventory_items (
  name TEXT PRIMARY KEY,
  quantity TEXT NOT NULL,
  unit TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS recipients (
  recipient_id TEXT PRIMARY KEY,
  size_tier TEXT CHECK (size_tier IS NULL OR size_tier IN ('small','medium','large')),
  household_size INTEGER CHECK (household_size IS NULL OR household_size >= 0),
  preference_tag TEXT CHECK (preference_tag IS NULL OR preference_tag IN ('baby','vegetarian','halal')),
  eligible INTEGER NOT NULL CHECK (eligible IN (0, 1)),
  updated_at TEXT NOT NULL,
  CHECK (size_tier IS NOT NULL OR household_size IS NOT NULL)
);

CREATE TABLE IF NOT EXISTS engine_config (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  config_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS allocation_plans (
  run_id TEXT PRIMARY KEY,
  plan_id TEXT NOT NULL,
  ruleset_version TEXT NOT NULL,
  generated_at TEXT NOT NULL,
  plan_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS bundle_lines (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL,
  bundle_key TEXT NOT NULL,
  recipient_count INTEGER,
  item TEXT NOT NULL,
  per_recipient INTEGER,
  total TEXT,
  unit TEXT NOT NULL,
  source TEXT,
  redistributed_units INTEGER NOT NULL DEFAULT 0,
  FOREIGN KEY (run_id) REFERENCES allocation_plans(run_id),
  CHECK ((per_recipient IS NULL) <> (total IS NULL))
);

CREATE TABLE IF NOT EXISTS attributions (
  recipient_id TEXT PRIMARY KEY,
  plan_id TEXT NOT NULL,
  standard_bundle TEXT NOT NULL,
  preference_bundle TEXT,
  size_tier TEXT NOT NULL CHECK (size_tier IN ('small','medium','large')),
  preference_tag TEXT,
  eligible INTEGER NOT NULL CHECK (eligible IN (0, 1)),
  attributed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_bundle_lines_run ON bundle_lines(run_id, bundle_key);
CREATE INDEX IF NOT EXISTS idx_attributions_plan ON attributions(plan_id);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

/// Recipient as kept by the store: the tier may only be known through the
/// household size.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecipientRecord {
    pub id: RecipientId,
    pub size_tier: Option<SizeTier>,
    pub household_size: Option<u32>,
    pub preference_tag: Option<PreferenceTag>,
    pub eligible: bool,
}

impl RecipientRecord {
    /// Resolve the engine view of this recipient.
    ///
    /// # Errors
    /// Returns [`AllocationError::UnresolvedTier`] when neither a tier nor a
    /// household size is recorded.
    pub fn to_recipient(&self) -> Result<Recipient, AllocationError> {
        Recipient::from_parts(
            self.id.clone(),
            self.size_tier,
            self.household_size,
            self.preference_tag,
            self.eligible,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredPlan {
    pub run_id: String,
    pub generated_at: String,
    pub plan: AllocationPlan,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanLineRow {
    pub bundle: String,
    pub recipient_count: Option<u64>,
    pub item: String,
    pub per_recipient: Option<u64>,
    pub total: Option<String>,
    pub unit: String,
    pub source: Option<String>,
    pub redistributed_units: u64,
}

impl SqliteStore {
    /// Open a SQLite-backed ration store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        for (target, sql) in [(1, MIGRATION_001_SQL), (2, MIGRATION_002_SQL)] {
            if version < target {
                self.apply_migration(target, sql)?;
                version = current_schema_version(&self.conn)?;
            }
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration(&mut self, version: i64, sql: &str) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .with_context(|| format!("failed to start migration v{version} transaction"))?;
        tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
        record_schema_version(&tx, version)?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        Ok(())
    }

    /// Insert or replace one inventory item.
    ///
    /// # Errors
    /// Returns an error when the item is malformed or the write fails.
    pub fn upsert_item(&mut self, item: &InventoryItem) -> Result<()> {
        if item.name.trim().is_empty() {
            return Err(anyhow!("item name MUST be non-empty"));
        }
        if item.quantity < Decimal::ZERO {
            return Err(anyhow!("item {} quantity MUST be >= 0 (got {})", item.name, item.quantity));
        }

        self.conn
            .execute(
                "INSERT INTO inventory_items(name, quantity, unit, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(name) DO UPDATE SET
                   quantity = excluded.quantity,
                   unit = excluded.unit,
                   updated_at = excluded.updated_at",
                params![item.name, item.quantity.normalize().to_string(), item.unit, now_rfc3339()?],
            )
            .with_context(|| format!("failed to upsert inventory item {}", item.name))?;
        Ok(())
    }

    /// Delete one inventory item. Returns whether a row existed.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn remove_item(&mut self, name: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM inventory_items WHERE name = ?1", params![name])
            .with_context(|| format!("failed to delete inventory item {name}"))?;
        Ok(deleted > 0)
    }

    /// Load the inventory ordered by item name.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or a quantity cannot be parsed.
    pub fn list_items(&self) -> Result<Vec<InventoryItem>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, quantity, unit FROM inventory_items ORDER BY name ASC")?;
        let mut rows = stmt.query([])?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            let name: String = row.get(0)?;
            let quantity_raw: String = row.get(1)?;
            items.push(InventoryItem {
                quantity: parse_decimal(&quantity_raw)
                    .with_context(|| format!("invalid quantity stored for {name}"))?,
                unit: row.get(2)?,
                name,
            });
        }
        Ok(items)
    }

    /// Insert or replace one recipient.
    ///
    /// # Errors
    /// Returns an error when the recipient has no resolvable tier or the write fails.
    pub fn upsert_recipient(&mut self, record: &RecipientRecord) -> Result<()> {
        if record.id.as_str().trim().is_empty() {
            return Err(anyhow!("recipient id MUST be non-empty"));
        }
        record.to_recipient().map_err(|err| anyhow!("recipient validation failed: {err}"))?;

        self.conn
            .execute(
                "INSERT INTO recipients(
                    recipient_id, size_tier, household_size, preference_tag, eligible, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(recipient_id) DO UPDATE SET
                   size_tier = excluded.size_tier,
                   household_size = excluded.household_size,
                   preference_tag = excluded.preference_tag,
                   eligible = excluded.eligible,
                   updated_at = excluded.updated_at",
                params![
                    record.id.as_str(),
                    record.size_tier.map(SizeTier::as_str),
                    record.household_size,
                    record.preference_tag.map(PreferenceTag::as_str),
                    record.eligible,
                    now_rfc3339()?,
                ],
            )
            .with_context(|| format!("failed to upsert recipient {}", record.id))?;
        Ok(())
    }

    /// Delete one recipient. Returns whether a row existed.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn remove_recipient(&mut self, id: &RecipientId) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM recipients WHERE recipient_id = ?1", params![id.as_str()])
            .with_context(|| format!("failed to delete recipient {id}"))?;
        Ok(deleted > 0)
    }

    /// Load every recipient ordered by id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_recipients(&self) -> Result<Vec<RecipientRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT recipient_id, size_tier, household_size, preference_tag, eligible
             FROM recipients
             ORDER BY recipient_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut recipients = Vec::new();
        while let Some(row) = rows.next()? {
            let size_tier_raw: Option<String> = row.get(1)?;
            let preference_raw: Option<String> = row.get(3)?;
            recipients.push(RecipientRecord {
                id: RecipientId::new(row.get::<_, String>(0)?),
                size_tier: size_tier_raw.as_deref().map(parse_size_tier).transpose()?,
                household_size: row.get(2)?,
                preference_tag: preference_raw.as_deref().map(parse_preference_tag).transpose()?,
                eligible: row.get(4)?,
            });
        }
        Ok(recipients)
    }

    /// Load the engine configuration, falling back to defaults when none was saved.
    ///
    /// # Errors
    /// Returns an error when the stored JSON cannot be read or decoded.
    pub fn load_config(&self) -> Result<EngineConfig> {
        let value = self
            .conn
            .query_row("SELECT config_json FROM engine_config WHERE id = 1", [], |row| {
                row.get::<_, String>(0)
            })
            .optional()
            .context("failed to read engine configuration")?;

        match value {
            Some(json) => {
                serde_json::from_str(&json).context("failed to deserialize engine configuration")
            }
            None => Ok(EngineConfig::default()),
        }
    }

    /// Validate and persist the engine configuration.
    ///
    /// # Errors
    /// Returns an error listing every violated rule, or when the write fails.
    pub fn save_config(&mut self, config: &EngineConfig) -> Result<()> {
        config.validate().map_err(|err| anyhow!("{err}"))?;
        self.conn
            .execute(
                "INSERT INTO engine_config(id, config_json, updated_at) VALUES (1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET
                   config_json = excluded.config_json,
                   updated_at = excluded.updated_at",
                params![
                    serde_json::to_string(config).context("failed to serialize engine configuration")?,
                    now_rfc3339()?,
                ],
            )
            .context("failed to persist engine configuration")?;
        Ok(())
    }

    /// Replace the current plan and all of its bundle lines in one transaction.
    ///
    /// Readers see either the previous plan or the new one, never a mix.
    ///
    /// # Errors
    /// Returns an error when serialization or any write fails; nothing is
    /// changed in that case.
    pub fn replace_plan(&mut self, plan: &AllocationPlan) -> Result<StoredPlan> {
        let tx = self.conn.transaction().context("failed to start plan transaction")?;
        let stored = Self::write_plan(&tx, plan)?;
        tx.commit().context("failed to commit plan transaction")?;
        Ok(stored)
    }

    /// Replace the current plan, its bundle lines and every attribution in
    /// one transaction.
    ///
    /// This is the persistence step of a full regeneration: attributions are
    /// never visible next to a plan they were not computed against.
    ///
    /// # Errors
    /// Returns an error when serialization or any write fails; the previous
    /// plan and attributions are kept in that case.
    pub fn replace_plan_and_attributions(
        &mut self,
        plan: &AllocationPlan,
        attributions: &[Attribution],
    ) -> Result<StoredPlan> {
        let tx = self.conn.transaction().context("failed to start regeneration transaction")?;
        let stored = Self::write_plan(&tx, plan)?;
        Self::write_attributions(&tx, attributions)?;
        tx.commit().context("failed to commit regeneration transaction")?;
        Ok(stored)
    }

    fn write_plan(tx: &Transaction<'_>, plan: &AllocationPlan) -> Result<StoredPlan> {
        let run_id = Ulid::new().to_string();
        let generated_at = now_rfc3339()?;

        tx.execute("DELETE FROM bundle_lines", []).context("failed to clear bundle lines")?;
        tx.execute("DELETE FROM allocation_plans", []).context("failed to clear previous plan")?;
        tx.execute(
            "INSERT INTO allocation_plans(run_id, plan_id, ruleset_version, generated_at, plan_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id,
                plan.plan_id,
                plan.ruleset_version,
                generated_at,
                serde_json::to_string(plan).context("failed to serialize allocation plan")?,
            ],
        )
        .context("failed to insert allocation plan")?;
        Self::insert_bundle_lines(tx, &run_id, plan)?;

        Ok(StoredPlan { run_id, generated_at, plan: plan.clone() })
    }

    fn insert_bundle_lines(tx: &Transaction<'_>, run_id: &str, plan: &AllocationPlan) -> Result<()> {
        let mut stmt = tx.prepare(
            "INSERT INTO bundle_lines(
                run_id, bundle_key, recipient_count, item, per_recipient, total, unit, source,
                redistributed_units
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        for bundle in plan.bundles() {
            let recipient_count = bundle.recipient_count.map(to_sql_integer).transpose()?;
            for line in &bundle.lines {
                let (per_recipient, total) = match line.quantity {
                    LineQuantity::PerRecipient(units) => (Some(to_sql_integer(units)?), None),
                    LineQuantity::Total(total) => (None, Some(total.normalize().to_string())),
                };
                stmt.execute(params![
                    run_id,
                    bundle.kind.key(),
                    recipient_count,
                    line.item,
                    per_recipient,
                    total,
                    line.unit,
                    line.source.map(|source| source.to_string()),
                    to_sql_integer(line.redistributed_units)?,
                ])
                .with_context(|| {
                    format!("failed to insert bundle line {} for {}", line.item, bundle.kind)
                })?;
            }
        }
        Ok(())
    }

    /// Return the plan written by the latest successful regeneration.
    ///
    /// # Errors
    /// Returns an error when lookup or JSON deserialization fails.
    pub fn current_plan(&self) -> Result<Option<StoredPlan>> {
        let value = self
            .conn
            .query_row(
                "SELECT run_id, generated_at, plan_json FROM allocation_plans
                 ORDER BY generated_at DESC, run_id DESC LIMIT 1",
                [],
                |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
                },
            )
            .optional()
            .context("failed to read current plan")?;

        match value {
            Some((run_id, generated_at, json)) => {
                let plan =
                    serde_json::from_str(&json).context("failed to deserialize stored plan")?;
                Ok(Some(StoredPlan { run_id, generated_at, plan }))
            }
            None => Ok(None),
        }
    }

    /// Flat bundle lines of the current plan, optionally for one bundle.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn plan_lines(&self, bundle: Option<BundleKind>) -> Result<Vec<PlanLineRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT bundle_key, recipient_count, item, per_recipient, total, unit, source,
                    redistributed_units
             FROM bundle_lines
             WHERE ?1 IS NULL OR bundle_key = ?1
             ORDER BY id ASC",
        )?;
        let bundle_key = bundle.map(BundleKind::key);
        let mut rows = stmt.query(params![bundle_key])?;
        let mut lines = Vec::new();
        while let Some(row) = rows.next()? {
            lines.push(PlanLineRow {
                bundle: row.get(0)?,
                recipient_count: row.get::<_, Option<i64>>(1)?.map(from_sql_integer).transpose()?,
                item: row.get(2)?,
                per_recipient: row.get::<_, Option<i64>>(3)?.map(from_sql_integer).transpose()?,
                total: row.get(4)?,
                unit: row.get(5)?,
                source: row.get(6)?,
                redistributed_units: from_sql_integer(row.get(7)?)?,
            });
        }
        Ok(lines)
    }

    /// Replace every stored attribution in one transaction.
    ///
    /// # Errors
    /// Returns an error when any write fails; nothing is changed in that case.
    pub fn replace_attributions(&mut self, attributions: &[Attribution]) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start attribution transaction")?;
        Self::write_attributions(&tx, attributions)?;
        tx.commit().context("failed to commit attribution transaction")?;
        Ok(())
    }

    fn write_attributions(tx: &Transaction<'_>, attributions: &[Attribution]) -> Result<()> {
        let attributed_at = now_rfc3339()?;
        tx.execute("DELETE FROM attributions", []).context("failed to clear attributions")?;
        let mut stmt = tx.prepare(
            "INSERT INTO attributions(
                recipient_id, plan_id, standard_bundle, preference_bundle,
                size_tier, preference_tag, eligible, attributed_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for attribution in attributions {
            stmt.execute(params![
                attribution.recipient_id.as_str(),
                attribution.plan_id,
                attribution.standard_bundle.kind.key(),
                attribution.preference_bundle.as_ref().map(|bundle| bundle.kind.key()),
                attribution.fingerprint.size_tier.as_str(),
                attribution.fingerprint.preference_tag.map(PreferenceTag::as_str),
                attribution.fingerprint.eligible,
                attributed_at,
            ])
            .with_context(|| {
                format!("failed to insert attribution for {}", attribution.recipient_id)
            })?;
        }
        Ok(())
    }

    /// Load stored attributions ordered by recipient id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_attributions(&self) -> Result<Vec<Attribution>> {
        let mut stmt = self.conn.prepare(
            "SELECT recipient_id, plan_id, standard_bundle, preference_bundle,
                    size_tier, preference_tag, eligible
             FROM attributions
             ORDER BY recipient_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut attributions = Vec::new();
        while let Some(row) = rows.next()? {
            let plan_id: String = row.get(1)?;
            let standard_raw: String = row.get(2)?;
            let preference_raw: Option<String> = row.get(3)?;
            let size_tier_raw: String = row.get(4)?;
            let preference_tag_raw: Option<String> = row.get(5)?;

            attributions.push(Attribution {
                recipient_id: RecipientId::new(row.get::<_, String>(0)?),
                standard_bundle: BundleRef {
                    plan_id: plan_id.clone(),
                    kind: parse_bundle_key(&standard_raw)?,
                },
                preference_bundle: preference_raw
                    .as_deref()
                    .map(|raw| {
                        parse_bundle_key(raw)
                            .map(|kind| BundleRef { plan_id: plan_id.clone(), kind })
                    })
                    .transpose()?,
                fingerprint: RecipientFingerprint {
                    size_tier: parse_size_tier(&size_tier_raw)?,
                    preference_tag: preference_tag_raw
                        .as_deref()
                        .map(parse_preference_tag)
                        .transpose()?,
                    eligible: row.get(6)?,
                },
                plan_id,
            });
        }
        Ok(attributions)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_decimal(raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw).with_context(|| format!("invalid decimal: {raw}"))
}

fn parse_size_tier(raw: &str) -> Result<SizeTier> {
    SizeTier::parse(raw).ok_or_else(|| anyhow!("unknown size_tier: {raw}"))
}

fn parse_preference_tag(raw: &str) -> Result<PreferenceTag> {
    PreferenceTag::parse(raw).ok_or_else(|| anyhow!("unknown preference_tag: {raw}"))
}

fn parse_bundle_key(raw: &str) -> Result<BundleKind> {
    BundleKind::parse_key(raw).ok_or_else(|| anyhow!("unknown bundle key: {raw}"))
}

fn to_sql_integer(value: u64) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("value {value} does not fit in a sqlite integer"))
}

fn from_sql_integer(value: i64) -> Result<u64> {
    u64::try_from(value).with_context(|| format!("negative value {value} stored as a count"))
}
