use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ration_api::{error_chain, RationApi};
use ration_core::{BundleKind, InventoryItem, PreferenceTag, RecipientId, SizeTier, TierWeights};
use ration_store_sqlite::RecipientRecord;
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV: &str = "RATION_LOG";

#[derive(Debug, Parser)]
#[command(name = "ration")]
#[command(about = "Charity allocation engine CLI")]
struct Cli {
    #[arg(long, default_value = "./ration.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Inventory {
        #[command(subcommand)]
        command: InventoryCommand,
    },
    Recipient {
        #[command(subcommand)]
        command: RecipientCommand,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Plan {
        #[command(subcommand)]
        command: PlanCommand,
    },
    Attribution {
        #[command(subcommand)]
        command: AttributionCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    Backup(DbBackupArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct RegenerateArgs {
    /// Store the change without rerunning the engine.
    #[arg(long, default_value_t = false)]
    no_regenerate: bool,
}

#[derive(Debug, Subcommand)]
enum InventoryCommand {
    Set(InventorySetArgs),
    Remove(InventoryRemoveArgs),
    List,
}

#[derive(Debug, Args)]
struct InventorySetArgs {
    #[arg(long)]
    name: String,
    #[arg(long, value_parser = parse_decimal)]
    quantity: Decimal,
    #[arg(long)]
    unit: String,
    #[command(flatten)]
    regenerate: RegenerateArgs,
}

#[derive(Debug, Args)]
struct InventoryRemoveArgs {
    #[arg(long)]
    name: String,
    #[command(flatten)]
    regenerate: RegenerateArgs,
}

#[derive(Debug, Subcommand)]
enum RecipientCommand {
    Set(RecipientSetArgs),
    Remove(RecipientRemoveArgs),
    List,
}

#[derive(Debug, Args)]
struct RecipientSetArgs {
    #[arg(long)]
    id: String,
    #[arg(long, value_enum, required_unless_present = "household_size")]
    tier: Option<TierArg>,
    #[arg(long)]
    household_size: Option<u32>,
    #[arg(long, value_enum)]
    preference: Option<PreferenceArg>,
    #[arg(long, default_value_t = false)]
    ineligible: bool,
    #[command(flatten)]
    regenerate: RegenerateArgs,
}

#[derive(Debug, Args)]
struct RecipientRemoveArgs {
    #[arg(long)]
    id: String,
    #[command(flatten)]
    regenerate: RegenerateArgs,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    Show,
    Set(ConfigSetArgs),
    Import(ConfigImportArgs),
}

#[derive(Debug, Args)]
struct ConfigSetArgs {
    /// Base share in percent; the preference share becomes the complement.
    #[arg(long)]
    base_share: Option<u8>,
    #[arg(long, value_parser = parse_decimal)]
    max_fairness_ratio: Option<Decimal>,
    /// Fixed weights as `small=1,medium=2,large=3`.
    #[arg(long, value_parser = parse_fixed_weights, conflicts_with = "clear_fixed")]
    fixed: Option<TierWeights>,
    #[arg(long, default_value_t = false)]
    clear_fixed: bool,
    #[arg(long)]
    bonus_precision: Option<u32>,
}

#[derive(Debug, Args)]
struct ConfigImportArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Subcommand)]
enum PlanCommand {
    Regenerate,
    Show,
    Lines(PlanLinesArgs),
}

#[derive(Debug, Args)]
struct PlanLinesArgs {
    /// Bundle key such as `standard:large`, `preference:halal` or `bonus`.
    #[arg(long, value_parser = parse_bundle_key)]
    bundle: Option<BundleKind>,
}

#[derive(Debug, Subcommand)]
enum AttributionCommand {
    Run,
    List,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TierArg {
    Small,
    Medium,
    Large,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PreferenceArg {
    Baby,
    Vegetarian,
    Halal,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let api = RationApi::new(cli.db);
    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Inventory { command } => run_inventory(command, &api),
        Command::Recipient { command } => run_recipient(command, &api),
        Command::Config { command } => run_config(command, &api),
        Command::Plan { command } => run_plan(command, &api),
        Command::Attribution { command } => run_attribution(command, &api),
    }
}

fn run_db(command: DbCommand, api: &RationApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
        DbCommand::Backup(args) => {
            api.backup(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
    }
}

fn run_inventory(command: InventoryCommand, api: &RationApi) -> Result<()> {
    match command {
        InventoryCommand::Set(args) => {
            let item =
                api.upsert_item(InventoryItem { name: args.name, quantity: args.quantity, unit: args.unit })?;
            let regeneration = regenerate_after_mutation(api, &args.regenerate);
            emit_json(serde_json::json!({ "item": item, "regeneration": regeneration }))
        }
        InventoryCommand::Remove(args) => {
            let removed = api.remove_item(&args.name)?;
            let regeneration = regenerate_after_mutation(api, &args.regenerate);
            emit_json(serde_json::json!({
                "name": args.name,
                "removed": removed,
                "regeneration": regeneration
            }))
        }
        InventoryCommand::List => {
            let items = api.list_items()?;
            emit_json(serde_json::json!({ "items": items }))
        }
    }
}

fn run_recipient(command: RecipientCommand, api: &RationApi) -> Result<()> {
    match command {
        RecipientCommand::Set(args) => {
            let record = api.upsert_recipient(RecipientRecord {
                id: RecipientId::new(args.id),
                size_tier: args.tier.map(TierArg::into_size_tier),
                household_size: args.household_size,
                preference_tag: args.preference.map(PreferenceArg::into_preference_tag),
                eligible: !args.ineligible,
            })?;
            let regeneration = regenerate_after_mutation(api, &args.regenerate);
            emit_json(serde_json::json!({ "recipient": record, "regeneration": regeneration }))
        }
        RecipientCommand::Remove(args) => {
            let removed = api.remove_recipient(&RecipientId::new(args.id.clone()))?;
            let regeneration = regenerate_after_mutation(api, &args.regenerate);
            emit_json(serde_json::json!({
                "id": args.id,
                "removed": removed,
                "regeneration": regeneration
            }))
        }
        RecipientCommand::List => {
            let recipients = api.list_recipients()?;
            emit_json(serde_json::json!({ "recipients": recipients }))
        }
    }
}

fn run_config(command: ConfigCommand, api: &RationApi) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let config = api.config()?;
            emit_json(serde_json::json!({ "config": config }))
        }
        ConfigCommand::Set(args) => {
            let mut config = api.config()?;
            if let Some(base_share) = args.base_share {
                config = config.with_base_share(base_share);
            }
            if let Some(ratio) = args.max_fairness_ratio {
                config.max_fairness_ratio = ratio;
            }
            if let Some(weights) = args.fixed {
                config = config.with_fixed_coefficients(weights);
            }
            if args.clear_fixed {
                config.fixed_coefficients = None;
            }
            if let Some(precision) = args.bonus_precision {
                config.bonus_precision = precision;
            }
            let config = api.set_config(config)?;
            emit_json(serde_json::json!({ "config": config }))
        }
        ConfigCommand::Import(args) => {
            let config = api.import_config(&args.file)?;
            emit_json(serde_json::json!({ "imported_from": args.file, "config": config }))
        }
    }
}

fn run_plan(command: PlanCommand, api: &RationApi) -> Result<()> {
    match command {
        PlanCommand::Regenerate => {
            let result = api.regenerate()?;
            emit_json(serde_json::to_value(&result).context("failed to serialize regeneration")?)
        }
        PlanCommand::Show => match api.current_plan()? {
            Some(stored) => {
                emit_json(serde_json::to_value(&stored).context("failed to serialize plan")?)
            }
            None => emit_json(serde_json::json!({ "plan": null })),
        },
        PlanCommand::Lines(args) => {
            let lines = api.plan_lines(args.bundle)?;
            emit_json(serde_json::json!({
                "bundle": args.bundle.map(BundleKind::key),
                "lines": lines
            }))
        }
    }
}

fn run_attribution(command: AttributionCommand, api: &RationApi) -> Result<()> {
    match command {
        AttributionCommand::Run => {
            let outcome = api.attribute()?;
            emit_json(serde_json::to_value(&outcome).context("failed to serialize attribution")?)
        }
        AttributionCommand::List => {
            let attributions = api.list_attributions()?;
            emit_json(serde_json::json!({ "attributions": attributions }))
        }
    }
}

/// A stored mutation stays stored even when the engine rejects the new
/// snapshot; the failure is reported next to it instead.
fn regenerate_after_mutation(api: &RationApi, args: &RegenerateArgs) -> Value {
    if args.no_regenerate {
        return serde_json::json!({ "status": "skipped" });
    }
    match api.regenerate() {
        Ok(result) => serde_json::json!({
            "status": "ok",
            "run_id": result.run_id,
            "plan_id": result.plan.plan_id,
            "attributed": result.attribution.attributions.len(),
            "pending": result.attribution.pending,
            "revoked": result.attribution.revoked.len()
        }),
        Err(err) => {
            debug!(error = %format!("{err:#}"), "regeneration after mutation failed");
            serde_json::json!({ "status": "failed", "errors": error_chain(&err) })
        }
    }
}

fn parse_decimal(value: &str) -> Result<Decimal, String> {
    Decimal::from_str(value.trim()).map_err(|err| format!("invalid decimal `{value}`: {err}"))
}

fn parse_bundle_key(value: &str) -> Result<BundleKind, String> {
    BundleKind::parse_key(value).ok_or_else(|| format!("unknown bundle key `{value}`"))
}

fn parse_fixed_weights(value: &str) -> Result<TierWeights, String> {
    let parse = || -> Result<TierWeights> {
        let mut small = None;
        let mut medium = None;
        let mut large = None;
        for part in value.split(',') {
            let (tier, weight) = part
                .split_once('=')
                .ok_or_else(|| anyhow!("expected tier=weight, got `{part}`"))?;
            let weight = Decimal::from_str(weight.trim())
                .with_context(|| format!("invalid weight for {}", tier.trim()))?;
            let slot = match SizeTier::parse(tier.trim()) {
                Some(SizeTier::Small) => &mut small,
                Some(SizeTier::Medium) => &mut medium,
                Some(SizeTier::Large) => &mut large,
                None => return Err(anyhow!("unknown size tier `{}`", tier.trim())),
            };
            *slot = Some(weight);
        }
        match (small, medium, large) {
            (Some(small), Some(medium), Some(large)) => Ok(TierWeights { small, medium, large }),
            _ => Err(anyhow!("small, medium and large weights are all required")),
        }
    };
    parse().map_err(|err| format!("{err:#}"))
}

impl TierArg {
    fn into_size_tier(self) -> SizeTier {
        match self {
            Self::Small => SizeTier::Small,
            Self::Medium => SizeTier::Medium,
            Self::Large => SizeTier::Large,
        }
    }
}

impl PreferenceArg {
    fn into_preference_tag(self) -> PreferenceTag {
        match self {
            Self::Baby => PreferenceTag::Baby,
            Self::Vegetarian => PreferenceTag::Vegetarian,
            Self::Halal => PreferenceTag::Halal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_weights_parse_in_any_order() {
        let weights = match parse_fixed_weights("large=3, small=1,medium=2.5") {
            Ok(weights) => weights,
            Err(err) => panic!("weights should parse: {err}"),
        };
        assert_eq!(weights.small, Decimal::ONE);
        assert_eq!(weights.medium, Decimal::new(25, 1));
        assert_eq!(weights.large, Decimal::from(3));
    }

    #[test]
    fn fixed_weights_require_every_tier() {
        assert!(parse_fixed_weights("small=1,large=3").is_err());
        assert!(parse_fixed_weights("small=1,medium=2,huge=3").is_err());
        assert!(parse_fixed_weights("small").is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
