//! Top-level CLI definition and dispatch.

use std::ffi::OsString;
use std::io::{self, IsTerminal, Stderr, StdinLock, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{ArgGroup, Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use free_up_space::cli::{Choice, Prompter, format_bytes};
use free_up_space::core::config::Config;
use free_up_space::core::errors::FusError;
use free_up_space::inventory::{
    ApplicationInventory, ApplicationRecord, InventoryScan, ProtectionRegistry,
};
use free_up_space::logger::ActivityLog;
use free_up_space::platform::{
    DiagnoseTools, Platform, PrivilegeCheck, ProtectionDiagnosis, UnixTrustReset, Volume,
    can_modify, detect_platform, diagnose_protection, running_as_root,
};
use free_up_space::reclaim::smart::{FixOutcome, FixResult};
use free_up_space::reclaim::{
    BackupLedger, CommitReport, FsMover, ItemOutcome, ItemReport, RestoreOutcome, RestoreReport,
    RestoreResolver, SelectionResult, SmartRestore, list_backup_folders, parse_target_gb,
    recently_modified, select, space_to_free,
};
use free_up_space::snapshot::{
    OffloadOutcome, OffloadReport, SnapshotFacility, SnapshotStrategy, TmutilFacility,
};

/// Window used when an interactive restore falls back to fixing
/// permissions on bundles copied back by hand.
const SMART_RESTORE_FALLBACK_HOURS: u64 = 2;

/// Free Up Space: move large applications off the system drive, and back.
#[derive(Debug, Parser)]
#[command(
    name = "fus",
    author,
    version,
    about = "Free Up Space - relocate large applications to a removable drive",
    long_about = None,
    after_help = "Without a mode flag fus asks for a free-space target, picks the largest \
applications that reach it, and moves them to a backup folder on a removable drive.",
    group(
        ArgGroup::new("mode").args([
            "restore",
            "list_backups",
            "check_time_machine_status",
            "restore_from_time_machine",
            "fix_permissions",
            "fix_permissions_choose",
        ])
    )
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Free space to reach on the system volume, in GB.
    #[arg(long, value_name = "GB", allow_negative_numbers = true)]
    target_free_gb: Option<f64>,
    /// Destination volume for relocated applications.
    #[arg(long, value_name = "PATH")]
    volume: Option<PathBuf>,
    /// Restore a backup folder (omit the path, or pass an empty one, to choose interactively).
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    restore: Option<Option<OsString>>,
    /// List backup folders on one volume, or on every removable volume.
    #[arg(long, value_name = "VOLUME", num_args = 0..=1)]
    list_backups: Option<Option<OsString>>,
    /// Report whether Time Machine can back deletions.
    #[arg(long)]
    check_time_machine_status: bool,
    /// Restore one application from the latest Time Machine backup.
    #[arg(long, value_name = "APP")]
    restore_from_time_machine: Option<String>,
    /// Always relocate to a removable drive, even when Time Machine is available.
    #[arg(long)]
    use_external_drive: bool,
    /// Fix permissions on applications copied back by hand.
    #[arg(long)]
    fix_permissions: bool,
    /// Like --fix-permissions, choosing among the N most recent applications.
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u64).range(1..))]
    fix_permissions_choose: Option<u64>,
    /// How far back --fix-permissions looks, in hours.
    #[arg(long, value_name = "HOURS")]
    hours: Option<u64>,
    /// Show what would happen without moving or deleting anything.
    #[arg(long)]
    dry_run: bool,
    /// Answer yes to every confirmation.
    #[arg(short, long)]
    yes: bool,
    /// Directory holding installed applications.
    #[arg(long, value_name = "DIR")]
    applications_dir: Option<PathBuf>,
    /// Directory where removable volumes are mounted.
    #[arg(long, value_name = "DIR")]
    volumes_dir: Option<PathBuf>,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode<'a> {
    Relocate,
    Restore(Option<&'a Path>),
    ListBackups(Option<&'a Path>),
    SnapshotStatus,
    SnapshotRestore(&'a str),
    FixPermissions { choose: Option<usize> },
}

impl Cli {
    fn mode(&self) -> Mode<'_> {
        if let Some(folder) = &self.restore {
            Mode::Restore(optional_path(folder.as_ref()))
        } else if let Some(volume) = &self.list_backups {
            Mode::ListBackups(optional_path(volume.as_ref()))
        } else if self.check_time_machine_status {
            Mode::SnapshotStatus
        } else if let Some(app) = &self.restore_from_time_machine {
            Mode::SnapshotRestore(app)
        } else if let Some(n) = self.fix_permissions_choose {
            Mode::FixPermissions {
                choose: Some(usize::try_from(n).unwrap_or(usize::MAX)),
            }
        } else if self.fix_permissions {
            Mode::FixPermissions { choose: None }
        } else {
            Mode::Relocate
        }
    }
}

/// A blank optional path means "not given".
fn optional_path(value: Option<&OsString>) -> Option<&Path> {
    value
        .filter(|v| !v.to_string_lossy().trim().is_empty())
        .map(Path::new)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input at runtime.
    #[error("{0}")]
    User(String),
    /// Operation partially succeeded.
    #[error("{0}")]
    Partial(String),
    /// Library failure, classified by its code.
    #[error(transparent)]
    Fus(#[from] FusError),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Io(_) => 2,
            Self::Json(_) => 3,
            Self::Partial(_) => 4,
            Self::Fus(err) => fus_exit_code(err),
        }
    }
}

const fn fus_exit_code(err: &FusError) -> i32 {
    match err {
        FusError::InvalidConfig { .. }
        | FusError::MissingConfig { .. }
        | FusError::ConfigParse { .. }
        | FusError::PrivilegesRequired { .. }
        | FusError::InvalidTarget { .. }
        | FusError::Protected { .. }
        | FusError::BackupNotFound { .. }
        | FusError::DestinationExists { .. }
        | FusError::SnapshotUnavailable { .. }
        | FusError::NotInSnapshot { .. } => 1,
        FusError::Serialization { .. } => 3,
        _ => 2,
    }
}

/// Interactive state shared by every flow.
struct Session {
    output: OutputMode,
    yes: bool,
    log: ActivityLog,
    prompter: Prompter<StdinLock<'static>, Stderr>,
}

impl Session {
    /// `true` when the user agrees or `--yes` was given.
    fn confirm(&mut self, message: &str, default: bool) -> Result<bool, CliError> {
        if self.yes {
            return Ok(true);
        }
        Ok(self.prompter.confirm(message, default)?)
    }
}

/// Dispatch to the selected mode.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    if let Some(Command::Completions(args)) = &cli.command {
        let mut command = Cli::command();
        let binary_name = command.get_name().to_string();
        generate(args.shell, &mut command, binary_name, &mut io::stdout());
        return Ok(());
    }

    let config = load_config(cli)?;
    let mut session = Session {
        output: output_mode(cli),
        yes: cli.yes,
        log: ActivityLog::from_config(&config),
        prompter: Prompter::new(io::stdin().lock(), io::stderr()),
    };

    match cli.mode() {
        Mode::Relocate => run_relocate(cli, &config, &mut session),
        Mode::Restore(folder) => run_restore(&config, folder, &mut session),
        Mode::ListBackups(volume) => run_list_backups(&config, volume, &session),
        Mode::SnapshotStatus => run_snapshot_status(&config, &session),
        Mode::SnapshotRestore(app) => run_snapshot_restore(&config, app, &mut session),
        Mode::FixPermissions { choose } => run_fix_permissions(
            &config,
            choose,
            config.restore.recent_window_hours,
            &mut session,
        ),
    }
}

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.applications_dir {
        config.inventory.applications_dir.clone_from(dir);
    }
    if let Some(dir) = &cli.volumes_dir {
        config.volumes.volumes_dir.clone_from(dir);
    }
    if let Some(hours) = cli.hours {
        config.restore.recent_window_hours = hours;
    }
    if cli.dry_run {
        config.backup.dry_run = true;
    }
    config.validate()?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Relocation
// ---------------------------------------------------------------------------

fn run_relocate(cli: &Cli, config: &Config, session: &mut Session) -> Result<(), CliError> {
    let platform = detect_platform()?;
    let registry = ProtectionRegistry::new(&config.inventory.protected_apps)?;
    let inventory = ApplicationInventory::new(&config.inventory.bundle_extension, registry);
    let scan = inventory.scan(&config.inventory.applications_dir)?;
    report_scan(session.output, &scan);

    let current_free = platform
        .fs_stats(&config.selection.system_volume)?
        .available_bytes;
    let target_gb = match cli.target_free_gb {
        Some(gb) => gb,
        None if session.yes => config.selection.default_target_free_gb,
        None => {
            if session.output == OutputMode::Human {
                println!("Free space now: {}", format_bytes(current_free));
            }
            session.prompter.ask_f64(
                "Target free space in GB",
                config.selection.default_target_free_gb,
            )?
        }
    };
    let target = parse_target_gb(target_gb)?;
    let needed = space_to_free(target, current_free);

    if needed == 0 {
        match session.output {
            OutputMode::Human => println!(
                "{} {} free already meets the {} target. Nothing to move.",
                "✓".green(),
                format_bytes(current_free),
                format_bytes(target)
            ),
            OutputMode::Json => write_json_line(&json!({
                "command": "relocate",
                "status": "target_met",
                "current_free_bytes": current_free,
                "target_free_bytes": target,
            }))?,
        }
        return Ok(());
    }

    let mut selection = select(&scan.records, needed);
    let busy: Vec<PathBuf> = selection
        .chosen
        .iter()
        .filter(|app| platform.is_in_use(&app.path))
        .map(|app| app.path.clone())
        .collect();
    if !busy.is_empty() {
        eprintln!("{} These applications are running:", "warning:".yellow());
        for path in &busy {
            eprintln!("  {}", path.display());
        }
        eprintln!("  Quit them (Command+Q) to include them in this run.");
        if !session.confirm("Continue without them?", true)? {
            return cancelled(session.output, "relocate");
        }
        let idle: Vec<ApplicationRecord> = scan
            .records
            .iter()
            .filter(|app| !busy.contains(&app.path))
            .cloned()
            .collect();
        selection = select(&idle, needed);
    }

    if selection.is_empty() {
        return Err(CliError::User(format!(
            "no movable applications found in {}",
            config.inventory.applications_dir.display()
        )));
    }
    if session.output == OutputMode::Human {
        print_selection(&selection, current_free, target);
    }

    if !cli.use_external_drive {
        let facility = TmutilFacility::from_config(&config.snapshot);
        let strategy = snapshot_strategy(config, facility.as_ref());
        if strategy.status().is_ok_and(|status| status.is_available()) {
            match strategy.ready_for_offload() {
                Ok(_) => return offload_via_snapshot(&strategy, &selection, session),
                Err(err) => eprintln!(
                    "{} Time Machine is configured but its latest backup is unusable ({err}); \
using a removable drive instead.",
                    "warning:".yellow()
                ),
            }
        }
    }
    relocate_to_volume(cli, config, platform.as_ref(), &selection, session)
}

fn report_scan(output: OutputMode, scan: &InventoryScan) {
    for warning in &scan.warnings {
        eprintln!(
            "{} skipped {}: {}",
            "warning:".yellow(),
            warning.path.display(),
            warning.reason
        );
    }
    if output == OutputMode::Human && !scan.protected.is_empty() {
        println!("Protected (never moved):");
        for protected in &scan.protected {
            println!("  {} ({})", protected.path.display(), protected.reason);
        }
    }
}

fn print_selection(selection: &SelectionResult, current_free: u64, target: u64) {
    println!(
        "\nFree now {}, target {}, need to free {}.",
        format_bytes(current_free),
        format_bytes(target),
        format_bytes(selection.target_bytes)
    );
    println!("  {:<36}  {:>10}  Path", "Application", "Size");
    println!("  {}", "-".repeat(70));
    for app in &selection.chosen {
        println!(
            "  {:<36}  {:>10}  {}",
            app.name,
            format_bytes(app.size_bytes),
            app.path.display()
        );
    }
    println!("  Total: {}", format_bytes(selection.total_bytes).bold());
    if !selection.target_reachable {
        println!(
            "{} Moving every application still leaves {} short of the target.",
            "warning:".yellow(),
            format_bytes(selection.shortfall_bytes())
        );
    }
}

fn snapshot_strategy<'a>(
    config: &Config,
    facility: Option<&'a TmutilFacility>,
) -> SnapshotStrategy<'a> {
    SnapshotStrategy::from_config(
        &config.snapshot,
        facility.map(|f| f as &dyn SnapshotFacility),
    )
    .with_dry_run(config.backup.dry_run)
}

fn offload_via_snapshot(
    strategy: &SnapshotStrategy<'_>,
    selection: &SelectionResult,
    session: &mut Session,
) -> Result<(), CliError> {
    let question = format!(
        "Time Machine is available. Delete these {} applications locally once each is confirmed in the latest backup?",
        selection.chosen.len()
    );
    if !session.confirm(&question, false)? {
        return cancelled(session.output, "relocate");
    }

    let yes = session.yes;
    let prompter = &mut session.prompter;
    let mut retry = |app: &ApplicationRecord, attempt: u32| {
        !yes && prompter
            .confirm(
                &format!(
                    "{} is not in the latest backup (attempt {attempt}). Run a backup, then retry?",
                    app.name
                ),
                false,
            )
            .unwrap_or(false)
    };
    let report = strategy.offload(&selection.chosen, &mut retry, &mut session.log)?;

    match session.output {
        OutputMode::Human => print_offload(&report),
        OutputMode::Json => write_json_line(&json!({
            "command": "relocate",
            "strategy": "snapshot",
            "selection": selection,
            "report": report,
            "summary": report.summary(),
        }))?,
    }
    if report.is_partial() {
        return Err(CliError::Partial(report.summary()));
    }
    Ok(())
}

fn print_offload(report: &OffloadReport) {
    for item in &report.items {
        match &item.outcome {
            OffloadOutcome::Deleted { snapshot_path } => println!(
                "  {} {} (kept in {})",
                "✓".green(),
                item.app.name,
                snapshot_path.display()
            ),
            OffloadOutcome::WouldDelete { snapshot_path } => println!(
                "  [dry run] would delete {} (found in {})",
                item.app.name,
                snapshot_path.display()
            ),
            OffloadOutcome::Unverified { attempts } => println!(
                "  {} {} not found in the latest backup after {attempts} attempt(s); left in place",
                "!".yellow(),
                item.app.name
            ),
            OffloadOutcome::Failed { error, .. } => {
                println!("  {} {}: {error}", "✗".red(), item.app.name);
            }
        }
    }
    println!(
        "\n{} ({} freed)",
        report.summary().bold(),
        format_bytes(report.bytes_freed())
    );
}

fn relocate_to_volume(
    cli: &Cli,
    config: &Config,
    platform: &dyn Platform,
    selection: &SelectionResult,
    session: &mut Session,
) -> Result<(), CliError> {
    let Some(volume) = pick_volume(cli.volume.as_deref(), config, platform, session)? else {
        return cancelled(session.output, "relocate");
    };
    if !config.backup.dry_run {
        ensure_writable_volume(platform, &volume)?;
        check_privileges(
            config,
            &[config.inventory.applications_dir.as_path(), volume.path.as_path()],
        )?;
    }

    if let Some(available) = volume.available_bytes
        && available < selection.total_bytes
    {
        eprintln!(
            "{} {} has {} free but the selection needs {}.",
            "warning:".yellow(),
            volume.name,
            format_bytes(available),
            format_bytes(selection.total_bytes)
        );
        if !session.confirm("Continue anyway?", false)? {
            return cancelled(session.output, "relocate");
        }
    }

    let existing = if session.yes {
        None
    } else {
        let folders = list_backup_folders(
            &volume.path,
            &config.backup.folder_prefix,
            &config.inventory.bundle_extension,
        )?;
        match folders.first() {
            Some(latest)
                if session.prompter.confirm(
                    &format!("Add to the existing backup folder {}?", latest.name),
                    false,
                )? =>
            {
                Some(latest.path.clone())
            }
            _ => None,
        }
    };

    let question = format!(
        "Move {} applications ({}) to {}?",
        selection.chosen.len(),
        format_bytes(selection.total_bytes),
        volume.path.display()
    );
    if !session.confirm(&question, false)? {
        return cancelled(session.output, "relocate");
    }

    let mover = FsMover::from_config(&config.backup);
    let ledger = BackupLedger::from_config(&mover, config);
    let tools = DiagnoseTools::default();
    let mut diagnoses: Vec<ProtectionDiagnosis> = Vec::new();
    let yes = session.yes;
    let prompter = &mut session.prompter;
    let mut after_failure = |item: &ItemReport| {
        let diagnosis = diagnose_protection(&item.app.path, &tools);
        eprint!("{diagnosis}");
        eprint!("{}", manual_move_instructions(item));
        diagnoses.push(diagnosis);
        if yes {
            return true;
        }
        let step = format!("Move {} by hand", item.app.name);
        if prompter.wait_for_step(&step).is_err() {
            return false;
        }
        prompter
            .confirm("Continue with remaining applications?", true)
            .unwrap_or(false)
    };
    let report = ledger.commit_with(
        &volume.path,
        selection,
        existing.as_deref(),
        &mut after_failure,
        &mut session.log,
    )?;

    match session.output {
        OutputMode::Human => print_commit(&report),
        OutputMode::Json => write_json_line(&json!({
            "command": "relocate",
            "strategy": "volume",
            "volume": volume,
            "selection": selection,
            "report": report,
            "diagnoses": diagnoses,
            "summary": report.summary(),
        }))?,
    }
    if report.is_partial() {
        return Err(CliError::Partial(report.summary()));
    }
    Ok(())
}

/// Steps for moving a bundle the automatic move could not handle.
fn manual_move_instructions(item: &ItemReport) -> String {
    let folder = item
        .destination
        .parent()
        .map_or_else(|| item.destination.display().to_string(), |p| p.display().to_string());
    format!(
        "Move {name} by hand:\n  \
1. Open Finder and go to {source}\n  \
2. Drag {name} into {folder}\n  \
3. Delete the original if Finder copied it\n  \
Or in a terminal: sudo mv '{source}' '{folder}/'\n",
        name = item.app.file_name(),
        source = item.app.path.display(),
    )
}

fn ensure_writable_volume(platform: &dyn Platform, volume: &Volume) -> Result<(), CliError> {
    if platform.fs_stats(&volume.path).is_ok_and(|stats| stats.is_readonly) {
        return Err(CliError::User(format!(
            "volume {} is mounted read-only",
            volume.path.display()
        )));
    }
    Ok(())
}

/// Refuse or warn before moving bundles without enough privileges.
fn check_privileges(config: &Config, dirs: &[&Path]) -> Result<(), CliError> {
    let writable = dirs.iter().all(|dir| can_modify(dir));
    match PrivilegeCheck::evaluate(running_as_root(), config.backup.require_root, writable) {
        PrivilegeCheck::Sufficient => Ok(()),
        PrivilegeCheck::Limited => {
            eprintln!(
                "{} not running as root and some directories are not writable; moves may fail. \
Re-run with sudo if they do.",
                "warning:".yellow()
            );
            Ok(())
        }
        PrivilegeCheck::Refused => Err(FusError::PrivilegesRequired {
            details: "backup.require_root is set; run fus with sudo".to_string(),
        }
        .into()),
    }
}

/// Destination volume: explicit, configured preference, or chosen.
fn pick_volume(
    explicit: Option<&Path>,
    config: &Config,
    platform: &dyn Platform,
    session: &mut Session,
) -> Result<Option<Volume>, CliError> {
    if let Some(path) = explicit {
        if !path.is_dir() {
            return Err(CliError::User(format!(
                "volume {} is not mounted",
                path.display()
            )));
        }
        return Ok(Some(Volume {
            name: path
                .file_name()
                .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned()),
            path: path.to_path_buf(),
            available_bytes: platform.fs_stats(path).ok().map(|s| s.available_bytes),
        }));
    }

    let mut volumes = platform.removable_volumes(
        &config.volumes.volumes_dir,
        &config.volumes.excluded_volumes,
    )?;
    if volumes.is_empty() {
        return Err(CliError::User(format!(
            "no removable volumes mounted under {}",
            config.volumes.volumes_dir.display()
        )));
    }
    if let Some(preferred) = &config.volumes.preferred_volume
        && let Some(pos) = volumes.iter().position(|v| &v.name == preferred)
    {
        return Ok(Some(volumes.swap_remove(pos)));
    }
    if session.yes {
        if volumes.len() == 1 {
            return Ok(volumes.pop());
        }
        return Err(CliError::User(
            "several volumes are mounted; pass --volume to pick one".to_string(),
        ));
    }

    let labels: Vec<String> = volumes
        .iter()
        .map(|v| match v.available_bytes {
            Some(free) => format!("{} ({} free)", v.name, format_bytes(free)),
            None => v.name.clone(),
        })
        .collect();
    match session.prompter.choose("Destination volume:", &labels, false)? {
        Choice::Item(i) => Ok(Some(volumes.swap_remove(i))),
        Choice::All | Choice::Cancel => Ok(None),
    }
}

fn print_commit(report: &CommitReport) {
    for item in &report.items {
        match &item.outcome {
            ItemOutcome::Moved { method } => println!(
                "  {} {} -> {} ({})",
                "✓".green(),
                item.app.name,
                item.destination.display(),
                method.as_str()
            ),
            ItemOutcome::WouldMove => println!(
                "  [dry run] would move {} -> {}",
                item.app.name,
                item.destination.display()
            ),
            ItemOutcome::Skipped { reason } => {
                println!("  {} {}: {reason}", "-".dimmed(), item.app.name);
            }
            ItemOutcome::Failed { error, .. } => {
                println!("  {} {}: {error}", "✗".red(), item.app.name);
            }
        }
    }
    println!(
        "\n{} into {} ({} moved)",
        report.summary().bold(),
        report.folder.display(),
        format_bytes(report.bytes_moved())
    );
    if !report.dry_run && report.succeeded() > 0 {
        println!("  Restore later with: fus --restore {}", report.folder.display());
    }
}

// ---------------------------------------------------------------------------
// Restore
// ---------------------------------------------------------------------------

fn run_restore(
    config: &Config,
    folder: Option<&Path>,
    session: &mut Session,
) -> Result<(), CliError> {
    let mover = FsMover::from_config(&config.backup);
    let trust = UnixTrustReset::from_config(&config.restore);
    let resolver = RestoreResolver::from_config(config, &mover, &trust);
    let destination = &config.inventory.applications_dir;
    if !config.backup.dry_run {
        check_privileges(config, &[destination.as_path()])?;
    }

    let choice = match folder {
        Some(folder) => RestoreTarget::Folder(folder.to_path_buf()),
        None => choose_restore_target(config, session)?,
    };

    let yes = session.yes;
    let prompter = &mut session.prompter;
    let mut overwrite = |app: &ApplicationRecord| {
        yes || prompter
            .confirm(
                &format!(
                    "{} is already installed and differs from the backup. Replace it?",
                    app.name
                ),
                false,
            )
            .unwrap_or(false)
    };

    let results: Vec<(PathBuf, RestoreReport)> = match choice {
        RestoreTarget::Folder(folder) => {
            let records = resolver.resolve(&folder)?;
            let report = resolver.restore(&records, destination, &mut overwrite, &mut session.log);
            vec![(folder, report)]
        }
        RestoreTarget::AllOn(volume) => resolver
            .restore_all(&volume, destination, &mut overwrite, &mut session.log)?
            .into_iter()
            .map(|(folder, report)| (folder.path, report))
            .collect(),
        RestoreTarget::SmartRestore => {
            return run_fix_permissions(config, None, SMART_RESTORE_FALLBACK_HOURS, session);
        }
        RestoreTarget::Nothing => return cancelled(session.output, "restore"),
    };

    match session.output {
        OutputMode::Human => {
            if results.is_empty() {
                println!("No backup folders to restore.");
            }
            for (folder, report) in &results {
                print_restore(folder, report);
            }
        }
        OutputMode::Json => {
            let folders: Vec<Value> = results
                .iter()
                .map(|(folder, report)| {
                    json!({
                        "folder": folder,
                        "summary": report.summary(),
                        "items": report.items,
                    })
                })
                .collect();
            write_json_line(&json!({
                "command": "restore",
                "destination": destination,
                "folders": folders,
            }))?;
        }
    }

    let partial: Vec<String> = results
        .iter()
        .filter(|(_, report)| report.is_partial())
        .map(|(folder, report)| format!("{}: {}", folder.display(), report.summary()))
        .collect();
    if !partial.is_empty() {
        return Err(CliError::Partial(partial.join("; ")));
    }
    Ok(())
}

enum RestoreTarget {
    Folder(PathBuf),
    AllOn(PathBuf),
    SmartRestore,
    Nothing,
}

fn choose_restore_target(config: &Config, session: &mut Session) -> Result<RestoreTarget, CliError> {
    let platform = detect_platform()?;
    let Some(volume) = pick_volume(None, config, platform.as_ref(), session)? else {
        return Ok(RestoreTarget::Nothing);
    };
    let folders = list_backup_folders(
        &volume.path,
        &config.backup.folder_prefix,
        &config.inventory.bundle_extension,
    )?;

    let choice = if folders.is_empty() {
        session.prompter.say(&format!(
            "No {}* folders on {}.",
            config.backup.folder_prefix,
            volume.path.display()
        ))?;
        Choice::Cancel
    } else {
        let labels: Vec<String> = folders
            .iter()
            .map(|f| format!("{} ({} applications)", f.name, f.app_count()))
            .collect();
        session.prompter.choose("Backup folder:", &labels, true)?
    };

    Ok(match choice {
        Choice::Item(i) => RestoreTarget::Folder(folders[i].path.clone()),
        Choice::All => RestoreTarget::AllOn(volume.path),
        Choice::Cancel => {
            let question = format!(
                "No backup folder chosen. Fix permissions on applications copied back in the last {SMART_RESTORE_FALLBACK_HOURS} hours instead?"
            );
            if !session.yes && session.prompter.confirm(&question, false)? {
                RestoreTarget::SmartRestore
            } else {
                RestoreTarget::Nothing
            }
        }
    })
}

fn print_restore(folder: &Path, report: &RestoreReport) {
    println!("{}", folder.display().to_string().bold());
    for item in &report.items {
        match &item.outcome {
            RestoreOutcome::Restored {
                replaced_existing,
                permission_issues,
                ..
            } => {
                let note = if *replaced_existing { " (replaced)" } else { "" };
                println!("  {} {}{note}", "✓".green(), item.app.name);
                for issue in permission_issues {
                    println!("      {} {issue}", "!".yellow());
                }
            }
            RestoreOutcome::WouldRestore => println!(
                "  [dry run] would restore {} -> {}",
                item.app.name,
                item.destination.display()
            ),
            RestoreOutcome::Skipped { reason } => {
                println!("  {} {}: {reason}", "-".dimmed(), item.app.name);
            }
            RestoreOutcome::Failed { error, .. } => {
                println!("  {} {}: {error}", "✗".red(), item.app.name);
            }
        }
    }
    println!("  {}", report.summary().bold());
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

fn run_list_backups(
    config: &Config,
    volume: Option<&Path>,
    session: &Session,
) -> Result<(), CliError> {
    let volumes: Vec<PathBuf> = match volume {
        Some(path) => {
            if !path.is_dir() {
                return Err(CliError::User(format!(
                    "volume {} is not mounted",
                    path.display()
                )));
            }
            vec![path.to_path_buf()]
        }
        None => detect_platform()?
            .removable_volumes(
                &config.volumes.volumes_dir,
                &config.volumes.excluded_volumes,
            )?
            .into_iter()
            .map(|v| v.path)
            .collect(),
    };

    let mut listing = Vec::with_capacity(volumes.len());
    for path in volumes {
        let folders = list_backup_folders(
            &path,
            &config.backup.folder_prefix,
            &config.inventory.bundle_extension,
        )?;
        listing.push((path, folders));
    }

    match session.output {
        OutputMode::Human => {
            if listing.is_empty() {
                println!("No removable volumes mounted.");
            }
            for (path, folders) in &listing {
                println!("{}", path.display().to_string().bold());
                if folders.is_empty() {
                    println!("  (no backup folders)");
                }
                for folder in folders {
                    let when = folder.timestamp.map_or_else(
                        || "unknown time".to_string(),
                        |ts| ts.format("%Y-%m-%d %H:%M:%S").to_string(),
                    );
                    println!(
                        "  {:<28}  {when}  {} applications",
                        folder.name,
                        folder.app_count()
                    );
                }
            }
        }
        OutputMode::Json => {
            let volumes: Vec<Value> = listing
                .iter()
                .map(|(path, folders)| json!({ "volume": path, "folders": folders }))
                .collect();
            write_json_line(&json!({ "command": "list-backups", "volumes": volumes }))?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Time Machine
// ---------------------------------------------------------------------------

fn run_snapshot_status(config: &Config, session: &Session) -> Result<(), CliError> {
    let facility = TmutilFacility::from_config(&config.snapshot);
    let strategy = snapshot_strategy(config, facility.as_ref());
    let status = strategy.status()?;
    let latest = if status.is_available() {
        strategy.latest_backup()?
    } else {
        None
    };

    match session.output {
        OutputMode::Human => {
            let marker = if status.is_available() {
                "✓".green()
            } else {
                "✗".red()
            };
            println!("{marker} Time Machine: {status}");
            if let Some(latest) = &latest {
                println!("  Latest backup: {}", latest.display());
            }
        }
        OutputMode::Json => write_json_line(&json!({
            "command": "check-time-machine-status",
            "status": status,
            "latest_backup": latest,
        }))?,
    }
    Ok(())
}

fn run_snapshot_restore(config: &Config, app: &str, session: &mut Session) -> Result<(), CliError> {
    let facility = TmutilFacility::from_config(&config.snapshot);
    let strategy = snapshot_strategy(config, facility.as_ref());
    let trust = UnixTrustReset::from_config(&config.restore);

    let restored = strategy.restore(
        app,
        &config.inventory.bundle_extension,
        &config.inventory.applications_dir,
        &trust,
        &mut session.log,
    )?;

    match session.output {
        OutputMode::Human => {
            println!(
                "{} Restored {} from {}",
                "✓".green(),
                restored.destination.display(),
                restored.source.display()
            );
            for issue in &restored.permissions.issues {
                println!("    {} {issue}", "!".yellow());
            }
        }
        OutputMode::Json => write_json_line(&json!({
            "command": "restore-from-time-machine",
            "dry_run": config.backup.dry_run,
            "restored": restored,
        }))?,
    }
    if !restored.permissions.is_clean() {
        return Err(CliError::Partial(format!(
            "{} restored with {} permission issues",
            restored.destination.display(),
            restored.permissions.issues.len()
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Smart restore
// ---------------------------------------------------------------------------

fn run_fix_permissions(
    config: &Config,
    choose: Option<usize>,
    hours: u64,
    session: &mut Session,
) -> Result<(), CliError> {
    let window = Duration::from_secs(hours.saturating_mul(3600));
    let scan = recently_modified(
        &config.inventory.applications_dir,
        &config.inventory.bundle_extension,
        window,
    )?;

    for alias in &scan.aliases {
        eprintln!("{} skipping alias {}", "note:".dimmed(), alias.display());
    }
    for damaged in scan.bundles.iter().filter(|b| b.problem.is_some()) {
        eprintln!(
            "{} {}: {}",
            "warning:".yellow(),
            damaged.name,
            damaged.problem.as_deref().unwrap_or("incomplete")
        );
    }

    let mut candidates: Vec<PathBuf> = scan.intact().map(|b| b.path.clone()).collect();
    if candidates.is_empty() {
        match session.output {
            OutputMode::Human => println!(
                "No intact applications modified in the last {hours} hours under {}.",
                config.inventory.applications_dir.display()
            ),
            OutputMode::Json => write_json_line(&json!({
                "command": "fix-permissions",
                "window_hours": hours,
                "outcomes": [],
            }))?,
        }
        return Ok(());
    }

    let labels: Vec<String> = scan
        .intact()
        .map(|b| format!("{} (modified {})", b.name, b.modified.format("%Y-%m-%d %H:%M")))
        .collect();
    let chosen: Vec<PathBuf> = if let Some(limit) = choose {
        candidates.truncate(limit);
        if session.yes {
            candidates
        } else {
            let picks = session.prompter.choose_many(
                &format!("{} most recently modified applications:", candidates.len()),
                &labels[..candidates.len()],
            )?;
            picks.into_iter().map(|i| candidates[i].clone()).collect()
        }
    } else {
        if session.output == OutputMode::Human {
            println!("Recently modified applications:");
            for label in &labels {
                println!("  {label}");
            }
        }
        let question = format!("Fix permissions for these {} applications?", candidates.len());
        if !session.confirm(&question, true)? {
            return cancelled(session.output, "fix-permissions");
        }
        candidates
    };
    if chosen.is_empty() {
        return cancelled(session.output, "fix-permissions");
    }

    let platform = detect_platform()?;
    let trust = UnixTrustReset::from_config(&config.restore);
    let smart = SmartRestore::from_config(&config.restore, platform.as_ref(), &trust);
    let outcomes = smart.fix_permissions(&chosen, &mut session.log);
    let clean = outcomes.iter().filter(|o| o.is_clean()).count();
    let summary = format!("{clean}/{} fixed", outcomes.len());

    match session.output {
        OutputMode::Human => {
            print_fix_outcomes(&outcomes);
            println!("\n{}", summary.bold());
        }
        OutputMode::Json => write_json_line(&json!({
            "command": "fix-permissions",
            "window_hours": hours,
            "outcomes": outcomes,
            "summary": summary,
        }))?,
    }
    if clean < outcomes.len() {
        return Err(CliError::Partial(summary));
    }
    Ok(())
}

fn print_fix_outcomes(outcomes: &[FixOutcome]) {
    for outcome in outcomes {
        match &outcome.result {
            FixResult::Fixed { report } if report.is_clean() => println!(
                "  {} {} ({} entries updated)",
                "✓".green(),
                outcome.path.display(),
                report.entries_updated
            ),
            FixResult::Fixed { report } => {
                println!("  {} {}", "!".yellow(), outcome.path.display());
                for issue in &report.issues {
                    println!("      {issue}");
                }
            }
            FixResult::InUse => println!(
                "  {} {} is still in use; quit it and run again",
                "✗".red(),
                outcome.path.display()
            ),
            FixResult::Missing => println!(
                "  {} {} disappeared",
                "✗".red(),
                outcome.path.display()
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn cancelled(output: OutputMode, command: &str) -> Result<(), CliError> {
    match output {
        OutputMode::Human => println!("Cancelled. Nothing was changed."),
        OutputMode::Json => write_json_line(&json!({
            "command": command,
            "status": "cancelled",
        }))?,
    }
    Ok(())
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("FUS_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
