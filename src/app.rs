use chrono::Utc;
use clap::Parser;
use serde_json::json;
use std::env;
use std::ffi::OsString;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cli::{
    split_comma_values, BackupCommand, Cli, CliCommand, CreateArgs, ExportArgs, FilterArgs,
    ListArgs, LockCommand,
};
use crate::config::{expand_home, load_config_or_default, Config};
use crate::error::{QueueError, QueueResult};
use crate::filter::{parse_statuses, parse_time_bound, run_query, PriorityRange, TaskFilter, TaskQuery};
use crate::lock::LockStatus;
use crate::logger::Logger;
use crate::queue::NewTask;
use crate::render::{self, OutputFormat};
use crate::store::write_atomic;
use crate::task_types::{
    parse_metadata_pairs, Priority, TaskId, TaskStatus, TaskType, META_CLEAR_CONTEXT,
    META_COMPLETION_MARKER, META_COMPLETION_PATTERN, META_DESCRIPTION, META_TIMEOUT,
};
use crate::transfer::{export, import, ImportMode};
use crate::workspace::Workspace;

const DEFAULT_CONFIG_REL: &str = ".config/taskq.yml";
const DEFAULT_QUEUE_REL: &str = ".taskq";
const META_COMMAND: &str = "command";
const INTERRUPTED_EXIT: i32 = 130;

#[derive(Debug)]
pub(crate) struct Quit {
    pub(crate) code: i32,
    #[allow(dead_code)]
    pub(crate) reason: String,
}

impl Quit {
    pub(crate) fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.code as u8)
    }
}

/// What a command hands back for printing.
#[derive(Debug)]
enum Output {
    Text(String),
    Raw(Vec<u8>),
    Nothing,
}

struct Context<'a> {
    workspace: &'a Workspace,
    config: &'a Config,
    format: OutputFormat,
}

fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
}

fn validation(message: String) -> QueueError {
    QueueError::Validation(message)
}

fn report_error(format: OutputFormat, kind: &str, message: &str) {
    match format {
        OutputFormat::Json => println!("{}", render::error(kind, message)),
        OutputFormat::Text => eprintln!("Error: {}", message),
    }
}

fn quit_with(format: OutputFormat, err: &QueueError) -> Quit {
    report_error(format, err.kind(), &err.to_string());
    Quit {
        code: err.exit_code(),
        reason: err.kind().to_string(),
    }
}

fn config_quit(format: OutputFormat, message: &str) -> Quit {
    report_error(format, "validation", message);
    Quit {
        code: 1,
        reason: "config".to_string(),
    }
}

fn resolve_queue_dir(
    cli: &Cli,
    config: &Config,
    home: Option<&Path>,
) -> Result<PathBuf, String> {
    if let Some(dir) = &cli.queue_dir {
        return Ok(dir.clone());
    }
    if let Some(dir) = &config.queue_dir {
        return Ok(expand_home(dir, home));
    }
    home.map(|home| home.join(DEFAULT_QUEUE_REL))
        .ok_or_else(|| "Missing HOME environment variable; pass --queue-dir".to_string())
}

pub(crate) fn run_with_cli(cli: Cli, interrupt: Arc<AtomicBool>) -> Result<(), Quit> {
    let format = cli.format;
    let home = home_dir();

    let loaded = match (&cli.config, &home) {
        (Some(path), _) => load_config_or_default(path, true),
        (None, Some(home)) => load_config_or_default(&home.join(DEFAULT_CONFIG_REL), false),
        (None, None) => load_config_or_default(Path::new(""), false),
    }
    .map_err(|message| config_quit(format, &message))?;
    let config = loaded.config;

    let queue_dir = resolve_queue_dir(&cli, &config, home.as_deref())
        .map_err(|message| config_quit(format, &message))?;
    let logger = Logger::new(
        config
            .log_path
            .as_deref()
            .map(|raw| expand_home(raw, home.as_deref())),
    );

    let workspace = Workspace::open(&config, queue_dir, logger, Some(Arc::clone(&interrupt)))
        .map_err(|err| quit_with(format, &err))?;
    let context = Context {
        workspace: &workspace,
        config: &config,
        format,
    };

    let output = dispatch(cli.command, &context).map_err(|err| quit_with(format, &err))?;
    emit(output).map_err(|err| quit_with(format, &err))?;

    if interrupt.load(Ordering::SeqCst) {
        return Err(Quit {
            code: INTERRUPTED_EXIT,
            reason: "interrupted".to_string(),
        });
    }
    Ok(())
}

fn emit(output: Output) -> QueueResult<()> {
    let mut stdout = io::stdout().lock();
    let result = match output {
        Output::Text(text) => writeln!(stdout, "{}", text),
        Output::Raw(bytes) => stdout.write_all(&bytes),
        Output::Nothing => Ok(()),
    };
    result
        .and_then(|()| stdout.flush())
        .map_err(|err| QueueError::io("Failed to write output", err))
}

fn dispatch(command: CliCommand, ctx: &Context<'_>) -> QueueResult<Output> {
    match command {
        CliCommand::Create(args) => create(args, ctx),
        CliCommand::Remove { id } => remove(&id, ctx),
        CliCommand::UpdateStatus { id, status } => update_status(&id, &status, ctx),
        CliCommand::UpdatePriority { id, priority } => update_priority(&id, &priority, ctx),
        CliCommand::Next { claim } => next(claim, ctx),
        CliCommand::Show { id } => show(&id, ctx),
        CliCommand::List(args) => list(args, ctx),
        CliCommand::Stats => stats(ctx),
        CliCommand::Export(args) => export_tasks(args, ctx),
        CliCommand::Import { source, mode } => import_tasks(&source, mode, ctx),
        CliCommand::Cleanup { max_age_days } => cleanup(max_age_days, ctx),
        CliCommand::Backup { action } => backup(action, ctx),
        CliCommand::Lock { action } => lock(action, ctx),
    }
}

fn parse_id(raw: &str) -> QueueResult<TaskId> {
    TaskId::try_from(raw).map_err(validation)
}

fn text(ctx: &Context<'_>, text: impl FnOnce() -> String, value: serde_json::Value) -> Output {
    Output::Text(render::either(ctx.format, text, value))
}

fn create(args: CreateArgs, ctx: &Context<'_>) -> QueueResult<Output> {
    let task_type: TaskType = args.task_type.parse().map_err(validation)?;
    let priority = match &args.priority {
        Some(raw) => raw.parse::<Priority>().map_err(validation)?,
        None => ctx.config.default_priority,
    };
    let id = args.id.as_deref().map(parse_id).transpose()?;

    let mut metadata = parse_metadata_pairs(&args.meta).map_err(validation)?;
    let text_fields = [
        (META_DESCRIPTION, &args.description),
        (META_COMMAND, &args.command),
        (META_COMPLETION_MARKER, &args.completion_marker),
        (META_COMPLETION_PATTERN, &args.completion_pattern),
    ];
    for (key, value) in text_fields {
        if let Some(value) = value {
            metadata.insert(key.to_string(), json!(value));
        }
    }
    if let Some(raw) = &args.timeout {
        let secs = raw
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|secs| *secs > 0)
            .ok_or_else(|| {
                validation(format!(
                    "timeout must be a positive number of seconds (got {:?})",
                    raw
                ))
            })?;
        metadata.insert(META_TIMEOUT.to_string(), json!(secs));
    }
    if args.clear_context {
        metadata.insert(META_CLEAR_CONTEXT.to_string(), json!(true));
    }

    let new = NewTask {
        task_type,
        priority,
        id,
        metadata,
    };
    let id = ctx
        .workspace
        .mutate(|engine| engine.create_task(new, Utc::now()))?;
    ctx.workspace.logger().log_event(
        "create",
        &[("task", &id), ("type", &task_type), ("priority", &priority)],
    );
    Ok(text(ctx, || id.to_string(), json!({ "id": id })))
}

fn remove(raw_id: &str, ctx: &Context<'_>) -> QueueResult<Output> {
    let id = parse_id(raw_id)?;
    let removed = ctx.workspace.mutate(|engine| engine.remove_task(&id))?;
    ctx.workspace.logger().log_event(
        "remove",
        &[("task", &id), ("status", &removed.status)],
    );
    Ok(text(
        ctx,
        || format!("Removed task {}", id),
        json!({ "removed": id, "status": removed.status }),
    ))
}

fn update_status(raw_id: &str, raw_status: &str, ctx: &Context<'_>) -> QueueResult<Output> {
    let id = parse_id(raw_id)?;
    let next: TaskStatus = raw_status.parse().map_err(validation)?;
    let (from, retry_count) = ctx.workspace.mutate(|engine| {
        let from = engine.get(&id)?.status;
        engine.update_status(&id, next, Utc::now())?;
        Ok((from, engine.get(&id)?.retry_count))
    })?;
    ctx.workspace.logger().log_event(
        "status",
        &[
            ("task", &id),
            ("from", &from),
            ("to", &next),
            ("retry_count", &retry_count),
        ],
    );
    Ok(text(
        ctx,
        || format!("Task {}: {} -> {}", id, from, next),
        json!({ "id": id, "from": from, "to": next, "retry_count": retry_count }),
    ))
}

fn update_priority(raw_id: &str, raw_priority: &str, ctx: &Context<'_>) -> QueueResult<Output> {
    let id = parse_id(raw_id)?;
    let priority: Priority = raw_priority.parse().map_err(validation)?;
    let from = ctx.workspace.mutate(|engine| {
        let from = engine.get(&id)?.priority;
        engine.update_priority(&id, priority, Utc::now())?;
        Ok(from)
    })?;
    ctx.workspace.logger().log_event(
        "priority",
        &[("task", &id), ("from", &from), ("to", &priority)],
    );
    Ok(text(
        ctx,
        || format!("Task {}: priority {} -> {}", id, from, priority),
        json!({ "id": id, "from": from, "to": priority }),
    ))
}

fn next(claim: bool, ctx: &Context<'_>) -> QueueResult<Output> {
    let selected = if claim {
        let claimed = ctx.workspace.mutate(|engine| engine.dequeue(Utc::now()))?;
        if let Some(id) = &claimed {
            ctx.workspace.logger().log_event(
                "status",
                &[("task", id), ("from", &TaskStatus::Pending), ("to", &TaskStatus::InProgress)],
            );
        }
        claimed
    } else {
        ctx.workspace.read()?.select_next()
    };

    let claimed = claim && selected.is_some();
    match (ctx.format, selected) {
        (OutputFormat::Text, None) => Ok(Output::Nothing),
        (OutputFormat::Text, Some(id)) => Ok(Output::Text(id.to_string())),
        (OutputFormat::Json, selected) => Ok(Output::Text(render::either(
            OutputFormat::Json,
            String::new,
            json!({ "id": selected, "claimed": claimed }),
        ))),
    }
}

fn show(raw_id: &str, ctx: &Context<'_>) -> QueueResult<Output> {
    let id = parse_id(raw_id)?;
    let engine = ctx.workspace.read()?;
    let task = engine.get(&id)?;
    Ok(Output::Text(render::task_detail(task, ctx.format)))
}

fn build_filter(args: &FilterArgs) -> QueueResult<TaskFilter> {
    let mut filter = TaskFilter::new();
    let statuses = split_comma_values(&args.status, "--status").map_err(validation)?;
    if !statuses.is_empty() {
        filter = filter.with_statuses(parse_statuses(&statuses).map_err(validation)?);
    }
    if let Some(raw) = &args.priority {
        filter = filter.with_priority(raw.parse::<PriorityRange>().map_err(validation)?);
    }
    if let Some(raw) = &args.task_type {
        filter = filter.with_type(raw.parse::<TaskType>().map_err(validation)?);
    }
    if let Some(raw) = &args.after {
        filter = filter.created_after(parse_time_bound(raw, false).map_err(validation)?);
    }
    if let Some(raw) = &args.before {
        filter = filter.created_before(parse_time_bound(raw, true).map_err(validation)?);
    }
    if let Some(needle) = &args.search {
        filter = filter.with_search(needle);
    }
    Ok(filter)
}

fn list(args: ListArgs, ctx: &Context<'_>) -> QueueResult<Output> {
    let query = TaskQuery::new(build_filter(&args.filter)?)
        .sorted_by(args.sort)
        .with_limit(args.limit);
    let engine = ctx.workspace.read()?;
    let tasks = run_query(engine.index(), &query, ctx.workspace.policy().priority_order);
    Ok(Output::Text(render::task_list(&tasks, ctx.format)))
}

fn stats(ctx: &Context<'_>) -> QueueResult<Output> {
    let counts = ctx.workspace.read()?.counts();
    Ok(Output::Text(render::stats(&counts, ctx.format)))
}

fn export_tasks(args: ExportArgs, ctx: &Context<'_>) -> QueueResult<Output> {
    let filter = build_filter(&args.filter)?;
    let engine = ctx.workspace.read()?;
    let bytes = export(
        engine.index(),
        ctx.workspace.policy(),
        args.export_format,
        &filter,
        Utc::now(),
    )?;
    let Some(path) = args.output else {
        return Ok(Output::Raw(bytes));
    };
    write_atomic(&path, &bytes)
        .map_err(|err| QueueError::io(format!("Failed to write {}", path.display()), err))?;
    ctx.workspace.logger().log_event(
        "export",
        &[("path", &path.display()), ("bytes", &bytes.len())],
    );
    Ok(text(
        ctx,
        || format!("Exported to {}", path.display()),
        json!({ "path": path.display().to_string(), "bytes": bytes.len() }),
    ))
}

fn read_payload(source: &str) -> QueueResult<Vec<u8>> {
    if source == "-" {
        let mut data = Vec::new();
        io::stdin()
            .read_to_end(&mut data)
            .map_err(|err| QueueError::io("Failed to read stdin", err))?;
        return Ok(data);
    }
    fs::read(source).map_err(|err| QueueError::io(format!("Failed to read {}", source), err))
}

fn import_tasks(source: &str, mode: ImportMode, ctx: &Context<'_>) -> QueueResult<Output> {
    let data = read_payload(source)?;
    let backups = ctx.workspace.backups();
    let summary = if mode == ImportMode::Validate {
        let mut engine = ctx.workspace.read()?;
        import(&mut engine, &data, mode, backups, Utc::now())?
    } else {
        ctx.workspace
            .mutate(|engine| import(engine, &data, mode, backups, Utc::now()))?
    };
    ctx.workspace.logger().log_event(
        "import",
        &[
            ("mode", &mode.as_str()),
            ("total", &summary.total),
            ("inserted", &summary.inserted),
            ("updated", &summary.updated),
            ("failed", &summary.failed),
        ],
    );
    Ok(Output::Text(render::import_summary(&summary, mode, ctx.format)))
}

fn cleanup(max_age_days: Option<i64>, ctx: &Context<'_>) -> QueueResult<Output> {
    let days = max_age_days.unwrap_or(ctx.config.task_retention_days);
    let removed = ctx
        .workspace
        .mutate(|engine| Ok(engine.cleanup_old_tasks(days, Utc::now())))?;
    ctx.workspace.logger().log_event(
        "cleanup",
        &[("removed", &removed), ("max_age_days", &days)],
    );
    Ok(text(
        ctx,
        || {
            if days <= 0 {
                "Cleanup disabled (max age <= 0 days)".to_string()
            } else {
                format!("Removed {} tasks older than {} days", removed, days)
            }
        },
        json!({ "removed": removed, "max_age_days": days }),
    ))
}

fn backup(action: BackupCommand, ctx: &Context<'_>) -> QueueResult<Output> {
    let backups = ctx.workspace.backups();
    let logger = ctx.workspace.logger();
    match action {
        BackupCommand::Create { reason } => {
            let entry = ctx.workspace.locked(|| backups.snapshot(&reason))?;
            match entry {
                Some(entry) => {
                    logger.log_event(
                        "backup",
                        &[("reason", &entry.reason), ("path", &entry.path.display())],
                    );
                    Ok(Output::Text(render::backup_entry(&entry, "Created", ctx.format)))
                }
                None => Ok(text(
                    ctx,
                    || "Nothing to back up: the store does not exist yet".to_string(),
                    json!(null),
                )),
            }
        }
        BackupCommand::List => Ok(Output::Text(render::backup_list(
            &backups.list()?,
            ctx.format,
        ))),
        BackupCommand::Latest => match backups.latest()? {
            Some(entry) => Ok(Output::Text(render::backup_entry(&entry, "Latest", ctx.format))),
            None => Ok(text(ctx, || "No backups.".to_string(), json!(null))),
        },
        BackupCommand::Cleanup { retention_days } => {
            let days = retention_days.unwrap_or(ctx.config.backups.retention_days);
            let removed = ctx.workspace.locked(|| backups.cleanup(days))?;
            logger.log_event(
                "backup_cleanup",
                &[("removed", &removed), ("retention_days", &days)],
            );
            Ok(text(
                ctx,
                || format!("Removed {} backups older than {} days", removed, days),
                json!({ "removed": removed, "retention_days": days }),
            ))
        }
        BackupCommand::Restore { source } => {
            let path = if source == "latest" {
                backups
                    .latest()?
                    .map(|entry| entry.path)
                    .ok_or_else(|| {
                        validation(format!("No backups in {}", backups.dir().display()))
                    })?
            } else {
                PathBuf::from(&source)
            };
            let previous = ctx.workspace.locked(|| backups.restore(&path))?;
            logger.log_event("restore", &[("path", &path.display())]);
            Ok(text(
                ctx,
                || {
                    let mut message = format!("Restored {}", path.display());
                    if let Some(previous) = &previous {
                        message.push_str(&format!(
                            "\nPrevious store saved to {}",
                            previous.path.display()
                        ));
                    }
                    message
                },
                json!({
                    "restored": path.display().to_string(),
                    "previous": previous.as_ref().map(|entry| entry.path.display().to_string()),
                }),
            ))
        }
    }
}

fn lock(action: LockCommand, ctx: &Context<'_>) -> QueueResult<Output> {
    let manager = ctx.workspace.lock();
    let marker = manager.marker_path().display().to_string();
    let logger = ctx.workspace.logger();
    match action {
        LockCommand::Status => Ok(Output::Text(render::lock_status(
            &manager.status()?,
            &marker,
            ctx.format,
        ))),
        LockCommand::Cleanup => {
            let reclaimed = manager.cleanup_stale(logger)?;
            let removed = matches!(reclaimed, Some(LockStatus::Stale { .. }));
            Ok(text(
                ctx,
                || {
                    if removed {
                        format!("Removed stale lock {}", marker)
                    } else {
                        format!("No stale lock at {}", marker)
                    }
                },
                json!({ "path": marker, "removed": removed }),
            ))
        }
        LockCommand::ForceUnlock => {
            let removed = manager.force_unlock(logger)?;
            Ok(text(
                ctx,
                || {
                    if removed {
                        format!("Removed lock {}", marker)
                    } else {
                        format!("No lock at {}", marker)
                    }
                },
                json!({ "path": marker, "removed": removed }),
            ))
        }
    }
}

pub(crate) fn run_with_args(args: Vec<OsString>, interrupt: Arc<AtomicBool>) -> Result<(), Quit> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err) => {
            // clap's `Error::print()` uses termcolor and can bypass Rust's test output
            // capturing. Rendering it ourselves keeps CLI errors capture-friendly.
            if err.use_stderr() {
                eprintln!("{err}");
            } else {
                print!("{err}");
            }
            return Err(Quit {
                code: err.exit_code(),
                reason: "cli_parse".to_string(),
            });
        }
    };
    run_with_cli(cli, interrupt)
}

pub(crate) fn main() -> ExitCode {
    let interrupt = Arc::new(AtomicBool::new(false));
    if let Err(err) = ctrlc::set_handler({
        let interrupt = Arc::clone(&interrupt);
        move || {
            interrupt.store(true, Ordering::SeqCst);
        }
    }) {
        eprintln!("Failed to set interrupt handler: {}", err);
    }

    match run_with_args(env::args_os().collect(), interrupt) {
        Ok(()) => ExitCode::SUCCESS,
        Err(quit) => quit.exit_code(),
    }
}
