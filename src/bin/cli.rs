//! Thin local harness standing in for the rendering layer: every invocation
//! boots the engine against the on-disk store, applies at most one action
//! through the `ActionController`, persists the result, and exits. Argument
//! parsing and the `CliError`/`print_help` shape follow the teacher's
//! `bin/admin_cli.rs` (hand-rolled argv walk, no external arg-parsing crate,
//! one flat error enum with a `Display` impl), adapted from an HTTP admin
//! client to a direct, in-process engine driver.

use std::env;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use askesis_engine::config::AppConfig;
use askesis_engine::engine::actions::{ActionController, BatchOutcome, HabitModalInput, ReorderPosition, ScopeChoice};
use askesis_engine::engine::bootstrap::{AttemptCounter, Bootstrapper};
use askesis_engine::engine::model::{AppState, Frequency, Goal, HabitId, TimeSlot};
use askesis_engine::engine::selectors;
use askesis_engine::engine::state_store::StateStore;
use askesis_engine::persistence::store::connect_sqlite;
use askesis_engine::persistence::PersistenceStore;
use askesis_engine::sync::{generate_sync_key, key_hash_hex, SyncOrchestrator};
use chrono::NaiveDate;
use uuid::Uuid;

const DEFAULT_DB_PATH: &str = "./askesis-state.db";
const DEFAULT_SYNC_KEY_FILE: &str = "./askesis-state.db.synckey";
const DEFAULT_PASSPHRASE_ENV: &str = "ASKESIS_PASSPHRASE";
const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:3939";
const DEFAULT_BOOT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BOOT_SYNC_TIMEOUT_MS: u64 = 4000;
const DEFAULT_ARCHIVE_THRESHOLD_DAYS: i64 = 90;

#[derive(Debug, Clone)]
struct Args {
    help: bool,
    db_path: String,
    sync_key_file: String,
    passphrase_env: String,
    server_url: String,
    json: bool,
    cmd: Option<Command>,
}

#[derive(Debug, Clone)]
enum Command {
    Boot,
    List { date: NaiveDate },
    Add(AddCmd),
    Toggle { habit: HabitId, slot: TimeSlot, date: NaiveDate },
    MarkAll { date: NaiveDate, outcome: BatchOutcome },
    Drop { habit: HabitId, from: TimeSlot, to: TimeSlot, date: NaiveDate, scope: ScopeChoice },
    End { habit: HabitId, date: NaiveDate },
    Delete { habit: HabitId },
    Graduate { habit: HabitId, date: NaiveDate },
    Reorder { moved: HabitId, target: HabitId, position: ReorderPosition },
    Archive { threshold_days: i64 },
    Export { out: String },
    Import { path: String },
    Reset,
    SyncInit,
    SyncStatus,
    SyncPush,
    SyncPull,
}

#[derive(Debug, Clone)]
struct AddCmd {
    name: String,
    date: NaiveDate,
    times: std::collections::BTreeSet<TimeSlot>,
    frequency: Frequency,
    goal: Goal,
}

#[derive(Debug)]
enum CliError {
    Args(String),
    Engine(String),
    Io(String),
}

impl Display for CliError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Args(msg) => write!(f, "argument error: {msg}"),
            CliError::Engine(msg) => write!(f, "engine error: {msg}"),
            CliError::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

impl std::error::Error for CliError {}

impl From<askesis_engine::EngineError> for CliError {
    fn from(err: askesis_engine::EngineError) -> Self {
        CliError::Engine(err.to_string())
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn parse_date(raw: &str, flag: &str) -> Result<NaiveDate, CliError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| CliError::Args(format!("{flag} expects YYYY-MM-DD, got {raw}")))
}

fn parse_uuid(raw: &str, flag: &str) -> Result<Uuid, CliError> {
    Uuid::parse_str(raw).map_err(|_| CliError::Args(format!("{flag} expects a UUID, got {raw}")))
}

fn parse_time_slot(raw: &str, flag: &str) -> Result<TimeSlot, CliError> {
    match raw {
        "morning" => Ok(TimeSlot::Morning),
        "afternoon" => Ok(TimeSlot::Afternoon),
        "evening" => Ok(TimeSlot::Evening),
        other => Err(CliError::Args(format!("{flag} expects morning|afternoon|evening, got {other}"))),
    }
}

fn parse_time_slots(raw: &str, flag: &str) -> Result<std::collections::BTreeSet<TimeSlot>, CliError> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(|s| parse_time_slot(s, flag)).collect()
}

fn parse_frequency(raw: &str) -> Result<Frequency, CliError> {
    if raw == "daily" {
        return Ok(Frequency::Daily);
    }
    if let Some(rest) = raw.strip_prefix("weekdays:") {
        let days = rest
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<u8>().map_err(|_| CliError::Args(format!("--frequency weekdays list has non-numeric entry: {s}"))))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Frequency::SpecificDaysOfWeek { days });
    }
    if let Some(rest) = raw.strip_prefix("interval:") {
        let period = rest.parse::<u32>().map_err(|_| CliError::Args(format!("--frequency interval period must be a number, got {rest}")))?;
        return Ok(Frequency::Interval { period });
    }
    Err(CliError::Args(format!("--frequency expects daily|weekdays:D,D..|interval:N, got {raw}")))
}

fn parse_goal(raw: &str) -> Result<Goal, CliError> {
    if raw == "check" {
        return Ok(Goal::Check);
    }
    if let Some(rest) = raw.strip_prefix("numeric:") {
        let total = rest.parse::<f64>().map_err(|_| CliError::Args(format!("--goal numeric total must be a number, got {rest}")))?;
        return Ok(Goal::Numeric { total });
    }
    Err(CliError::Args(format!("--goal expects check|numeric:N, got {raw}")))
}

fn next_flag_value<'a>(argv: &'a [String], idx: &mut usize, flag: &str) -> Result<&'a str, CliError> {
    *idx += 1;
    argv.get(*idx).map(String::as_str).ok_or_else(|| CliError::Args(format!("missing value for {flag}")))
}

impl Args {
    fn parse(argv: Vec<String>) -> Result<Self, CliError> {
        let mut help = false;
        let mut db_path = DEFAULT_DB_PATH.to_string();
        let mut sync_key_file = DEFAULT_SYNC_KEY_FILE.to_string();
        let mut passphrase_env = DEFAULT_PASSPHRASE_ENV.to_string();
        let mut server_url = DEFAULT_SERVER_URL.to_string();
        let mut json = false;
        let mut idx = 0usize;

        while idx < argv.len() {
            match argv[idx].as_str() {
                "-h" | "--help" => {
                    help = true;
                    idx += 1;
                }
                "--json" => {
                    json = true;
                    idx += 1;
                }
                "--db" => {
                    db_path = next_flag_value(&argv, &mut idx, "--db")?.to_string();
                    idx += 1;
                }
                "--sync-key-file" => {
                    sync_key_file = next_flag_value(&argv, &mut idx, "--sync-key-file")?.to_string();
                    idx += 1;
                }
                "--passphrase-env" => {
                    passphrase_env = next_flag_value(&argv, &mut idx, "--passphrase-env")?.to_string();
                    idx += 1;
                }
                "--server-url" => {
                    server_url = next_flag_value(&argv, &mut idx, "--server-url")?.to_string();
                    idx += 1;
                }
                _ => break,
            }
        }

        let cmd = if idx >= argv.len() { None } else { Some(parse_command(&argv[idx], &argv[(idx + 1)..])?) };

        Ok(Self { help, db_path, sync_key_file, passphrase_env, server_url, json, cmd })
    }
}

fn parse_command(name: &str, rest: &[String]) -> Result<Command, CliError> {
    match name {
        "boot" => Ok(Command::Boot),
        "list" => {
            let date = flag_or(rest, "--date").map(|d| parse_date(d, "--date")).transpose()?.unwrap_or_else(today);
            Ok(Command::List { date })
        }
        "add" => {
            let name = flag_required(rest, "--name")?.to_string();
            let date = flag_or(rest, "--date").map(|d| parse_date(d, "--date")).transpose()?.unwrap_or_else(today);
            let times = parse_time_slots(flag_required(rest, "--times")?, "--times")?;
            let frequency = flag_or(rest, "--frequency").map(parse_frequency).transpose()?.unwrap_or(Frequency::Daily);
            let goal = flag_or(rest, "--goal").map(parse_goal).transpose()?.unwrap_or(Goal::Check);
            Ok(Command::Add(AddCmd { name, date, times, frequency, goal }))
        }
        "toggle" => Ok(Command::Toggle {
            habit: parse_uuid(flag_required(rest, "--habit")?, "--habit")?,
            slot: parse_time_slot(flag_required(rest, "--slot")?, "--slot")?,
            date: parse_date(flag_required(rest, "--date")?, "--date")?,
        }),
        "mark-all" => {
            let date = parse_date(flag_required(rest, "--date")?, "--date")?;
            let outcome = match flag_or(rest, "--outcome").unwrap_or("completed") {
                "completed" => BatchOutcome::Completed,
                "snoozed" => BatchOutcome::Snoozed,
                other => return Err(CliError::Args(format!("--outcome expects completed|snoozed, got {other}"))),
            };
            Ok(Command::MarkAll { date, outcome })
        }
        "drop" => Ok(Command::Drop {
            habit: parse_uuid(flag_required(rest, "--habit")?, "--habit")?,
            from: parse_time_slot(flag_required(rest, "--from")?, "--from")?,
            to: parse_time_slot(flag_required(rest, "--to")?, "--to")?,
            date: parse_date(flag_required(rest, "--date")?, "--date")?,
            scope: match flag_or(rest, "--scope").unwrap_or("today") {
                "today" => ScopeChoice::JustToday,
                "future" => ScopeChoice::FromNowOn,
                other => return Err(CliError::Args(format!("--scope expects today|future, got {other}"))),
            },
        }),
        "end" => Ok(Command::End {
            habit: parse_uuid(flag_required(rest, "--habit")?, "--habit")?,
            date: parse_date(flag_required(rest, "--date")?, "--date")?,
        }),
        "delete" => Ok(Command::Delete { habit: parse_uuid(flag_required(rest, "--habit")?, "--habit")? }),
        "graduate" => Ok(Command::Graduate {
            habit: parse_uuid(flag_required(rest, "--habit")?, "--habit")?,
            date: parse_date(flag_required(rest, "--date")?, "--date")?,
        }),
        "reorder" => Ok(Command::Reorder {
            moved: parse_uuid(flag_required(rest, "--moved")?, "--moved")?,
            target: parse_uuid(flag_required(rest, "--target")?, "--target")?,
            position: match flag_required(rest, "--position")? {
                "before" => ReorderPosition::Before,
                "after" => ReorderPosition::After,
                other => return Err(CliError::Args(format!("--position expects before|after, got {other}"))),
            },
        }),
        "archive" => {
            let threshold_days = flag_or(rest, "--threshold-days")
                .map(|v| v.parse::<i64>().map_err(|_| CliError::Args("--threshold-days must be a number".to_string())))
                .transpose()?
                .unwrap_or(DEFAULT_ARCHIVE_THRESHOLD_DAYS);
            Ok(Command::Archive { threshold_days })
        }
        "export" => Ok(Command::Export { out: flag_required(rest, "--out")?.to_string() }),
        "import" => Ok(Command::Import { path: flag_required(rest, "--in")?.to_string() }),
        "reset" => Ok(Command::Reset),
        "sync" => {
            let sub = rest.first().ok_or_else(|| CliError::Args("sync expects a subcommand: init|status|push|pull".to_string()))?;
            match sub.as_str() {
                "init" => Ok(Command::SyncInit),
                "status" => Ok(Command::SyncStatus),
                "push" => Ok(Command::SyncPush),
                "pull" => Ok(Command::SyncPull),
                other => Err(CliError::Args(format!("unknown sync subcommand: {other}"))),
            }
        }
        other => Err(CliError::Args(format!("unknown command: {other}"))),
    }
}

fn today() -> NaiveDate {
    chrono::Utc::now().date_naive()
}

fn flag_or<'a>(rest: &'a [String], flag: &str) -> Option<&'a str> {
    rest.iter().position(|a| a == flag).and_then(|i| rest.get(i + 1)).map(String::as_str)
}

fn flag_required<'a>(rest: &'a [String], flag: &str) -> Result<&'a str, CliError> {
    flag_or(rest, flag).ok_or_else(|| CliError::Args(format!("missing required flag {flag}")))
}

struct Engine {
    state_store: Arc<StateStore>,
    persistence: Arc<PersistenceStore>,
    actions: Arc<ActionController>,
}

impl Engine {
    async fn open(db_path: &str) -> Result<Self, CliError> {
        let pool = connect_sqlite(db_path).await.map_err(|e| CliError::Io(e.to_string()))?;
        let persistence = PersistenceStore::new(pool);
        let state_store = Arc::new(StateStore::new(AppState::empty(now_ms())));
        let actions = Arc::new(ActionController::new(Arc::clone(&state_store)));

        let bootstrapper = Bootstrapper::new(
            Arc::clone(&state_store),
            Arc::clone(&persistence),
            None,
            Arc::clone(&actions),
            DEFAULT_BOOT_MAX_ATTEMPTS,
            std::time::Duration::from_millis(DEFAULT_BOOT_SYNC_TIMEOUT_MS),
        );
        bootstrapper.boot(&AttemptCounter::new(), now_ms()).await?;

        Ok(Self { state_store, persistence, actions })
    }

    async fn persist(&self) -> Result<(), CliError> {
        self.persistence.save_state(&self.state_store, now_ms(), true, true).await?;
        Ok(())
    }
}

fn read_sync_key(path: &str) -> Result<Option<Uuid>, CliError> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Uuid::parse_str(raw.trim()).map(Some).map_err(|e| CliError::Io(format!("corrupt sync key file: {e}"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CliError::Io(e.to_string())),
    }
}

fn read_passphrase(env_var: &str) -> Result<String, CliError> {
    env::var(env_var).map_err(|_| CliError::Args(format!("set {env_var} to the sync passphrase before syncing")))
}

async fn build_orchestrator(args: &Args, engine: &Engine) -> Result<Arc<SyncOrchestrator>, CliError> {
    let key = read_sync_key(&args.sync_key_file)?.ok_or_else(|| CliError::Args(format!("no sync key at {}; run `sync init` first", args.sync_key_file)))?;
    let passphrase = read_passphrase(&args.passphrase_env)?;
    Ok(Arc::new(SyncOrchestrator::new(
        args.server_url.clone(),
        Arc::clone(&engine.state_store),
        Arc::clone(&engine.persistence),
        key,
        passphrase,
    )))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).try_init();

    let args = Args::parse(env::args().skip(1).collect())?;
    if args.help || args.cmd.is_none() {
        print_help();
        return Ok(());
    }

    if let Err(e) = AppConfig::init_global() {
        tracing::debug!("config already initialized or unavailable: {}", e);
    }

    if let Err(err) = run(args).await {
        eprintln!("{err}");
        std::process::exit(2);
    }
    Ok(())
}

async fn run(args: Args) -> Result<(), CliError> {
    match args.cmd.clone().expect("checked by caller") {
        Command::SyncInit => {
            if read_sync_key(&args.sync_key_file)?.is_some() {
                return Err(CliError::Args(format!("sync key already exists at {}", args.sync_key_file)));
            }
            let key = generate_sync_key();
            std::fs::write(&args.sync_key_file, key.to_string()).map_err(|e| CliError::Io(e.to_string()))?;
            println!("sync key written to {}", args.sync_key_file);
            println!("key hash: {}", key_hash_hex(key));
            return Ok(());
        }
        _ => {}
    }

    let engine = Engine::open(&args.db_path).await?;

    match args.cmd.expect("checked by caller") {
        Command::SyncInit => unreachable!("handled above"),
        Command::Boot => {
            let state = engine.state_store.lock().await;
            println!("booted: {} habits, last_modified={}", state.habits.len(), state.last_modified);
        }
        Command::List { date } => {
            let state = engine.state_store.lock().await;
            for habit in &state.habits {
                if habit.is_deleted() {
                    continue;
                }
                let appears = selectors::should_habit_appear_on_date(habit, date);
                let streak = selectors::calculate_habit_streak(habit, &state.monthly_logs, date);
                let display = selectors::get_habit_display_info(habit, Some(date));
                let name = display.map(|d| d.name).unwrap_or_else(|| "(unnamed)".to_string());
                println!("{}\t{}\tappears={}\tstreak={}", habit.id, name, appears, streak);
            }
        }
        Command::Add(cmd) => {
            engine
                .actions
                .save_habit_from_modal(
                    HabitModalInput {
                        editing_habit_id: None,
                        target_date: cmd.date,
                        display_name: cmd.name,
                        icon: None,
                        color: None,
                        goal: cmd.goal,
                        philosophy: None,
                        frequency: cmd.frequency,
                        times: cmd.times,
                        schedule_anchor: cmd.date,
                    },
                    now_ms(),
                )
                .await?;
            engine.persist().await?;
            println!("habit added");
        }
        Command::Toggle { habit, slot, date } => {
            let (scope, milestone) = engine.actions.toggle_habit_status(habit, slot, date, now_ms()).await?;
            engine.persist().await?;
            println!("{scope:?}");
            if let Some(m) = milestone {
                println!("milestone: {m:?}");
            }
        }
        Command::MarkAll { date, outcome } => {
            engine.actions.mark_all_habits_for_date(date, outcome, now_ms()).await?;
            engine.persist().await?;
            println!("marked all habits for {date}");
        }
        Command::Drop { habit, from, to, date, scope } => {
            engine.actions.handle_habit_drop(habit, from, to, date, scope, now_ms()).await?;
            engine.persist().await?;
            println!("habit slot moved");
        }
        Command::End { habit, date } => {
            engine.actions.request_habit_ending(habit).await?;
            engine.actions.confirm_habit_ending(habit, date, now_ms()).await?;
            engine.persist().await?;
            println!("habit ended as of {date}");
        }
        Command::Delete { habit } => {
            engine.actions.request_habit_deletion(habit).await?;
            engine.actions.confirm_habit_deletion(habit, now_ms()).await?;
            engine.persist().await?;
            println!("habit permanently deleted");
        }
        Command::Graduate { habit, date } => {
            engine.actions.graduate_habit(habit, date, now_ms()).await?;
            engine.persist().await?;
            println!("habit graduated as of {date}");
        }
        Command::Reorder { moved, target, position } => {
            let mut state = engine.state_store.lock().await;
            askesis_engine::engine::actions::reorder_habits(&mut state.habits, moved, target, position)?;
            drop(state);
            engine.persist().await?;
            println!("habit reordered");
        }
        Command::Archive { threshold_days } => {
            let archived = engine.actions.perform_archival_check(today(), threshold_days, now_ms()).await?;
            engine.persist().await?;
            println!("archived {archived} day-records older than {threshold_days} days");
        }
        Command::Export { out } => {
            let state = engine.state_store.lock().await;
            let json = PersistenceStore::export_json(&state)?;
            std::fs::write(&out, json).map_err(|e| CliError::Io(e.to_string()))?;
            println!("exported to {out}");
        }
        Command::Import { path } => {
            let payload = std::fs::read_to_string(&path).map_err(|e| CliError::Io(e.to_string()))?;
            let imported = PersistenceStore::import_json(&payload)?;
            engine.state_store.replace(imported).await;
            engine.persist().await?;
            println!("imported from {path}");
        }
        Command::Reset => {
            engine.actions.reset_application_data(now_ms()).await;
            engine.persistence.clear_all().await?;
            std::fs::remove_file(&args.sync_key_file).ok();
            println!("application data reset; clear {} yourself if it holds a saved passphrase", args.passphrase_env);
        }
        Command::SyncStatus => {
            let orchestrator = build_orchestrator(&args, &engine).await?;
            println!("{:?}", orchestrator.status().await);
        }
        Command::SyncPush => {
            let orchestrator = build_orchestrator(&args, &engine).await?;
            orchestrator.push_current(now_ms()).await?;
            println!("pushed");
        }
        Command::SyncPull => {
            let orchestrator = build_orchestrator(&args, &engine).await?;
            orchestrator.initial_pull_and_merge(now_ms()).await?;
            println!("pulled and merged");
        }
    }

    if args.json {
        tracing::debug!("--json was requested but plain output was already printed above");
    }

    Ok(())
}

fn print_help() {
    println!(
        r#"askesis-cli (local harness for the habit-tracking engine)

Global flags:
  --db PATH                 SQLite store path (default {DEFAULT_DB_PATH})
  --sync-key-file PATH      Where the sync key lives (default {DEFAULT_SYNC_KEY_FILE})
  --passphrase-env NAME     Env var holding the sync passphrase (default {DEFAULT_PASSPHRASE_ENV})
  --server-url URL          Vault server base URL (default {DEFAULT_SERVER_URL})
  --json                    Reserved for future machine-readable output
  -h, --help                Show this help

Commands:
  boot                                       Load the store and print a summary
  list [--date YYYY-MM-DD]                   List habits and streaks for a date
  add --name NAME --times morning,evening
      [--date YYYY-MM-DD] [--frequency daily|weekdays:D,D|interval:N]
      [--goal check|numeric:N]               Create a habit
  toggle --habit ID --slot SLOT --date DATE  Cycle a slot's status
  mark-all --date DATE [--outcome completed|snoozed]
  drop --habit ID --from SLOT --to SLOT --date DATE [--scope today|future]
  end --habit ID --date DATE                 End a habit as of a date
  delete --habit ID                          Permanently delete a habit
  graduate --habit ID --date DATE
  reorder --moved ID --target ID --position before|after
  archive [--threshold-days N]               Run the archival sweep
  export --out PATH                          Write a plaintext export
  import --in PATH                           Load a plaintext export
  reset                                      Wipe all local state
  sync init                                  Generate a new sync key
  sync status                                Show sync status
  sync push                                  Push local state to the vault
  sync pull                                  Pull, merge, and push

Examples:
  askesis-cli sync init
  askesis-cli add --name "Read" --times morning --date 2026-01-01
  askesis-cli toggle --habit <uuid> --slot morning --date 2026-01-01
  ASKESIS_PASSPHRASE=secret askesis-cli sync pull
"#
    );
}
