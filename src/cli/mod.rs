#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use clap::{ArgAction, CommandFactory as _, Parser, Subcommand};
use serde::Serialize;
use tokio::io::AsyncBufReadExt as _;
use tracing::{debug, info, warn};

use crate::alarm::{CommandAlarm, PlayerCommand};
use crate::clock::{Clock as _, SystemClock, format_ms_rfc3339};
use crate::config::{self, Config, NotifyBackend};
use crate::ledger::{DismissalLedger, JsonFileLedger};
use crate::logging;
use crate::notify::{CommandNotifier, NullNotifier, PlatformNotifier};
use crate::output::table::Table;
use crate::scheduler::{
    Collaborators, Decision, FiringHandle, Notification, NotificationScheduler,
};
use crate::settings::{JsonSettingsStore, Settings, SettingsPatch};
use crate::task::{Task, TaskSource};

#[derive(Debug, Parser)]
#[command(
    name = "duebell",
    version,
    about = "Due-date reminders with alarm and desktop notifications"
)]
pub struct Cli {
    /// Config file (defaults to $DUEBELL_CONFIG, then ~/.config/duebell/config.toml)
    #[arg(long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// More log output (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the scheduler against a task file until interrupted
    Watch(WatchArgs),
    /// Show what the scheduler would decide for each task right now
    Check(CheckArgs),
    Settings(SettingsArgs),
    Dismissed(DismissedArgs),
    /// Show the suppression record for one task
    Status(StatusArgs),
    Permission(PermissionArgs),
    /// Play the alarm briefly regardless of settings
    TestAlarm,
    Config(ConfigArgs),
    Completion(CompletionArgs),
    Version,
}

#[derive(Debug, Parser)]
pub struct WatchArgs {
    /// Task file (JSON array, {"items": [...]}, or YAML)
    #[arg(short = 't', long = "tasks")]
    pub tasks: PathBuf,
    /// Re-read the task file every N seconds (0 disables)
    #[arg(short = 'r', long = "reload", default_value_t = 30)]
    pub reload_seconds: u64,
    /// Evaluate once, wait for any alarm to finish, then exit
    #[arg(long = "once")]
    pub once: bool,
    /// Print notifications as JSON lines
    #[arg(long = "json")]
    pub json: bool,
    /// Start in background cadence
    #[arg(long = "background")]
    pub background: bool,
    /// Read control commands (visible, hidden, focus, stop, dismiss <id>, check) from stdin
    #[arg(long = "stdin-control")]
    pub stdin_control: bool,
}

#[derive(Debug, Parser)]
pub struct CheckArgs {
    #[arg(short = 't', long = "tasks")]
    pub tasks: PathBuf,
    #[arg(long = "json", conflicts_with = "csv")]
    pub json: bool,
    #[arg(long = "csv")]
    pub csv: bool,
}

#[derive(Debug, Parser)]
pub struct SettingsArgs {
    #[command(subcommand)]
    pub cmd: SettingsCmd,
}

#[derive(Debug, Subcommand)]
pub enum SettingsCmd {
    Show {
        #[arg(long = "json")]
        json: bool,
    },
    /// Keys: enabled, sound-enabled, loop-sound, notify-minutes-before, desktop-notifications
    Set { key: String, value: String },
}

#[derive(Debug, Parser)]
pub struct DismissedArgs {
    #[command(subcommand)]
    pub cmd: DismissedCmd,
}

#[derive(Debug, Subcommand)]
pub enum DismissedCmd {
    List {
        #[arg(long = "csv")]
        csv: bool,
    },
    Clear,
}

#[derive(Debug, Parser)]
pub struct StatusArgs {
    pub task_id: String,
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct PermissionArgs {
    /// Ask for permission if it has not been decided
    #[arg(long = "request")]
    pub request: bool,
}

#[derive(Debug, Parser)]
pub struct CompletionArgs {
    pub shell: clap_complete::Shell,
}

#[derive(Debug, Parser)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub cmd: ConfigCmd,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCmd {
    List,
    Set(ConfigSetArgs),
    Get(ConfigGetArgs),
}

#[derive(Debug, Parser)]
pub struct ConfigSetArgs {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Parser)]
pub struct ConfigGetArgs {
    pub key: String,
}

pub async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config_path = cli.config.as_deref();
    match cli.cmd {
        Commands::Completion(args) => {
            let mut cmd = Cli::command();
            clap_complete::generate(args.shell, &mut cmd, "duebell", &mut std::io::stdout());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config(args) => cmd_config(config_path, args),
        Commands::Version => Ok(cmd_version()),
        Commands::Watch(args) => cmd_watch(&Host::open(config_path).await?, args).await,
        Commands::Check(args) => cmd_check(&Host::open(config_path).await?, &args).await,
        Commands::Settings(args) => cmd_settings(&Host::open(config_path).await?, args),
        Commands::Dismissed(args) => cmd_dismissed(&Host::open(config_path).await?, &args),
        Commands::Status(args) => cmd_status(&Host::open(config_path).await?, &args),
        Commands::Permission(args) => cmd_permission(&Host::open(config_path).await?, &args).await,
        Commands::TestAlarm => cmd_test_alarm(&Host::open(config_path).await?).await,
    }
}

fn cmd_config(config_path: Option<&Path>, args: ConfigArgs) -> anyhow::Result<ExitCode> {
    match args.cmd {
        ConfigCmd::List => {
            print!("{}", config::list_resolved_toml(config_path)?);
        }
        ConfigCmd::Set(set) => {
            config::set_value_string(config_path, &set.key, &set.value)?;
            println!("Set {} = {}", set.key, set.value);
        }
        ConfigCmd::Get(get) => match config::get_value_string(config_path, &get.key)? {
            Some(v) => println!("{v}"),
            None => anyhow::bail!(
                "configuration key '{}' not found - use 'duebell config list' to see available keys",
                get.key
            ),
        },
    }
    Ok(ExitCode::SUCCESS)
}

/// Everything a command needs: resolved config, the scheduler, and direct
/// ledger access for listing.
struct Host {
    cfg: Config,
    ledger: Arc<JsonFileLedger>,
    scheduler: NotificationScheduler,
}

impl Host {
    async fn open(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let explicit = config_path.map(Path::to_path_buf);
        let cfg = tokio::task::spawn_blocking(move || -> anyhow::Result<Config> {
            let (cfg, paths) = config::load(explicit.as_deref())?;
            debug!(config = %paths.config_file.display(), "configuration loaded");
            Ok(cfg)
        })
        .await??;
        Self::from_config(cfg)
    }

    fn from_config(cfg: Config) -> anyhow::Result<Self> {
        let ledger = Arc::new(JsonFileLedger::new(cfg.ledger_file()?));
        let player = PlayerCommand::resolve(&cfg.alarm.player, &cfg.alarm.player_args);
        if player.is_none() {
            warn!("no audio player found; alarms will be silent");
        }

        let notifier: Arc<dyn PlatformNotifier> = match cfg.notify.backend {
            NotifyBackend::None => Arc::new(NullNotifier),
            backend => {
                let n = CommandNotifier::detect(&cfg.notify.app_name);
                if !n.is_supported() && backend == NotifyBackend::Command {
                    warn!("notify.backend is 'command' but no notifier program was found");
                }
                Arc::new(n)
            }
        };

        let deps = Collaborators {
            settings: Arc::new(JsonSettingsStore::new(cfg.settings_file()?)),
            ledger: ledger.clone(),
            alarm: Arc::new(CommandAlarm::new(player, cfg.alarm.volume)),
            notifier,
            clock: Arc::new(SystemClock),
        };
        let scheduler = NotificationScheduler::new(deps, cfg.scheduler_policy()?);
        Ok(Self {
            cfg,
            ledger,
            scheduler,
        })
    }
}

async fn load_tasks(path: &Path) -> anyhow::Result<Vec<Task>> {
    let source = TaskSource::new(path.to_path_buf());
    tokio::task::spawn_blocking(move || source.load())
        .await
        .context("task loader panicked")?
}

#[derive(Debug, Serialize)]
struct NotificationLine<'a> {
    at: String,
    task_id: &'a str,
    title: &'a str,
    due_at: Option<&'a str>,
    is_overdue: bool,
    minutes_until: u64,
    reminder_minutes_before: u32,
    firing_id: &'a str,
}

fn print_notification(n: &Notification, json: bool) {
    let at = format_ms_rfc3339(SystemClock.now_ms());
    if json {
        let line = NotificationLine {
            at,
            task_id: &n.task.id,
            title: n.task.display_title(),
            due_at: n.task.due_at.as_deref(),
            is_overdue: n.is_overdue,
            minutes_until: n.minutes_until,
            reminder_minutes_before: n.reminder_minutes_before,
            firing_id: &n.firing_id,
        };
        match serde_json::to_string(&line) {
            Ok(s) => println!("{s}"),
            Err(e) => warn!("failed to encode notification: {e}"),
        }
        return;
    }
    println!(
        "{at}  {}  {}  [{}]",
        n.task.display_title(),
        n.time_text(),
        n.task.id
    );
}

/// One line of `watch --stdin-control` input.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ControlCommand {
    Visible,
    Hidden,
    Focus,
    StopAlarm,
    Dismiss(String),
    Check,
}

impl ControlCommand {
    fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let cmd = parts.next()?;
        let arg = parts.next();
        Some(match (cmd.to_ascii_lowercase().as_str(), arg) {
            ("visible" | "show", None) => Self::Visible,
            ("hidden" | "hide", None) => Self::Hidden,
            ("focus", None) => Self::Focus,
            ("stop", None) => Self::StopAlarm,
            ("dismiss", Some(id)) => Self::Dismiss(id.to_owned()),
            ("check", None) => Self::Check,
            _ => return None,
        })
    }
}

type HandleMap = Arc<Mutex<BTreeMap<String, FiringHandle>>>;

fn lock_handles(handles: &HandleMap) -> std::sync::MutexGuard<'_, BTreeMap<String, FiringHandle>> {
    handles
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// One handle per task; a re-fire replaces the older one.
fn remember_handle(handles: &HandleMap, n: &Notification) {
    lock_handles(handles).insert(n.task.id.clone(), n.handle().clone());
}

/// Drops handles whose task left the snapshot or was completed.
fn retain_current(handles: &HandleMap, tasks: &[Task]) {
    let live: BTreeSet<&str> = tasks
        .iter()
        .filter(|t| !t.completed)
        .map(|t| t.id.as_str())
        .collect();
    lock_handles(handles).retain(|id, _| live.contains(id.as_str()));
}

fn apply_control(cmd: ControlCommand, scheduler: &NotificationScheduler, handles: &HandleMap) {
    match cmd {
        ControlCommand::Visible => scheduler.set_page_visible(true),
        ControlCommand::Hidden => scheduler.set_page_visible(false),
        ControlCommand::Focus => scheduler.window_focused(),
        ControlCommand::StopAlarm => scheduler.stop_alarm(),
        ControlCommand::Check => {
            let fired = scheduler.check_tasks();
            debug!(fired, "manual check");
        }
        ControlCommand::Dismiss(id) => {
            let handle = lock_handles(handles).remove(&id);
            match handle {
                Some(h) => {
                    h.dismiss();
                    info!(task_id = %id, "notification dismissed");
                }
                None => warn!(task_id = %id, "no active notification for task"),
            }
        }
    }
}

async fn cmd_watch(host: &Host, args: WatchArgs) -> anyhow::Result<ExitCode> {
    let scheduler = &host.scheduler;
    let tasks = load_tasks(&args.tasks).await?;
    info!(count = tasks.len(), file = %args.tasks.display(), "tasks loaded");

    if args.background {
        scheduler.set_page_visible(false);
    }

    let handles: HandleMap = Arc::new(Mutex::new(BTreeMap::new()));
    let sink = Arc::clone(&handles);
    let json = args.json;
    let on_notification = move |n: Notification| {
        print_notification(&n, json);
        remember_handle(&sink, &n);
    };

    if args.once {
        let fired = scheduler.check_once(tasks, on_notification);
        debug!(fired, "single pass complete");
        wait_for_alarm(scheduler).await;
        return Ok(ExitCode::SUCCESS);
    }

    scheduler.start(tasks, on_notification);

    let mut reload = (args.reload_seconds > 0).then(|| {
        let period = Duration::from_secs(args.reload_seconds);
        tokio::time::interval_at(tokio::time::Instant::now() + period, period)
    });
    let mut control = args
        .stdin_control
        .then(|| tokio::io::BufReader::new(tokio::io::stdin()).lines());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            () = tick_reload(reload.as_mut()) => {
                match load_tasks(&args.tasks).await {
                    Ok(tasks) => {
                        retain_current(&handles, &tasks);
                        scheduler.update_tasks(tasks);
                    }
                    Err(e) => warn!("failed to reload tasks: {e:#}"),
                }
            }
            line = next_control_line(control.as_mut()) => match line {
                Some(line) => match ControlCommand::parse(&line) {
                    Some(cmd) => apply_control(cmd, scheduler, &handles),
                    None if line.trim().is_empty() => {}
                    None => warn!("unknown control command: {}", line.trim()),
                },
                None => control = None,
            },
        }
    }

    scheduler.stop();
    lock_handles(&handles).clear();
    Ok(ExitCode::SUCCESS)
}

async fn tick_reload(reload: Option<&mut tokio::time::Interval>) {
    match reload {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn next_control_line(
    control: Option<&mut tokio::io::Lines<tokio::io::BufReader<tokio::io::Stdin>>>,
) -> Option<String> {
    match control {
        Some(lines) => match lines.next_line().await {
            Ok(line) => line,
            Err(e) => {
                warn!("stdin read failed: {e}");
                None
            }
        },
        None => std::future::pending().await,
    }
}

async fn wait_for_alarm(scheduler: &NotificationScheduler) {
    if !scheduler.is_alarm_playing() {
        return;
    }
    eprintln!("[Press Ctrl+C to silence the alarm]");
    let mut poll = tokio::time::interval(Duration::from_millis(200));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = poll.tick() => {
                if !scheduler.is_alarm_playing() {
                    return;
                }
            }
        }
    }
    scheduler.stop_alarm();
}

#[derive(Debug, Serialize)]
struct CheckRow {
    task_id: String,
    title: String,
    due_at: Option<String>,
    decision: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    minutes_until: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    is_overdue: Option<bool>,
}

fn check_row(task: &Task, decision: Decision) -> CheckRow {
    let (decision, reason, minutes_until, is_overdue) = match decision {
        Decision::Fire(t) => ("fire", None, Some(t.minutes_until()), Some(t.is_overdue())),
        Decision::Skip(r) => ("skip", Some(r.as_str()), None, None),
    };
    CheckRow {
        task_id: task.id.clone(),
        title: task.display_title().to_owned(),
        due_at: task.due_at.clone(),
        decision,
        reason,
        minutes_until,
        is_overdue,
    }
}

async fn cmd_check(host: &Host, args: &CheckArgs) -> anyhow::Result<ExitCode> {
    let tasks = load_tasks(&args.tasks).await?;
    let settings = host.scheduler.get_settings();
    let now = SystemClock.now_ms();

    let rows: Vec<CheckRow> = tasks
        .iter()
        .map(|t| check_row(t, host.scheduler.evaluate_task(t, &settings, now)))
        .collect();

    if args.json {
        let mut s = serde_json::to_string_pretty(&rows)?;
        s.push('\n');
        print!("{s}");
        return Ok(ExitCode::SUCCESS);
    }

    let mut t = Table::new(["ID", "TITLE", "DUE", "DECISION", "DETAIL"]);
    for r in rows {
        let detail = match (r.reason, r.minutes_until, r.is_overdue) {
            (Some(reason), _, _) => reason.to_owned(),
            (None, Some(m), Some(true)) => format!("overdue by {m} min"),
            (None, Some(m), _) => format!("due in {m} min"),
            _ => String::new(),
        };
        t.row([
            r.task_id,
            r.title,
            r.due_at.unwrap_or_else(|| "-".to_owned()),
            r.decision.to_owned(),
            detail,
        ]);
    }
    if args.csv {
        t.print_csv()?;
    } else {
        if !settings.enabled {
            println!("Notifications are disabled; nothing would fire.\n");
        }
        t.print()?;
    }
    Ok(ExitCode::SUCCESS)
}

fn settings_table(s: &Settings) -> Table {
    let mut t = Table::new(["SETTING", "VALUE"]);
    t.row(["enabled".to_owned(), s.enabled.to_string()]);
    t.row(["sound-enabled".to_owned(), s.sound_enabled.to_string()]);
    t.row(["loop-sound".to_owned(), s.loop_sound.to_string()]);
    t.row([
        "notify-minutes-before".to_owned(),
        s.notify_minutes_before.to_string(),
    ]);
    t.row([
        "desktop-notifications".to_owned(),
        s.desktop_notifications.to_string(),
    ]);
    t
}

fn cmd_settings(host: &Host, args: SettingsArgs) -> anyhow::Result<ExitCode> {
    let settings = match args.cmd {
        SettingsCmd::Show { json: true } => {
            let mut s = serde_json::to_string_pretty(&host.scheduler.get_settings())?;
            s.push('\n');
            print!("{s}");
            return Ok(ExitCode::SUCCESS);
        }
        SettingsCmd::Show { json: false } => host.scheduler.get_settings(),
        SettingsCmd::Set { key, value } => {
            let patch = SettingsPatch::from_key_value(&key, &value)?;
            host.scheduler.update_settings(&patch)
        }
    };
    settings_table(&settings).print()?;
    Ok(ExitCode::SUCCESS)
}

fn cmd_dismissed(host: &Host, args: &DismissedArgs) -> anyhow::Result<ExitCode> {
    match args.cmd {
        DismissedCmd::Clear => {
            host.scheduler.clear_dismissed_notifications();
            println!("Cleared dismissed notifications");
        }
        DismissedCmd::List { csv } => {
            let now = SystemClock.now_ms();
            let window = host.scheduler.policy().suppression_ms;
            let mut t = Table::new(["TASK_ID", "DISMISSED_AT", "MINUTES_AGO", "SUPPRESSED"]);
            for (id, at) in host.ledger.entries() {
                let status = host.scheduler.get_task_notification_status(&id);
                let suppressed = at > now.saturating_sub(window);
                t.row([
                    id,
                    status.dismissed_at.unwrap_or_default(),
                    status.minutes_ago.map(|m| m.to_string()).unwrap_or_default(),
                    suppressed.to_string(),
                ]);
            }
            if csv {
                t.print_csv()?;
            } else if t.is_empty() {
                println!(
                    "No dismissed notifications ({})",
                    config::tilde_path(host.ledger.path())
                );
            } else {
                t.print()?;
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_status(host: &Host, args: &StatusArgs) -> anyhow::Result<ExitCode> {
    let status = host.scheduler.get_task_notification_status(&args.task_id);
    if args.json {
        let mut s = serde_json::to_string_pretty(&status)?;
        s.push('\n');
        print!("{s}");
        return Ok(ExitCode::SUCCESS);
    }
    match (status.dismissed_at, status.minutes_ago) {
        (Some(at), Some(ago)) => println!(
            "{}: last notified/dismissed {ago} min ago ({at})",
            args.task_id
        ),
        _ => println!("{}: never notified or dismissed", args.task_id),
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_permission(host: &Host, args: &PermissionArgs) -> anyhow::Result<ExitCode> {
    let scheduler = &host.scheduler;
    if args.request && scheduler.should_prompt_for_permission() {
        let state = scheduler.request_permission().await;
        println!("permission: {}", state.as_str());
        return Ok(ExitCode::SUCCESS);
    }
    println!("permission: {}", scheduler.permission_state().as_str());
    if scheduler.should_prompt_for_permission() {
        println!("Run 'duebell permission --request' to enable desktop notifications.");
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_test_alarm(host: &Host) -> anyhow::Result<ExitCode> {
    let policy = host.scheduler.policy();
    println!(
        "Playing {} for {} ms...",
        config::tilde_path(Path::new(&policy.alarm_resource)),
        policy.test_alarm_duration.as_millis()
    );
    if host.scheduler.test_alarm().await {
        println!("Alarm test complete");
        return Ok(ExitCode::SUCCESS);
    }
    eprintln!(
        "alarm failed to play; check alarm.sound_file ({}) and alarm.player",
        host.cfg.alarm.sound_file
    );
    Ok(ExitCode::from(1))
}

fn cmd_version() -> ExitCode {
    println!("duebell version {}", env!("CARGO_PKG_VERSION"));
    println!("  rust: {}", rustc_version_runtime::version());
    println!(
        "  os/arch: {}/{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    ExitCode::SUCCESS
}
