#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::DuebellError;
use crate::scheduler::{FiringWindow, SchedulerPolicy};

pub const CONFIG_ENV: &str = "DUEBELL_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub alarm: AlarmConfig,
    pub notify: NotifyConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub foreground_interval_ms: u64,
    pub background_interval_ms: u64,
    /// Max lateness past the reminder instant.
    #[serde(alias = "catch_up_ms")]
    pub catch_up_window_ms: u64,
    /// Max lateness past the due instant.
    pub overdue_grace_ms: u64,
    pub suppression_ms: u64,
    pub test_alarm_ms: u64,
    pub start_visible: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            foreground_interval_ms: 10_000,
            background_interval_ms: 30_000,
            catch_up_window_ms: 120_000,
            overdue_grace_ms: 300_000,
            suppression_ms: 3_600_000,
            test_alarm_ms: 3_000,
            start_visible: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AlarmConfig {
    #[serde(alias = "sound")]
    pub sound_file: String,
    /// Empty means auto-detect.
    pub player: String,
    pub player_args: Vec<String>,
    pub volume: f32,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            sound_file: "~/.local/share/duebell/alarm.wav".to_owned(),
            player: String::new(),
            player_args: Vec::new(),
            volume: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotifyConfig {
    pub backend: NotifyBackend,
    pub app_name: String,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            backend: NotifyBackend::Auto,
            app_name: "duebell".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotifyBackend {
    Auto,
    Command,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(alias = "dir")]
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.local/share/duebell".to_owned(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub config_file: PathBuf,
}

/// `explicit` wins, then `$DUEBELL_CONFIG`, then the per-user default.
pub fn resolve_paths(explicit: Option<&Path>) -> anyhow::Result<ConfigPaths> {
    if let Some(p) = explicit {
        return Ok(ConfigPaths {
            config_file: p.to_path_buf(),
        });
    }
    if let Some(v) = std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
        return Ok(ConfigPaths {
            config_file: PathBuf::from(v),
        });
    }
    default_paths()
}

pub fn default_paths() -> anyhow::Result<ConfigPaths> {
    let unix = home_config_path_unix();
    if !cfg!(windows) {
        return Ok(ConfigPaths { config_file: unix });
    }

    if unix.exists() {
        return Ok(ConfigPaths { config_file: unix });
    }

    let proj = ProjectDirs::from("com", "duebell", "duebell")
        .context("failed to determine platform config directory")?;
    Ok(ConfigPaths {
        config_file: proj.config_dir().join("config.toml"),
    })
}

fn home_config_path_unix() -> PathBuf {
    let home = home_dir().unwrap_or_else(|| PathBuf::from("~"));
    home.join(".config").join("duebell").join("config.toml")
}

fn home_dir() -> Option<PathBuf> {
    if let Some(v) = std::env::var_os("HOME") {
        return Some(PathBuf::from(v));
    }
    if let Some(v) = std::env::var_os("USERPROFILE") {
        return Some(PathBuf::from(v));
    }
    let drive = std::env::var_os("HOMEDRIVE");
    let path = std::env::var_os("HOMEPATH");
    match (drive, path) {
        (Some(d), Some(p)) => Some(PathBuf::from(d).join(PathBuf::from(p))),
        _ => None,
    }
}

#[must_use]
pub fn expand_tilde(input: &str) -> String {
    if let Some(rest) = input.strip_prefix("~/")
        && let Some(home) = home_dir()
    {
        return home.join(rest).to_string_lossy().to_string();
    }
    input.to_owned()
}

/// Shortens a path under `$HOME` for display.
#[must_use]
pub fn tilde_path(input: &Path) -> String {
    let shown = input.to_string_lossy();
    let Some(home) = home_dir() else {
        return shown.into_owned();
    };
    let home_str = home.to_string_lossy();
    if let Some(rest) = shown.strip_prefix(home_str.as_ref()) {
        if rest.is_empty() {
            return "~".to_owned();
        }
        if rest.starts_with(std::path::MAIN_SEPARATOR) {
            return format!("~{rest}");
        }
    }
    shown.into_owned()
}

pub fn expand_path(input: &str) -> anyhow::Result<PathBuf> {
    let expanded = expand_env_vars(&expand_tilde(input));
    let p = PathBuf::from(expanded);
    if p.is_absolute() {
        return Ok(p);
    }
    let cwd = std::env::current_dir().context("failed to get current directory")?;
    Ok(cwd.join(p))
}

fn expand_env_vars(input: &str) -> String {
    // $VAR and ${VAR}; unknown vars stay as written.
    let Ok(re) = regex::Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?") else {
        return input.to_owned();
    };
    re.replace_all(input, |caps: &regex::Captures<'_>| {
        let key = &caps[1];
        std::env::var(key).unwrap_or_else(|_| caps[0].to_owned())
    })
    .to_string()
}

pub fn load(explicit: Option<&Path>) -> anyhow::Result<(Config, ConfigPaths)> {
    let paths = resolve_paths(explicit)?;
    let (_doc, cfg) = load_from_file(&paths.config_file)?;
    cfg.validate()?;
    Ok((cfg, paths))
}

pub fn list_resolved_toml(explicit: Option<&Path>) -> anyhow::Result<String> {
    let (cfg, _paths) = load(explicit)?;
    Ok(toml::to_string_pretty(&cfg)?)
}

pub fn get_value_string(explicit: Option<&Path>, key: &str) -> anyhow::Result<Option<String>> {
    let paths = resolve_paths(explicit)?;
    get_value_string_at_path(&paths.config_file, key)
}

pub fn set_value_string(explicit: Option<&Path>, key: &str, value: &str) -> anyhow::Result<()> {
    let paths = resolve_paths(explicit)?;
    set_value_string_at_path(&paths.config_file, key, value)
}

fn load_from_file(path: &Path) -> anyhow::Result<(toml_edit::DocumentMut, Config)> {
    if !path.exists() {
        return Ok((toml_edit::DocumentMut::new(), Config::default()));
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let doc = raw
        .parse::<toml_edit::DocumentMut>()
        .with_context(|| format!("failed to parse TOML in {}", path.display()))?;

    let cfg: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to deserialize TOML in {}", path.display()))?;
    Ok((doc, cfg))
}

pub fn get_value_string_at_path(path: &Path, key: &str) -> anyhow::Result<Option<String>> {
    let (_doc, cfg) = load_from_file(path)?;
    cfg.validate()?;

    let norm = normalize_key(key);
    let value = lookup_value(&cfg, &norm);
    Ok(value.map(format_value_for_stdout))
}

pub fn set_value_string_at_path(path: &Path, key: &str, value: &str) -> anyhow::Result<()> {
    let (mut doc, cfg) = load_from_file(path)?;
    cfg.validate()?;

    let (norm_key, value_item) = normalize_key_and_parse_value(key, value)?;
    apply_set(&mut doc, &norm_key, value_item)?;

    // Re-parse so a bad value never reaches disk.
    let new_raw = doc.to_string();
    let new_cfg: Config = toml::from_str(&new_raw)
        .with_context(|| format!("config update produced invalid TOML for {}", path.display()))?;
    new_cfg.validate()?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, new_raw.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;

    Ok(())
}

impl Config {
    pub fn validate(&self) -> Result<(), DuebellError> {
        let s = &self.scheduler;
        if s.foreground_interval_ms == 0 || s.background_interval_ms == 0 {
            return Err(DuebellError::Config(
                "scheduler intervals must be >= 1 ms".to_owned(),
            ));
        }
        if s.test_alarm_ms == 0 {
            return Err(DuebellError::Config(
                "scheduler.test_alarm_ms must be >= 1".to_owned(),
            ));
        }
        for (name, v) in [
            ("scheduler.catch_up_window_ms", s.catch_up_window_ms),
            ("scheduler.overdue_grace_ms", s.overdue_grace_ms),
            ("scheduler.suppression_ms", s.suppression_ms),
        ] {
            if i64::try_from(v).is_err() {
                return Err(DuebellError::Config(format!("{name} is out of range")));
            }
        }
        if !self.alarm.volume.is_finite() || !(0.0..=1.0).contains(&self.alarm.volume) {
            return Err(DuebellError::Config(
                "alarm.volume must be between 0.0 and 1.0".to_owned(),
            ));
        }
        if self.storage.data_dir.trim().is_empty() {
            return Err(DuebellError::Config(
                "storage.data_dir must not be empty".to_owned(),
            ));
        }
        if self.notify.app_name.trim().is_empty() {
            return Err(DuebellError::Config(
                "notify.app_name must not be empty".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn data_dir(&self) -> anyhow::Result<PathBuf> {
        expand_path(&self.storage.data_dir)
    }

    pub fn settings_file(&self) -> anyhow::Result<PathBuf> {
        Ok(self.data_dir()?.join("settings.json"))
    }

    pub fn ledger_file(&self) -> anyhow::Result<PathBuf> {
        Ok(self.data_dir()?.join("dismissed.json"))
    }

    pub fn scheduler_policy(&self) -> anyhow::Result<SchedulerPolicy> {
        let s = &self.scheduler;
        let ms = |v: u64| i64::try_from(v).unwrap_or(i64::MAX);
        Ok(SchedulerPolicy {
            foreground_interval: Duration::from_millis(s.foreground_interval_ms),
            background_interval: Duration::from_millis(s.background_interval_ms),
            window: FiringWindow {
                catch_up_ms: ms(s.catch_up_window_ms),
                overdue_grace_ms: ms(s.overdue_grace_ms),
            },
            suppression_ms: ms(s.suppression_ms),
            alarm_resource: expand_path(&self.alarm.sound_file)?
                .to_string_lossy()
                .into_owned(),
            test_alarm_duration: Duration::from_millis(s.test_alarm_ms),
            start_visible: s.start_visible,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyType {
    Bool,
    Int,
    Float,
    String,
    StringList,
    Enum(&'static [&'static str]),
}

fn normalize_key(key: &str) -> String {
    match key {
        "scheduler.catch_up_ms" => "scheduler.catch_up_window_ms",
        "scheduler.foreground_ms" => "scheduler.foreground_interval_ms",
        "scheduler.background_ms" => "scheduler.background_interval_ms",
        "alarm.sound" => "alarm.sound_file",
        "alarm.args" => "alarm.player_args",
        "storage.dir" => "storage.data_dir",
        _ => key,
    }
    .to_owned()
}

fn normalize_key_and_parse_value(key: &str, value: &str) -> anyhow::Result<(String, toml_edit::Item)> {
    let norm = normalize_key(key);
    let key_type = key_type(&norm).ok_or_else(|| DuebellError::InvalidConfigKey(key.to_owned()))?;
    let invalid = |msg: String| DuebellError::InvalidConfigValue {
        key: key.to_owned(),
        msg,
    };
    let item = match key_type {
        KeyType::Bool => toml_edit::value(parse_bool(value).map_err(invalid)?),
        KeyType::Int => toml_edit::value(parse_int(value).map_err(invalid)?),
        KeyType::Float => toml_edit::value(parse_float(value).map_err(invalid)?),
        KeyType::String => toml_edit::value(value),
        KeyType::StringList => {
            let mut arr = toml_edit::Array::new();
            for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                arr.push(part);
            }
            toml_edit::value(arr)
        }
        KeyType::Enum(allowed) => {
            let v = value.trim();
            if !allowed.contains(&v) {
                return Err(invalid(format!("must be one of: {}", allowed.join(", "))).into());
            }
            toml_edit::value(v)
        }
    };

    Ok((norm, item))
}

fn key_type(key: &str) -> Option<KeyType> {
    Some(match key {
        "alarm.sound_file" | "alarm.player" | "notify.app_name" | "storage.data_dir" => {
            KeyType::String
        }

        "alarm.player_args" => KeyType::StringList,

        "scheduler.start_visible" => KeyType::Bool,

        "scheduler.foreground_interval_ms"
        | "scheduler.background_interval_ms"
        | "scheduler.catch_up_window_ms"
        | "scheduler.overdue_grace_ms"
        | "scheduler.suppression_ms"
        | "scheduler.test_alarm_ms" => KeyType::Int,

        "alarm.volume" => KeyType::Float,

        "notify.backend" => KeyType::Enum(&["auto", "command", "none"]),

        _ => return None,
    })
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(format!("expected true|false, got '{other}'")),
    }
}

fn parse_int(s: &str) -> Result<i64, String> {
    let n = s
        .trim()
        .parse::<i64>()
        .map_err(|e| format!("expected integer, got '{s}': {e}"))?;
    if n < 0 {
        return Err(format!("expected a non-negative integer, got {n}"));
    }
    Ok(n)
}

fn parse_float(s: &str) -> Result<f64, String> {
    s.trim()
        .parse::<f64>()
        .map_err(|e| format!("expected number, got '{s}': {e}"))
}

fn apply_set(
    doc: &mut toml_edit::DocumentMut,
    key: &str,
    value: toml_edit::Item,
) -> anyhow::Result<()> {
    let parts: Vec<&str> = key.split('.').filter(|p| !p.is_empty()).collect();
    let Some((leaf, parents)) = parts.split_last() else {
        return Err(DuebellError::InvalidConfigKey(key.to_owned()).into());
    };

    let mut cur = doc.as_table_mut();
    for seg in parents {
        if !cur.contains_key(seg) {
            let mut t = toml_edit::Table::new();
            t.set_implicit(true);
            cur.insert(seg, toml_edit::Item::Table(t));
        }
        cur = cur[seg].as_table_mut().ok_or_else(|| {
            DuebellError::Config(format!("cannot set {key}: '{seg}' is not a table"))
        })?;
    }

    cur.insert(leaf, value);
    Ok(())
}

fn lookup_value(cfg: &Config, key: &str) -> Option<serde_json::Value> {
    let mut v = serde_json::to_value(cfg).ok()?;
    for seg in key.split('.').filter(|s| !s.is_empty()) {
        match v {
            serde_json::Value::Object(mut map) => {
                v = map.remove(seg)?;
            }
            _ => return None,
        }
    }
    Some(v)
}

fn format_value_for_stdout(v: serde_json::Value) -> String {
    match v {
        serde_json::Value::Null => "null".to_owned(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s,
        other => serde_json::to_string_pretty(&other).unwrap_or_else(|_| other.to_string()),
    }
}
