#![forbid(unsafe_code)]

//! Notification preferences and where they live.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DuebellError;

pub const DEFAULT_NOTIFY_MINUTES_BEFORE: u32 = 5;

#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub enabled: bool,
    pub sound_enabled: bool,
    pub loop_sound: bool,
    pub notify_minutes_before: u32,
    pub desktop_notifications: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            sound_enabled: true,
            loop_sound: false,
            notify_minutes_before: DEFAULT_NOTIFY_MINUTES_BEFORE,
            desktop_notifications: true,
        }
    }
}

/// Persisted payloads may come from older builds or hand edits, so every
/// field decodes on its own and falls back to its default.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSettings {
    enabled: Option<Value>,
    sound_enabled: Option<Value>,
    loop_sound: Option<Value>,
    notify_minutes_before: Option<Value>,
    desktop_notifications: Option<Value>,
}

impl From<RawSettings> for Settings {
    fn from(raw: RawSettings) -> Self {
        let d = Self::default();
        Self {
            enabled: bool_or(raw.enabled, d.enabled),
            sound_enabled: bool_or(raw.sound_enabled, d.sound_enabled),
            loop_sound: bool_or(raw.loop_sound, d.loop_sound),
            notify_minutes_before: raw
                .notify_minutes_before
                .as_ref()
                .and_then(minutes_from_value)
                .unwrap_or(d.notify_minutes_before),
            desktop_notifications: bool_or(raw.desktop_notifications, d.desktop_notifications),
        }
    }
}

impl<'de> Deserialize<'de> for Settings {
    fn deserialize<D>(d: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        RawSettings::deserialize(d).map(Self::from)
    }
}

fn bool_or(v: Option<Value>, default: bool) -> bool {
    match v {
        Some(Value::Bool(b)) => b,
        _ => default,
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn minutes_from_value(v: &Value) -> Option<u32> {
    let n = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !n.is_finite() || n < 0.0 || n > f64::from(u32::MAX) {
        return None;
    }
    Some(n.trunc() as u32)
}

/// Shallow partial update: every present key overwrites.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_sound: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify_minutes_before: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desktop_notifications: Option<bool>,
}

impl SettingsPatch {
    /// Builds a single-key patch from CLI-style input. Accepts kebab,
    /// snake and camel spellings of each key.
    pub fn from_key_value(key: &str, value: &str) -> Result<Self, DuebellError> {
        let norm: String = key
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        let mut patch = Self::default();
        let bad = |msg: String| DuebellError::InvalidConfigValue {
            key: key.to_owned(),
            msg,
        };
        match norm.as_str() {
            "enabled" => patch.enabled = Some(parse_bool(value).map_err(bad)?),
            "soundenabled" => patch.sound_enabled = Some(parse_bool(value).map_err(bad)?),
            "loopsound" => patch.loop_sound = Some(parse_bool(value).map_err(bad)?),
            "desktopnotifications" => {
                patch.desktop_notifications = Some(parse_bool(value).map_err(bad)?);
            }
            "notifyminutesbefore" => {
                let n = value
                    .trim()
                    .parse::<u32>()
                    .map_err(|e| bad(format!("expected non-negative integer, got '{value}': {e}")))?;
                patch.notify_minutes_before = Some(n);
            }
            _ => return Err(DuebellError::InvalidSettingsKey(key.to_owned())),
        }
        Ok(patch)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl Settings {
    #[must_use]
    pub fn merge(mut self, patch: &SettingsPatch) -> Self {
        if let Some(v) = patch.enabled {
            self.enabled = v;
        }
        if let Some(v) = patch.sound_enabled {
            self.sound_enabled = v;
        }
        if let Some(v) = patch.loop_sound {
            self.loop_sound = v;
        }
        if let Some(v) = patch.notify_minutes_before {
            self.notify_minutes_before = v;
        }
        if let Some(v) = patch.desktop_notifications {
            self.desktop_notifications = v;
        }
        self
    }

    #[must_use]
    pub fn notify_lead_ms(&self) -> i64 {
        i64::from(self.notify_minutes_before) * 60_000
    }
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s.trim() {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        other => Err(format!("expected true|false, got '{other}'")),
    }
}

pub trait SettingsStore: Send + Sync {
    /// Current snapshot. Missing or unreadable data yields defaults.
    fn load(&self) -> Settings;

    fn save(&self, settings: &Settings) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct JsonSettingsStore {
    path: PathBuf,
}

impl JsonSettingsStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonSettingsStore {
    fn load(&self) -> Settings {
        let data = match std::fs::read(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Settings::default(),
            Err(e) => {
                tracing::warn!("failed to read {}: {e}; using default settings", self.path.display());
                return Settings::default();
            }
        };
        match serde_json::from_slice::<Settings>(&data) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(
                    "ignoring malformed settings at {}: {e}",
                    self.path.display()
                );
                Settings::default()
            }
        }
    }

    fn save(&self, settings: &Settings) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(settings)?;
        std::fs::write(&tmp, &data)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path).with_context(|| {
            format!("failed to rename {} -> {}", tmp.display(), self.path.display())
        })?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    current: Mutex<Option<Settings>>,
}

impl MemorySettingsStore {
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        Self {
            current: Mutex::new(Some(settings)),
        }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Settings {
        let guard = self
            .current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.as_ref().copied().unwrap_or_default()
    }

    fn save(&self, settings: &Settings) -> anyhow::Result<()> {
        let mut guard = self
            .current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = Some(*settings);
        Ok(())
    }
}
