#![forbid(unsafe_code)]

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::DuebellError;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    #[must_use]
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Self::Low,
            "high" => Self::High,
            _ => Self::Medium,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// A task as the scheduler sees it. Read-only to the scheduler.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub due_at: Option<String>,
    pub completed: bool,
    pub priority: Priority,
}

impl Task {
    #[must_use]
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            due_at: None,
            completed: false,
            priority: Priority::Medium,
        }
    }

    #[must_use]
    pub fn with_due_at(mut self, due_at: impl Into<String>) -> Self {
        self.due_at = Some(due_at.into());
        self
    }

    #[must_use]
    pub fn with_due_ms(self, due_ms: i64) -> Self {
        self.with_due_at(crate::clock::format_ms_rfc3339(due_ms))
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn completed(mut self, completed: bool) -> Self {
        self.completed = completed;
        self
    }

    #[must_use]
    pub fn display_title(&self) -> &str {
        let t = self.title.trim();
        if t.is_empty() { "Untitled" } else { t }
    }

    /// Parses `due_at` into epoch milliseconds. `None` when absent.
    pub fn due_ms(&self) -> Option<Result<i64, DuebellError>> {
        self.due_at.as_deref().map(parse_due_ms)
    }
}

/// Wire shape accepted from hosts. Upstream task sources disagree on
/// field names, so everything is normalised here before it reaches the
/// scheduler.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskRecord {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default, alias = "name")]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "dueAt", alias = "deadline")]
    pub due_at: Option<String>,
    #[serde(default)]
    pub completed: Option<bool>,
    #[serde(default)]
    pub is_completed: Option<bool>,
    #[serde(default)]
    pub done: Option<bool>,
    #[serde(default)]
    pub priority: Option<String>,
}

impl From<TaskRecord> for Task {
    fn from(r: TaskRecord) -> Self {
        let completed = r.completed.unwrap_or(false)
            || r.is_completed.unwrap_or(false)
            || r.done.unwrap_or(false);
        let due_at = r.due_at.filter(|s| !s.trim().is_empty());
        let description = r.description.filter(|s| !s.trim().is_empty());
        Self {
            id: r.id,
            title: r.title,
            description,
            due_at,
            completed,
            priority: r
                .priority
                .as_deref()
                .map_or(Priority::Medium, Priority::parse_lenient),
        }
    }
}

fn id_string<'de, D>(d: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Str(String),
        Int(i64),
        Uint(u64),
    }

    Ok(match RawId::deserialize(d)? {
        RawId::Str(s) => s,
        RawId::Int(n) => n.to_string(),
        RawId::Uint(n) => n.to_string(),
    })
}

/// Accepts RFC 3339, or a naive `YYYY-MM-DDTHH:MM[:SS]` read as UTC.
pub fn parse_due_ms(raw: &str) -> Result<i64, DuebellError> {
    use time::format_description::well_known::Rfc3339;
    use time::macros::format_description;

    let s = raw.trim();
    let parsed = time::OffsetDateTime::parse(s, &Rfc3339).ok().or_else(|| {
        let with_secs = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
        let no_secs = format_description!("[year]-[month]-[day]T[hour]:[minute]");
        time::PrimitiveDateTime::parse(s, with_secs)
            .or_else(|_| time::PrimitiveDateTime::parse(s, no_secs))
            .ok()
            .map(time::PrimitiveDateTime::assume_utc)
    });

    let Some(dt) = parsed else {
        return Err(DuebellError::InvalidDueTime(raw.to_owned()));
    };
    i64::try_from(dt.unix_timestamp_nanos() / 1_000_000)
        .map_err(|_| DuebellError::InvalidDueTime(raw.to_owned()))
}
