#![forbid(unsafe_code)]

//! Firing-window arithmetic, free of any I/O.

use serde::Serialize;

use crate::ledger::round_div;

pub const DEFAULT_CATCH_UP_MS: i64 = 2 * 60 * 1000;
pub const DEFAULT_OVERDUE_GRACE_MS: i64 = 5 * 60 * 1000;

/// Bounds around the reminder instant.
///
/// A reminder fires when `reminder <= now <= reminder + catch_up_ms` and
/// `now <= due + overdue_grace_ms`. Polling is discrete and hosts can be
/// suspended for long stretches, so the upper bounds keep a resumed host
/// from replaying every stale reminder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiringWindow {
    pub catch_up_ms: i64,
    pub overdue_grace_ms: i64,
}

impl Default for FiringWindow {
    fn default() -> Self {
        Self {
            catch_up_ms: DEFAULT_CATCH_UP_MS,
            overdue_grace_ms: DEFAULT_OVERDUE_GRACE_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Timing {
    pub due_ms: i64,
    pub reminder_ms: i64,
    pub until_reminder_ms: i64,
    pub until_due_ms: i64,
}

impl Timing {
    #[must_use]
    pub fn compute(due_ms: i64, lead_ms: i64, now_ms: i64) -> Self {
        let reminder_ms = due_ms.saturating_sub(lead_ms);
        Self {
            due_ms,
            reminder_ms,
            until_reminder_ms: reminder_ms.saturating_sub(now_ms),
            until_due_ms: due_ms.saturating_sub(now_ms),
        }
    }

    #[must_use]
    pub fn is_overdue(&self) -> bool {
        self.until_due_ms < 0
    }

    /// Whole minutes until (or past) due, rounded.
    #[must_use]
    pub fn minutes_until(&self) -> u64 {
        round_div(self.until_due_ms.saturating_abs(), 60_000).unsigned_abs()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Completed,
    NoDueTime,
    RecentlyDismissed,
    InvalidDueTime,
    NotYet,
    MissedWindow,
    TooOverdue,
}

impl SkipReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::NoDueTime => "no due time",
            Self::RecentlyDismissed => "recently dismissed",
            Self::InvalidDueTime => "invalid due time",
            Self::NotYet => "not yet",
            Self::MissedWindow => "missed window",
            Self::TooOverdue => "too overdue",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Fire(Timing),
    Skip(SkipReason),
}

impl FiringWindow {
    #[must_use]
    pub fn evaluate(&self, timing: &Timing) -> Decision {
        if timing.until_reminder_ms > 0 {
            return Decision::Skip(SkipReason::NotYet);
        }
        if timing.until_reminder_ms < -self.catch_up_ms {
            return Decision::Skip(SkipReason::MissedWindow);
        }
        if timing.until_due_ms < -self.overdue_grace_ms {
            return Decision::Skip(SkipReason::TooOverdue);
        }
        Decision::Fire(*timing)
    }
}
