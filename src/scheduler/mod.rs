#![forbid(unsafe_code)]

//! Due-date reminder scheduler.
//!
//! Polls the current task snapshot on a timer, decides which reminders
//! have matured, and fans each firing out to the alarm player, the
//! platform notifier and the host callback. The cadence follows page
//! visibility: short while the host is visible, long while it is hidden.

pub mod window;

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::alarm::AlarmPlayer;
use crate::clock::{Clock, format_ms_rfc3339};
use crate::ledger::{DEFAULT_SUPPRESSION_MS, DismissalLedger, NotificationStatus};
use crate::notify::{DesktopNotice, PermissionState, PlatformNotifier};
use crate::settings::{Settings, SettingsPatch, SettingsStore};
use crate::task::Task;

pub use window::{Decision, FiringWindow, SkipReason, Timing};

/// Receives every firing. Called outside the scheduler's internal lock, so
/// it may call back into the scheduler.
pub type NotificationHandler = Arc<dyn Fn(Notification) + Send + Sync>;

/// Injected collaborators. Hosts build one set and one scheduler.
#[derive(Clone)]
pub struct Collaborators {
    pub settings: Arc<dyn SettingsStore>,
    pub ledger: Arc<dyn DismissalLedger>,
    pub alarm: Arc<dyn AlarmPlayer>,
    pub notifier: Arc<dyn PlatformNotifier>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerPolicy {
    pub foreground_interval: Duration,
    pub background_interval: Duration,
    pub window: FiringWindow,
    pub suppression_ms: i64,
    pub alarm_resource: String,
    pub test_alarm_duration: Duration,
    pub start_visible: bool,
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self {
            foreground_interval: Duration::from_secs(10),
            background_interval: Duration::from_secs(30),
            window: FiringWindow::default(),
            suppression_ms: DEFAULT_SUPPRESSION_MS,
            alarm_resource: "alarm.wav".to_owned(),
            test_alarm_duration: Duration::from_secs(3),
            start_visible: true,
        }
    }
}

impl SchedulerPolicy {
    #[must_use]
    pub fn interval(&self, cadence: Cadence) -> Duration {
        match cadence {
            Cadence::Foreground => self.foreground_interval,
            Cadence::Background => self.background_interval,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    Foreground,
    Background,
}

impl Cadence {
    fn for_visibility(visible: bool) -> Self {
        if visible {
            Self::Foreground
        } else {
            Self::Background
        }
    }
}

/// Actions bound to one firing.
#[derive(Clone)]
pub struct FiringHandle {
    task_id: String,
    ledger: Arc<dyn DismissalLedger>,
    alarm: Arc<dyn AlarmPlayer>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for FiringHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiringHandle")
            .field("task_id", &self.task_id)
            .finish_non_exhaustive()
    }
}

impl FiringHandle {
    /// Suppresses the task for the cool-down window and silences the alarm.
    pub fn dismiss(&self) {
        self.ledger.record_at(&self.task_id, self.clock.now_ms());
        self.alarm.stop();
    }

    pub fn stop(&self) {
        self.alarm.stop();
    }
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub task: Task,
    pub is_overdue: bool,
    pub minutes_until: u64,
    pub reminder_minutes_before: u32,
    pub firing_id: String,
    handle: FiringHandle,
}

impl Notification {
    pub fn dismiss(&self) {
        self.handle.dismiss();
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    #[must_use]
    pub fn handle(&self) -> &FiringHandle {
        &self.handle
    }

    #[must_use]
    pub fn time_text(&self) -> String {
        match (self.is_overdue, self.minutes_until) {
            (_, 0) => "Due now!".to_owned(),
            (true, n) => format!("Overdue by {n} min"),
            (false, n) => format!("Due in {n} min"),
        }
    }

    #[must_use]
    pub fn desktop_notice(&self) -> DesktopNotice {
        let n = self.minutes_until;
        let mut body = if self.is_overdue {
            format!("Overdue by {n} minutes")
        } else if n == 0 {
            "Due now!".to_owned()
        } else {
            format!("Due in {n} minutes")
        };
        if let Some(desc) = self.task.description.as_deref() {
            body.push('\n');
            body.push_str(desc);
        }
        DesktopNotice {
            title: format!("Task Reminder: {}", self.task.display_title()),
            body,
            tag: format!("task-{}", self.task.id),
        }
    }
}

fn new_firing_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    let short: String = id.chars().take(8).collect();
    format!("fire-{short}")
}

struct Session {
    tasks: Arc<[Task]>,
    handler: Option<NotificationHandler>,
    running: bool,
    timer: Option<JoinHandle<()>>,
    generation: u64,
    cadence: Cadence,
    page_visible: bool,
    permission: PermissionState,
    permission_requested: bool,
    last_check_ms: Option<i64>,
    alarm_owner: u64,
}

struct Inner {
    deps: Collaborators,
    policy: SchedulerPolicy,
    session: Mutex<Session>,
}

/// Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct NotificationScheduler {
    inner: Arc<Inner>,
}

impl NotificationScheduler {
    #[must_use]
    pub fn new(deps: Collaborators, policy: SchedulerPolicy) -> Self {
        let permission = deps.notifier.permission_state();
        let visible = policy.start_visible;
        Self {
            inner: Arc::new(Inner {
                session: Mutex::new(Session {
                    tasks: Arc::from(Vec::new()),
                    handler: None,
                    running: false,
                    timer: None,
                    generation: 0,
                    cadence: Cadence::for_visibility(visible),
                    page_visible: visible,
                    permission,
                    permission_requested: false,
                    last_check_ms: None,
                    alarm_owner: 0,
                }),
                deps,
                policy,
            }),
        }
    }

    fn session(&self) -> std::sync::MutexGuard<'_, Session> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn deps(&self) -> &Collaborators {
        &self.inner.deps
    }

    #[must_use]
    pub fn policy(&self) -> &SchedulerPolicy {
        &self.inner.policy
    }

    /// Stops any previous run, evaluates once immediately, then arms the
    /// repeating timer for the current visibility.
    pub fn start<F>(&self, tasks: Vec<Task>, on_notification: F)
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        self.stop();
        let visible = {
            let mut s = self.session();
            s.tasks = Arc::from(tasks);
            s.handler = Some(Arc::new(on_notification));
            s.running = true;
            s.page_visible
        };

        self.check_tasks();
        self.arm_timer();

        info!(
            mode = if visible { "foreground" } else { "background" },
            "notification scheduler started"
        );
    }

    /// Evaluates `tasks` once with `on_notification` as the handler and
    /// arms no timer.
    pub fn check_once<F>(&self, tasks: Vec<Task>, on_notification: F) -> usize
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        {
            let mut s = self.session();
            s.tasks = Arc::from(tasks);
            s.handler = Some(Arc::new(on_notification));
        }
        self.check_tasks()
    }

    /// Cancels the timer and silences the alarm before returning.
    pub fn stop(&self) {
        let (timer, was_running) = {
            let mut s = self.session();
            s.generation += 1;
            let was_running = s.running;
            s.running = false;
            (s.timer.take(), was_running)
        };
        if let Some(t) = timer {
            t.abort();
        }
        self.deps().alarm.stop();
        if was_running {
            info!("notification scheduler stopped");
        }
    }

    /// Replaces the task snapshot. Takes effect on the next tick.
    pub fn update_tasks(&self, tasks: Vec<Task>) {
        let count = tasks.len();
        self.session().tasks = Arc::from(tasks);
        debug!(count, "task snapshot replaced");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.session().running
    }

    #[must_use]
    pub fn cadence(&self) -> Cadence {
        self.session().cadence
    }

    #[must_use]
    pub fn is_page_visible(&self) -> bool {
        self.session().page_visible
    }

    #[must_use]
    pub fn last_check_ms(&self) -> Option<i64> {
        self.session().last_check_ms
    }

    fn arm_timer(&self) {
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            warn!("no async runtime; reminders will only be checked on demand");
            return;
        };

        let (generation, period, cadence) = {
            let mut s = self.session();
            if !s.running {
                return;
            }
            s.generation += 1;
            if let Some(t) = s.timer.take() {
                t.abort();
            }
            let cadence = Cadence::for_visibility(s.page_visible);
            s.cadence = cadence;
            (s.generation, self.inner.policy.interval(cadence), cadence)
        };

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let task = rt.spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let sched = NotificationScheduler { inner };
                if sched.tick(Some(generation)).is_none() {
                    break;
                }
            }
        });

        let mut s = self.session();
        if s.generation == generation {
            s.timer = Some(task);
            debug!(
                interval_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
                ?cadence,
                "timer armed"
            );
        } else {
            task.abort();
        }
    }

    /// Host signal for visibility transitions. Acted on only while running.
    pub fn set_page_visible(&self, visible: bool) {
        let (running, armed) = {
            let mut s = self.session();
            s.page_visible = visible;
            (s.running, s.timer.is_some())
        };
        if !running {
            return;
        }
        info!(
            state = if visible { "visible" } else { "hidden" },
            "page visibility changed"
        );
        if visible {
            self.perform_catch_up_check();
        }
        if armed {
            self.arm_timer();
        }
    }

    /// Host signal for window focus; covers platforms that focus without a
    /// visibility transition.
    pub fn window_focused(&self) {
        let (running, visible) = {
            let s = self.session();
            (s.running, s.page_visible)
        };
        if running && visible {
            self.perform_catch_up_check();
        }
    }

    /// Out-of-schedule evaluation after the host was unobserved.
    pub fn perform_catch_up_check(&self) -> usize {
        let now = self.deps().clock.now_ms();
        match self.last_check_ms() {
            Some(last) => info!(
                since_last_secs = (now - last) / 1000,
                "performing catch-up check"
            ),
            None => info!("performing catch-up check"),
        }
        self.check_tasks()
    }

    /// One evaluation pass over the current snapshot. Returns the number of
    /// reminders fired.
    pub fn check_tasks(&self) -> usize {
        self.tick(None).unwrap_or(0)
    }

    /// `None` when the tick belongs to a cancelled timer.
    fn tick(&self, generation: Option<u64>) -> Option<usize> {
        if let Some(g) = generation
            && self.session().generation != g
        {
            return None;
        }

        let settings = self.deps().settings.load();
        if !settings.enabled {
            debug!("notifications disabled; skipping tick");
            return Some(0);
        }

        let now = self.deps().clock.now_ms();
        let (epoch, tasks, handler, permission, visible) = {
            let mut s = self.session();
            if let Some(g) = generation
                && s.generation != g
            {
                return None;
            }
            s.last_check_ms = Some(now);
            (
                s.generation,
                Arc::clone(&s.tasks),
                s.handler.clone(),
                s.permission,
                s.page_visible,
            )
        };

        let mut fired = 0;
        for task in tasks.iter() {
            match self.evaluate_task(task, &settings, now) {
                Decision::Fire(timing) => {
                    if !self.is_current(epoch) {
                        debug!("scheduler stopped mid-tick; dropping remaining reminders");
                        break;
                    }
                    info!(
                        task_id = %task.id,
                        title = %task.title,
                        reminder_at = %format_ms_rfc3339(timing.reminder_ms),
                        due_at = %format_ms_rfc3339(timing.due_ms),
                        minutes_until_due = timing.until_due_ms / 60_000,
                        notify_minutes_before = settings.notify_minutes_before,
                        page_visible = visible,
                        "triggering notification"
                    );
                    if self.trigger(task, timing, &settings, permission, handler.as_ref(), epoch) {
                        fired += 1;
                    }
                }
                Decision::Skip(reason) => {
                    tracing::trace!(task_id = %task.id, reason = reason.as_str(), "skipped");
                }
            }
        }
        Some(fired)
    }

    /// Applies the exclusion filters and the firing window to one task.
    /// Reads the ledger but has no side effects beyond logging.
    pub fn evaluate_task(&self, task: &Task, settings: &Settings, now_ms: i64) -> Decision {
        if task.completed {
            return Decision::Skip(SkipReason::Completed);
        }
        let Some(raw_due) = task.due_at.as_deref() else {
            return Decision::Skip(SkipReason::NoDueTime);
        };
        if self
            .deps()
            .ledger
            .is_recently_suppressed_at(&task.id, now_ms, self.inner.policy.suppression_ms)
        {
            return Decision::Skip(SkipReason::RecentlyDismissed);
        }
        let due_ms = match crate::task::parse_due_ms(raw_due) {
            Ok(ms) => ms,
            Err(e) => {
                warn!(task_id = %task.id, "{e}; skipping");
                return Decision::Skip(SkipReason::InvalidDueTime);
            }
        };
        let timing = Timing::compute(due_ms, settings.notify_lead_ms(), now_ms);
        self.inner.policy.window.evaluate(&timing)
    }

    fn firing_handle(&self, task_id: &str) -> FiringHandle {
        let deps = self.deps();
        FiringHandle {
            task_id: task_id.to_owned(),
            ledger: Arc::clone(&deps.ledger),
            alarm: Arc::clone(&deps.alarm),
            clock: Arc::clone(&deps.clock),
        }
    }

    fn build_notification(&self, task: &Task, timing: &Timing, settings: &Settings) -> Notification {
        Notification {
            task: task.clone(),
            is_overdue: timing.is_overdue(),
            minutes_until: timing.minutes_until(),
            reminder_minutes_before: settings.notify_minutes_before,
            firing_id: new_firing_id(),
            handle: self.firing_handle(&task.id),
        }
    }

    /// False once `stop` (or a restart) has superseded the session `epoch`.
    fn is_current(&self, epoch: u64) -> bool {
        self.session().generation == epoch
    }

    /// Fires one reminder. Returns false when a `stop` overtook the
    /// firing before the alarm or the host handler was reached.
    fn trigger(
        &self,
        task: &Task,
        timing: Timing,
        settings: &Settings,
        permission: PermissionState,
        handler: Option<&NotificationHandler>,
        epoch: u64,
    ) -> bool {
        let payload = self.build_notification(task, &timing, settings);

        if settings.desktop_notifications && permission == PermissionState::Granted {
            self.show_desktop(&payload);
        }

        if settings.sound_enabled {
            // Held across `play` so that `stop` either sees this sound and
            // silences it, or bumps the generation first and we skip.
            let played = {
                let mut s = self.session();
                if s.generation == epoch {
                    s.alarm_owner += 1;
                    Some(
                        self.deps()
                            .alarm
                            .play(&self.inner.policy.alarm_resource, settings.loop_sound),
                    )
                } else {
                    None
                }
            };
            match played {
                Some(true) => debug!(task_id = %task.id, "alarm sound played"),
                Some(false) => warn!(task_id = %task.id, "alarm sound failed to play"),
                None => {
                    debug!(task_id = %task.id, "scheduler stopped before the alarm; firing dropped");
                    return false;
                }
            }
        }

        if !self.is_current(epoch) {
            debug!(task_id = %task.id, "scheduler stopped before the handler; firing dropped");
            return false;
        }

        match handler {
            Some(h) => h(payload),
            None => debug!(task_id = %task.id, "no notification handler registered"),
        }

        self.deps()
            .ledger
            .record_at(&task.id, self.deps().clock.now_ms());
        true
    }

    fn show_desktop(&self, payload: &Notification) {
        let weak = Arc::downgrade(&self.inner);
        let task = payload.task.clone();
        let shown = self.deps().notifier.show(
            payload.desktop_notice(),
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    NotificationScheduler { inner }.activate_desktop(&task);
                }
            }),
        );
        if !shown {
            debug!(task_id = %payload.task.id, "desktop notice not shown");
        }
    }

    /// A clicked desktop notice focuses the host and re-surfaces the
    /// in-app payload, recomputed for the current time.
    fn activate_desktop(&self, task: &Task) {
        self.deps().notifier.focus_app();
        let Some(handler) = self.session().handler.clone() else {
            return;
        };
        let Some(Ok(due_ms)) = task.due_ms() else {
            return;
        };
        let settings = self.deps().settings.load();
        let timing = Timing::compute(due_ms, settings.notify_lead_ms(), self.deps().clock.now_ms());
        handler(self.build_notification(task, &timing, &settings));
    }

    #[must_use]
    pub fn get_settings(&self) -> Settings {
        self.deps().settings.load()
    }

    /// Shallow-merges `patch` over the stored settings, persists, and
    /// returns the merged value.
    pub fn update_settings(&self, patch: &SettingsPatch) -> Settings {
        let merged = self.deps().settings.load().merge(patch);
        if let Err(e) = self.deps().settings.save(&merged) {
            warn!("failed to persist notification settings: {e:#}");
        }
        merged
    }

    #[must_use]
    pub fn is_alarm_playing(&self) -> bool {
        self.deps().alarm.is_playing()
    }

    pub fn stop_alarm(&self) {
        self.deps().alarm.stop();
    }

    /// Plays the alarm regardless of settings for the configured test
    /// window, then stops it unless another sound took over meanwhile.
    pub async fn test_alarm(&self) -> bool {
        let owner = {
            let mut s = self.session();
            s.alarm_owner += 1;
            s.alarm_owner
        };
        let played = self
            .deps()
            .alarm
            .play(&self.inner.policy.alarm_resource, false);
        if !played {
            warn!("test alarm failed to play");
            return false;
        }

        tokio::time::sleep(self.inner.policy.test_alarm_duration).await;
        let still_ours = self.session().alarm_owner == owner;
        if still_ours {
            self.stop_alarm();
        }
        true
    }

    pub fn clear_dismissed_notifications(&self) {
        self.deps().ledger.clear();
        info!("cleared all dismissed notifications");
    }

    #[must_use]
    pub fn get_task_notification_status(&self, task_id: &str) -> NotificationStatus {
        NotificationStatus::from_record(
            self.deps().ledger.last_dismissed(task_id),
            self.deps().clock.now_ms(),
        )
    }

    #[must_use]
    pub fn permission_state(&self) -> PermissionState {
        self.session().permission
    }

    #[must_use]
    pub fn should_prompt_for_permission(&self) -> bool {
        let notifier = &self.deps().notifier;
        notifier.is_supported()
            && notifier.permission_state() == PermissionState::Default
            && !self.session().permission_requested
    }

    /// Prompts at most once per session. Settled states are returned
    /// without prompting.
    pub async fn request_permission(&self) -> PermissionState {
        let notifier = Arc::clone(&self.deps().notifier);
        if !notifier.is_supported() {
            warn!("desktop notifications not supported on this platform");
            return PermissionState::Denied;
        }

        let current = notifier.permission_state();
        {
            let mut s = self.session();
            if current != PermissionState::Default {
                s.permission = current;
                return current;
            }
            if s.permission_requested {
                return s.permission;
            }
            s.permission_requested = true;
        }

        let answer = notifier.request_permission().await;
        self.session().permission = answer;
        info!(permission = answer.as_str(), "desktop notification permission resolved");
        answer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ledger::MemoryLedger;
    use crate::notify::{MemoryNotifier, NullNotifier};
    use crate::settings::MemorySettingsStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const MIN: i64 = 60_000;
    const NOW: i64 = 1_700_000_000_000;

    #[derive(Default)]
    struct RecordingAlarm {
        plays: AtomicUsize,
        playing: AtomicBool,
        fail: bool,
    }

    impl AlarmPlayer for RecordingAlarm {
        fn play(&self, _resource: &str, _looped: bool) -> bool {
            self.plays.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return false;
            }
            self.playing.store(true, Ordering::SeqCst);
            true
        }

        fn stop(&self) {
            self.playing.store(false, Ordering::SeqCst);
        }

        fn is_playing(&self) -> bool {
            self.playing.load(Ordering::SeqCst)
        }

        fn set_volume(&self, _volume: f32) {}

        fn volume(&self) -> f32 {
            1.0
        }
    }

    struct Fixture {
        sched: NotificationScheduler,
        clock: Arc<ManualClock>,
        alarm: Arc<RecordingAlarm>,
        ledger: Arc<MemoryLedger>,
        notifier: Arc<MemoryNotifier>,
        received: Arc<Mutex<Vec<Notification>>>,
    }

    impl Fixture {
        fn new(settings: Settings) -> Self {
            Self::with_alarm(settings, RecordingAlarm::default())
        }

        fn with_alarm(settings: Settings, alarm: RecordingAlarm) -> Self {
            Self::build(settings, alarm, PermissionState::Granted)
        }

        fn with_permission(settings: Settings, permission: PermissionState) -> Self {
            Self::build(settings, RecordingAlarm::default(), permission)
        }

        fn build(settings: Settings, alarm: RecordingAlarm, permission: PermissionState) -> Self {
            let clock = Arc::new(ManualClock::new(NOW));
            let alarm = Arc::new(alarm);
            let ledger = Arc::new(MemoryLedger::new());
            let notifier = Arc::new(MemoryNotifier::new(permission, PermissionState::Granted));
            let deps = Collaborators {
                settings: Arc::new(MemorySettingsStore::new(settings)),
                ledger: ledger.clone(),
                alarm: alarm.clone(),
                notifier: notifier.clone(),
                clock: clock.clone(),
            };
            Self {
                sched: NotificationScheduler::new(deps, SchedulerPolicy::default()),
                clock,
                alarm,
                ledger,
                notifier,
                received: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn start(&self, tasks: Vec<Task>) {
            let sink = Arc::clone(&self.received);
            self.sched.start(tasks, move |n| sink.lock().unwrap().push(n));
        }

        fn received(&self) -> Vec<Notification> {
            self.received.lock().unwrap().clone()
        }
    }

    fn due_in(id: &str, delta_ms: i64) -> Task {
        Task::new(id, format!("Task {id}")).with_due_ms(NOW + delta_ms)
    }

    #[test]
    fn eager_tick_fires_task_inside_window() {
        let fx = Fixture::new(Settings::default());
        fx.start(vec![due_in("t1", 4 * MIN)]);

        let got = fx.received();
        assert_eq!(got.len(), 1);
        assert!(!got[0].is_overdue);
        assert_eq!(got[0].minutes_until, 4);
        assert_eq!(got[0].reminder_minutes_before, 5);
        assert_eq!(fx.alarm.plays.load(Ordering::SeqCst), 1);
        assert!(fx.ledger.last_dismissed("t1").is_some());
    }

    #[test]
    fn stale_overdue_task_does_not_fire() {
        let fx = Fixture::new(Settings::default());
        fx.start(vec![due_in("t2", -10 * MIN)]);
        assert!(fx.received().is_empty());
        assert_eq!(fx.alarm.plays.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn excluded_tasks_never_fire() {
        let fx = Fixture::new(Settings::default());
        let done = due_in("done", 4 * MIN).completed(true);
        let undated = Task::new("undated", "No due");
        let garbage = Task::new("bad", "Bad").with_due_at("someday");
        fx.start(vec![done, undated, garbage]);
        assert!(fx.received().is_empty());
    }

    #[test]
    fn disabled_settings_skip_whole_tick() {
        let fx = Fixture::new(Settings {
            enabled: false,
            ..Settings::default()
        });
        fx.start(vec![due_in("t1", 4 * MIN)]);
        assert!(fx.received().is_empty());
        assert_eq!(fx.sched.last_check_ms(), None);
    }

    #[test]
    fn ledger_suppresses_refire_until_it_decays() {
        let fx = Fixture::new(Settings {
            notify_minutes_before: 0,
            ..Settings::default()
        });
        fx.start(vec![due_in("t1", 0)]);
        assert_eq!(fx.received().len(), 1);

        fx.clock.advance_ms(MIN);
        assert_eq!(fx.sched.check_tasks(), 0);

        // Re-dated task still in its window after the cool-down.
        fx.clock.advance_ms(DEFAULT_SUPPRESSION_MS);
        fx.sched.update_tasks(vec![due_in("t1", DEFAULT_SUPPRESSION_MS + MIN)]);
        assert_eq!(fx.sched.check_tasks(), 1);
        assert_eq!(fx.received().len(), 2);
    }

    #[test]
    fn sound_disabled_still_notifies() {
        let fx = Fixture::new(Settings::default());
        fx.sched.update_settings(&SettingsPatch {
            sound_enabled: Some(false),
            ..SettingsPatch::default()
        });
        fx.start(vec![due_in("t1", 4 * MIN)]);
        assert_eq!(fx.alarm.plays.load(Ordering::SeqCst), 0);
        assert_eq!(fx.received().len(), 1);
    }

    #[test]
    fn failed_alarm_does_not_suppress_notification() {
        let fx = Fixture::with_alarm(
            Settings::default(),
            RecordingAlarm {
                fail: true,
                ..RecordingAlarm::default()
            },
        );
        fx.start(vec![due_in("t1", 4 * MIN)]);
        assert_eq!(fx.received().len(), 1);
        assert_eq!(fx.notifier.notices().len(), 1);
    }

    #[test]
    fn dismiss_and_stop_callbacks() {
        let fx = Fixture::new(Settings {
            loop_sound: true,
            ..Settings::default()
        });
        fx.start(vec![due_in("t1", 4 * MIN)]);
        let n = fx.received().remove(0);
        assert!(fx.sched.is_alarm_playing());

        n.stop();
        assert!(!fx.sched.is_alarm_playing());

        fx.ledger.clear();
        fx.clock.advance_ms(1_000);
        n.dismiss();
        assert_eq!(fx.ledger.last_dismissed("t1"), Some(NOW + 1_000));
    }

    #[test]
    fn stop_silences_alarm() {
        let fx = Fixture::new(Settings::default());
        fx.start(vec![due_in("t1", 4 * MIN)]);
        assert!(fx.sched.is_alarm_playing());
        fx.sched.stop();
        assert!(!fx.sched.is_alarm_playing());
        assert!(!fx.sched.is_running());
    }

    /// Parks the first `last_dismissed` lookup until the test releases it.
    struct GatedLedger {
        inner: MemoryLedger,
        entered: Mutex<Option<std::sync::mpsc::Sender<()>>>,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl DismissalLedger for GatedLedger {
        fn record_at(&self, task_id: &str, now_ms: i64) {
            self.inner.record_at(task_id, now_ms);
        }

        fn last_dismissed(&self, task_id: &str) -> Option<i64> {
            if let Some(tx) = self.entered.lock().unwrap().take() {
                tx.send(()).unwrap();
                self.release.lock().unwrap().recv().unwrap();
            }
            self.inner.last_dismissed(task_id)
        }

        fn clear(&self) {
            self.inner.clear();
        }

        fn entries(&self) -> std::collections::BTreeMap<String, i64> {
            self.inner.entries()
        }
    }

    #[test]
    fn stop_during_tick_drops_the_firing() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let ledger = Arc::new(GatedLedger {
            inner: MemoryLedger::new(),
            entered: Mutex::new(Some(entered_tx)),
            release: Mutex::new(release_rx),
        });
        let alarm = Arc::new(RecordingAlarm::default());
        let notifier = Arc::new(MemoryNotifier::new(
            PermissionState::Granted,
            PermissionState::Granted,
        ));
        let deps = Collaborators {
            settings: Arc::new(MemorySettingsStore::new(Settings {
                loop_sound: true,
                ..Settings::default()
            })),
            ledger: ledger.clone(),
            alarm: alarm.clone(),
            notifier: notifier.clone(),
            clock: Arc::new(ManualClock::new(NOW)),
        };
        let sched = NotificationScheduler::new(deps, SchedulerPolicy::default());

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let worker = sched.clone();
        let tick = std::thread::spawn(move || {
            worker.check_once(vec![due_in("t1", 4 * MIN)], move |n| {
                sink.lock().unwrap().push(n.task.id.clone());
            })
        });

        entered_rx.recv().unwrap();
        sched.stop();
        release_tx.send(()).unwrap();

        assert_eq!(tick.join().unwrap(), 0);
        assert!(!sched.is_alarm_playing());
        assert_eq!(alarm.plays.load(Ordering::SeqCst), 0);
        assert!(received.lock().unwrap().is_empty());
        assert!(notifier.notices().is_empty());
        assert_eq!(ledger.last_dismissed("t1"), None);
    }

    #[test]
    fn tick_after_stop_still_fires_on_demand() {
        let fx = Fixture::new(Settings::default());
        fx.sched.stop();
        let sink = Arc::clone(&fx.received);
        let n = fx
            .sched
            .check_once(vec![due_in("t1", 4 * MIN)], move |n| sink.lock().unwrap().push(n));
        assert_eq!(n, 1);
        assert_eq!(fx.received().len(), 1);
    }

    #[test]
    fn denied_permission_skips_desktop_but_still_notifies() {
        let fx = Fixture::with_permission(Settings::default(), PermissionState::Denied);
        fx.start(vec![due_in("t1", 4 * MIN)]);
        assert!(fx.notifier.notices().is_empty());
        assert_eq!(fx.received().len(), 1);
        assert_eq!(fx.alarm.plays.load(Ordering::SeqCst), 1);
        assert!(fx.ledger.last_dismissed("t1").is_some());
    }

    #[test]
    fn desktop_notice_is_keyed_by_task_and_reactivates_payload() {
        let fx = Fixture::new(Settings::default());
        fx.start(vec![
            due_in("t1", 4 * MIN).with_description("bring snacks"),
        ]);
        let notices = fx.notifier.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].tag, "task-t1");
        assert_eq!(notices[0].title, "Task Reminder: Task t1");
        assert_eq!(notices[0].body, "Due in 4 minutes\nbring snacks");

        fx.clock.advance_ms(MIN);
        assert!(fx.notifier.activate("task-t1"));
        let got = fx.received();
        assert_eq!(got.len(), 2);
        assert_eq!(got[1].minutes_until, 3);
        assert_eq!(fx.notifier.focus_requests(), 1);
    }

    #[test]
    fn desktop_notice_respects_setting() {
        let fx = Fixture::new(Settings {
            desktop_notifications: false,
            ..Settings::default()
        });
        fx.start(vec![due_in("t1", 4 * MIN)]);
        assert!(fx.notifier.notices().is_empty());
        assert_eq!(fx.received().len(), 1);
    }

    #[test]
    fn status_reports_suppression() {
        let fx = Fixture::new(Settings::default());
        assert!(!fx.sched.get_task_notification_status("t1").dismissed);
        fx.start(vec![due_in("t1", 4 * MIN)]);
        fx.clock.advance_ms(3 * MIN);
        let st = fx.sched.get_task_notification_status("t1");
        assert!(st.dismissed);
        assert_eq!(st.minutes_ago, Some(3));

        fx.sched.clear_dismissed_notifications();
        assert!(!fx.sched.get_task_notification_status("t1").dismissed);
    }

    #[test]
    fn update_settings_returns_merged_value() {
        let fx = Fixture::new(Settings::default());
        let merged = fx.sched.update_settings(&SettingsPatch {
            notify_minutes_before: Some(15),
            ..SettingsPatch::default()
        });
        assert_eq!(merged.notify_minutes_before, 15);
        assert!(merged.sound_enabled);
        assert_eq!(fx.sched.get_settings(), merged);
    }

    #[test]
    fn visibility_is_ignored_while_stopped() {
        let fx = Fixture::new(Settings::default());
        fx.sched.update_tasks(vec![due_in("t1", 4 * MIN)]);
        fx.sched.set_page_visible(true);
        fx.sched.window_focused();
        assert!(fx.received().is_empty());
    }

    #[test]
    fn notification_time_text() {
        let fx = Fixture::new(Settings {
            notify_minutes_before: 0,
            ..Settings::default()
        });
        fx.start(vec![due_in("a", -MIN)]);
        let n = fx.received().remove(0);
        assert!(n.is_overdue);
        assert_eq!(n.time_text(), "Overdue by 1 min");
        assert!(n.firing_id.starts_with("fire-"));
    }

    #[tokio::test]
    async fn permission_prompt_happens_once() {
        let clock = Arc::new(ManualClock::new(NOW));
        let notifier = Arc::new(MemoryNotifier::new(
            PermissionState::Default,
            PermissionState::Granted,
        ));
        let deps = Collaborators {
            settings: Arc::new(MemorySettingsStore::default()),
            ledger: Arc::new(MemoryLedger::new()),
            alarm: Arc::new(RecordingAlarm::default()),
            notifier: notifier.clone(),
            clock,
        };
        let sched = NotificationScheduler::new(deps, SchedulerPolicy::default());
        assert!(sched.should_prompt_for_permission());
        assert_eq!(sched.permission_state(), PermissionState::Default);

        assert_eq!(sched.request_permission().await, PermissionState::Granted);
        assert_eq!(sched.request_permission().await, PermissionState::Granted);
        assert_eq!(notifier.prompts(), 1);
        assert!(!sched.should_prompt_for_permission());
        assert_eq!(sched.permission_state(), PermissionState::Granted);
    }

    #[tokio::test]
    async fn settled_permission_is_returned_without_prompt() {
        for settled in [PermissionState::Denied, PermissionState::Granted] {
            let notifier = Arc::new(MemoryNotifier::new(settled, PermissionState::Granted));
            let deps = Collaborators {
                settings: Arc::new(MemorySettingsStore::default()),
                ledger: Arc::new(MemoryLedger::new()),
                alarm: Arc::new(RecordingAlarm::default()),
                notifier: notifier.clone(),
                clock: Arc::new(ManualClock::new(NOW)),
            };
            let sched = NotificationScheduler::new(deps, SchedulerPolicy::default());
            assert!(!sched.should_prompt_for_permission());
            assert_eq!(sched.request_permission().await, settled);
            assert_eq!(notifier.prompts(), 0);
        }
    }

    #[tokio::test]
    async fn unsupported_platform_is_denied_without_prompt() {
        let deps = Collaborators {
            settings: Arc::new(MemorySettingsStore::default()),
            ledger: Arc::new(MemoryLedger::new()),
            alarm: Arc::new(RecordingAlarm::default()),
            notifier: Arc::new(NullNotifier),
            clock: Arc::new(ManualClock::new(NOW)),
        };
        let sched = NotificationScheduler::new(deps, SchedulerPolicy::default());
        assert!(!sched.should_prompt_for_permission());
        assert_eq!(sched.request_permission().await, PermissionState::Denied);
    }

    #[tokio::test(start_paused = true)]
    async fn test_alarm_stops_after_window() {
        let fx = Fixture::new(Settings {
            sound_enabled: false,
            ..Settings::default()
        });
        let sched = fx.sched.clone();
        let run = tokio::spawn(async move { sched.test_alarm().await });
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(fx.sched.is_alarm_playing());

        assert!(run.await.unwrap());
        assert!(!fx.sched.is_alarm_playing());
        assert_eq!(fx.alarm.plays.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_alarm_reports_failure() {
        let fx = Fixture::with_alarm(
            Settings::default(),
            RecordingAlarm {
                fail: true,
                ..RecordingAlarm::default()
            },
        );
        assert!(!fx.sched.test_alarm().await);
    }
}
