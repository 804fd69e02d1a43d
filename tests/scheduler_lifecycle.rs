use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

use duebell::alarm::{AlarmPlayer, NullAlarm};
use duebell::clock::ManualClock;
use duebell::ledger::{DismissalLedger, MemoryLedger};
use duebell::notify::NullNotifier;
use duebell::scheduler::{Cadence, Collaborators, NotificationScheduler, SchedulerPolicy};
use duebell::settings::{MemorySettingsStore, Settings, SettingsPatch, SettingsStore};
use duebell::task::Task;

const MIN: i64 = 60_000;
const NOW: i64 = 1_750_000_000_000;

/// Every tick loads settings exactly once, so loads count ticks.
#[derive(Default)]
struct CountingSettings {
    inner: MemorySettingsStore,
    loads: AtomicUsize,
}

impl SettingsStore for CountingSettings {
    fn load(&self) -> Settings {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load()
    }

    fn save(&self, settings: &Settings) -> anyhow::Result<()> {
        self.inner.save(settings)
    }
}

struct Rig {
    sched: NotificationScheduler,
    settings: Arc<CountingSettings>,
    clock: Arc<ManualClock>,
    fired: Arc<Mutex<Vec<String>>>,
}

impl Rig {
    fn new() -> Self {
        let settings = Arc::new(CountingSettings::default());
        let clock = Arc::new(ManualClock::new(NOW));
        let deps = Collaborators {
            settings: settings.clone(),
            ledger: Arc::new(MemoryLedger::new()),
            alarm: Arc::new(NullAlarm),
            notifier: Arc::new(NullNotifier),
            clock: clock.clone(),
        };
        Self {
            sched: NotificationScheduler::new(deps, SchedulerPolicy::default()),
            settings,
            clock,
            fired: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn start(&self, tasks: Vec<Task>) {
        let sink = Arc::clone(&self.fired);
        self.sched
            .start(tasks, move |n| sink.lock().unwrap().push(n.task.id.clone()));
    }

    fn ticks(&self) -> usize {
        self.settings.loads.load(Ordering::SeqCst)
    }

    fn fired(&self) -> Vec<String> {
        self.fired.lock().unwrap().clone()
    }
}

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn eager_tick_then_foreground_cadence() {
    let rig = Rig::new();
    rig.start(Vec::new());
    assert!(rig.sched.is_running());
    assert_eq!(rig.sched.cadence(), Cadence::Foreground);
    assert_eq!(rig.ticks(), 1);

    sleep_ms(9_500).await;
    assert_eq!(rig.ticks(), 1);
    sleep_ms(1_000).await;
    assert_eq!(rig.ticks(), 2);
    sleep_ms(10_000).await;
    assert_eq!(rig.ticks(), 3);
}

#[tokio::test(start_paused = true)]
async fn restart_keeps_a_single_timer() {
    let rig = Rig::new();
    rig.start(Vec::new());
    rig.start(Vec::new());
    assert_eq!(rig.ticks(), 2);

    sleep_ms(10_500).await;
    assert_eq!(rig.ticks(), 3);
    sleep_ms(10_000).await;
    assert_eq!(rig.ticks(), 4);
}

#[tokio::test(start_paused = true)]
async fn stop_halts_ticks() {
    let rig = Rig::new();
    rig.start(Vec::new());
    rig.sched.stop();
    assert!(!rig.sched.is_running());

    sleep_ms(60_000).await;
    assert_eq!(rig.ticks(), 1);

    rig.sched.stop();
    assert_eq!(rig.ticks(), 1);
}

#[tokio::test(start_paused = true)]
async fn visibility_switches_cadence_and_catches_up() {
    let rig = Rig::new();
    rig.start(Vec::new());

    rig.sched.set_page_visible(false);
    assert_eq!(rig.sched.cadence(), Cadence::Background);
    assert_eq!(rig.ticks(), 1);

    sleep_ms(20_000).await;
    assert_eq!(rig.ticks(), 1);
    sleep_ms(10_500).await;
    assert_eq!(rig.ticks(), 2);

    rig.sched.set_page_visible(true);
    assert_eq!(rig.sched.cadence(), Cadence::Foreground);
    assert_eq!(rig.ticks(), 3);

    sleep_ms(10_500).await;
    assert_eq!(rig.ticks(), 4);
}

#[tokio::test(start_paused = true)]
async fn focus_catches_up_only_while_visible() {
    let rig = Rig::new();
    rig.start(Vec::new());

    rig.sched.window_focused();
    assert_eq!(rig.ticks(), 2);

    rig.sched.set_page_visible(false);
    rig.sched.window_focused();
    assert_eq!(rig.ticks(), 2);
}

#[tokio::test(start_paused = true)]
async fn timer_tick_fires_matured_reminder() {
    let rig = Rig::new();
    let due = Task::new("rent", "Pay rent").with_due_ms(NOW + 6 * MIN);
    rig.start(vec![due]);
    assert!(rig.fired().is_empty());

    rig.clock.advance_ms(MIN);
    sleep_ms(10_500).await;
    assert_eq!(rig.fired(), vec!["rent"]);

    // Recorded by the firing; the next tick stays quiet.
    sleep_ms(10_000).await;
    assert_eq!(rig.fired().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn snapshot_updates_apply_on_next_tick() {
    let rig = Rig::new();
    rig.start(Vec::new());

    rig.sched
        .update_tasks(vec![Task::new("call", "Call mom").with_due_ms(NOW + 4 * MIN)]);
    assert!(rig.fired().is_empty());

    sleep_ms(10_500).await;
    assert_eq!(rig.fired(), vec!["call"]);
}

#[test]
fn start_without_runtime_runs_eager_tick_only() {
    let rig = Rig::new();
    rig.start(vec![Task::new("x", "X").with_due_ms(NOW + 2 * MIN)]);
    assert!(rig.sched.is_running());
    assert_eq!(rig.ticks(), 1);
    assert_eq!(rig.fired(), vec!["x"]);
    rig.sched.stop();
}

#[derive(Default)]
struct FlagAlarm {
    plays: AtomicUsize,
    playing: AtomicBool,
}

impl AlarmPlayer for FlagAlarm {
    fn play(&self, _resource: &str, _looped: bool) -> bool {
        self.plays.fetch_add(1, Ordering::SeqCst);
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

/// Holds the first lookup (a slow ledger file, say) until released.
struct SlowLedger {
    inner: MemoryLedger,
    entered: Mutex<Option<mpsc::Sender<()>>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl DismissalLedger for SlowLedger {
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

    fn entries(&self) -> BTreeMap<String, i64> {
        self.inner.entries()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_during_timer_tick_leaves_alarm_silent() {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let alarm = Arc::new(FlagAlarm::default());
    let deps = Collaborators {
        // Disabled at start so the eager tick never reaches the ledger.
        settings: Arc::new(MemorySettingsStore::new(Settings {
            enabled: false,
            loop_sound: true,
            ..Settings::default()
        })),
        ledger: Arc::new(SlowLedger {
            inner: MemoryLedger::new(),
            entered: Mutex::new(Some(entered_tx)),
            release: Mutex::new(release_rx),
        }),
        alarm: alarm.clone(),
        notifier: Arc::new(NullNotifier),
        clock: Arc::new(ManualClock::new(NOW)),
    };
    let policy = SchedulerPolicy {
        foreground_interval: Duration::from_millis(50),
        ..SchedulerPolicy::default()
    };
    let sched = NotificationScheduler::new(deps, policy);
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    sched.start(
        vec![Task::new("t1", "Standup").with_due_ms(NOW + 4 * MIN)],
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        },
    );
    sched.update_settings(&SettingsPatch {
        enabled: Some(true),
        ..SettingsPatch::default()
    });

    tokio::task::spawn_blocking(move || entered_rx.recv())
        .await
        .unwrap()
        .unwrap();
    sched.stop();
    assert!(!sched.is_alarm_playing());
    release_tx.send(()).unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!sched.is_alarm_playing());
    assert_eq!(alarm.plays.load(Ordering::SeqCst), 0);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}
