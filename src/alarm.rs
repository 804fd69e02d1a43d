#![forbid(unsafe_code)]

//! Audible alerts. At most one sound is active per player.

use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub trait AlarmPlayer: Send + Sync {
    /// Stops anything playing, then starts `resource`. Returns whether
    /// playback started; never panics on platform failure. The scheduler
    /// calls this with its session lock held, so it must not block on or
    /// call back into the scheduler.
    fn play(&self, resource: &str, looped: bool) -> bool;

    /// Idempotent.
    fn stop(&self);

    fn is_playing(&self) -> bool;

    fn set_volume(&self, volume: f32);

    fn volume(&self) -> f32;
}

#[must_use]
pub fn clamp_volume(v: f32) -> f32 {
    if v.is_nan() { 1.0 } else { v.clamp(0.0, 1.0) }
}

/// Player that never produces sound.
#[derive(Debug, Default)]
pub struct NullAlarm;

impl AlarmPlayer for NullAlarm {
    fn play(&self, resource: &str, _looped: bool) -> bool {
        debug!("audio unavailable; not playing {resource}");
        false
    }

    fn stop(&self) {}

    fn is_playing(&self) -> bool {
        false
    }

    fn set_volume(&self, _volume: f32) {}

    fn volume(&self) -> f32 {
        0.0
    }
}

/// External program invocation with `{path}`, `{volume}` (0..1) and
/// `{volume_pct}` (0..100) placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerCommand {
    pub program: String,
    pub args: Vec<String>,
}

const KNOWN_PLAYERS: &[(&str, &[&str])] = &[
    ("paplay", &["{path}"]),
    ("afplay", &["-v", "{volume}", "{path}"]),
    (
        "ffplay",
        &["-nodisp", "-autoexit", "-loglevel", "quiet", "-volume", "{volume_pct}", "{path}"],
    ),
    ("aplay", &["-q", "{path}"]),
];

impl PlayerCommand {
    /// First known player found in PATH.
    #[must_use]
    pub fn detect() -> Option<Self> {
        KNOWN_PLAYERS.iter().find_map(|(name, args)| {
            which::which(name).ok().map(|p| Self {
                program: p.to_string_lossy().into_owned(),
                args: args.iter().map(|a| (*a).to_owned()).collect(),
            })
        })
    }

    /// Uses `program` when set, else detects. A configured program with no
    /// args reuses the known template for that player name if there is one.
    #[must_use]
    pub fn resolve(program: &str, args: &[String]) -> Option<Self> {
        let program = program.trim();
        if program.is_empty() {
            return Self::detect();
        }
        let args = if args.is_empty() {
            let base = Path::new(program)
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or(program);
            KNOWN_PLAYERS
                .iter()
                .find(|(name, _)| *name == base)
                .map_or_else(
                    || vec!["{path}".to_owned()],
                    |(_, a)| a.iter().map(|s| (*s).to_owned()).collect(),
                )
        } else {
            args.to_vec()
        };
        Some(Self {
            program: program.to_owned(),
            args,
        })
    }

    #[must_use]
    pub fn render_args(&self, path: &str, volume: f32) -> Vec<String> {
        let vol = format!("{volume:.2}");
        let pct = format!("{:.0}", volume * 100.0);
        self.args
            .iter()
            .map(|a| {
                a.replace("{path}", path)
                    .replace("{volume_pct}", &pct)
                    .replace("{volume}", &vol)
            })
            .collect()
    }
}

#[derive(Debug)]
struct Playback {
    generation: u64,
    playing: bool,
    looped: bool,
    volume: f32,
    task: Option<JoinHandle<()>>,
}

/// Plays sounds by spawning an external player on the tokio runtime.
#[derive(Debug, Clone)]
pub struct CommandAlarm {
    player: Option<PlayerCommand>,
    state: Arc<Mutex<Playback>>,
}

impl CommandAlarm {
    #[must_use]
    pub fn new(player: Option<PlayerCommand>, volume: f32) -> Self {
        Self {
            player,
            state: Arc::new(Mutex::new(Playback {
                generation: 0,
                playing: false,
                looped: false,
                volume: clamp_volume(volume),
                task: None,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Playback> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn build(&self, player: &PlayerCommand, resource: &str, volume: f32) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&player.program);
        cmd.args(player.render_args(resource, volume));
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::null());
        cmd.stderr(std::process::Stdio::null());
        cmd.kill_on_drop(true);
        cmd
    }
}

impl AlarmPlayer for CommandAlarm {
    fn play(&self, resource: &str, looped: bool) -> bool {
        self.stop();

        let Some(player) = self.player.clone() else {
            warn!("no audio player available; cannot play {resource}");
            return false;
        };
        if !Path::new(resource).is_file() {
            warn!("alarm sound not found: {resource}");
            return false;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no async runtime; cannot play {resource}");
            return false;
        };

        let mut state = self.lock();
        let volume = state.volume;
        let mut cmd = self.build(&player, resource, volume);
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                warn!("failed to start {}: {e}", player.program);
                return false;
            }
        };

        state.generation += 1;
        let generation = state.generation;
        state.playing = true;
        state.looped = looped;

        let shared = Arc::clone(&self.state);
        let this = self.clone();
        let resource = resource.to_owned();
        state.task = Some(handle.spawn(async move {
            loop {
                match child.wait().await {
                    Ok(status) if status.success() && looped => {}
                    Ok(status) if status.success() => break,
                    Ok(status) => {
                        warn!("audio player exited with {status}");
                        break;
                    }
                    Err(e) => {
                        warn!("audio player wait failed: {e}");
                        break;
                    }
                }
                let mut next = this.build(&player, &resource, volume);
                match next.spawn() {
                    Ok(c) => child = c,
                    Err(e) => {
                        warn!("failed to restart {}: {e}", player.program);
                        break;
                    }
                }
            }
            let mut st = shared
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if st.generation == generation {
                st.playing = false;
                st.looped = false;
                st.task = None;
            }
        }));
        info!(looped, "alarm started");
        true
    }

    fn stop(&self) {
        let mut state = self.lock();
        state.generation += 1;
        if let Some(task) = state.task.take() {
            task.abort();
            debug!("alarm stopped");
        }
        state.playing = false;
        state.looped = false;
    }

    fn is_playing(&self) -> bool {
        self.lock().playing
    }

    fn set_volume(&self, volume: f32) {
        self.lock().volume = clamp_volume(volume);
    }

    fn volume(&self) -> f32 {
        self.lock().volume
    }
}
