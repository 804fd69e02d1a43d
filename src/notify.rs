#![forbid(unsafe_code)]

//! Desktop (system-level) notifications.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PermissionState {
    Granted,
    Denied,
    #[default]
    Default,
}

impl PermissionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::Denied => "denied",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesktopNotice {
    pub title: String,
    pub body: String,
    /// Notices sharing a tag replace each other.
    pub tag: String,
}

/// Invoked when the user clicks a shown notice.
pub type ActivateHandler = Box<dyn FnOnce() + Send>;

#[async_trait]
pub trait PlatformNotifier: Send + Sync {
    fn is_supported(&self) -> bool;

    fn permission_state(&self) -> PermissionState;

    async fn request_permission(&self) -> PermissionState;

    fn show(&self, notice: DesktopNotice, on_activate: ActivateHandler) -> bool;

    fn focus_app(&self) {}
}

#[derive(Debug, Default)]
pub struct NullNotifier;

#[async_trait]
impl PlatformNotifier for NullNotifier {
    fn is_supported(&self) -> bool {
        false
    }

    fn permission_state(&self) -> PermissionState {
        PermissionState::Denied
    }

    async fn request_permission(&self) -> PermissionState {
        PermissionState::Denied
    }

    fn show(&self, _notice: DesktopNotice, _on_activate: ActivateHandler) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandBackend {
    NotifySend,
    Osascript,
}

/// Shells out to `notify-send` or `osascript`. Cannot observe clicks.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    app_name: String,
    backend: Option<(CommandBackend, String)>,
}

impl CommandNotifier {
    #[must_use]
    pub fn detect(app_name: &str) -> Self {
        let candidates: &[(CommandBackend, &str)] = if cfg!(target_os = "macos") {
            &[(CommandBackend::Osascript, "osascript")]
        } else {
            &[(CommandBackend::NotifySend, "notify-send")]
        };
        let backend = candidates.iter().find_map(|(kind, name)| {
            which::which(name)
                .ok()
                .map(|p| (*kind, p.to_string_lossy().into_owned()))
        });
        Self {
            app_name: app_name.to_owned(),
            backend,
        }
    }

    fn args(&self, kind: CommandBackend, notice: &DesktopNotice) -> Vec<String> {
        match kind {
            CommandBackend::NotifySend => vec![
                "-a".to_owned(),
                self.app_name.clone(),
                "-u".to_owned(),
                "critical".to_owned(),
                "-h".to_owned(),
                format!("string:x-canonical-private-synchronous:{}", notice.tag),
                notice.title.clone(),
                notice.body.clone(),
            ],
            CommandBackend::Osascript => vec![
                "-e".to_owned(),
                format!(
                    r#"display notification "{}" with title "{}""#,
                    escape_applescript(&notice.body),
                    escape_applescript(&notice.title)
                ),
            ],
        }
    }
}

fn escape_applescript(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[async_trait]
impl PlatformNotifier for CommandNotifier {
    fn is_supported(&self) -> bool {
        self.backend.is_some()
    }

    fn permission_state(&self) -> PermissionState {
        if self.backend.is_some() {
            PermissionState::Granted
        } else {
            PermissionState::Denied
        }
    }

    async fn request_permission(&self) -> PermissionState {
        self.permission_state()
    }

    fn show(&self, notice: DesktopNotice, _on_activate: ActivateHandler) -> bool {
        let Some((kind, program)) = self.backend.clone() else {
            return false;
        };
        let args = self.args(kind, &notice);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                match tokio::process::Command::new(&program)
                    .args(&args)
                    .stdin(std::process::Stdio::null())
                    .output()
                    .await
                {
                    Ok(out) if out.status.success() => {}
                    Ok(out) => warn!(
                        "{program} failed: {}",
                        String::from_utf8_lossy(&out.stderr).trim()
                    ),
                    Err(e) => warn!("failed to run {program}: {e}"),
                }
            });
            return true;
        }
        match std::process::Command::new(&program).args(&args).output() {
            Ok(out) => out.status.success(),
            Err(e) => {
                warn!("failed to run {program}: {e}");
                false
            }
        }
    }
}

/// In-process notifier: keeps the latest notice per tag and lets the host
/// simulate a click. Useful for embedding hosts that draw their own alerts.
pub struct MemoryNotifier {
    supported: bool,
    state: Mutex<MemoryNotifierState>,
}

struct MemoryNotifierState {
    permission: PermissionState,
    answer: PermissionState,
    prompts: usize,
    focus_requests: usize,
    shown: BTreeMap<String, (DesktopNotice, Option<ActivateHandler>)>,
}

impl MemoryNotifier {
    /// `answer` is what a prompt resolves to while the state is `Default`.
    #[must_use]
    pub fn new(permission: PermissionState, answer: PermissionState) -> Self {
        Self {
            supported: true,
            state: Mutex::new(MemoryNotifierState {
                permission,
                answer,
                prompts: 0,
                focus_requests: 0,
                shown: BTreeMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn unsupported() -> Self {
        let mut n = Self::new(PermissionState::Denied, PermissionState::Denied);
        n.supported = false;
        n
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryNotifierState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn notices(&self) -> Vec<DesktopNotice> {
        self.lock().shown.values().map(|(n, _)| n.clone()).collect()
    }

    #[must_use]
    pub fn prompts(&self) -> usize {
        self.lock().prompts
    }

    #[must_use]
    pub fn focus_requests(&self) -> usize {
        self.lock().focus_requests
    }

    /// Simulates a click on the notice with `tag`. Returns false when no
    /// such notice is showing.
    pub fn activate(&self, tag: &str) -> bool {
        let handler = {
            let mut st = self.lock();
            st.shown.remove(tag).and_then(|(_, h)| h)
        };
        match handler {
            Some(h) => {
                h();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl PlatformNotifier for MemoryNotifier {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn permission_state(&self) -> PermissionState {
        self.lock().permission
    }

    async fn request_permission(&self) -> PermissionState {
        let mut st = self.lock();
        if st.permission == PermissionState::Default {
            st.prompts += 1;
            st.permission = st.answer;
        }
        st.permission
    }

    fn show(&self, notice: DesktopNotice, on_activate: ActivateHandler) -> bool {
        if !self.supported {
            return false;
        }
        let mut st = self.lock();
        if st.permission != PermissionState::Granted {
            return false;
        }
        debug!(tag = %notice.tag, "desktop notice shown");
        st.shown
            .insert(notice.tag.clone(), (notice, Some(on_activate)));
        true
    }

    fn focus_app(&self) {
        self.lock().focus_requests += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn notice(tag: &str, body: &str) -> DesktopNotice {
        DesktopNotice {
            title: "Task Reminder: x".to_owned(),
            body: body.to_owned(),
            tag: tag.to_owned(),
        }
    }

    #[test]
    fn memory_notifier_replaces_by_tag() {
        let n = MemoryNotifier::new(PermissionState::Granted, PermissionState::Granted);
        assert!(n.show(notice("task-1", "first"), Box::new(|| {})));
        assert!(n.show(notice("task-1", "second"), Box::new(|| {})));
        assert!(n.show(notice("task-2", "other"), Box::new(|| {})));
        let shown = n.notices();
        assert_eq!(shown.len(), 2);
        assert_eq!(shown[0].body, "second");
    }

    #[test]
    fn activation_runs_handler_once() {
        let n = MemoryNotifier::new(PermissionState::Granted, PermissionState::Granted);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        n.show(
            notice("task-1", "b"),
            Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(n.activate("task-1"));
        assert!(!n.activate("task-1"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn show_requires_permission() {
        let n = MemoryNotifier::new(PermissionState::Default, PermissionState::Denied);
        assert!(!n.show(notice("task-1", "b"), Box::new(|| {})));
        assert!(!MemoryNotifier::unsupported().show(notice("t", "b"), Box::new(|| {})));
    }

    #[tokio::test]
    async fn prompt_resolves_once() {
        let n = MemoryNotifier::new(PermissionState::Default, PermissionState::Granted);
        assert_eq!(n.request_permission().await, PermissionState::Granted);
        assert_eq!(n.request_permission().await, PermissionState::Granted);
        assert_eq!(n.prompts(), 1);
    }

    #[test]
    fn applescript_quotes_are_escaped() {
        assert_eq!(escape_applescript(r#"say "hi""#), r#"say \"hi\""#);
    }

    #[tokio::test]
    async fn null_notifier_is_denied() {
        let n = NullNotifier;
        assert!(!n.is_supported());
        assert_eq!(n.request_permission().await, PermissionState::Denied);
    }
}
