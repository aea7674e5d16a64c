use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use opsdeck_core::fsatomic::write_atomic;

use crate::error::ConsoleError;

const SUBSCRIBER_QUEUE: usize = 64;

impl crate::manager::DetachHook for WorkspaceStore {
    fn session_closed(&self, session_id: &str) {
        self.detach_session_id(session_id);
    }
}

/// On-screen keyboard toolbar placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ToolbarMode {
    #[default]
    Disabled,
    Floating,
    Top,
}

impl fmt::Display for ToolbarMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ToolbarMode::Disabled => "disabled",
            ToolbarMode::Floating => "floating",
            ToolbarMode::Top => "top",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tab {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub color_id: String,
    #[serde(default)]
    pub order: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceState {
    pub active_tab_id: String,
    pub version: u64,
    pub tabs: Vec<Tab>,
    #[serde(default)]
    pub keyboard_toolbar_mode: ToolbarMode,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
}

fn default_idle_timeout() -> u64 {
    1_800
}

impl Default for WorkspaceState {
    fn default() -> Self {
        Self {
            active_tab_id: String::new(),
            version: 0,
            tabs: Vec::new(),
            keyboard_toolbar_mode: ToolbarMode::default(),
            idle_timeout_seconds: default_idle_timeout(),
        }
    }
}

/// Published on every successful mutation; payloads carry the minimal
/// diff.
#[derive(Debug, Clone)]
pub enum WorkspaceEvent {
    FullUpdate(WorkspaceState),
    TabAdded(Tab),
    TabUpdated(Tab),
    TabRemoved { id: String },
    ActiveTabChanged { id: String },
    SessionAttached { tab_id: String, session_id: String },
    SessionDetached { tab_id: String },
    KeyboardToolbarModeChanged { mode: ToolbarMode },
}

impl WorkspaceEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkspaceEvent::FullUpdate(_) => "workspace-full-update",
            WorkspaceEvent::TabAdded(_) => "tab-added",
            WorkspaceEvent::TabUpdated(_) => "tab-updated",
            WorkspaceEvent::TabRemoved { .. } => "tab-removed",
            WorkspaceEvent::ActiveTabChanged { .. } => "active-tab-changed",
            WorkspaceEvent::SessionAttached { .. } => "session-attached",
            WorkspaceEvent::SessionDetached { .. } => "session-detached",
            WorkspaceEvent::KeyboardToolbarModeChanged { .. } => "keyboard-toolbar-mode-changed",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            WorkspaceEvent::FullUpdate(state) => {
                serde_json::to_value(state).unwrap_or_default()
            }
            WorkspaceEvent::TabAdded(tab) | WorkspaceEvent::TabUpdated(tab) => {
                serde_json::to_value(tab).unwrap_or_default()
            }
            WorkspaceEvent::TabRemoved { id } => json!({ "id": id }),
            WorkspaceEvent::ActiveTabChanged { id } => json!({ "activeTabId": id }),
            WorkspaceEvent::SessionAttached { tab_id, session_id } => {
                json!({ "tabId": tab_id, "sessionId": session_id })
            }
            WorkspaceEvent::SessionDetached { tab_id } => json!({ "tabId": tab_id }),
            WorkspaceEvent::KeyboardToolbarModeChanged { mode } => {
                json!({ "mode": mode.to_string() })
            }
        }
    }
}

/// Persistent workspace document plus a subscription fan-out. The
/// write lock covers only the in-memory mutation; the atomic file
/// replace happens after release, serialized by version so stale
/// snapshots never overwrite newer ones.
pub struct WorkspaceStore {
    path: PathBuf,
    state: StdRwLock<WorkspaceState>,
    last_persisted: StdMutex<u64>,
    subscribers: StdMutex<HashMap<u64, mpsc::Sender<WorkspaceEvent>>>,
    next_subscriber: AtomicU64,
    idle_timeout_seconds: Arc<AtomicU64>,
}

impl WorkspaceStore {
    /// Load the document or start from the default when absent. The
    /// `idle_timeout_seconds` handle is the session manager's; the
    /// persisted value wins over the configured default.
    pub fn load(
        path: PathBuf,
        idle_timeout_seconds: Arc<AtomicU64>,
    ) -> Result<Arc<Self>, ConsoleError> {
        let state = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<WorkspaceState>(&bytes).map_err(|err| {
                ConsoleError::internal(format!("workspace document corrupt: {err}"))
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let mut state = WorkspaceState::default();
                state.idle_timeout_seconds = idle_timeout_seconds.load(Ordering::SeqCst);
                state
            }
            Err(err) => return Err(ConsoleError::internal(format!("read workspace: {err}"))),
        };
        idle_timeout_seconds.store(state.idle_timeout_seconds.max(1), Ordering::SeqCst);
        let version = state.version;
        Ok(Arc::new(Self {
            path,
            state: StdRwLock::new(state),
            last_persisted: StdMutex::new(version),
            subscribers: StdMutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
            idle_timeout_seconds,
        }))
    }

    pub fn get_state(&self) -> WorkspaceState {
        self.state.read().expect("workspace lock").clone()
    }

    /// Replace the active tab and the full tab list. Orders are
    /// renumbered to the dense permutation regardless of what the
    /// caller sent.
    pub fn replace_state(
        &self,
        active_tab_id: String,
        mut tabs: Vec<Tab>,
    ) -> Result<WorkspaceState, ConsoleError> {
        let mut seen = std::collections::HashSet::new();
        for tab in &tabs {
            if tab.id.trim().is_empty() {
                return Err(ConsoleError::validation("tab id must not be empty"));
            }
            if !seen.insert(tab.id.clone()) {
                return Err(ConsoleError::validation(format!(
                    "duplicate tab id {}",
                    tab.id
                )));
            }
        }
        if !active_tab_id.is_empty() && !seen.contains(&active_tab_id) {
            return Err(ConsoleError::validation(format!(
                "active tab {active_tab_id} is not in the tab list"
            )));
        }
        for (index, tab) in tabs.iter_mut().enumerate() {
            tab.order = index;
        }
        self.mutate(|state| {
            state.active_tab_id = active_tab_id;
            state.tabs = tabs;
            Ok(((), None))
        })
        .map(|_| self.get_state())
    }

    pub fn add_tab(
        &self,
        id: String,
        label: String,
        color_id: String,
    ) -> Result<Tab, ConsoleError> {
        if id.trim().is_empty() {
            return Err(ConsoleError::validation("tab id must not be empty"));
        }
        self.mutate(move |state| {
            if state.tabs.iter().any(|tab| tab.id == id) {
                return Err(ConsoleError::conflict(format!("tab {id} already exists")));
            }
            let tab = Tab {
                id,
                label,
                color_id,
                order: state.tabs.len(),
                session_id: None,
            };
            state.tabs.push(tab.clone());
            Ok((tab.clone(), Some(WorkspaceEvent::TabAdded(tab))))
        })
    }

    pub fn update_tab(
        &self,
        id: &str,
        label: Option<String>,
        color_id: Option<String>,
    ) -> Result<Tab, ConsoleError> {
        self.mutate(move |state| {
            let tab = state
                .tabs
                .iter_mut()
                .find(|tab| tab.id == id)
                .ok_or_else(|| ConsoleError::not_found(format!("tab {id} not found")))?;
            if let Some(label) = label {
                tab.label = label;
            }
            if let Some(color_id) = color_id {
                tab.color_id = color_id;
            }
            let tab = tab.clone();
            Ok((tab.clone(), Some(WorkspaceEvent::TabUpdated(tab))))
        })
    }

    /// Remove a tab, renumber the remainder densely, and shift the
    /// active tab to the first remaining tab when the removed one was
    /// active.
    pub fn remove_tab(&self, id: &str) -> Result<WorkspaceState, ConsoleError> {
        self.mutate(move |state| {
            let position = state
                .tabs
                .iter()
                .position(|tab| tab.id == id)
                .ok_or_else(|| ConsoleError::not_found(format!("tab {id} not found")))?;
            state.tabs.remove(position);
            for (index, tab) in state.tabs.iter_mut().enumerate() {
                tab.order = index;
            }
            if state.active_tab_id == id {
                state.active_tab_id = state
                    .tabs
                    .first()
                    .map(|tab| tab.id.clone())
                    .unwrap_or_default();
            }
            Ok((
                (),
                Some(WorkspaceEvent::TabRemoved { id: id.to_string() }),
            ))
        })
        .map(|_| self.get_state())
    }

    /// Set the active tab; an empty id clears the selection.
    pub fn set_active_tab(&self, id: String) -> Result<(), ConsoleError> {
        self.mutate(move |state| {
            if !id.is_empty() && !state.tabs.iter().any(|tab| tab.id == id) {
                return Err(ConsoleError::not_found(format!("tab {id} not found")));
            }
            state.active_tab_id = id.clone();
            Ok(((), Some(WorkspaceEvent::ActiveTabChanged { id })))
        })
    }

    pub fn attach_session(&self, tab_id: &str, session_id: String) -> Result<(), ConsoleError> {
        self.mutate(move |state| {
            let tab = state
                .tabs
                .iter_mut()
                .find(|tab| tab.id == tab_id)
                .ok_or_else(|| ConsoleError::not_found(format!("tab {tab_id} not found")))?;
            tab.session_id = Some(session_id.clone());
            Ok((
                (),
                Some(WorkspaceEvent::SessionAttached {
                    tab_id: tab_id.to_string(),
                    session_id,
                }),
            ))
        })
    }

    /// Clear any tab binding that points at `session_id`. Called by
    /// the session manager when a session closes; a no-op when no tab
    /// is bound.
    pub fn detach_session_id(&self, session_id: &str) {
        let result = self.mutate(|state| {
            let Some(tab) = state
                .tabs
                .iter_mut()
                .find(|tab| tab.session_id.as_deref() == Some(session_id))
            else {
                return Err(ConsoleError::not_found("no tab bound to session"));
            };
            tab.session_id = None;
            let tab_id = tab.id.clone();
            Ok(((), Some(WorkspaceEvent::SessionDetached { tab_id })))
        });
        match result {
            Ok(()) => info!(event = "workspace_session_detached", session_id = %session_id),
            Err(ConsoleError::NotFound(_)) => {}
            Err(err) => warn!(event = "workspace_detach_error", error = %err),
        }
    }

    pub fn set_toolbar_mode(&self, mode: ToolbarMode) -> Result<(), ConsoleError> {
        self.mutate(move |state| {
            state.keyboard_toolbar_mode = mode;
            Ok((
                (),
                Some(WorkspaceEvent::KeyboardToolbarModeChanged { mode }),
            ))
        })
    }

    /// Update the idle timeout and propagate it to the session
    /// manager's sweeper.
    pub fn set_idle_timeout_seconds(&self, seconds: u64) -> Result<(), ConsoleError> {
        if seconds == 0 {
            return Err(ConsoleError::validation(
                "idle timeout must be at least one second",
            ));
        }
        self.mutate(move |state| {
            state.idle_timeout_seconds = seconds;
            Ok(((), None))
        })?;
        self.idle_timeout_seconds.store(seconds, Ordering::SeqCst);
        Ok(())
    }

    pub fn subscribe(&self) -> (u64, mpsc::Receiver<WorkspaceEvent>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .lock()
            .expect("subscriber lock")
            .insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().expect("subscriber lock").remove(&id);
    }

    /// Apply a mutation under the write lock, bump the version, then
    /// persist and publish outside the lock. `None` events publish a
    /// full-update.
    fn mutate<T>(
        &self,
        apply: impl FnOnce(&mut WorkspaceState) -> Result<(T, Option<WorkspaceEvent>), ConsoleError>,
    ) -> Result<T, ConsoleError> {
        let (value, event, snapshot) = {
            let mut state = self.state.write().expect("workspace lock");
            let before = state.clone();
            match apply(&mut state) {
                Ok((value, event)) => {
                    state.version += 1;
                    (value, event, state.clone())
                }
                Err(err) => {
                    *state = before;
                    return Err(err);
                }
            }
        };
        self.persist(&snapshot)?;
        let event = event.unwrap_or_else(|| WorkspaceEvent::FullUpdate(snapshot));
        self.publish(event);
        Ok(value)
    }

    fn persist(&self, snapshot: &WorkspaceState) -> Result<(), ConsoleError> {
        let mut last = self.last_persisted.lock().expect("persist lock");
        if snapshot.version <= *last {
            return Ok(());
        }
        let bytes = serde_json::to_vec_pretty(snapshot)
            .map_err(|err| ConsoleError::internal(format!("encode workspace: {err}")))?;
        write_atomic(&self.path, &bytes)
            .map_err(|err| ConsoleError::internal(format!("persist workspace: {err}")))?;
        *last = snapshot.version;
        Ok(())
    }

    /// Deliver to every subscriber without blocking; slow consumers
    /// lose events, dead ones are dropped from the set.
    fn publish(&self, event: WorkspaceEvent) {
        let mut subscribers = self.subscribers.lock().expect("subscriber lock");
        subscribers.retain(|id, tx| {
            if tx.is_closed() {
                return false;
            }
            if tx.try_send(event.clone()).is_err() {
                debug!(event = "workspace_subscriber_lagging", subscriber = id);
            }
            true
        });
    }
}
