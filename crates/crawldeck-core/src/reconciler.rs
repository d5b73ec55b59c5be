//! Reconciler: resolves the remote list, the persisted slot and the in-memory registry
//! into one consistent active profile.
//!
//! ## Pass rules
//!
//! | Remote status | Outcome |
//! |---------------|---------|
//! | loading | `Loading`; nothing is written |
//! | failed | keep the in-memory selection, else adopt the persisted one unvalidated (`ErrorWithFallback`), else `ErrorNoSelection` |
//! | loaded, empty after filtering | `EmptySet`; registry and slot cleared |
//! | loaded, non-empty | keep a valid in-memory selection; else restore a valid persisted one; else default heuristic (`Resolved`) |
//!
//! A valid in-memory selection is never displaced by a list refresh. Every value is read
//! at apply time, so a late list cannot override a newer explicit choice that is still valid.
//!
//! Once [`Reconciler::spawn_watcher`] has run, every registry change schedules a follow-up
//! pass against the last loaded list. A selection that is cleared, or set to a profile outside
//! the Selectable Set, is replaced by the same rules; a valid one is left untouched.
//!
//! After an automatic write, [`Confirmation`] checks on a short bounded schedule that the
//! slot caught up. It yields as soon as the registry holds something else: a concurrent
//! consumer choice is authoritative.

use crate::filter::{DefaultReason, SelectionFilter};
use crate::persist::{PersistenceBinding, SelectionStore};
use crate::profile::{Profile, ProfileId};
use crate::registry::ActiveSelectionRegistry;
use crate::registry::Subscription;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

/// Default confirmation schedule: tens of milliseconds up to a few seconds.
pub const DEFAULT_CONFIRM_SCHEDULE_MS: [u64; 4] = [50, 250, 1000, 2500];

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Remote list status as seen by one pass.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteStatus {
    Loading,
    /// Retries exhausted; carries the message for optional display.
    Failed(String),
    /// Raw list, before placeholder filtering.
    Loaded(Vec<Profile>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconcileState {
    Loading,
    ErrorNoSelection,
    ErrorWithFallback,
    EmptySet,
    Resolved,
}

/// State transitions and decisions, published on a broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionEvent {
    StateChanged {
        from: ReconcileState,
        to: ReconcileState,
    },
    /// Stability rule: the current selection is still selectable.
    Kept { profile_id: ProfileId },
    /// The persisted selection was valid and restored.
    Restored { profile_id: ProfileId },
    AutoSelected {
        profile_id: ProfileId,
        reason: DefaultReason,
    },
    /// Persisted selection not in the Selectable Set; discarded.
    PersistedPurged { profile_id: ProfileId },
    /// Fetch failed; persisted selection adopted without list validation.
    FallbackAdopted { profile_id: ProfileId },
    /// Selectable Set empty; selection dropped.
    Cleared { previous: Option<ProfileId> },
    FetchFailed { message: String },
    ExplicitSelection { profile_id: ProfileId },
    Confirmed { profile_id: ProfileId, attempt: usize },
    /// Registry changed under a pending confirmation; the newer value wins.
    Yielded {
        expected: ProfileId,
        found: Option<ProfileId>,
    },
    /// Slot did not hold the candidate; written again.
    Rewritten { profile_id: ProfileId, attempt: usize },
    Unconfirmed { profile_id: ProfileId },
}

/// Result of one pass.
#[derive(Debug)]
pub struct PassOutcome {
    pub state: ReconcileState,
    pub active: Option<Profile>,
    /// Selectable Set of this pass (empty unless the list loaded).
    pub selectable: Vec<Profile>,
    /// Remote entries removed by the placeholder filter.
    pub filtered_out: usize,
    /// Fetch error message, for display only.
    pub error: Option<String>,
    /// Present when this pass wrote an automatic selection.
    pub confirmation: Option<Confirmation>,
}

pub struct Reconciler {
    registry: ActiveSelectionRegistry,
    store: Arc<dyn SelectionStore>,
    filter: SelectionFilter,
    confirm_schedule: Vec<Duration>,
    state: Mutex<ReconcileState>,
    pass_lock: Mutex<()>,
    /// Status of the last pass; follow-up passes only run over a loaded list.
    last_remote: Mutex<RemoteStatus>,
    events: broadcast::Sender<SelectionEvent>,
    watcher: Mutex<Option<Watcher>>,
    _binding: PersistenceBinding,
}

struct Watcher {
    _subscription: Subscription,
    task: JoinHandle<()>,
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        self.stop_watcher();
    }
}

impl Reconciler {
    /// Binds `store` to `registry`: from here on every registry write is persisted.
    pub fn new(
        registry: ActiveSelectionRegistry,
        store: Arc<dyn SelectionStore>,
        filter: SelectionFilter,
        confirm_schedule: Vec<Duration>,
    ) -> Self {
        let binding = PersistenceBinding::attach(&registry, Arc::clone(&store));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            registry,
            store,
            filter,
            confirm_schedule,
            state: Mutex::new(ReconcileState::Loading),
            pass_lock: Mutex::new(()),
            last_remote: Mutex::new(RemoteStatus::Loading),
            events,
            watcher: Mutex::new(None),
            _binding: binding,
        }
    }

    pub fn registry(&self) -> &ActiveSelectionRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn SelectionStore> {
        &self.store
    }

    pub fn filter(&self) -> &SelectionFilter {
        &self.filter
    }

    pub fn state(&self) -> ReconcileState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SelectionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SelectionEvent) {
        tracing::debug!(?event, "selection event");
        let _ = self.events.send(event);
    }

    fn transition(&self, to: ReconcileState) {
        let from = {
            let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::replace(&mut *state, to)
        };
        if from != to {
            tracing::info!(from = ?from, to = ?to, "selection state changed");
            self.emit(SelectionEvent::StateChanged { from, to });
        }
    }

    fn load_persisted(&self) -> Option<Profile> {
        match self.store.load() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "persisted selection unreadable; treating as absent");
                None
            }
        }
    }

    fn purge_persisted(&self, profile_id: ProfileId) {
        if let Err(e) = self.store.clear() {
            tracing::warn!(error = %e, profile_id, "failed to purge persisted selection");
        }
        tracing::info!(profile_id, "persisted selection is not selectable; purged");
        self.emit(SelectionEvent::PersistedPurged { profile_id });
    }

    /// Explicit consumer choice. Honored immediately and persisted; it outranks the
    /// default heuristic for as long as its id stays in the Selectable Set.
    pub fn select(&self, profile: Profile) {
        let profile_id = profile.id;
        tracing::info!(profile_id, name = %profile.name, "explicit profile selection");
        self.registry.set(profile);
        self.emit(SelectionEvent::ExplicitSelection { profile_id });
    }

    /// Reacts to registry changes: each one wakes a task that runs [`Reconciler::revalidate`]
    /// and spawns the resulting confirmation. Idempotent; needs a tokio runtime.
    ///
    /// The task holds a weak handle, and dropping the reconciler stops it.
    pub fn spawn_watcher(self: &Arc<Self>) {
        let mut watcher = self.watcher.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if watcher.is_some() {
            return;
        }
        let notify = Arc::new(Notify::new());
        let wake = Arc::clone(&notify);
        let subscription = self.registry.subscribe(move |_| wake.notify_one());
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            loop {
                notify.notified().await;
                let confirmation = match weak.upgrade() {
                    Some(reconciler) => reconciler.revalidate().and_then(|o| o.confirmation),
                    None => break,
                };
                if let Some(c) = confirmation {
                    tokio::spawn(c.run());
                }
            }
        });
        tracing::debug!("selection watcher started");
        *watcher = Some(Watcher {
            _subscription: subscription,
            task,
        });
    }

    /// Detaches the registry listener and stops the follow-up task.
    pub fn stop_watcher(&self) {
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(w) = watcher {
            w.task.abort();
            tracing::debug!("selection watcher stopped");
        }
    }

    /// Follow-up pass after a registry change. Re-applies the last loaded list when the
    /// current selection is missing or not selectable; returns `None` when nothing was
    /// due (no loaded list, or the selection is already consistent with it).
    pub fn revalidate(&self) -> Option<PassOutcome> {
        let _pass = self.pass_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let raw = match &*self.last_remote.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) {
            RemoteStatus::Loaded(raw) => raw.clone(),
            _ => return None,
        };
        let selectable = self.filter.apply(&raw);
        let current = self.registry.current_id();
        let consistent = match current {
            Some(id) => selectable.iter().any(|p| p.id == id),
            None => selectable.is_empty(),
        };
        if consistent {
            return None;
        }
        tracing::info!(profile_id = ?current, "active selection out of step with the profile list; reconciling");
        Some(self.apply_locked(&RemoteStatus::Loaded(raw)))
    }

    /// Runs one pass. Synchronous; the returned [`Confirmation`], if any, is awaited
    /// or spawned by the caller.
    pub fn apply(&self, remote: &RemoteStatus) -> PassOutcome {
        let _pass = self.pass_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *self.last_remote.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = remote.clone();
        self.apply_locked(remote)
    }

    fn apply_locked(&self, remote: &RemoteStatus) -> PassOutcome {
        match remote {
            RemoteStatus::Loading => {
                self.transition(ReconcileState::Loading);
                self.outcome(ReconcileState::Loading, Vec::new(), 0, None, None)
            }
            RemoteStatus::Failed(message) => self.apply_failed(message),
            RemoteStatus::Loaded(raw) => {
                let selectable = self.filter.apply(raw);
                let filtered_out = raw.len() - selectable.len();
                if selectable.is_empty() {
                    self.apply_empty(filtered_out)
                } else {
                    self.apply_selectable(selectable, filtered_out)
                }
            }
        }
    }

    fn apply_failed(&self, message: &str) -> PassOutcome {
        self.emit(SelectionEvent::FetchFailed {
            message: message.to_string(),
        });
        let state = if let Some(current) = self.registry.current_id() {
            self.emit(SelectionEvent::Kept { profile_id: current });
            ReconcileState::ErrorWithFallback
        } else if let Some(persisted) = self.load_persisted() {
            let profile_id = persisted.id;
            tracing::info!(profile_id, "profile list unavailable; adopting persisted selection");
            self.registry.set(persisted);
            self.emit(SelectionEvent::FallbackAdopted { profile_id });
            ReconcileState::ErrorWithFallback
        } else {
            tracing::warn!(error = %message, "profile list unavailable and nothing persisted");
            ReconcileState::ErrorNoSelection
        };
        self.transition(state);
        self.outcome(state, Vec::new(), 0, Some(message.to_string()), None)
    }

    fn apply_empty(&self, filtered_out: usize) -> PassOutcome {
        let previous = self.registry.current_id();
        let persisted = self.load_persisted();
        if let Some(p) = &persisted {
            self.purge_persisted(p.id);
        }
        self.registry.clear();
        if previous.is_some() || persisted.is_some() {
            self.emit(SelectionEvent::Cleared { previous });
        }
        tracing::info!(filtered_out, "no selectable profiles");
        self.transition(ReconcileState::EmptySet);
        self.outcome(ReconcileState::EmptySet, Vec::new(), filtered_out, None, None)
    }

    fn apply_selectable(&self, selectable: Vec<Profile>, filtered_out: usize) -> PassOutcome {
        let current = self.registry.get();
        if let Some(c) = &current {
            if selectable.iter().any(|p| p.id == c.id) {
                self.emit(SelectionEvent::Kept { profile_id: c.id });
                self.transition(ReconcileState::Resolved);
                return self.outcome(ReconcileState::Resolved, selectable, filtered_out, None, None);
            }
            tracing::info!(profile_id = c.id, "active selection is no longer selectable");
        }

        let mut candidate = None;
        if let Some(persisted) = self.load_persisted() {
            match selectable.iter().find(|p| p.id == persisted.id) {
                Some(fresh) => {
                    self.emit(SelectionEvent::Restored { profile_id: fresh.id });
                    candidate = Some(fresh.clone());
                }
                None => self.purge_persisted(persisted.id),
            }
        }
        let candidate = match candidate {
            Some(c) => c,
            None => match self.filter.choose_default(&selectable) {
                Some((p, reason)) => {
                    tracing::info!(profile_id = p.id, name = %p.name, ?reason, "auto-selecting profile");
                    self.emit(SelectionEvent::AutoSelected {
                        profile_id: p.id,
                        reason,
                    });
                    p.clone()
                }
                // Unreachable for a non-empty set.
                None => return self.apply_empty(filtered_out),
            },
        };

        let profile_id = candidate.id;
        self.registry.set(candidate);
        let confirmation = Confirmation {
            candidate: profile_id,
            registry: self.registry.clone(),
            store: Arc::clone(&self.store),
            schedule: self.confirm_schedule.clone(),
            events: self.events.clone(),
        };
        self.transition(ReconcileState::Resolved);
        self.outcome(
            ReconcileState::Resolved,
            selectable,
            filtered_out,
            None,
            Some(confirmation),
        )
    }

    fn outcome(
        &self,
        state: ReconcileState,
        selectable: Vec<Profile>,
        filtered_out: usize,
        error: Option<String>,
        confirmation: Option<Confirmation>,
    ) -> PassOutcome {
        PassOutcome {
            state,
            active: self.registry.get(),
            selectable,
            filtered_out,
            error,
            confirmation,
        }
    }
}

/// How a [`Confirmation`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationResult {
    /// Registry and slot both hold the candidate.
    Confirmed { attempt: usize },
    /// Another selection landed first and was left alone.
    Yielded { found: Option<ProfileId> },
    /// Schedule exhausted without the slot catching up.
    Unconfirmed,
}

/// Bounded check that an automatic selection reached the persisted slot.
pub struct Confirmation {
    candidate: ProfileId,
    registry: ActiveSelectionRegistry,
    store: Arc<dyn SelectionStore>,
    schedule: Vec<Duration>,
    events: broadcast::Sender<SelectionEvent>,
}

impl std::fmt::Debug for Confirmation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Confirmation")
            .field("candidate", &self.candidate)
            .field("schedule", &self.schedule)
            .finish()
    }
}

impl Confirmation {
    pub fn candidate(&self) -> ProfileId {
        self.candidate
    }

    pub async fn run(self) -> ConfirmationResult {
        let schedule = if self.schedule.is_empty() {
            vec![Duration::ZERO]
        } else {
            self.schedule.clone()
        };
        for (i, delay) in schedule.iter().enumerate() {
            let attempt = i + 1;
            if !delay.is_zero() {
                tokio::time::sleep(*delay).await;
            }

            let found = self.registry.current_id();
            if found != Some(self.candidate) {
                tracing::info!(
                    expected = self.candidate,
                    found = ?found,
                    "selection changed during confirmation; keeping the newer value"
                );
                let _ = self.events.send(SelectionEvent::Yielded {
                    expected: self.candidate,
                    found,
                });
                return ConfirmationResult::Yielded { found };
            }

            match self.store.load() {
                Ok(Some(p)) if p.id == self.candidate => match self.store.flush().await {
                    Ok(()) => {
                        tracing::debug!(profile_id = self.candidate, attempt, "selection confirmed");
                        let _ = self.events.send(SelectionEvent::Confirmed {
                            profile_id: self.candidate,
                            attempt,
                        });
                        return ConfirmationResult::Confirmed { attempt };
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, attempt, "persisted selection not flushed");
                        continue;
                    }
                },
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, attempt, "confirmation could not read persisted selection"),
            }

            if let Some(current) = self.registry.get().filter(|p| p.id == self.candidate) {
                if let Err(e) = self.store.save(&current) {
                    tracing::warn!(error = %e, attempt, "confirmation re-save failed");
                }
                let _ = self.events.send(SelectionEvent::Rewritten {
                    profile_id: self.candidate,
                    attempt,
                });
            }
        }
        tracing::warn!(
            profile_id = self.candidate,
            attempts = schedule.len(),
            "persisted selection never confirmed"
        );
        let _ = self.events.send(SelectionEvent::Unconfirmed {
            profile_id: self.candidate,
        });
        ConfirmationResult::Unconfirmed
    }
}
