//! Selection controller: one object per view/session that drives fetch → reconcile → confirm.
//!
//! Each [`SelectionController::mount`] refetches the list (nothing is cached between mounts),
//! runs a pass, and spawns the confirmation of any automatic choice. A mount overtaken by a
//! newer one is dropped without touching the registry.
//!
//! The first mount also starts the reconciler's watcher, so registry changes made between
//! mounts (a stale explicit choice, a `forget`) are reconciled against the last loaded list.

use crate::config::SelectionConfig;
use crate::fetcher::RemoteListFetcher;
use crate::persist::{MemorySelectionStore, SelectionStore, SledSelectionStore, StoreError};
use crate::profile::{DraftError, Profile, ProfileDraft, ProfileId};
use crate::reconciler::{
    ConfirmationResult, PassOutcome, ReconcileState, Reconciler, RemoteStatus, SelectionEvent,
};
use crate::registry::ActiveSelectionRegistry;
use crate::remote::{FetchError, HttpProfileSource, ProfileSource};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Draft(#[from] DraftError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("profile {0} is not in the selectable set")]
    NotSelectable(ProfileId),
}

/// What a mount produced.
#[derive(Debug)]
pub enum MountOutcome {
    Applied {
        outcome: PassOutcome,
        /// Spawned confirmation of an automatic choice.
        confirmation: Option<JoinHandle<ConfirmationResult>>,
    },
    /// A newer mount started first; this one changed nothing.
    Superseded,
}

impl MountOutcome {
    pub fn state(&self) -> Option<ReconcileState> {
        match self {
            MountOutcome::Applied { outcome, .. } => Some(outcome.state),
            MountOutcome::Superseded => None,
        }
    }

    pub fn active(&self) -> Option<&Profile> {
        match self {
            MountOutcome::Applied { outcome, .. } => outcome.active.as_ref(),
            MountOutcome::Superseded => None,
        }
    }

    /// Waits for the spawned confirmation, if any.
    pub async fn confirmed(self) -> Option<ConfirmationResult> {
        match self {
            MountOutcome::Applied {
                confirmation: Some(handle),
                ..
            } => handle.await.ok(),
            _ => None,
        }
    }
}

pub struct SelectionController {
    fetcher: RemoteListFetcher,
    reconciler: Arc<Reconciler>,
    selectable: Mutex<Vec<Profile>>,
}

impl SelectionController {
    pub fn new(fetcher: RemoteListFetcher, reconciler: Reconciler) -> Self {
        Self {
            fetcher,
            reconciler: Arc::new(reconciler),
            selectable: Mutex::new(Vec::new()),
        }
    }

    /// HTTP source and sled slot as configured. `ephemeral` swaps the slot for memory.
    pub fn from_config(
        config: &SelectionConfig,
        registry: ActiveSelectionRegistry,
        ephemeral: bool,
    ) -> Result<Self, ControllerError> {
        let source: Arc<dyn ProfileSource> =
            Arc::new(HttpProfileSource::new(&config.api_base_url, config.request_timeout()));
        let store: Arc<dyn SelectionStore> = if ephemeral {
            Arc::new(MemorySelectionStore::new())
        } else {
            Arc::new(SledSelectionStore::open(
                Some(&config.storage_path),
                &config.storage_slot,
            )?)
        };
        tracing::info!(
            api = %config.api_base_url,
            storage = if ephemeral { "memory" } else { config.storage_path.as_str() },
            "selection controller configured"
        );
        Ok(Self::new(
            RemoteListFetcher::new(source, config.retry_policy(), config.include_tokens),
            Reconciler::new(registry, store, config.filter(), config.confirm_schedule()),
        ))
    }

    pub fn registry(&self) -> &ActiveSelectionRegistry {
        self.reconciler.registry()
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn events(&self) -> broadcast::Receiver<SelectionEvent> {
        self.reconciler.subscribe_events()
    }

    pub fn current(&self) -> Option<Profile> {
        self.registry().get()
    }

    /// Selectable Set from the last applied list.
    pub fn selectable(&self) -> Vec<Profile> {
        self.selectable
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Fetch, reconcile, and spawn the confirmation. Must run inside a tokio runtime.
    pub async fn mount(&self) -> MountOutcome {
        self.reconciler.spawn_watcher();
        self.reconciler.apply(&RemoteStatus::Loading);
        let remote = match self.fetcher.fetch().await {
            Ok(list) => RemoteStatus::Loaded(list),
            Err(FetchError::Superseded) => return MountOutcome::Superseded,
            Err(e) => RemoteStatus::Failed(e.to_string()),
        };
        let mut outcome = self.reconciler.apply(&remote);
        if matches!(remote, RemoteStatus::Loaded(_)) {
            *self
                .selectable
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = outcome.selectable.clone();
        }
        if outcome.filtered_out > 0 {
            tracing::info!(
                filtered_out = outcome.filtered_out,
                selectable = outcome.selectable.len(),
                "placeholder profiles hidden"
            );
        }
        let confirmation = outcome.confirmation.take().map(|c| tokio::spawn(c.run()));
        MountOutcome::Applied {
            outcome,
            confirmation,
        }
    }

    /// Explicit consumer choice.
    pub fn select(&self, profile: Profile) {
        self.reconciler.select(profile);
    }

    /// Explicit choice by id, restricted to the last Selectable Set.
    pub fn select_id(&self, id: ProfileId) -> Result<Profile, ControllerError> {
        let profile = self
            .selectable()
            .into_iter()
            .find(|p| p.id == id)
            .ok_or(ControllerError::NotSelectable(id))?;
        self.select(profile.clone());
        Ok(profile)
    }

    /// Full record, tokens included. Does not change the selection.
    pub async fn profile_details(&self, id: ProfileId) -> Result<Profile, ControllerError> {
        Ok(self.fetcher.source().get_profile(id).await?)
    }

    /// Creates a profile, makes it active, then remounts so the list reflects it.
    ///
    /// A profile named with the placeholder label is selected here but displaced by the
    /// remount, like any selection that is not in the Selectable Set.
    pub async fn create_profile(
        &self,
        draft: ProfileDraft,
    ) -> Result<(Profile, MountOutcome), ControllerError> {
        let draft = draft.validated()?;
        let created = self.fetcher.source().create_profile(&draft).await?;
        tracing::info!(profile_id = created.id, name = %created.name, "profile created");
        // The new id is not in the last loaded list yet; hold follow-up passes until the remount.
        self.reconciler.apply(&RemoteStatus::Loading);
        self.select(created.clone());
        let outcome = self.mount().await;
        Ok((created, outcome))
    }

    /// Drops the selection; the persisted slot is cleared with it.
    ///
    /// Once a list has loaded, the watcher refills the selection from it by the usual rules
    /// (valid persisted value, else the default heuristic). Use [`Self::teardown`] to log out.
    pub fn forget(&self) -> Result<(), ControllerError> {
        tracing::info!("active selection cleared");
        self.registry().clear();
        // An empty registry fires no change, so the slot is cleared here as well.
        self.reconciler.store().clear()?;
        Ok(())
    }

    /// Makes the persisted selection durable. Call before exiting.
    pub async fn flush(&self) -> Result<(), ControllerError> {
        self.reconciler.store().flush().await?;
        Ok(())
    }

    /// Logout: clears the selection and detaches every registry listener.
    pub fn teardown(self) {
        self.reconciler.stop_watcher();
        self.registry().reset();
    }
}
