//! Persisted Selection Store: last confirmed active profile, kept across restarts.
//!
//! One named slot holds a versioned JSON envelope:
//!
//! ```json
//! { "state": { "activeProfile": { "id": 2, "name": "Perfil Demo" } }, "version": 1 }
//! ```
//!
//! The slot is a best-effort cache, never a source of truth: anything malformed, partial
//! or written under another envelope version loads as absent, and callers still have to
//! check the id against the live Selectable Set.

use crate::profile::Profile;
use crate::registry::{ActiveSelectionRegistry, Subscription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Envelope version written by this build.
pub const ENVELOPE_VERSION: u32 = 1;

/// Default slot key.
pub const DEFAULT_SLOT: &str = "profile-storage";

const DEFAULT_PATH: &str = "./data/crawldeck_selection";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("selection store: {0}")]
    Sled(#[from] sled::Error),
    #[error("selection envelope encode: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    state: EnvelopeState,
    version: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct EnvelopeState {
    #[serde(rename = "activeProfile")]
    active_profile: Option<Profile>,
}

fn encode(profile: &Profile) -> Result<Vec<u8>, StoreError> {
    let envelope = Envelope {
        state: EnvelopeState {
            active_profile: Some(profile.without_tokens()),
        },
        version: ENVELOPE_VERSION,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

/// Unreadable or foreign envelopes decode to `None`.
fn decode(bytes: &[u8]) -> Option<Profile> {
    match serde_json::from_slice::<Envelope>(bytes) {
        Ok(envelope) if envelope.version == ENVELOPE_VERSION => envelope.state.active_profile,
        Ok(envelope) => {
            tracing::warn!(
                version = envelope.version,
                expected = ENVELOPE_VERSION,
                "persisted selection has unknown envelope version; ignoring"
            );
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "persisted selection is malformed; ignoring");
            None
        }
    }
}

/// Durable slot for the active selection.
///
/// `save` and `clear` run inside registry listeners, on whatever thread changed the
/// selection, so they must not block on disk. Durability is [`SelectionStore::flush`].
#[async_trait]
pub trait SelectionStore: Send + Sync {
    /// `Ok(None)` when nothing usable is stored.
    fn load(&self) -> Result<Option<Profile>, StoreError>;
    fn save(&self, profile: &Profile) -> Result<(), StoreError>;
    fn clear(&self) -> Result<(), StoreError>;

    /// Waits until earlier writes are on disk.
    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Sled-backed store. Writes land in sled's page cache; sled's background flusher or
/// an explicit [`SelectionStore::flush`] makes them durable.
pub struct SledSelectionStore {
    db: sled::Db,
    slot: String,
}

impl SledSelectionStore {
    /// Open the store at `path` (default `./data/crawldeck_selection`).
    pub fn open(path: Option<impl AsRef<Path>>, slot: &str) -> Result<Self, StoreError> {
        let p = path
            .map(|x| x.as_ref().to_path_buf())
            .unwrap_or_else(|| Path::new(DEFAULT_PATH).to_path_buf());
        let db = sled::open(p)?;
        Ok(Self {
            db,
            slot: slot.to_string(),
        })
    }

    /// Raw slot bytes, for diagnostics.
    pub fn raw(&self) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get(self.slot.as_bytes())?.map(|v| v.to_vec()))
    }

    /// Write raw bytes into the slot, bypassing the envelope.
    pub fn put_raw(&self, bytes: &[u8]) -> Result<(), StoreError> {
        self.db.insert(self.slot.as_bytes(), bytes)?;
        Ok(())
    }
}

#[async_trait]
impl SelectionStore for SledSelectionStore {
    fn load(&self) -> Result<Option<Profile>, StoreError> {
        Ok(self.raw()?.as_deref().and_then(decode))
    }

    fn save(&self, profile: &Profile) -> Result<(), StoreError> {
        let bytes = encode(profile)?;
        self.put_raw(&bytes)
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.db.remove(self.slot.as_bytes())?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }
}

/// Volatile store with the same envelope semantics. Used for `--ephemeral` runs and tests.
#[derive(Default)]
pub struct MemorySelectionStore {
    slot: Mutex<Option<Vec<u8>>>,
}

impl MemorySelectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with `profile`.
    pub fn with_profile(profile: &Profile) -> Result<Self, StoreError> {
        let store = Self::new();
        store.save(profile)?;
        Ok(store)
    }

    pub fn put_raw(&self, bytes: &[u8]) {
        *self.lock() = Some(bytes.to_vec());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Vec<u8>>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SelectionStore for MemorySelectionStore {
    fn load(&self) -> Result<Option<Profile>, StoreError> {
        Ok(self.lock().as_deref().and_then(decode))
    }

    fn save(&self, profile: &Profile) -> Result<(), StoreError> {
        let bytes = encode(profile)?;
        *self.lock() = Some(bytes);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.lock() = None;
        Ok(())
    }
}

/// Mirrors every registry change into a [`SelectionStore`].
///
/// Store failures are logged and swallowed; the registry stays authoritative and the
/// reconciler's confirmation step re-saves a lost write.
pub struct PersistenceBinding {
    _subscription: Subscription,
}

impl PersistenceBinding {
    pub fn attach(registry: &ActiveSelectionRegistry, store: Arc<dyn SelectionStore>) -> Self {
        let subscription = registry.subscribe(move |profile| {
            let result = match profile {
                Some(p) => store.save(p),
                None => store.clear(),
            };
            if let Err(e) = result {
                tracing::warn!(
                    error = %e,
                    profile_id = ?profile.map(|p| p.id),
                    "failed to persist active selection"
                );
            }
        });
        Self {
            _subscription: subscription,
        }
    }
}
