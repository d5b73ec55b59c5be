//! crawldeck core: active-profile selection.
//! Remote profile list, placeholder filtering, persisted slot and the reconciler that keeps
//! every consumer agreeing on one active profile.

pub mod config;
pub mod controller;
pub mod fetcher;
pub mod filter;
pub mod persist;
pub mod profile;
pub mod reconciler;
pub mod registry;
pub mod remote;

pub use config::SelectionConfig;
pub use controller::{ControllerError, MountOutcome, SelectionController};
pub use fetcher::{RemoteListFetcher, RetryPolicy};
pub use filter::{DefaultReason, SelectionFilter};
pub use persist::{
    MemorySelectionStore, PersistenceBinding, SelectionStore, SledSelectionStore, StoreError,
};
pub use profile::{DraftError, Profile, ProfileDraft, ProfileId, ProfileTokens};
pub use reconciler::{
    Confirmation, ConfirmationResult, PassOutcome, ReconcileState, Reconciler, RemoteStatus,
    SelectionEvent,
};
pub use registry::{ActiveSelectionRegistry, Subscription};
pub use remote::{FetchError, HttpProfileSource, ProfileSource};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
