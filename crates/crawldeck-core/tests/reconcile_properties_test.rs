//! Selection reconciliation: end-to-end properties through the public controller API.
//!
//! Run with: `cargo test -p crawldeck-core --test reconcile_properties_test`

use async_trait::async_trait;
use crawldeck_core::{
    ActiveSelectionRegistry, ConfirmationResult, FetchError, MemorySelectionStore, Profile,
    ProfileDraft, ProfileId, ProfileSource, ReconcileState, Reconciler, RemoteListFetcher,
    RetryPolicy, SelectionController, SelectionEvent, SelectionFilter, SelectionStore,
    SledSelectionStore,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Serves queued list responses; an `Err(status)` entry fails that request.
struct QueuedSource {
    lists: Mutex<VecDeque<Result<Vec<Profile>, u16>>>,
}

impl QueuedSource {
    fn new(lists: Vec<Result<Vec<Profile>, u16>>) -> Arc<Self> {
        Arc::new(Self {
            lists: Mutex::new(lists.into()),
        })
    }
}

#[async_trait]
impl ProfileSource for QueuedSource {
    async fn list_profiles(&self, _include_tokens: bool) -> Result<Vec<Profile>, FetchError> {
        let next = self.lists.lock().unwrap().pop_front().unwrap_or(Ok(Vec::new()));
        next.map_err(|status| FetchError::Status {
            status,
            detail: format!("Error {}", status),
        })
    }

    async fn get_profile(&self, id: ProfileId) -> Result<Profile, FetchError> {
        Err(FetchError::Status {
            status: 404,
            detail: format!("profile {} not found", id),
        })
    }

    async fn create_profile(&self, draft: &ProfileDraft) -> Result<Profile, FetchError> {
        Ok(Profile::new(50, draft.name.clone()))
    }
}

fn list(entries: &[(i64, &str)]) -> Vec<Profile> {
    entries.iter().map(|(id, name)| Profile::new(*id, *name)).collect()
}

fn controller(
    source: Arc<QueuedSource>,
    registry: ActiveSelectionRegistry,
    store: Arc<dyn SelectionStore>,
) -> SelectionController {
    SelectionController::new(
        RemoteListFetcher::new(source, RetryPolicy::default(), false),
        Reconciler::new(
            registry,
            store,
            SelectionFilter::default(),
            vec![
                Duration::from_millis(50),
                Duration::from_millis(250),
                Duration::from_millis(1000),
                Duration::from_millis(2500),
            ],
        ),
    )
}

#[tokio::test(start_paused = true)]
async fn test_valid_selection_survives_refresh() {
    let registry = ActiveSelectionRegistry::new();
    let store = Arc::new(MemorySelectionStore::new());
    let source = QueuedSource::new(vec![
        Ok(list(&[(1, "A"), (2, "B")])),
        Ok(list(&[(1, "A"), (2, "B"), (3, "Perfil Demo")])),
    ]);
    let c = controller(source, registry.clone(), store);

    c.mount().await;
    c.select(Profile::new(2, "B"));
    let revision = registry.revision();
    let mut events = c.events();
    let out = c.mount().await;

    assert_eq!(out.active().map(|p| p.id), Some(2));
    assert_eq!(registry.current_id(), Some(2));
    assert_eq!(registry.revision(), revision, "a kept selection is not written again");

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.contains(&SelectionEvent::Kept { profile_id: 2 }));
    assert!(!seen.iter().any(|e| matches!(
        e,
        SelectionEvent::AutoSelected { .. } | SelectionEvent::Restored { .. }
    )));
}

#[tokio::test(start_paused = true)]
async fn test_selection_outside_loaded_list_converges() {
    let registry = ActiveSelectionRegistry::new();
    let store = Arc::new(MemorySelectionStore::new());
    let source = QueuedSource::new(vec![Ok(list(&[(1, "Alpha"), (2, "Beta")]))]);
    let c = controller(source, registry.clone(), store.clone());

    c.mount().await;
    registry.set(Profile::new(99, "Ghost"));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(registry.current_id(), Some(1));
    assert_eq!(c.reconciler().state(), ReconcileState::Resolved);
    assert_eq!(store.load().expect("load").map(|p| p.id), Some(1));

    c.select(Profile::new(42, "Not listed"));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(registry.current_id(), Some(1));

    c.forget().expect("forget");
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(registry.current_id(), Some(1));
    assert_eq!(store.load().expect("load").map(|p| p.id), Some(1));
}

#[test]
fn test_filter_is_idempotent() {
    let filter = SelectionFilter::default();
    let raw = list(&[(1, "Nuevo Perfil"), (2, "Alpha"), (3, "nuevo perfil (copia)"), (4, "Beta")]);
    let once = filter.apply(&raw);
    assert_eq!(filter.apply(&once), once);
    assert_eq!(once.iter().map(|p| p.id).collect::<Vec<_>>(), vec![2, 4]);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_persisted_selection_is_purged() {
    let store = Arc::new(MemorySelectionStore::with_profile(&Profile::new(99, "Old")).expect("seed store"));
    let source = QueuedSource::new(vec![Ok(list(&[(1, "Alpha"), (2, "Beta")]))]);
    let c = controller(source, ActiveSelectionRegistry::new(), store.clone());

    let out = c.mount().await;

    assert_eq!(out.active().map(|p| p.id), Some(1));
    assert_ne!(store.load().expect("load").map(|p| p.id), Some(99));
}

#[tokio::test(start_paused = true)]
async fn test_demo_marker_wins_default_heuristic() {
    let store = Arc::new(MemorySelectionStore::new());
    let source = QueuedSource::new(vec![Ok(list(&[(1, "Alpha"), (2, "Perfil Demo"), (3, "Beta")]))]);
    let c = controller(source, ActiveSelectionRegistry::new(), store.clone());

    let out = c.mount().await;
    assert_eq!(out.active().map(|p| p.id), Some(2));
    assert_eq!(out.confirmed().await, Some(ConfirmationResult::Confirmed { attempt: 1 }));
    assert_eq!(store.load().expect("load").map(|p| p.id), Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_first_in_order_without_marker() {
    let source = QueuedSource::new(vec![Ok(list(&[(1, "Alpha"), (2, "Beta")]))]);
    let c = controller(source, ActiveSelectionRegistry::new(), Arc::new(MemorySelectionStore::new()));

    let out = c.mount().await;
    assert_eq!(out.active().map(|p| p.id), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_explicit_override_is_not_reverted() {
    let registry = ActiveSelectionRegistry::new();
    let store = Arc::new(MemorySelectionStore::new());
    let profiles = list(&[(1, "Alpha"), (2, "Perfil Demo"), (3, "Gamma")]);
    let source = QueuedSource::new(vec![Ok(profiles.clone()), Ok(profiles)]);
    let c = controller(source, registry.clone(), store.clone());

    let out = c.mount().await;
    assert_eq!(out.active().map(|p| p.id), Some(2));
    // User picks Gamma before the confirmation schedule has run.
    c.select(Profile::new(3, "Gamma"));
    assert_eq!(
        out.confirmed().await,
        Some(ConfirmationResult::Yielded { found: Some(3) })
    );

    let again = c.mount().await;
    assert_eq!(again.active().map(|p| p.id), Some(3));
    assert_eq!(store.load().expect("load").map(|p| p.id), Some(3));
}

#[tokio::test(start_paused = true)]
async fn test_empty_set_clears_selection_and_store() {
    let registry = ActiveSelectionRegistry::new();
    let store = Arc::new(MemorySelectionStore::new());
    let source = QueuedSource::new(vec![
        Ok(list(&[(1, "Alpha")])),
        Ok(list(&[(7, "Nuevo Perfil")])),
    ]);
    let c = controller(source, registry.clone(), store.clone());

    c.mount().await;
    assert_eq!(registry.current_id(), Some(1));

    let out = c.mount().await;
    assert_eq!(out.state(), Some(ReconcileState::EmptySet));
    assert!(registry.get().is_none());
    assert!(store.load().expect("load").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_fetch_error_adopts_persisted_selection() {
    let store = Arc::new(MemorySelectionStore::with_profile(&Profile::new(5, "X")).expect("seed store"));
    let source = QueuedSource::new(vec![Err(503), Err(503), Err(503)]);
    let c = controller(source, ActiveSelectionRegistry::new(), store);

    let started = tokio::time::Instant::now();
    let out = c.mount().await;

    assert_eq!(out.state(), Some(ReconcileState::ErrorWithFallback));
    assert_eq!(out.active().map(|p| p.id), Some(5));
    assert_eq!(started.elapsed(), Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_fetch_error_without_persisted_selection() {
    let source = QueuedSource::new(vec![Err(500), Err(500), Err(500)]);
    let c = controller(source, ActiveSelectionRegistry::new(), Arc::new(MemorySelectionStore::new()));

    let out = c.mount().await;
    assert_eq!(out.state(), Some(ReconcileState::ErrorNoSelection));
    assert!(out.active().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_selection_restored_after_restart() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let profiles = list(&[(1, "Alpha"), (2, "Beta"), (3, "Perfil Demo")]);
    {
        let store = Arc::new(SledSelectionStore::open(Some(dir.path()), "profile-storage").expect("open store"));
        let c = controller(QueuedSource::new(vec![Ok(profiles.clone())]), ActiveSelectionRegistry::new(), store);
        let out = c.mount().await;
        c.select_id(1).expect("select Alpha");
        out.confirmed().await;
        c.flush().await.expect("flush store");
    }
    let store = Arc::new(SledSelectionStore::open(Some(dir.path()), "profile-storage").expect("reopen store"));
    let c = controller(QueuedSource::new(vec![Ok(profiles)]), ActiveSelectionRegistry::new(), store);

    let out = c.mount().await;
    assert_eq!(out.active().map(|p| p.id), Some(1));
}
