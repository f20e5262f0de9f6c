//! Sync coordination: per-user single-flight background jobs.
//!
//! Each user owns a slot in a concurrent map. `start` claims the slot,
//! spawns the fetch → extract → merge pipeline as a supervised tokio task,
//! and returns immediately; clients observe progress by polling. Status
//! records live behind a non-poisoning mutex so readers always see a
//! complete snapshot, and a panicking pipeline lands as `Failed` rather
//! than dying silently.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::claude::CompletionClient;
use crate::db::{IntelDb, SyncOutcome};
use crate::extractor::InsightExtractor;
use crate::google_api::gmail::{FetchError, MailProvider, MessageRecord};
use crate::google_api::{AuthError, Credential, TokenProvider};

// ============================================================================
// Status types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Running,
    Completed,
    Failed,
}

/// What one completed run produced.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub emails_processed: usize,
    pub relationships: usize,
    pub projects: usize,
    pub action_items: usize,
    pub facts: usize,
    /// Subjects of unread messages the urgency heuristic flagged.
    pub urgent_subjects: Vec<String>,
}

/// Per-user sync status. Cloned out whole for every reader.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub user_email: String,
    pub state: SyncState,
    pub progress: u8,
    pub phase: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_sync: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<SyncSummary>,
}

impl SyncStatus {
    fn idle(user_email: &str) -> Self {
        Self {
            user_email: user_email.to_string(),
            state: SyncState::Idle,
            progress: 0,
            phase: "idle".to_string(),
            started_at: None,
            completed_at: None,
            last_sync: None,
            error: None,
            result: None,
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.state == SyncState::Running
    }
}

struct SyncSlot {
    status: Mutex<SyncStatus>,
    cancel: AtomicBool,
}

impl SyncSlot {
    fn new(user_email: &str) -> Self {
        Self {
            status: Mutex::new(SyncStatus::idle(user_email)),
            cancel: AtomicBool::new(false),
        }
    }

    /// Raise progress, never lowering it within a run.
    fn advance(&self, phase: &str, progress: u8) {
        let mut status = self.status.lock();
        status.phase = phase.to_string();
        status.progress = status.progress.max(progress.min(100));
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// This user's slot is occupied; the running sync is untouched.
    #[error("sync already in progress")]
    AlreadyRunning,
    /// The stored credential is expired with no refresh token; nothing was
    /// started and no fetch was attempted.
    #[error("credential invalid, re-authentication required")]
    CredentialInvalid,
}

/// Pipeline-internal failure, recorded into the slot and never raised to HTTP.
#[derive(Debug, thiserror::Error)]
enum SyncFailure {
    #[error("{0}")]
    Auth(#[from] AuthError),
    #[error("{0}")]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Store(#[from] crate::db::StoreError),
    #[error("sync cancelled")]
    Cancelled,
}

// ============================================================================
// Credential persistence seam
// ============================================================================

/// Where refreshed credentials get saved. The token provider itself never
/// persists; the coordinator owns that responsibility.
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<Credential, AuthError>;
    fn save(&self, credential: &Credential) -> Result<(), AuthError>;
}

/// token.json-backed store.
pub struct FileCredentialStore;

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Credential, AuthError> {
        crate::google_api::token_store::load_token()
    }

    fn save(&self, credential: &Credential) -> Result<(), AuthError> {
        crate::google_api::token_store::save_token(credential)
    }
}

// ============================================================================
// Coordinator
// ============================================================================

pub struct SyncCoordinator {
    slots: DashMap<String, Arc<SyncSlot>>,
    tokens: Arc<dyn TokenProvider>,
    mail: Arc<dyn MailProvider>,
    model: Arc<dyn CompletionClient>,
    credentials: Arc<dyn CredentialStore>,
    db_path: PathBuf,
    max_results: u32,
}

impl SyncCoordinator {
    pub fn new(
        tokens: Arc<dyn TokenProvider>,
        mail: Arc<dyn MailProvider>,
        model: Arc<dyn CompletionClient>,
        credentials: Arc<dyn CredentialStore>,
        db_path: PathBuf,
        max_results: u32,
    ) -> Self {
        Self {
            slots: DashMap::new(),
            tokens,
            mail,
            model,
            credentials,
            db_path,
            max_results,
        }
    }

    /// Claim the user's slot and launch the pipeline in the background.
    ///
    /// Returns as soon as the slot transitions to `Running`; terminal states
    /// from a previous run are immediately reclaimable.
    pub fn start(
        self: &Arc<Self>,
        user_email: &str,
        credential: Credential,
        window_days: u32,
    ) -> Result<(), SyncError> {
        // An expired credential with no refresh token can never fetch;
        // reject before claiming the slot so no run is recorded.
        if credential.is_expired() && credential.refresh_token.is_none() {
            return Err(SyncError::CredentialInvalid);
        }

        let slot = self
            .slots
            .entry(user_email.to_string())
            .or_insert_with(|| Arc::new(SyncSlot::new(user_email)))
            .clone();

        {
            let mut status = slot.status.lock();
            if status.state == SyncState::Running {
                return Err(SyncError::AlreadyRunning);
            }
            status.state = SyncState::Running;
            status.progress = 0;
            status.phase = "starting".to_string();
            status.started_at = Some(Utc::now());
            status.completed_at = None;
            status.error = None;
            status.result = None;
        }
        slot.cancel.store(false, Ordering::Relaxed);

        log::info!(
            "Starting sync for {} (window {} days)",
            user_email,
            window_days
        );

        let coordinator = Arc::clone(self);
        let task_slot = Arc::clone(&slot);
        let user = user_email.to_string();
        tokio::spawn(async move {
            let pipeline_slot = Arc::clone(&task_slot);
            let pipeline_coordinator = Arc::clone(&coordinator);
            let pipeline_user = user.clone();

            // Inner spawn so a panic surfaces as a JoinError instead of
            // killing the supervisor.
            let handle = tokio::spawn(async move {
                pipeline_coordinator
                    .run_pipeline(&pipeline_slot, &pipeline_user, credential, window_days)
                    .await
            });

            let outcome = match handle.await {
                Ok(Ok(summary)) => Ok(summary),
                Ok(Err(failure)) => Err(failure.to_string()),
                Err(join_error) => Err(format!("sync task panicked: {}", join_error)),
            };

            coordinator.finalize(&task_slot, &user, outcome);
        });

        Ok(())
    }

    /// Snapshot of the user's sync status.
    pub fn status(&self, user_email: &str) -> SyncStatus {
        match self.slots.get(user_email) {
            Some(slot) => slot.status.lock().clone(),
            None => SyncStatus::idle(user_email),
        }
    }

    /// Ask a running sync to stop between extraction batches.
    ///
    /// Returns false when nothing was running.
    pub fn cancel(&self, user_email: &str) -> bool {
        match self.slots.get(user_email) {
            Some(slot) if slot.status.lock().state == SyncState::Running => {
                slot.cancel.store(true, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    /// Forget a user's slot (database reset).
    pub fn clear(&self, user_email: &str) {
        self.slots.remove(user_email);
    }

    /// Fetch → extract → merge, updating the slot as phases complete.
    async fn run_pipeline(
        &self,
        slot: &Arc<SyncSlot>,
        user_email: &str,
        credential: Credential,
        window_days: u32,
    ) -> Result<SyncSummary, SyncFailure> {
        slot.advance("authorizing", 5);
        let valid = self.tokens.ensure_valid(credential).await?;
        if let Err(e) = self.credentials.save(&valid) {
            log::warn!("Failed to persist refreshed credential: {}", e);
        }

        if slot.cancelled() {
            return Err(SyncFailure::Cancelled);
        }

        slot.advance("fetching", 10);
        let messages = self
            .mail
            .fetch_recent(&valid, window_days, self.max_results)
            .await?;
        log::info!("Fetched {} messages for {}", messages.len(), user_email);

        slot.advance("analyzing", 20);
        let extractor = InsightExtractor::new(Arc::clone(&self.model));
        let progress_slot = Arc::clone(slot);
        let batch = extractor
            .extract(user_email, &messages, move |done, total| {
                let pct = 20 + ((70 * done) / total.max(1)) as u8;
                progress_slot.advance("analyzing", pct);
                !progress_slot.cancelled()
            })
            .await;

        if slot.cancelled() {
            return Err(SyncFailure::Cancelled);
        }

        slot.advance("storing", 92);
        let mut db = IntelDb::open_at(self.db_path.clone())?;
        db.merge(user_email, &batch)?;
        let timestamps: Vec<DateTime<Utc>> = messages.iter().map(|m| m.timestamp).collect();
        db.record_activity(user_email, &timestamps)?;

        Ok(build_summary(&messages, &batch))
    }

    /// Write the terminal state into the slot and the sync log.
    fn finalize(&self, slot: &Arc<SyncSlot>, user_email: &str, outcome: Result<SyncSummary, String>) {
        let now = Utc::now();
        let (status_label, progress, processed, error) = {
            let mut status = slot.status.lock();
            status.completed_at = Some(now);
            match outcome {
                Ok(summary) => {
                    status.state = SyncState::Completed;
                    status.progress = 100;
                    status.phase = "complete".to_string();
                    status.last_sync = Some(now);
                    status.error = None;
                    let processed = summary.emails_processed;
                    status.result = Some(summary);
                    log::info!("Sync completed for {}", user_email);
                    ("completed", 100u8, processed, None)
                }
                Err(message) => {
                    status.state = SyncState::Failed;
                    status.phase = "failed".to_string();
                    status.error = Some(message.clone());
                    log::warn!("Sync failed for {}: {}", user_email, message);
                    ("failed", status.progress, 0, Some(message))
                }
            }
        };

        let started_at = slot
            .status
            .lock()
            .started_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| now.to_rfc3339());

        match IntelDb::open_at(self.db_path.clone()) {
            Ok(mut db) => {
                let result = db.record_sync_outcome(
                    user_email,
                    &SyncOutcome {
                        status: status_label.to_string(),
                        progress: progress as i64,
                        emails_processed: processed as i64,
                        error_message: error,
                        started_at,
                        completed_at: now.to_rfc3339(),
                    },
                );
                if let Err(e) = result {
                    log::warn!("Failed to record sync outcome for {}: {}", user_email, e);
                }
            }
            Err(e) => log::warn!("Failed to open DB for sync log: {}", e),
        }
    }
}

fn build_summary(
    messages: &[MessageRecord],
    batch: &crate::extractor::ExtractedInsightBatch,
) -> SyncSummary {
    SyncSummary {
        emails_processed: messages.len(),
        relationships: batch.relationships.len(),
        projects: batch.projects.len(),
        action_items: batch.action_items.len(),
        facts: batch.facts.len(),
        urgent_subjects: messages
            .iter()
            .filter(|m| m.urgent)
            .map(|m| m.subject.clone())
            .collect(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claude::LlmError;
    use crate::google_api::gmail::Mailbox;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    const USER: &str = "me@example.com";

    fn credential(expired: bool, refresh: Option<&str>) -> Credential {
        let expiry = if expired {
            Utc::now() - chrono::Duration::hours(1)
        } else {
            Utc::now() + chrono::Duration::hours(1)
        };
        Credential {
            token: "ya29.token".to_string(),
            refresh_token: refresh.map(|s| s.to_string()),
            token_uri: "https://oauth2.googleapis.com/token".to_string(),
            client_id: "client".to_string(),
            client_secret: None,
            expiry: Some(expiry.to_rfc3339()),
            account: Some(USER.to_string()),
        }
    }

    fn message(id: &str, from_name: &str, from_addr: &str, subject: &str, body: &str) -> MessageRecord {
        MessageRecord {
            id: id.to_string(),
            sender: Mailbox {
                name: from_name.to_string(),
                address: from_addr.to_string(),
            },
            recipients: vec![Mailbox {
                name: String::new(),
                address: USER.to_string(),
            }],
            subject: subject.to_string(),
            excerpt: body.to_string(),
            timestamp: Utc::now(),
            urgent: false,
        }
    }

    struct FakeTokens {
        refreshes: AtomicUsize,
    }

    impl FakeTokens {
        fn new() -> Self {
            Self {
                refreshes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TokenProvider for FakeTokens {
        async fn ensure_valid(&self, stored: Credential) -> Result<Credential, AuthError> {
            if !stored.is_expired() {
                return Ok(stored);
            }
            if stored.refresh_token.is_none() {
                return Err(AuthError::CredentialInvalid);
            }
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            let mut refreshed = stored;
            refreshed.token = "ya29.refreshed".to_string();
            refreshed.expiry = Some((Utc::now() + chrono::Duration::hours(1)).to_rfc3339());
            Ok(refreshed)
        }
    }

    struct FakeMail {
        messages: Vec<MessageRecord>,
        fetches: AtomicUsize,
        gate: Option<Arc<Notify>>,
        fail: Option<FetchError>,
    }

    impl FakeMail {
        fn with_messages(messages: Vec<MessageRecord>) -> Self {
            Self {
                messages,
                fetches: AtomicUsize::new(0),
                gate: None,
                fail: None,
            }
        }

        fn gated(messages: Vec<MessageRecord>, gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::with_messages(messages)
            }
        }
    }

    #[async_trait]
    impl MailProvider for FakeMail {
        async fn fetch_recent(
            &self,
            _credential: &Credential,
            _window_days: u32,
            max_results: u32,
        ) -> Result<Vec<MessageRecord>, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if let Some(fail) = &self.fail {
                return Err(match fail {
                    FetchError::Auth => FetchError::Auth,
                    FetchError::Transient(m) => FetchError::Transient(m.clone()),
                    FetchError::Permanent(m) => FetchError::Permanent(m.clone()),
                });
            }
            Ok(self
                .messages
                .iter()
                .take(max_results as usize)
                .cloned()
                .collect())
        }
    }

    struct FakeModel {
        response: String,
    }

    #[async_trait]
    impl CompletionClient for FakeModel {
        async fn complete(&self, _system: &str, _prompt: &str) -> Result<String, LlmError> {
            Ok(self.response.clone())
        }
    }

    struct MemoryCredentials {
        saved: Mutex<Vec<Credential>>,
    }

    impl CredentialStore for MemoryCredentials {
        fn load(&self) -> Result<Credential, AuthError> {
            Err(AuthError::CredentialInvalid)
        }
        fn save(&self, credential: &Credential) -> Result<(), AuthError> {
            self.saved.lock().push(credential.clone());
            Ok(())
        }
    }

    struct Harness {
        coordinator: Arc<SyncCoordinator>,
        tokens: Arc<FakeTokens>,
        mail: Arc<FakeMail>,
        credentials: Arc<MemoryCredentials>,
        db_path: PathBuf,
    }

    fn harness(mail: FakeMail, response: &str) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("sync_test.db");
        std::mem::forget(dir);

        let tokens = Arc::new(FakeTokens::new());
        let mail = Arc::new(mail);
        let credentials = Arc::new(MemoryCredentials {
            saved: Mutex::new(Vec::new()),
        });
        let coordinator = Arc::new(SyncCoordinator::new(
            tokens.clone(),
            mail.clone(),
            Arc::new(FakeModel {
                response: response.to_string(),
            }),
            credentials.clone(),
            db_path.clone(),
            50,
        ));
        Harness {
            coordinator,
            tokens,
            mail,
            credentials,
            db_path,
        }
    }

    async fn wait_terminal(coordinator: &Arc<SyncCoordinator>, user: &str) -> SyncStatus {
        for _ in 0..200 {
            let status = coordinator.status(user);
            if matches!(status.state, SyncState::Completed | SyncState::Failed) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sync never reached a terminal state");
    }

    const SCENARIO_RESPONSE: &str = r#"{
        "relationships": [{"name": "Alice", "address": "alice@x.com", "context": "mentioned directly"}],
        "projects": [{"name": "Launch Plan", "description": "upcoming launch"}],
        "action_items": [{"description": "send report", "deadline": "Friday"}],
        "important_facts": []
    }"#;

    fn scenario_messages() -> Vec<MessageRecord> {
        vec![
            message("m1", "Alice", "alice@x.com", "Intro", "Alice <alice@x.com> says hi"),
            message("m2", "Bob", "bob@y.com", "Launch Plan", "Kicking off the Launch Plan"),
            message("m3", "Carol", "carol@z.com", "Reports", "Please send report by Friday"),
        ]
    }

    #[tokio::test]
    async fn test_end_to_end_sync_produces_insights() {
        let h = harness(FakeMail::with_messages(scenario_messages()), SCENARIO_RESPONSE);

        h.coordinator
            .start(USER, credential(false, None), 30)
            .expect("start");
        let status = wait_terminal(&h.coordinator, USER).await;

        assert_eq!(status.state, SyncState::Completed);
        assert_eq!(status.progress, 100);
        assert!(!status.is_syncing());
        assert!(status.last_sync.is_some());
        let summary = status.result.expect("summary");
        assert_eq!(summary.emails_processed, 3);
        assert_eq!(summary.relationships, 1);
        assert_eq!(summary.projects, 1);
        assert_eq!(summary.action_items, 1);

        // Persisted intelligence matches the scenario
        let db = IntelDb::open_at(h.db_path.clone()).expect("db");
        let intel = db.get_intelligence(USER).expect("get").expect("row");
        assert_eq!(intel.relationships.len(), 1);
        assert_eq!(intel.relationships[0].contact_email, "alice@x.com");
        assert_eq!(intel.projects.len(), 1);
        assert_eq!(intel.projects[0].name, "Launch Plan");
        assert_eq!(intel.tasks.len(), 1);
        assert!(intel.tasks[0].description.contains("send report"));
    }

    #[tokio::test]
    async fn test_start_while_running_rejected_without_disturbing_run() {
        let gate = Arc::new(Notify::new());
        let h = harness(
            FakeMail::gated(scenario_messages(), gate.clone()),
            SCENARIO_RESPONSE,
        );

        h.coordinator
            .start(USER, credential(false, None), 30)
            .expect("first start");

        // Let the pipeline reach the gated fetch
        tokio::time::sleep(Duration::from_millis(20)).await;
        let before = h.coordinator.status(USER);
        assert_eq!(before.state, SyncState::Running);

        let second = h.coordinator.start(USER, credential(false, None), 30);
        assert!(matches!(second, Err(SyncError::AlreadyRunning)));

        // The rejected start must not touch the running slot
        let after = h.coordinator.status(USER);
        assert_eq!(after.started_at, before.started_at);
        assert_eq!(after.progress, before.progress);
        assert_eq!(after.phase, before.phase);

        gate.notify_one();
        let terminal = wait_terminal(&h.coordinator, USER).await;
        assert_eq!(terminal.state, SyncState::Completed);
    }

    #[tokio::test]
    async fn test_slot_reusable_after_completion() {
        let h = harness(FakeMail::with_messages(scenario_messages()), SCENARIO_RESPONSE);

        h.coordinator
            .start(USER, credential(false, None), 30)
            .expect("first");
        wait_terminal(&h.coordinator, USER).await;

        h.coordinator
            .start(USER, credential(false, None), 30)
            .expect("second start after terminal state");
        let status = wait_terminal(&h.coordinator, USER).await;
        assert_eq!(status.state, SyncState::Completed);
        assert_eq!(h.mail.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expired_with_refresh_token_refreshes_once() {
        let h = harness(FakeMail::with_messages(scenario_messages()), SCENARIO_RESPONSE);

        h.coordinator
            .start(USER, credential(true, Some("1//refresh")), 30)
            .expect("start");
        let status = wait_terminal(&h.coordinator, USER).await;

        assert_eq!(status.state, SyncState::Completed);
        assert_eq!(h.tokens.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(h.mail.fetches.load(Ordering::SeqCst), 1);
        // The refreshed credential was handed to the store
        let saved = h.credentials.saved.lock();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].token, "ya29.refreshed");
    }

    #[tokio::test]
    async fn test_expired_without_refresh_token_rejected_before_fetch() {
        let h = harness(FakeMail::with_messages(scenario_messages()), SCENARIO_RESPONSE);

        let result = h
            .coordinator
            .start(USER, credential(true, None), 30);
        assert!(matches!(result, Err(SyncError::CredentialInvalid)));

        // No run was recorded and no fetch attempted
        assert_eq!(h.coordinator.status(USER).state, SyncState::Idle);
        assert_eq!(h.mail.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(h.tokens.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_lands_as_failed_status() {
        let mut mail = FakeMail::with_messages(Vec::new());
        mail.fail = Some(FetchError::Transient("HTTP 503".to_string()));
        let h = harness(mail, SCENARIO_RESPONSE);

        h.coordinator
            .start(USER, credential(false, None), 30)
            .expect("start");
        let status = wait_terminal(&h.coordinator, USER).await;

        assert_eq!(status.state, SyncState::Failed);
        assert!(status.error.as_ref().unwrap().contains("503"));
        assert!(!status.is_syncing());

        // Failed slot is immediately reusable
        h.coordinator
            .start(USER, credential(false, None), 30)
            .expect("restart after failure");
    }

    #[tokio::test]
    async fn test_cancel_stops_between_batches() {
        let gate = Arc::new(Notify::new());
        let h = harness(
            FakeMail::gated(scenario_messages(), gate.clone()),
            SCENARIO_RESPONSE,
        );

        h.coordinator
            .start(USER, credential(false, None), 30)
            .expect("start");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.coordinator.cancel(USER));
        gate.notify_one();

        let status = wait_terminal(&h.coordinator, USER).await;
        assert_eq!(status.state, SyncState::Failed);
        assert!(status.error.unwrap().contains("cancelled"));
    }

    #[tokio::test]
    async fn test_cancel_idle_returns_false() {
        let h = harness(FakeMail::with_messages(Vec::new()), SCENARIO_RESPONSE);
        assert!(!h.coordinator.cancel(USER));
    }

    #[tokio::test]
    async fn test_concurrent_users_do_not_clobber() {
        let gate = Arc::new(Notify::new());
        let h = harness(
            FakeMail::gated(scenario_messages(), gate.clone()),
            SCENARIO_RESPONSE,
        );

        h.coordinator
            .start("a@example.com", credential(false, None), 30)
            .expect("start a");
        tokio::time::sleep(Duration::from_millis(10)).await;

        // A second user starts while the first is mid-fetch
        h.coordinator
            .start("b@example.com", credential(false, None), 30)
            .expect("start b");

        assert_eq!(h.coordinator.status("a@example.com").state, SyncState::Running);

        gate.notify_one();
        gate.notify_one();
        let a = wait_terminal(&h.coordinator, "a@example.com").await;
        let b = wait_terminal(&h.coordinator, "b@example.com").await;
        assert_eq!(a.state, SyncState::Completed);
        assert_eq!(b.state, SyncState::Completed);
        assert_eq!(a.user_email, "a@example.com");
        assert_eq!(b.user_email, "b@example.com");
    }

    #[tokio::test]
    async fn test_sync_outcome_logged() {
        let h = harness(FakeMail::with_messages(scenario_messages()), SCENARIO_RESPONSE);
        h.coordinator
            .start(USER, credential(false, None), 30)
            .expect("start");
        wait_terminal(&h.coordinator, USER).await;

        let db = IntelDb::open_at(h.db_path.clone()).expect("db");
        let intel = db.get_intelligence(USER).expect("get").expect("row");
        // The sync log row exists alongside the merged data
        assert!(intel.last_synced_at.is_some());
    }

    #[test]
    fn test_status_snapshot_for_unknown_user() {
        let tokens: Arc<dyn TokenProvider> = Arc::new(FakeTokens::new());
        let mail: Arc<dyn MailProvider> = Arc::new(FakeMail::with_messages(Vec::new()));
        let coordinator = SyncCoordinator::new(
            tokens,
            mail,
            Arc::new(FakeModel {
                response: "{}".to_string(),
            }),
            Arc::new(MemoryCredentials {
                saved: Mutex::new(Vec::new()),
            }),
            PathBuf::from("/tmp/unused.db"),
            50,
        );
        let status = coordinator.status("stranger@example.com");
        assert_eq!(status.state, SyncState::Idle);
        assert_eq!(status.progress, 0);
        assert!(!status.is_syncing());
    }
}
