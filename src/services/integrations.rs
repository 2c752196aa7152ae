//! Per-agency integration connection lifecycle.
//!
//! The catalog of supported integrations is compiled in. Each agency keeps one
//! state entry per integration inside its settings document; entries are only
//! ever touched through [`SettingsStore::update_integration`], which merges a
//! single key under a row lock.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::services::settings_store::SettingsStore;

pub type IntegrationConfig = Map<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum IntegrationError {
    #[error("Invalid integration: {0}")]
    InvalidIntegration(String),
    #[error("Integration not connected: {0}")]
    IntegrationNotConnected(String),
    #[error("Agency not found")]
    AgencyNotFound,
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for IntegrationError {
    fn from(error: sqlx::Error) -> Self {
        IntegrationError::Storage(error.to_string())
    }
}

impl From<serde_json::Error> for IntegrationError {
    fn from(error: serde_json::Error) -> Self {
        IntegrationError::Storage(error.to_string())
    }
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationCategory {
    Carriers,
    Marketplaces,
    Crm,
    Communication,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub struct CatalogEntry {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub category: IntegrationCategory,
}

const CATALOG: [CatalogEntry; 8] = [
    CatalogEntry {
        id: "ivans",
        name: "IVANS",
        description: "Insurance industry standard for carrier downloads and messages",
        category: IntegrationCategory::Carriers,
    },
    CatalogEntry {
        id: "healthsherpa",
        name: "HealthSherpa",
        description: "Health insurance marketplace enrollment platform",
        category: IntegrationCategory::Marketplaces,
    },
    CatalogEntry {
        id: "covered-ca",
        name: "Covered California",
        description: "California state health insurance marketplace",
        category: IntegrationCategory::Marketplaces,
    },
    CatalogEntry {
        id: "medicare",
        name: "Medicare.gov",
        description: "Federal Medicare enrollment and plan comparison",
        category: IntegrationCategory::Marketplaces,
    },
    CatalogEntry {
        id: "salesforce",
        name: "Salesforce",
        description: "CRM platform for customer relationship management",
        category: IntegrationCategory::Crm,
    },
    CatalogEntry {
        id: "hubspot",
        name: "HubSpot",
        description: "Marketing, sales, and service CRM platform",
        category: IntegrationCategory::Crm,
    },
    CatalogEntry {
        id: "twilio",
        name: "Twilio",
        description: "SMS and voice communication platform",
        category: IntegrationCategory::Communication,
    },
    CatalogEntry {
        id: "sendgrid",
        name: "SendGrid",
        description: "Email delivery and marketing platform",
        category: IntegrationCategory::Communication,
    },
];

pub fn available_integrations() -> &'static [CatalogEntry] {
    &CATALOG
}

pub fn find_integration(id: &str) -> Option<&'static CatalogEntry> {
    CATALOG.iter().find(|entry| entry.id == id)
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationStatus {
    Active,
    #[default]
    Inactive,
    Error,
    Syncing,
}

/// Stored per-agency state of one integration. Serialized with camelCase keys,
/// which is also the layout inside `agencies.settings.integrations`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationState {
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub status: IntegrationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<IntegrationConfig>,
}

impl IntegrationState {
    /// Decodes a stored entry. Undecodable entries fall back to the default
    /// state; decoded entries are normalized so `connected` and `status` agree.
    pub fn from_stored(integration_id: &str, value: Value) -> Self {
        match serde_json::from_value::<IntegrationState>(value) {
            Ok(state) => state.normalized(),
            Err(error) => {
                warn!(integration_id, %error, "discarding undecodable integration state");
                IntegrationState::default()
            }
        }
    }

    fn normalized(mut self) -> Self {
        let live = matches!(
            self.status,
            IntegrationStatus::Active | IntegrationStatus::Syncing
        );
        if self.connected && !live {
            self.status = IntegrationStatus::Active;
        } else if !self.connected && live {
            self.status = IntegrationStatus::Inactive;
        }
        self
    }
}

/// Catalog entry merged with the agency's state for it.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Integration {
    #[serde(flatten)]
    pub entry: CatalogEntry,
    #[serde(flatten)]
    pub state: IntegrationState,
}

pub fn merge_with_catalog(mut stored: HashMap<String, IntegrationState>) -> Vec<Integration> {
    CATALOG
        .iter()
        .map(|entry| Integration {
            entry: *entry,
            state: stored.remove(entry.id).unwrap_or_default(),
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq)]
pub enum IntegrationAction {
    Connect { config: Option<IntegrationConfig> },
    Disconnect,
    Sync,
    Configure { config: Option<IntegrationConfig> },
}

impl IntegrationAction {
    pub fn name(&self) -> &'static str {
        match self {
            IntegrationAction::Connect { .. } => "connect",
            IntegrationAction::Disconnect => "disconnect",
            IntegrationAction::Sync => "sync",
            IntegrationAction::Configure { .. } => "configure",
        }
    }
}

struct Planned {
    next: Option<IntegrationState>,
    schedule_sync: bool,
}

impl Planned {
    fn write(next: IntegrationState) -> Self {
        Self {
            next: Some(next),
            schedule_sync: false,
        }
    }
}

fn plan(
    integration_id: &str,
    current: IntegrationState,
    action: IntegrationAction,
    now: DateTime<Utc>,
) -> Result<Planned, IntegrationError> {
    match action {
        IntegrationAction::Connect { config } => Ok(Planned::write(IntegrationState {
            connected: true,
            status: IntegrationStatus::Active,
            last_sync: Some(now),
            config: config.or(current.config),
        })),
        IntegrationAction::Disconnect => Ok(Planned::write(IntegrationState {
            connected: false,
            status: IntegrationStatus::Inactive,
            last_sync: current.last_sync,
            config: None,
        })),
        IntegrationAction::Sync => {
            if !current.connected {
                return Err(IntegrationError::IntegrationNotConnected(
                    integration_id.to_string(),
                ));
            }
            if current.status == IntegrationStatus::Syncing {
                return Ok(Planned {
                    next: None,
                    schedule_sync: false,
                });
            }
            Ok(Planned {
                next: Some(IntegrationState {
                    status: IntegrationStatus::Syncing,
                    ..current
                }),
                schedule_sync: true,
            })
        }
        IntegrationAction::Configure { config } => Ok(Planned::write(IntegrationState {
            config,
            ..current
        })),
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct SyncFailure(pub String);

/// Remote side of a sync: pulls data from the third-party service.
#[async_trait]
pub trait IntegrationSync: Send + Sync {
    async fn sync(
        &self,
        agency_id: Uuid,
        integration: &CatalogEntry,
        config: Option<&IntegrationConfig>,
    ) -> Result<(), SyncFailure>;
}

/// Stands in for a real remote call: waits a fixed delay and succeeds.
pub struct SimulatedSync {
    delay: Duration,
}

impl SimulatedSync {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl IntegrationSync for SimulatedSync {
    async fn sync(
        &self,
        _agency_id: Uuid,
        _integration: &CatalogEntry,
        _config: Option<&IntegrationConfig>,
    ) -> Result<(), SyncFailure> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct SyncJob {
    pub agency_id: Uuid,
    pub integration_id: &'static str,
    pub config: Option<IntegrationConfig>,
}

#[derive(Clone)]
pub struct IntegrationManager {
    store: Arc<dyn SettingsStore>,
    clock: Arc<dyn Clock>,
    jobs: mpsc::UnboundedSender<SyncJob>,
}

impl IntegrationManager {
    /// Builds the manager and spawns its sync worker on the current runtime.
    /// The worker exits once every clone of the manager is dropped.
    pub fn start(
        store: Arc<dyn SettingsStore>,
        clock: Arc<dyn Clock>,
        provider: Arc<dyn IntegrationSync>,
    ) -> Self {
        let (jobs, queue) = mpsc::unbounded_channel();
        tokio::spawn(run_sync_worker(
            store.clone(),
            clock.clone(),
            provider,
            queue,
        ));
        Self { store, clock, jobs }
    }

    pub async fn list(&self, agency_id: Uuid) -> Result<Vec<Integration>, IntegrationError> {
        let stored = self.store.integrations(agency_id).await?;
        Ok(merge_with_catalog(stored))
    }

    pub async fn apply(
        &self,
        agency_id: Uuid,
        integration_id: &str,
        action: IntegrationAction,
    ) -> Result<Integration, IntegrationError> {
        let entry = find_integration(integration_id)
            .ok_or_else(|| IntegrationError::InvalidIntegration(integration_id.to_string()))?;
        let now = self.clock.now();
        let action_name = action.name();

        let mut schedule_sync = false;
        let state = self
            .store
            .update_integration(
                agency_id,
                entry.id,
                Box::new(|current: IntegrationState| -> Result<_, IntegrationError> {
                    let planned = plan(entry.id, current, action, now)?;
                    schedule_sync = planned.schedule_sync;
                    Ok(planned.next)
                }),
            )
            .await?;

        info!(
            %agency_id,
            integration_id = entry.id,
            action = action_name,
            status = ?state.status,
            "integration updated"
        );

        if schedule_sync {
            let job = SyncJob {
                agency_id,
                integration_id: entry.id,
                config: state.config.clone(),
            };
            if self.jobs.send(job).is_err() {
                error!(
                    %agency_id,
                    integration_id = entry.id,
                    "sync worker is gone; integration left syncing"
                );
            }
        }

        Ok(Integration {
            entry: *entry,
            state,
        })
    }

    /// Records the outcome of a sync job against the latest stored state.
    #[cfg(test)]
    pub async fn complete_sync(
        &self,
        job: &SyncJob,
        outcome: Result<(), SyncFailure>,
    ) -> Result<IntegrationState, IntegrationError> {
        finish_sync(self.store.as_ref(), self.clock.as_ref(), job, outcome).await
    }
}

async fn finish_sync(
    store: &dyn SettingsStore,
    clock: &dyn Clock,
    job: &SyncJob,
    outcome: Result<(), SyncFailure>,
) -> Result<IntegrationState, IntegrationError> {
    let now = clock.now();
    store
        .update_integration(
            job.agency_id,
            job.integration_id,
            Box::new(move |current: IntegrationState| -> Result<_, IntegrationError> {
                // Disconnected or reconnected since the job was queued.
                if !current.connected || current.status != IntegrationStatus::Syncing {
                    return Ok(None);
                }
                let next = match outcome {
                    Ok(()) => IntegrationState {
                        status: IntegrationStatus::Active,
                        last_sync: Some(now),
                        ..current
                    },
                    Err(_) => IntegrationState {
                        connected: false,
                        status: IntegrationStatus::Error,
                        ..current
                    },
                };
                Ok(Some(next))
            }),
        )
        .await
}

async fn run_sync_worker(
    store: Arc<dyn SettingsStore>,
    clock: Arc<dyn Clock>,
    provider: Arc<dyn IntegrationSync>,
    mut queue: mpsc::UnboundedReceiver<SyncJob>,
) {
    while let Some(job) = queue.recv().await {
        tokio::spawn(execute_sync(
            store.clone(),
            clock.clone(),
            provider.clone(),
            job,
        ));
    }
}

async fn execute_sync(
    store: Arc<dyn SettingsStore>,
    clock: Arc<dyn Clock>,
    provider: Arc<dyn IntegrationSync>,
    job: SyncJob,
) {
    let Some(entry) = find_integration(job.integration_id) else {
        return;
    };
    let outcome = provider
        .sync(job.agency_id, entry, job.config.as_ref())
        .await;
    if let Err(failure) = &outcome {
        warn!(
            agency_id = %job.agency_id,
            integration_id = job.integration_id,
            %failure,
            "integration sync failed"
        );
    }

    match finish_sync(store.as_ref(), clock.as_ref(), &job, outcome).await {
        Ok(state) => info!(
            agency_id = %job.agency_id,
            integration_id = job.integration_id,
            status = ?state.status,
            "integration sync finished"
        ),
        Err(error) => error!(
            agency_id = %job.agency_id,
            integration_id = job.integration_id,
            %error,
            "failed to record sync completion; integration left syncing"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::settings_store::Transition;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    };

    /// Settings documents kept in memory, one per agency, with the same merge
    /// semantics as the Postgres store.
    #[derive(Default)]
    struct MemoryStore {
        documents: Mutex<HashMap<Uuid, Value>>,
        fail_writes: AtomicBool,
    }

    impl MemoryStore {
        fn with_agencies(ids: &[Uuid]) -> Self {
            let store = MemoryStore::default();
            {
                let mut documents = store.documents.lock().unwrap();
                for id in ids {
                    documents.insert(*id, json!({}));
                }
            }
            store
        }

        fn document(&self, agency_id: Uuid) -> Value {
            self.documents.lock().unwrap()[&agency_id].clone()
        }

        fn set_document(&self, agency_id: Uuid, document: Value) {
            self.documents.lock().unwrap().insert(agency_id, document);
        }
    }

    #[async_trait]
    impl SettingsStore for MemoryStore {
        async fn integrations(
            &self,
            agency_id: Uuid,
        ) -> Result<HashMap<String, IntegrationState>, IntegrationError> {
            let documents = self.documents.lock().unwrap();
            let document = documents
                .get(&agency_id)
                .ok_or(IntegrationError::AgencyNotFound)?;
            let mut states = HashMap::new();
            if let Some(Value::Object(entries)) = document.get("integrations") {
                for (id, value) in entries {
                    states.insert(id.clone(), IntegrationState::from_stored(id, value.clone()));
                }
            }
            Ok(states)
        }

        async fn update_integration(
            &self,
            agency_id: Uuid,
            integration_id: &str,
            transition: Transition<'_>,
        ) -> Result<IntegrationState, IntegrationError> {
            let mut documents = self.documents.lock().unwrap();
            let document = documents
                .get_mut(&agency_id)
                .ok_or(IntegrationError::AgencyNotFound)?;
            let current = document
                .get("integrations")
                .and_then(|entries| entries.get(integration_id))
                .cloned()
                .map(|value| IntegrationState::from_stored(integration_id, value))
                .unwrap_or_default();
            let Some(next) = transition(current.clone())? else {
                return Ok(current);
            };
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(IntegrationError::Storage("connection reset".into()));
            }
            let root = document.as_object_mut().expect("settings document is an object");
            let entries = root
                .entry("integrations")
                .or_insert_with(|| json!({}))
                .as_object_mut()
                .expect("integrations is an object");
            entries.insert(integration_id.to_string(), serde_json::to_value(&next)?);
            Ok(next)
        }
    }

    struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        fn at(time: DateTime<Utc>) -> Self {
            Self(Mutex::new(time))
        }

        fn set(&self, time: DateTime<Utc>) {
            *self.0.lock().unwrap() = time;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    /// Provider that waits like the simulated one, counts calls, and can be
    /// told to fail.
    struct ScriptedSync {
        delay: Duration,
        fail: bool,
        calls: AtomicUsize,
    }

    impl ScriptedSync {
        fn succeeding(delay: Duration) -> Self {
            Self {
                delay,
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing(delay: Duration) -> Self {
            Self {
                delay,
                fail: true,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl IntegrationSync for ScriptedSync {
        async fn sync(
            &self,
            _agency_id: Uuid,
            _integration: &CatalogEntry,
            _config: Option<&IntegrationConfig>,
        ) -> Result<(), SyncFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                Err(SyncFailure("remote timed out".into()))
            } else {
                Ok(())
            }
        }
    }

    const DELAY: Duration = Duration::from_secs(3);

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    struct Harness {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        provider: Arc<ScriptedSync>,
        manager: IntegrationManager,
    }

    fn harness(agencies: &[Uuid], provider: ScriptedSync) -> Harness {
        let store = Arc::new(MemoryStore::with_agencies(agencies));
        let clock = Arc::new(ManualClock::at(t0()));
        let provider = Arc::new(provider);
        let manager = IntegrationManager::start(store.clone(), clock.clone(), provider.clone());
        Harness {
            store,
            clock,
            provider,
            manager,
        }
    }

    async fn state_of(manager: &IntegrationManager, agency_id: Uuid, id: &str) -> IntegrationState {
        manager
            .list(agency_id)
            .await
            .unwrap()
            .into_iter()
            .find(|integration| integration.entry.id == id)
            .unwrap()
            .state
    }

    fn config(value: Value) -> Option<IntegrationConfig> {
        value.as_object().cloned()
    }

    #[tokio::test]
    async fn list_defaults_every_catalog_entry_in_order() {
        let agency = Uuid::new_v4();
        let h = harness(&[agency], ScriptedSync::succeeding(DELAY));

        let integrations = h.manager.list(agency).await.unwrap();

        let ids: Vec<&str> = integrations.iter().map(|item| item.entry.id).collect();
        let catalog_ids: Vec<&str> = available_integrations().iter().map(|entry| entry.id).collect();
        assert_eq!(ids, catalog_ids);
        assert!(integrations
            .iter()
            .all(|item| item.state == IntegrationState::default()));
    }

    #[tokio::test]
    async fn connect_marks_integration_active() {
        let agency = Uuid::new_v4();
        let h = harness(&[agency], ScriptedSync::succeeding(DELAY));

        let connected = h
            .manager
            .apply(agency, "ivans", IntegrationAction::Connect { config: None })
            .await
            .unwrap();

        assert_eq!(connected.entry.name, "IVANS");
        assert!(connected.state.connected);
        assert_eq!(connected.state.status, IntegrationStatus::Active);
        assert_eq!(connected.state.last_sync, Some(t0()));
        assert_eq!(state_of(&h.manager, agency, "ivans").await, connected.state);
    }

    #[tokio::test]
    async fn reconnect_refreshes_last_sync_and_keeps_config() {
        let agency = Uuid::new_v4();
        let h = harness(&[agency], ScriptedSync::succeeding(DELAY));
        h.manager
            .apply(
                agency,
                "twilio",
                IntegrationAction::Connect {
                    config: config(json!({ "sid": "AC1" })),
                },
            )
            .await
            .unwrap();

        let later = t0() + chrono::Duration::minutes(5);
        h.clock.set(later);
        let again = h
            .manager
            .apply(agency, "twilio", IntegrationAction::Connect { config: None })
            .await
            .unwrap();

        assert_eq!(again.state.last_sync, Some(later));
        assert_eq!(again.state.config, config(json!({ "sid": "AC1" })));
    }

    #[tokio::test]
    async fn disconnect_clears_config_and_is_idempotent() {
        let agency = Uuid::new_v4();
        let h = harness(&[agency], ScriptedSync::succeeding(DELAY));
        h.manager
            .apply(
                agency,
                "salesforce",
                IntegrationAction::Connect {
                    config: config(json!({ "instance": "na1" })),
                },
            )
            .await
            .unwrap();

        let once = h
            .manager
            .apply(agency, "salesforce", IntegrationAction::Disconnect)
            .await
            .unwrap();
        let twice = h
            .manager
            .apply(agency, "salesforce", IntegrationAction::Disconnect)
            .await
            .unwrap();

        assert!(!once.state.connected);
        assert_eq!(once.state.status, IntegrationStatus::Inactive);
        assert_eq!(once.state.config, None);
        assert_eq!(once, twice);
        let serialized = serde_json::to_value(&twice).unwrap();
        assert!(serialized.get("config").is_none());
    }

    #[tokio::test]
    async fn sync_requires_a_connection() {
        let agency = Uuid::new_v4();
        let h = harness(&[agency], ScriptedSync::succeeding(DELAY));
        let before = h.store.document(agency);

        let error = h
            .manager
            .apply(agency, "hubspot", IntegrationAction::Sync)
            .await
            .unwrap_err();

        assert!(matches!(error, IntegrationError::IntegrationNotConnected(id) if id == "hubspot"));
        assert_eq!(h.store.document(agency), before);
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_resolves_to_active_after_the_delay() {
        let agency = Uuid::new_v4();
        let h = harness(&[agency], ScriptedSync::succeeding(DELAY));
        h.manager
            .apply(agency, "ivans", IntegrationAction::Connect { config: None })
            .await
            .unwrap();

        let syncing = h
            .manager
            .apply(agency, "ivans", IntegrationAction::Sync)
            .await
            .unwrap();
        assert_eq!(syncing.state.status, IntegrationStatus::Syncing);
        assert!(syncing.state.connected);

        let later = t0() + chrono::Duration::seconds(3);
        h.clock.set(later);
        tokio::time::sleep(DELAY + Duration::from_secs(1)).await;

        let state = state_of(&h.manager, agency, "ivans").await;
        assert_eq!(state.status, IntegrationStatus::Active);
        assert_eq!(state.last_sync, Some(later));
    }

    #[tokio::test(start_paused = true)]
    async fn sync_while_syncing_does_not_queue_again() {
        let agency = Uuid::new_v4();
        let h = harness(&[agency], ScriptedSync::succeeding(DELAY));
        h.manager
            .apply(agency, "medicare", IntegrationAction::Connect { config: None })
            .await
            .unwrap();

        let first = h
            .manager
            .apply(agency, "medicare", IntegrationAction::Sync)
            .await
            .unwrap();
        let second = h
            .manager
            .apply(agency, "medicare", IntegrationAction::Sync)
            .await
            .unwrap();
        assert_eq!(first, second);

        tokio::time::sleep(DELAY * 2).await;
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            state_of(&h.manager, agency, "medicare").await.status,
            IntegrationStatus::Active
        );
    }

    #[tokio::test]
    async fn completion_after_disconnect_is_a_no_op() {
        let agency = Uuid::new_v4();
        let h = harness(&[agency], ScriptedSync::succeeding(Duration::from_secs(3600)));
        h.manager
            .apply(agency, "sendgrid", IntegrationAction::Connect { config: None })
            .await
            .unwrap();
        h.manager
            .apply(agency, "sendgrid", IntegrationAction::Sync)
            .await
            .unwrap();
        h.manager
            .apply(agency, "sendgrid", IntegrationAction::Disconnect)
            .await
            .unwrap();

        let job = SyncJob {
            agency_id: agency,
            integration_id: "sendgrid",
            config: None,
        };
        let state = h.manager.complete_sync(&job, Ok(())).await.unwrap();

        assert!(!state.connected);
        assert_eq!(state.status, IntegrationStatus::Inactive);
        assert_eq!(state_of(&h.manager, agency, "sendgrid").await, state);
    }

    #[tokio::test]
    async fn completion_after_reconnect_is_a_no_op() {
        let agency = Uuid::new_v4();
        let h = harness(&[agency], ScriptedSync::succeeding(Duration::from_secs(3600)));
        h.manager
            .apply(agency, "ivans", IntegrationAction::Connect { config: None })
            .await
            .unwrap();
        h.manager
            .apply(agency, "ivans", IntegrationAction::Sync)
            .await
            .unwrap();
        let reconnected = h
            .manager
            .apply(agency, "ivans", IntegrationAction::Connect { config: None })
            .await
            .unwrap();

        let job = SyncJob {
            agency_id: agency,
            integration_id: "ivans",
            config: None,
        };
        let state = h.manager.complete_sync(&job, Ok(())).await.unwrap();

        assert_eq!(state, reconnected.state);
    }

    #[tokio::test]
    async fn configure_before_connect_is_preserved() {
        let agency = Uuid::new_v4();
        let h = harness(&[agency], ScriptedSync::succeeding(DELAY));

        let configured = h
            .manager
            .apply(
                agency,
                "healthsherpa",
                IntegrationAction::Configure {
                    config: config(json!({ "foo": 1 })),
                },
            )
            .await
            .unwrap();
        assert!(!configured.state.connected);
        assert_eq!(configured.state.status, IntegrationStatus::Inactive);

        let connected = h
            .manager
            .apply(agency, "healthsherpa", IntegrationAction::Connect { config: None })
            .await
            .unwrap();

        assert!(connected.state.connected);
        assert_eq!(connected.state.config, config(json!({ "foo": 1 })));
    }

    #[tokio::test]
    async fn configure_keeps_connection_status() {
        let agency = Uuid::new_v4();
        let h = harness(&[agency], ScriptedSync::succeeding(DELAY));
        h.manager
            .apply(agency, "hubspot", IntegrationAction::Connect { config: None })
            .await
            .unwrap();

        let configured = h
            .manager
            .apply(
                agency,
                "hubspot",
                IntegrationAction::Configure {
                    config: config(json!({ "portal": 42 })),
                },
            )
            .await
            .unwrap();

        assert!(configured.state.connected);
        assert_eq!(configured.state.status, IntegrationStatus::Active);
        assert_eq!(configured.state.last_sync, Some(t0()));
    }

    #[tokio::test]
    async fn unknown_integration_is_rejected_without_writing() {
        let agency = Uuid::new_v4();
        let h = harness(&[agency], ScriptedSync::succeeding(DELAY));

        let error = h
            .manager
            .apply(agency, "myspace", IntegrationAction::Connect { config: None })
            .await
            .unwrap_err();

        assert!(matches!(error, IntegrationError::InvalidIntegration(id) if id == "myspace"));
        assert_eq!(h.store.document(agency), json!({}));
    }

    #[tokio::test]
    async fn agencies_are_isolated() {
        let agency_a = Uuid::new_v4();
        let agency_b = Uuid::new_v4();
        let h = harness(&[agency_a, agency_b], ScriptedSync::succeeding(DELAY));

        h.manager
            .apply(agency_a, "ivans", IntegrationAction::Connect { config: None })
            .await
            .unwrap();

        assert!(state_of(&h.manager, agency_a, "ivans").await.connected);
        assert_eq!(
            state_of(&h.manager, agency_b, "ivans").await,
            IntegrationState::default()
        );
        assert_eq!(h.store.document(agency_b), json!({}));
    }

    #[tokio::test]
    async fn updates_preserve_the_rest_of_the_settings_document() {
        let agency = Uuid::new_v4();
        let h = harness(&[agency], ScriptedSync::succeeding(DELAY));
        h.store.set_document(
            agency,
            json!({
                "branding": { "color": "teal" },
                "integrations": {
                    "twilio": { "connected": true, "status": "active" }
                }
            }),
        );

        h.manager
            .apply(agency, "ivans", IntegrationAction::Connect { config: None })
            .await
            .unwrap();

        let document = h.store.document(agency);
        assert_eq!(document["branding"], json!({ "color": "teal" }));
        assert_eq!(document["integrations"]["twilio"]["status"], "active");
        assert_eq!(document["integrations"]["ivans"]["status"], "active");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_remote_sync_moves_to_error() {
        let agency = Uuid::new_v4();
        let h = harness(&[agency], ScriptedSync::failing(DELAY));
        h.manager
            .apply(
                agency,
                "covered-ca",
                IntegrationAction::Connect {
                    config: config(json!({ "broker": "B-7" })),
                },
            )
            .await
            .unwrap();
        h.manager
            .apply(agency, "covered-ca", IntegrationAction::Sync)
            .await
            .unwrap();

        h.clock.set(t0() + chrono::Duration::seconds(10));
        tokio::time::sleep(DELAY + Duration::from_secs(1)).await;

        let state = state_of(&h.manager, agency, "covered-ca").await;
        assert!(!state.connected);
        assert_eq!(state.status, IntegrationStatus::Error);
        assert_eq!(state.last_sync, Some(t0()));
        assert_eq!(state.config, config(json!({ "broker": "B-7" })));

        let error = h
            .manager
            .apply(agency, "covered-ca", IntegrationAction::Sync)
            .await
            .unwrap_err();
        assert!(matches!(error, IntegrationError::IntegrationNotConnected(_)));

        let reconnected = h
            .manager
            .apply(agency, "covered-ca", IntegrationAction::Connect { config: None })
            .await
            .unwrap();
        assert_eq!(reconnected.state.status, IntegrationStatus::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn storage_failure_at_completion_leaves_syncing() {
        let agency = Uuid::new_v4();
        let h = harness(&[agency], ScriptedSync::succeeding(DELAY));
        h.manager
            .apply(agency, "ivans", IntegrationAction::Connect { config: None })
            .await
            .unwrap();
        h.manager
            .apply(agency, "ivans", IntegrationAction::Sync)
            .await
            .unwrap();

        h.store.fail_writes.store(true, Ordering::SeqCst);
        tokio::time::sleep(DELAY + Duration::from_secs(1)).await;

        let state = state_of(&h.manager, agency, "ivans").await;
        assert!(state.connected);
        assert_eq!(state.status, IntegrationStatus::Syncing);
    }

    #[tokio::test]
    async fn unknown_agency_surfaces_as_error() {
        let h = harness(&[], ScriptedSync::succeeding(DELAY));

        let error = h.manager.list(Uuid::new_v4()).await.unwrap_err();

        assert!(matches!(error, IntegrationError::AgencyNotFound));
    }

    #[test]
    fn stored_states_are_normalized() {
        let stale = IntegrationState::from_stored(
            "ivans",
            json!({ "connected": true, "status": "inactive" }),
        );
        assert_eq!(stale.status, IntegrationStatus::Active);

        let orphaned = IntegrationState::from_stored(
            "ivans",
            json!({ "connected": false, "status": "syncing", "lastSync": "2026-01-05T10:00:00.000Z" }),
        );
        assert_eq!(orphaned.status, IntegrationStatus::Inactive);
        assert!(orphaned.last_sync.is_some());

        let garbage = IntegrationState::from_stored("ivans", json!({ "status": "exploded" }));
        assert_eq!(garbage, IntegrationState::default());
    }

    #[test]
    fn merged_view_serializes_flat_camel_case() {
        let mut stored = HashMap::new();
        stored.insert(
            "ivans".to_string(),
            IntegrationState {
                connected: true,
                status: IntegrationStatus::Active,
                last_sync: Some(t0()),
                config: None,
            },
        );

        let merged = merge_with_catalog(stored);
        let value = serde_json::to_value(&merged[0]).unwrap();

        assert_eq!(value["id"], "ivans");
        assert_eq!(value["category"], "carriers");
        assert_eq!(value["connected"], true);
        assert_eq!(value["status"], "active");
        assert!(value["lastSync"].is_string());
        assert_eq!(merged.len(), available_integrations().len());
    }
}
