use async_trait::async_trait;
use fieldsync_agent::{Agent, AgentConfig, DB_FILE};
use fieldsync_storage::LocalStore;
use fieldsync_sync::remote::memory::InMemoryRemote;
use fieldsync_sync::{ConnectivityState, DrainOutcome, DrainTrigger, ProbeError, Prober};
use fieldsync_types::Record;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

struct AlwaysUp;

#[async_trait]
impl Prober for AlwaysUp {
    async fn probe(&self) -> Result<(), ProbeError> {
        Ok(())
    }
}

// ── Config ──────────────────────────────────────────────────────

#[test]
fn partial_config_file_keeps_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.json");
    std::fs::write(
        &path,
        r#"{
            "data_dir": "/var/lib/fieldsync",
            "user_id": "u1",
            "remote": {"base_url": "https://db.example.com", "api_key": "k"},
            "sync": {"max_retries": 3}
        }"#,
    )
    .unwrap();

    let config = AgentConfig::load(&path).unwrap();

    assert_eq!(config.data_dir, PathBuf::from("/var/lib/fieldsync"));
    assert_eq!(config.user_id.as_deref(), Some("u1"));
    assert_eq!(config.remote.base_url, "https://db.example.com");
    assert_eq!(config.remote.timeout_secs, 30);
    assert_eq!(config.sync.max_retries, 3);
    assert_eq!(config.sync.stale_after_secs, 3600);
    assert_eq!(config.connectivity.probe_interval_secs, 30);
    assert_eq!(config.warmer.ttl_secs, 4 * 60 * 60);
    assert_eq!(config.warmer.steps.len(), 5);
    assert_eq!(config.db_path(), PathBuf::from("/var/lib/fieldsync").join(DB_FILE));
}

#[test]
fn missing_config_file_names_the_path() {
    let err = AgentConfig::load(&PathBuf::from("/nonexistent/agent.json")).unwrap_err();
    assert!(format!("{err:#}").contains("/nonexistent/agent.json"));
}

#[test]
fn malformed_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.json");
    std::fs::write(&path, "{ not json").unwrap();

    let err = AgentConfig::load(&path).unwrap_err();
    assert!(err.to_string().contains("invalid config"));
}

#[test]
fn config_roundtrips_through_json() {
    let config = AgentConfig {
        user_id: Some("u7".into()),
        ..AgentConfig::default()
    };
    let raw = serde_json::to_string(&config).unwrap();
    let parsed: AgentConfig = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed, config);
}

// ── Wiring ──────────────────────────────────────────────────────

#[tokio::test]
async fn built_agent_drains_after_a_successful_probe() {
    let config = AgentConfig {
        user_id: Some("u1".into()),
        ..AgentConfig::default()
    };
    let store = LocalStore::open_in_memory().unwrap();
    let remote = Arc::new(InMemoryRemote::new().with_unique_key("visits", "idempotency_key"));
    let agent = Agent::build(&config, store, remote.clone(), Arc::new(AlwaysUp));

    agent
        .store
        .save(
            "visits",
            &Record::new_local(json!({
                "customer_id": "c1",
                "user_id": "u1",
                "visit_date": "2026-10-16",
                "outcome": "sale",
            })),
        )
        .await
        .unwrap();

    assert_eq!(
        agent.processor.drain(DrainTrigger::Manual).await.unwrap(),
        DrainOutcome::Offline
    );
    assert_eq!(agent.monitor.probe_now().await, ConnectivityState::Online);

    let outcome = agent.processor.drain(DrainTrigger::Manual).await.unwrap();
    assert!(matches!(outcome, DrainOutcome::Completed(ref r) if r.succeeded == 1));
    assert_eq!(remote.rows("visits").len(), 1);
}

#[tokio::test]
async fn from_config_opens_store_in_data_dir() {
    let dir = tempfile::tempdir().unwrap();
    let config = AgentConfig {
        data_dir: dir.path().join("data"),
        ..AgentConfig::default()
    };

    let agent = Agent::from_config(&config).unwrap();
    agent.store.set_meta_time("probe", 1).await.unwrap();

    assert!(config.db_path().exists());
}

#[tokio::test]
async fn run_until_stops_on_shutdown() {
    let config = AgentConfig::default();
    let agent = Agent::build(
        &config,
        LocalStore::open_in_memory().unwrap(),
        Arc::new(InMemoryRemote::new()),
        Arc::new(AlwaysUp),
    );

    agent.run_until(async {}).await.unwrap();
}
