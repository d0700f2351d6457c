use super::*;

use std::collections::HashMap;

fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    move |key| vars.get(key).cloned()
}

#[test]
fn defaults_apply_without_file_or_environment() {
    let settings = resolve_settings(None, env_from(&[]));
    assert_eq!(settings, Settings::default());
    assert_eq!(settings.server_bind, "127.0.0.1:8443");
    assert_eq!(settings.max_body_bytes, 64 * 1024);
}

#[test]
fn settings_file_overrides_defaults() {
    let file = r#"
bind_addr = "0.0.0.0:9000"
database_url = "sqlite://./var/rovers.db"
"#;
    let settings = resolve_settings(Some(file), env_from(&[]));
    assert_eq!(settings.server_bind, "0.0.0.0:9000");
    assert_eq!(settings.database_url, "sqlite://./var/rovers.db");
}

#[test]
fn unreadable_settings_file_is_ignored() {
    let settings = resolve_settings(Some("bind_addr = ["), env_from(&[]));
    assert_eq!(settings, Settings::default());
}

#[test]
fn environment_wins_over_the_file_and_app_prefix_wins_last() {
    let file = r#"bind_addr = "0.0.0.0:9000""#;
    let settings = resolve_settings(
        Some(file),
        env_from(&[
            ("STORE_BIND", "127.0.0.1:7000"),
            ("APP__BIND_ADDR", "127.0.0.1:7001"),
            ("DATABASE_URL", "sqlite://./a.db"),
            ("APP__MAX_BODY_BYTES", "1024"),
        ]),
    );
    assert_eq!(settings.server_bind, "127.0.0.1:7001");
    assert_eq!(settings.database_url, "sqlite://./a.db");
    assert_eq!(settings.max_body_bytes, 1024);
}

#[test]
fn invalid_body_limit_keeps_the_default() {
    for raw in ["lots", "0", "-5"] {
        let settings = resolve_settings(None, env_from(&[("APP__MAX_BODY_BYTES", raw)]));
        assert_eq!(settings.max_body_bytes, 64 * 1024, "{raw}");
    }
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
    assert_eq!(
        normalize_database_url("sqlite:data/test.db"),
        "sqlite://data/test.db"
    );
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
    assert_eq!(normalize_database_url("  "), Settings::default().database_url);
}

#[test]
fn creates_parent_dir_for_sqlite_url() {
    let temp_root = tempfile::tempdir().expect("temp dir");
    let db_path = temp_root.path().join("data").join("store.db");

    prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare db url");
    assert!(temp_root.path().join("data").exists());
}

#[tokio::test]
async fn prepared_database_url_opens_a_sqlite_store() {
    let temp_root = tempfile::tempdir().expect("temp dir");
    let db_path = temp_root.path().join("nested").join("store.db");

    let prepared = prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare");
    let store = storage::SqliteStore::open(&prepared)
        .await
        .expect("open sqlite");
    store.health_check().await.expect("healthy");
    drop(store);

    assert!(
        db_path.exists(),
        "database file should be created: {}",
        db_path.display()
    );
}
