/// Settings provider tests against the JSON settings file.
use bridge_agent::settings::{
    EndpointConfig, FileSettingsStore, SettingsError, SettingsProvider, SettingsStore,
};

fn fallback() -> EndpointConfig {
    EndpointConfig {
        host: "localhost".to_owned(),
        http_port: 4000,
        ws_port: 4001,
    }
}

#[tokio::test]
async fn missing_file_means_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileSettingsStore::new(dir.path().join("cloud_settings.json"));
    assert!(store.load().await.unwrap().is_none());

    let provider = SettingsProvider::new(store, fallback());
    assert_eq!(provider.resolve().await, fallback());
}

#[tokio::test]
async fn saved_settings_replace_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cloud_settings.json");
    std::fs::write(
        &path,
        r#"{"serverIp": "bridge.example.com", "httpPort": 8080, "wsPort": 8081}"#,
    )
    .unwrap();

    let provider = SettingsProvider::new(FileSettingsStore::new(&path), fallback());
    let ep = provider.resolve().await;
    assert_eq!(
        ep,
        EndpointConfig {
            host: "bridge.example.com".to_owned(),
            http_port: 8080,
            ws_port: 8081,
        }
    );
    assert_eq!(provider.current(), ep);
}

#[tokio::test]
async fn server_host_alias_and_missing_ports() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cloud_settings.json");
    std::fs::write(&path, r#"{"serverHost": "10.1.2.3", "extra": true}"#).unwrap();

    let provider = SettingsProvider::new(FileSettingsStore::new(&path), fallback());
    let ep = provider.resolve().await;
    assert_eq!(ep.host, "10.1.2.3");
    assert_eq!(ep.http_port, 4000);
    assert_eq!(ep.ws_port, 4001);
}

/// Test: an edited file is picked up on the next resolve and signalled once.
#[tokio::test]
async fn edited_file_signals_change() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cloud_settings.json");
    std::fs::write(&path, r#"{"serverIp": "10.0.0.5"}"#).unwrap();

    let provider = SettingsProvider::new(FileSettingsStore::new(&path), fallback());
    provider.resolve().await;
    let mut rx = provider.subscribe();
    assert_eq!(rx.borrow_and_update().host, "10.0.0.5");

    std::fs::write(&path, r#"{"serverIp": "10.0.0.6"}"#).unwrap();
    provider.resolve().await;
    assert!(rx.has_changed().unwrap());
    assert_eq!(rx.borrow_and_update().host, "10.0.0.6");

    provider.resolve().await;
    assert!(!rx.has_changed().unwrap());
}

#[tokio::test]
async fn malformed_file_keeps_last_known_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cloud_settings.json");
    std::fs::write(&path, r#"{"serverIp": "10.0.0.5"}"#).unwrap();

    let store = FileSettingsStore::new(&path);
    let provider = SettingsProvider::new(store.clone(), fallback());
    provider.resolve().await;

    std::fs::write(&path, "{ not json").unwrap();
    assert!(matches!(store.load().await, Err(SettingsError::Parse { .. })));
    assert_eq!(provider.resolve().await.host, "10.0.0.5");

    std::fs::remove_file(&path).unwrap();
    assert_eq!(provider.resolve().await.host, "10.0.0.5");
}

#[tokio::test]
async fn empty_file_and_blank_host_mean_no_settings() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cloud_settings.json");

    std::fs::write(&path, "  \n").unwrap();
    assert!(FileSettingsStore::new(&path).load().await.unwrap().is_none());

    std::fs::write(&path, r#"{"serverIp": ""}"#).unwrap();
    let provider = SettingsProvider::new(FileSettingsStore::new(&path), fallback());
    assert_eq!(provider.resolve().await, fallback());
}

#[tokio::test]
async fn unreadable_path_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    // A directory cannot be read as a file.
    let store = FileSettingsStore::new(dir.path());
    assert!(matches!(store.load().await, Err(SettingsError::Io { .. })));

    let provider = SettingsProvider::new(store, fallback());
    assert_eq!(provider.resolve().await, fallback());
}
