use courier_logger::{LogSettings, Logger};
use std::fs;
use std::time::Duration;
use tempfile::tempdir;

#[test]
fn settings_with_directory_create_a_json_log_file() -> Result<(), Box<dyn std::error::Error>> {
    let tmp_dir = tempdir()?;
    let log_dir = tmp_dir.path().join("logs");

    let settings: LogSettings = serde_json::from_value(serde_json::json!({
        "name": "integration-file-logging",
        "level": "debug",
        "console": false,
        "directory": log_dir,
        "rotation": "never",
        "json": true
    }))?;

    let logger = Logger::from_settings(&settings)?;
    assert!(logger.guard().is_some());

    tracing::info!(queue = "queue.OrderCreated.Audit.default", "hello from integration test");

    std::thread::sleep(Duration::from_millis(30));
    drop(logger);

    let log_file = fs::read_dir(&log_dir)?
        .flatten()
        .map(|entry| entry.path())
        .find(|path| path.extension().and_then(|ext| ext.to_str()) == Some("log"))
        .expect("log file should be created");

    let contents = fs::read_to_string(&log_file)?;
    assert!(contents.contains("queue.OrderCreated.Audit.default"));
    assert!(contents.trim_start().starts_with('{'), "file output should be JSON lines");

    Ok(())
}
