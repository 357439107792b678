use dispatch_rs::config::Config;
use std::time::Duration;

const VARS: [&str; 4] = [
    "DISPATCH_WORKERS",
    "DISPATCH_BATCH_SIZE",
    "DISPATCH_IDLE_POLL_MS",
    "DISPATCH_COMPLETION_POLL_MS",
];

// Environment variables are process-wide, so all env scenarios share one test.
#[test]
fn config_from_env() {
    unsafe {
        for var in VARS {
            std::env::remove_var(var);
        }
    }
    let defaults = Config::from_env().unwrap();
    assert_eq!(defaults.workers, 4);
    assert_eq!(defaults.batch_size, 10);
    assert_eq!(defaults.idle_poll_ms, 50);
    assert_eq!(defaults.completion_poll_ms, 100);

    unsafe {
        std::env::set_var("DISPATCH_WORKERS", "8");
        std::env::set_var("DISPATCH_BATCH_SIZE", " 32 ");
        std::env::set_var("DISPATCH_IDLE_POLL_MS", "5");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.workers, 8);
    assert_eq!(config.batch_size, 32);
    assert_eq!(
        config.dispatcher_options().idle_poll,
        Duration::from_millis(5)
    );

    unsafe {
        std::env::set_var("DISPATCH_WORKERS", "many");
    }
    assert!(Config::from_env().is_err());

    unsafe {
        std::env::set_var("DISPATCH_WORKERS", "2");
        std::env::set_var("DISPATCH_BATCH_SIZE", "0");
    }
    assert!(Config::from_env().is_err());

    // Clean up
    unsafe {
        for var in VARS {
            std::env::remove_var(var);
        }
    }
}

#[test]
fn config_from_toml_fills_defaults() {
    let config = Config::from_toml_str(
        r#"
        workers = 2
        completion_poll_ms = 20
        otel_endpoint = "http://localhost:4317"
        "#,
    )
    .unwrap();

    assert_eq!(config.workers, 2);
    assert_eq!(config.batch_size, 10);
    assert_eq!(config.otel_endpoint.as_deref(), Some("http://localhost:4317"));

    let options = config.dispatcher_options();
    assert_eq!(options.completion_poll, Duration::from_millis(20));
    assert_eq!(options.idle_poll, Duration::from_millis(50));

    let telemetry = config.telemetry("dispatch-test");
    assert_eq!(telemetry.service_name, "dispatch-test");
    assert_eq!(telemetry.log_level, "info");
}

#[test]
fn config_from_toml_rejects_bad_input() {
    assert!(Config::from_toml_str("workers = 0").is_err());
    assert!(Config::from_toml_str("batch_size = -1").is_err());
    assert!(Config::from_toml_str("wrokers = 3").is_err());
}

#[test]
fn config_load_reads_file() {
    let path = std::env::temp_dir().join(format!("dispatch-config-{}.toml", uuid::Uuid::new_v4()));
    std::fs::write(&path, "batch_size = 3\n").unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.batch_size, 3);

    std::fs::remove_file(&path).unwrap();
    assert!(Config::load(&path).is_err());
}
