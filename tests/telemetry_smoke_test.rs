//! Smoke test for OTLP export while a dispatcher runs.
//!
//! Requires an OTLP collector listening on `OTEL_ENDPOINT`
//! (default `http://localhost:4317`).
//!
//! Run with:
//! ```sh
//! cargo test --test telemetry_smoke_test -- --ignored --nocapture
//! ```

use std::time::Duration;

use dispatch_rs::dispatcher::Dispatcher;
use dispatch_rs::telemetry::{TelemetryConfig, init_telemetry};

#[test]
#[ignore] // Requires a running OTLP collector
fn smoke_dispatch_run_exports() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let endpoint = std::env::var("OTEL_ENDPOINT")
            .unwrap_or_else(|_| "http://localhost:4317".to_string());
        let guard = init_telemetry(TelemetryConfig {
            endpoint: Some(endpoint),
            service_name: "dispatch-smoke-test".to_string(),
            log_level: "debug".to_string(),
        })
        .expect("failed to init telemetry");

        let summary = tokio::task::spawn_blocking(|| {
            let dispatcher = Dispatcher::<u32>::new(
                |d, _, value, _| {
                    if *value < 200 {
                        d.push(value + 1);
                    }
                    Ok(())
                },
                5,
            )
            .unwrap();
            dispatcher.push(1);
            dispatcher.start(3).unwrap();
            dispatcher.wait_for_completion()
        })
        .await
        .unwrap()
        .expect("dispatcher was started");
        assert_eq!(summary.processed, 200);

        guard.force_flush();
        tokio::time::sleep(Duration::from_secs(2)).await;
    });
}
