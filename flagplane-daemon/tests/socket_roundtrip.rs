//! Runs the daemon in-process against a temp HOME and drives it through the
//! blocking socket client.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, Instant};

use flagplane_core::config::DaemonConfig;
use flagplane_daemon::{
    request_flags, request_reload, request_resolve, request_status, request_stop, watch,
};
use serde_json::{json, Value};
use tempfile::TempDir;

const BASE: &str = r##"{
  "flags": {
    "headerColor": {"state": "ENABLED", "variants": {"red": "#CC0000", "blue": "#0000CC"}, "defaultVariant": "red"}
  }
}"##;

const CHECKOUT_YAML: &str = "\
metadata:
  flagSetId: checkout
flags:
  express-pay:
    state: ENABLED
    defaultVariant: \"off\"
    variants:
      \"on\": true
      \"off\": false
";

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(50));
    }
    false
}

fn subscribers(home: &Path) -> u64 {
    request_status(home)
        .ok()
        .and_then(|status| status["subscribers"].as_u64())
        .unwrap_or(0)
}

struct Setup {
    home: TempDir,
    _flags_dir: TempDir,
    base: PathBuf,
    checkout: PathBuf,
}

fn setup() -> (Setup, DaemonConfig) {
    let home = TempDir::new().expect("home");
    let flags_dir = TempDir::new().expect("flags dir");
    let base = flags_dir.path().join("base.json");
    let checkout = flags_dir.path().join("checkout.yaml");
    fs::write(&base, BASE).expect("write base");
    fs::write(&checkout, CHECKOUT_YAML).expect("write checkout");

    let config = DaemonConfig {
        debounce_ms: 50,
        ..DaemonConfig::default()
    }
    .with_extra_sources([base.clone(), checkout.clone()]);

    (
        Setup {
            home,
            _flags_dir: flags_dir,
            base,
            checkout,
        },
        config,
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn daemon_answers_resolve_flags_and_streams_watch_updates() {
    let (setup, config) = setup();
    let home = setup.home.path().to_path_buf();
    let daemon = tokio::spawn(flagplane_daemon::run(home.clone(), config));

    let client_home = home.clone();
    let base_id = setup.base.display().to_string();
    let checkout_id = setup.checkout.display().to_string();
    let base_path = setup.base.clone();

    tokio::task::spawn_blocking(move || {
        let home = client_home.as_path();
        assert!(
            wait_until(Duration::from_secs(5), || request_status(home).is_ok()),
            "daemon did not start listening in time"
        );

        let status = request_status(home).expect("status");
        assert_eq!(status["running"], json!(true));
        assert_eq!(
            status["sources_metadata"],
            json!(format!("{base_id},{checkout_id}"))
        );

        // resolve: sentinel scope and explicit flag-set
        let color = request_resolve(home, "headerColor", None, Some("string".into()))
            .expect("resolve headerColor");
        assert_eq!(color["value"], json!("#CC0000"));
        let express = request_resolve(home, "express-pay", Some("checkout".into()), None)
            .expect("resolve express-pay");
        assert_eq!(express["value"], json!(false));
        let err = request_resolve(home, "express-pay", None, None).unwrap_err();
        assert!(err.to_string().contains("FLAG_NOT_FOUND"), "got: {err}");

        // flags: per-source cache and unknown source
        let checkout_flags = request_flags(home, Some(checkout_id.clone())).expect("flags");
        assert_eq!(checkout_flags["metadata"], json!({"flagSetId": "checkout"}));
        assert!(checkout_flags["flags"].get("headerColor").is_none());
        assert!(request_flags(home, Some("nowhere.json".into())).is_err());

        // watch: initial snapshot, then one after an edit
        let watch_home = home.to_path_buf();
        let watcher = std::thread::spawn(move || {
            let mut snapshots: Vec<Value> = Vec::new();
            watch(&watch_home, None, |snapshot| {
                snapshots.push(snapshot);
                snapshots.len() < 2
            })
            .expect("watch");
            snapshots
        });
        assert!(
            wait_until(Duration::from_secs(5), || subscribers(home) == 1),
            "watch subscriber was not registered"
        );

        fs::write(&base_path, BASE.replace("\"red\"}", "\"blue\"}")).expect("edit base");
        // Either the file watcher or this explicit reload applies the edit;
        // content hashing keeps the second one from publishing again.
        request_reload(home, Some(base_id.clone())).expect("reload");

        let snapshots = watcher.join().expect("watch thread");
        assert_eq!(snapshots.len(), 2);
        assert_eq!(
            snapshots[0]["flags"]["headerColor"]["defaultVariant"],
            json!("red")
        );
        assert_eq!(
            snapshots[1]["flags"]["headerColor"]["defaultVariant"],
            json!("blue")
        );

        assert!(
            wait_until(Duration::from_secs(5), || subscribers(home) == 0),
            "closed watch stream was not unregistered"
        );

        request_stop(home).expect("stop");
    })
    .await
    .expect("client thread");

    let result = tokio::time::timeout(Duration::from_secs(5), daemon)
        .await
        .expect("daemon exits after stop")
        .expect("join");
    assert!(result.is_ok(), "daemon returned error: {result:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn removing_a_source_file_drops_its_flags() {
    let (setup, config) = setup();
    let home = setup.home.path().to_path_buf();
    let daemon = tokio::spawn(flagplane_daemon::run(home.clone(), config));
    let checkout = setup.checkout.clone();
    let checkout_id = checkout.display().to_string();

    tokio::task::spawn_blocking(move || {
        let home = home.as_path();
        assert!(wait_until(Duration::from_secs(5), || request_status(home).is_ok()));
        assert!(request_resolve(home, "express-pay", Some("checkout".into()), None).is_ok());

        fs::remove_file(&checkout).expect("remove checkout");
        let summary = request_reload(home, Some(checkout_id.clone())).expect("reload");
        let summaries = summary.as_array().expect("summaries");
        assert!(summaries.iter().all(|s| s["missing"] == json!(true)));
        let deleted: u64 = summaries
            .iter()
            .filter_map(|s| s["deleted"].as_u64())
            .sum();
        // The file watcher may already have applied the removal.
        assert!(deleted <= 1);

        let err = request_resolve(home, "express-pay", Some("checkout".into()), None).unwrap_err();
        assert!(err.to_string().contains("FLAG_NOT_FOUND"), "got: {err}");
        let cached = request_flags(home, Some(checkout_id)).expect("flags");
        assert_eq!(cached, json!({"flags": {}, "metadata": {}}));

        request_stop(home).expect("stop");
    })
    .await
    .expect("client thread");

    let result = tokio::time::timeout(Duration::from_secs(5), daemon)
        .await
        .expect("daemon exits after stop")
        .expect("join");
    assert!(result.is_ok(), "daemon returned error: {result:?}");
}
