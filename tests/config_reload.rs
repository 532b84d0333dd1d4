use std::sync::mpsc;
use std::time::Duration;

use tempfile::TempDir;

use timelapse_kernel::{status, ConfigPatch, ConfigStore, ConfigWatcher, StatusEvent, TimeOfDay};

#[test]
fn external_edit_reaches_the_update_queue() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("timelapse.toml");
    let (status_tx, status_rx) = status::channel();
    let store = ConfigStore::open(&path)
        .expect("open store")
        .with_status(status_tx);
    let (updates_tx, updates_rx) = mpsc::channel();
    let watcher = ConfigWatcher::new(store, updates_tx)
        .with_debounce(Duration::from_millis(200))
        .spawn()
        .expect("spawn watcher");

    // what `timelapsed set --cutoff 21:30` does
    std::thread::sleep(Duration::from_millis(50));
    let mut editor = ConfigStore::open(&path).expect("second store");
    editor
        .update(&ConfigPatch {
            video_cutoff: Some(TimeOfDay::from_hm(21, 30).unwrap()),
            ..ConfigPatch::default()
        })
        .expect("update");

    let config = updates_rx
        .recv_timeout(Duration::from_secs(3))
        .expect("reloaded config");
    assert_eq!(config.video_cutoff.to_string(), "21:30");
    assert_eq!(
        status_rx.recv_timeout(Duration::from_secs(1)),
        Some(StatusEvent::ConfigChanged)
    );

    watcher.stop().expect("stop watcher");
}

#[test]
fn broken_edit_falls_back_to_defaults_on_disk() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("timelapse.toml");
    let store = ConfigStore::open(&path).expect("open store");
    let (updates_tx, updates_rx) = mpsc::channel();
    let watcher = ConfigWatcher::new(store, updates_tx)
        .with_debounce(Duration::from_millis(200))
        .spawn()
        .expect("spawn watcher");

    std::thread::sleep(Duration::from_millis(50));
    std::fs::write(
        &path,
        "work_start = \"09:00\"\ncapture_interval = \"soon\"\ncamera = \"north\"\n",
    )
    .expect("write");

    let config = updates_rx
        .recv_timeout(Duration::from_secs(3))
        .expect("reloaded config");
    assert_eq!(config.work_start.to_string(), "07:00");
    assert_eq!(config.capture_interval, Duration::from_secs(15));

    let on_disk: toml::Table =
        toml::from_str(&std::fs::read_to_string(&path).expect("read back")).expect("toml");
    assert_eq!(on_disk["capture_interval"].as_integer(), Some(15));
    assert_eq!(on_disk["camera"].as_str(), Some("north"));

    watcher.stop().expect("stop watcher");
}
