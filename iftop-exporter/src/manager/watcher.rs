// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Dynamic interface discovery through the shared directory.
//!
//! The helper writes one JSON label file per host-side interface into the
//! dynamic directory; this watcher turns those files into task start/stop
//! calls. The `.watching` sentinel tells the helper that events are being
//! consumed from here on.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use nix::net::if_::if_nametoindex;
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::manager::Manager;

/// Sentinel created once the watcher is armed; the helper waits for it.
pub const WATCHING_FILE: &str = ".watching";

/// Watch the dynamic directory and drive `start`/`stop` from file events.
///
/// Returns only on watcher failure; static interfaces are unaffected.
pub async fn watch(manager: Arc<Manager>) -> Result<()> {
    let dir = manager.config().dynamic_dir.clone();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create dynamic directory ({})", dir.display()))?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
        // The receiver side only goes away when the watch task dies.
        let _ = tx.send(event);
    })
    .context("create watcher")?;
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("watch dynamic directory ({})", dir.display()))?;

    // Created after the watch is armed so the helper cannot write into a
    // window where events would be lost.
    let sentinel = dir.join(WATCHING_FILE);
    std::fs::write(&sentinel, b"")
        .with_context(|| format!("create watching file ({})", sentinel.display()))?;
    info!("start watch dynamic dir ({})", dir.display());

    while let Some(event) = rx.recv().await {
        match event {
            Ok(event) => handle_event(&manager, &event),
            Err(e) => error!("watch error: {e}"),
        }
    }

    Ok(())
}

fn handle_event(manager: &Arc<Manager>, event: &Event) {
    for path in &event.paths {
        let Some(interface) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };

        if interface == WATCHING_FILE {
            continue;
        }
        if manager.is_static_interface(interface) {
            debug!("watch ignored static interface ({interface})");
            continue;
        }

        match event.kind {
            // Create, data write and metadata change all mean "the label file
            // is (or may now be) readable"; some filesystems collapse the
            // create into a bare chmod.
            EventKind::Create(_)
            | EventKind::Modify(
                ModifyKind::Data(_) | ModifyKind::Metadata(_) | ModifyKind::Any | ModifyKind::Other,
            ) => {
                handle_upsert(manager, path, interface);
            }
            EventKind::Remove(_) => {
                info!("stop iftop task for interface ({interface})");
                manager.stop(interface);
            }
            _ => {}
        }
    }
}

fn handle_upsert(manager: &Arc<Manager>, path: &Path, interface: &str) {
    // The label file can arrive before the veth does; skip and wait for the
    // next event.
    if let Err(e) = if_nametoindex(interface) {
        info!("interface ignored, not found link for interface ({interface}): {e}");
        return;
    }

    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!("read file failed for interface ({interface}): {e}");
            return;
        }
    };

    let labels: HashMap<String, String> = match serde_json::from_str(&contents) {
        Ok(labels) => labels,
        Err(e) => {
            warn!("json unmarshal failed for interface ({interface}): {e}");
            return;
        }
    };

    manager.set_dynamic_labels(interface, labels.clone());

    let owner = labels.get("owner").map(String::as_str).unwrap_or_default();
    info!("try to start iftop for interface ({interface}, {owner})");
    manager.start(interface);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerConfig;
    use notify::event::{CreateKind, RemoveKind};
    use std::io::Write;

    fn test_manager(config: ManagerConfig) -> Arc<Manager> {
        let registry = prometheus::Registry::new();
        Arc::new(Manager::new(config, &registry).unwrap())
    }

    fn create_event(path: &Path) -> Event {
        Event::new(EventKind::Create(CreateKind::File)).add_path(path.to_path_buf())
    }

    #[tokio::test]
    async fn test_upsert_event_for_missing_link_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("definitely-no-such-if0");
        std::fs::write(&path, "{}").unwrap();

        let manager = test_manager(ManagerConfig::default());
        handle_event(&manager, &create_event(&path));

        assert!(!manager.has_task("definitely-no-such-if0"));
    }

    #[tokio::test]
    async fn test_upsert_event_starts_task_for_existing_link() {
        // The loopback interface exists everywhere this test runs.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lo");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(br#"{"owner": "ns/pod", "node_interface_name": "lo"}"#)
            .unwrap();

        let manager = test_manager(ManagerConfig::default());
        handle_event(&manager, &create_event(&path));

        let labels = manager.dynamic_labels("lo").expect("labels stored");
        assert_eq!(labels["owner"], "ns/pod");

        // The task registers asynchronously.
        for _ in 0..100 {
            if manager.has_task("lo") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(manager.has_task("lo"));
        manager.stop("lo");
    }

    #[tokio::test]
    async fn test_malformed_json_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lo");
        std::fs::write(&path, "not json").unwrap();

        let manager = test_manager(ManagerConfig::default());
        handle_event(&manager, &create_event(&path));

        assert!(manager.dynamic_labels("lo").is_none());
        assert!(!manager.has_task("lo"));
    }

    #[tokio::test]
    async fn test_watching_sentinel_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(WATCHING_FILE);
        std::fs::write(&path, "").unwrap();

        let manager = test_manager(ManagerConfig::default());
        handle_event(&manager, &create_event(&path));

        assert!(manager.task_interfaces().is_empty());
    }

    #[tokio::test]
    async fn test_static_interface_names_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lo");
        std::fs::write(&path, r#"{"owner": "ns/pod"}"#).unwrap();

        let manager = test_manager(ManagerConfig {
            static_interfaces: vec!["lo".to_string()],
            ..Default::default()
        });
        handle_event(&manager, &create_event(&path));

        assert!(manager.dynamic_labels("lo").is_none());
        assert!(!manager.has_task("lo"));
    }

    #[tokio::test]
    async fn test_remove_event_stops_task() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lo");
        std::fs::write(&path, r#"{"owner": "ns/pod"}"#).unwrap();

        let manager = test_manager(ManagerConfig::default());
        handle_event(&manager, &create_event(&path));
        for _ in 0..100 {
            if manager.has_task("lo") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(manager.has_task("lo"));

        let remove = Event::new(EventKind::Remove(RemoveKind::File)).add_path(path.clone());
        handle_event(&manager, &remove);
        for _ in 0..100 {
            if !manager.has_task("lo") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!manager.has_task("lo"));
        assert!(manager.dynamic_labels("lo").is_none());
    }
}
