// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Lifecycle management of iftop tasks across static and dynamic interfaces.
//!
//! The manager owns a single registry (tasks, remove signals, dynamic
//! interface labels) guarded by one mutex. Per interface it runs a
//! supervision loop: spawn iftop, wait for exit, back off, respawn; a remove
//! signal terminates the current child and unregisters the interface.

pub mod metrics;
pub mod watcher;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use log::{debug, error, info, warn};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::iftop::{Options, SortBy, State, Task};
use crate::manager::metrics::{ExporterMetrics, TaskSnapshot};

/// Wait between iftop runs in continuous mode.
const CONTINUOUS_BACKOFF: Duration = Duration::from_secs(2);

/// Cadence of the metrics projection.
const METRICS_INTERVAL: Duration = Duration::from_secs(10);

/// How long `shutdown` waits for supervision loops to unregister.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub static_interfaces: Vec<String>,
    pub dynamic: bool,
    pub dynamic_dir: PathBuf,

    /// Continuous mode lets each iftop run until it exits on its own and
    /// respawns after a short fixed backoff. Periodic mode (the default)
    /// passes `-s duration` so each run produces exactly one report, then
    /// waits `interval` before the next run.
    pub continuous: bool,
    pub interval: Duration,
    pub duration: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            static_interfaces: Vec::new(),
            dynamic: false,
            dynamic_dir: PathBuf::from("/var/lib/iftop-exporter/dynamic"),
            continuous: false,
            interval: Duration::from_secs(10),
            duration: Duration::from_secs(3),
        }
    }
}

#[derive(Default)]
struct Registry {
    tasks: HashMap<String, Arc<Task>>,
    removers: HashMap<String, CancellationToken>,
    dynamic_labels: HashMap<String, HashMap<String, String>>,
}

pub struct Manager {
    config: ManagerConfig,
    registry: Mutex<Registry>,
    metrics: ExporterMetrics,
    shutdown: CancellationToken,
}

impl Manager {
    pub fn new(config: ManagerConfig, registry: &prometheus::Registry) -> Result<Self> {
        Ok(Manager {
            config,
            registry: Mutex::new(Registry::default()),
            metrics: ExporterMetrics::new(registry)?,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap()
    }

    pub fn is_static_interface(&self, interface: &str) -> bool {
        self.config
            .static_interfaces
            .iter()
            .any(|name| name == interface)
    }

    pub fn has_task(&self, interface: &str) -> bool {
        self.lock().tasks.contains_key(interface)
    }

    pub fn task_interfaces(&self) -> Vec<String> {
        self.lock().tasks.keys().cloned().collect()
    }

    pub fn dynamic_labels(&self, interface: &str) -> Option<HashMap<String, String>> {
        self.lock().dynamic_labels.get(interface).cloned()
    }

    pub fn set_dynamic_labels(&self, interface: &str, labels: HashMap<String, String>) {
        self.lock()
            .dynamic_labels
            .insert(interface.to_string(), labels);
    }

    /// Begin supervising an interface. A second `start` while its task is
    /// alive is a no-op.
    pub fn start(self: &Arc<Self>, interface: &str) {
        let manager = self.clone();
        let interface = interface.to_string();
        tokio::spawn(async move { manager.exec(interface).await });
    }

    /// Signal the interface's supervision loop to terminate the current child
    /// and unregister. Stopping an unknown interface is a no-op.
    pub fn stop(&self, interface: &str) {
        if let Some(token) = self.lock().removers.get(interface) {
            token.cancel();
        }
    }

    /// Fire every task's remove signal and wait (bounded) for the registry to
    /// drain.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for token in self.lock().removers.values() {
            token.cancel();
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
        while !self.lock().tasks.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                warn!("shutdown drain timeout reached, leaving remaining tasks behind");
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    /// Start static tasks, arm the dynamic watcher, then run the metrics loop
    /// until shutdown.
    pub async fn run(self: Arc<Self>) {
        info!("start: static interfaces ({})", self.config.static_interfaces.len());
        self.static_start();

        if self.config.dynamic {
            info!("dynamic enabled");
            let manager = self.clone();
            tokio::spawn(async move {
                // A watcher failure leaves static interfaces serving.
                if let Err(e) = watcher::watch(manager).await {
                    error!("dynamic directory watch failed: {e:#}");
                }
            });
        } else {
            info!("dynamic not enabled");
        }

        self.metrics_loop().await;
    }

    fn static_start(self: &Arc<Self>) {
        for interface in self.config.static_interfaces.clone() {
            self.start(&interface);
        }
    }

    fn new_task(&self, interface: &str) -> Task {
        let options = Options {
            interface: interface.to_string(),
            no_hostname_lookup: true,
            sort_by: Some(SortBy::Last2s),
            single_seconds: if self.config.continuous {
                0
            } else {
                self.config.duration.as_secs()
            },
            ..Default::default()
        };
        Task::new(options)
    }

    fn backoff(&self) -> Duration {
        if self.config.continuous {
            CONTINUOUS_BACKOFF
        } else {
            self.config.interval
        }
    }

    /// The per-interface supervision loop.
    ///
    /// The cached task pointer in the registry is what the metrics projector
    /// reads. In continuous mode it is replaced before each run so scrapes see
    /// the fresh state immediately; in periodic mode it is replaced only after
    /// a run exits, so scrapes keep seeing the last completed report while the
    /// next child accumulates.
    async fn exec(self: Arc<Self>, interface: String) {
        let token = CancellationToken::new();
        let mut current = Arc::new(self.new_task(&interface));

        {
            let mut registry = self.lock();
            if registry.tasks.contains_key(&interface) {
                info!("iftop task already there ({interface})");
                return;
            }
            registry.tasks.insert(interface.clone(), current.clone());
            registry.removers.insert(interface.clone(), token.clone());
        }

        loop {
            debug!("iftop task start ({interface}): {}", current.command_line());
            tokio::select! {
                result = current.run() => match result {
                    Ok(status) => debug!("iftop task exit ({interface}): {status}"),
                    Err(e) => warn!("iftop task failed ({interface}): {e:#}"),
                },
                _ = token.cancelled() => {
                    info!("remove task, try to kill iftop for interface ({interface})");
                    current.kill();
                    break;
                }
            }

            if !self.config.continuous {
                self.lock()
                    .tasks
                    .insert(interface.clone(), current.clone());
            }

            tokio::select! {
                _ = sleep(self.backoff()) => {}
                _ = token.cancelled() => {
                    // No child is running during backoff; kill is a no-op
                    // unless a straggler is still being reaped.
                    info!("remove task, try to kill iftop for interface ({interface})");
                    current.kill();
                    break;
                }
            }

            let next = Arc::new(self.new_task(&interface));
            if self.config.continuous {
                self.lock().tasks.insert(interface.clone(), next.clone());
            }
            current = next;
        }

        info!("remove iftop task ({interface})");
        let mut registry = self.lock();
        registry.tasks.remove(&interface);
        registry.removers.remove(&interface);
        registry.dynamic_labels.remove(&interface);
    }

    fn snapshots(&self) -> Vec<TaskSnapshot> {
        let registry = self.lock();
        registry
            .tasks
            .values()
            .map(|task| {
                let state: State = task.state();
                let owner = registry
                    .dynamic_labels
                    .get(&state.interface)
                    .and_then(|labels| labels.get("owner"))
                    .cloned()
                    .unwrap_or_default();
                TaskSnapshot { state, owner }
            })
            .collect()
    }

    async fn metrics_loop(&self) {
        let mut ticker = tokio::time::interval(METRICS_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshots = self.snapshots();
                    debug!("update metrics: found total ({}) iftop tasks", snapshots.len());
                    self.metrics.update(&snapshots);
                }
                _ = self.shutdown.cancelled() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager(config: ManagerConfig) -> Arc<Manager> {
        let registry = prometheus::Registry::new();
        Arc::new(Manager::new(config, &registry).unwrap())
    }

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            sleep(Duration::from_millis(25)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_start_registers_task_and_remover() {
        let manager = test_manager(ManagerConfig::default());
        manager.start("testif0");

        assert!(wait_until(|| manager.has_task("testif0")).await);
        let registry = manager.lock();
        assert!(registry.removers.contains_key("testif0"));
        assert_eq!(registry.tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_double_start_is_noop() {
        let manager = test_manager(ManagerConfig::default());
        manager.start("testif0");
        assert!(wait_until(|| manager.has_task("testif0")).await);

        manager.start("testif0");
        sleep(Duration::from_millis(100)).await;

        let registry = manager.lock();
        assert_eq!(registry.tasks.len(), 1);
        assert_eq!(registry.removers.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_unregisters_everything() {
        let manager = test_manager(ManagerConfig::default());
        manager.set_dynamic_labels("testif0", HashMap::from([("owner".into(), "ns/p".into())]));
        manager.start("testif0");
        assert!(wait_until(|| manager.has_task("testif0")).await);

        manager.stop("testif0");
        assert!(wait_until(|| !manager.has_task("testif0")).await);

        let registry = manager.lock();
        assert!(registry.tasks.is_empty());
        assert!(registry.removers.is_empty());
        assert!(registry.dynamic_labels.is_empty());
    }

    #[tokio::test]
    async fn test_stop_unknown_interface_is_noop() {
        let manager = test_manager(ManagerConfig::default());
        manager.stop("never-started");
    }

    #[tokio::test]
    async fn test_tasks_and_removers_stay_in_sync_across_cycles() {
        let manager = test_manager(ManagerConfig::default());
        for round in 0..3 {
            manager.start("testif0");
            assert!(wait_until(|| manager.has_task("testif0")).await, "round {round}");
            {
                let registry = manager.lock();
                let mut tasks: Vec<_> = registry.tasks.keys().cloned().collect();
                let mut removers: Vec<_> = registry.removers.keys().cloned().collect();
                tasks.sort();
                removers.sort();
                assert_eq!(tasks, removers);
            }
            manager.stop("testif0");
            assert!(wait_until(|| !manager.has_task("testif0")).await, "round {round}");
            assert!(manager.lock().removers.is_empty());
        }
    }

    #[tokio::test]
    async fn test_shutdown_drains_all_tasks() {
        let manager = test_manager(ManagerConfig::default());
        manager.start("testif0");
        manager.start("testif1");
        assert!(wait_until(|| manager.task_interfaces().len() == 2).await);

        manager.shutdown().await;
        assert!(manager.lock().tasks.is_empty());
    }

    #[tokio::test]
    async fn test_static_interfaces_start_on_run() {
        let config = ManagerConfig {
            static_interfaces: vec!["testif0".into(), "testif1".into()],
            ..Default::default()
        };
        let manager = test_manager(config);
        let runner = manager.clone();
        tokio::spawn(async move { runner.run().await });

        assert!(wait_until(|| manager.task_interfaces().len() == 2).await);
        manager.shutdown().await;
    }

    #[test]
    fn test_new_task_periodic_sets_single_seconds() {
        let manager = test_manager(ManagerConfig {
            continuous: false,
            duration: Duration::from_secs(3),
            ..Default::default()
        });
        let task = manager.new_task("eth0");
        assert!(task.command_line().contains("-s 3"));
        assert!(task.command_line().contains("-o 2s"));
        assert!(task.command_line().contains("-n"));
    }

    #[test]
    fn test_new_task_continuous_omits_single_seconds() {
        let manager = test_manager(ManagerConfig {
            continuous: true,
            ..Default::default()
        });
        assert!(!manager.new_task("eth0").command_line().contains("-s"));
    }

    #[test]
    fn test_backoff_by_mode() {
        let periodic = test_manager(ManagerConfig {
            interval: Duration::from_secs(30),
            ..Default::default()
        });
        assert_eq!(periodic.backoff(), Duration::from_secs(30));

        let continuous = test_manager(ManagerConfig {
            continuous: true,
            interval: Duration::from_secs(30),
            ..Default::default()
        });
        assert_eq!(continuous.backoff(), CONTINUOUS_BACKOFF);
    }

    #[tokio::test]
    async fn test_snapshot_owner_resolution() {
        let manager = test_manager(ManagerConfig::default());
        manager.set_dynamic_labels("", HashMap::from([("owner".into(), "ns/p".into())]));
        manager.start("testif0");
        assert!(wait_until(|| manager.has_task("testif0")).await);

        // The task never ran iftop, so its state.interface is still empty and
        // resolves against the "" labels entry.
        let snapshots = manager.snapshots();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].owner, "ns/p");

        manager.stop("testif0");
    }
}
