// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Pod reconciliation: publish interface info files for matching pods.
//!
//! For every selected pod that is Running (or already Terminating) on this
//! node, each container interface is resolved to its host-side veth and one
//! JSON file per veth is written into the dynamic directory. The exporter
//! watches that directory and starts/stops iftop tasks accordingly. On pod
//! deletion the files written for that pod are removed again.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use futures::StreamExt;
use futures::stream::select_all;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::interfaces::InterfaceResolver;
use crate::selector::Selectors;

/// On-disk contract with the exporter: one file per node-side interface,
/// named after it.
#[derive(Debug, Clone, Serialize)]
pub struct InterfaceInfo {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub owner: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub container_interface_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub node_interface_name: String,
}

pub struct PodReconciler {
    resolver: InterfaceResolver,
    selectors: Selectors,
    dynamic_dir: PathBuf,
    node_name: String,

    /// Node interfaces written per pod key, cleaned up when the pod goes
    /// away. A registered pod is not reprocessed on later events.
    registered: HashMap<String, Vec<String>>,
}

fn pod_key(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or_default(),
        pod.metadata.name.as_deref().unwrap_or_default()
    )
}

fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .unwrap_or_default()
}

fn pod_node_name(pod: &Pod) -> &str {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.node_name.as_deref())
        .unwrap_or_default()
}

fn pod_container_id(pod: &Pod) -> Option<&str> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .filter_map(|status| status.container_id.as_deref())
        .find(|id| !id.is_empty())
}

impl PodReconciler {
    pub fn new(
        resolver: InterfaceResolver,
        selectors: Selectors,
        dynamic_dir: impl Into<PathBuf>,
        node_name: String,
    ) -> Self {
        PodReconciler {
            resolver,
            selectors,
            dynamic_dir: dynamic_dir.into(),
            node_name,
            registered: HashMap::new(),
        }
    }

    /// Handle an applied (created/updated/listed) pod.
    pub fn observe_pod(&mut self, pod: &Pod) -> Result<()> {
        let key = pod_key(pod);

        let labels = pod.metadata.labels.clone().unwrap_or_default();
        if !self.selectors.matches(&labels) {
            debug!(pod = %key, "pod ignored");
            return Ok(());
        }

        if pod.metadata.deletion_timestamp.is_some() {
            info!(pod = %key, "pod deleting");
            self.clean_interfaces(&key);
            return Ok(());
        }

        if self.registered.contains_key(&key) {
            debug!(pod = %key, "pod already handled");
            return Ok(());
        }

        if pod_phase(pod) != "Running" {
            debug!(pod = %key, phase = pod_phase(pod), "pod not running");
            return Ok(());
        }

        if pod_node_name(pod) != self.node_name {
            debug!(pod = %key, "pod not on this node");
            return Ok(());
        }

        self.set_interfaces(&key, pod)
    }

    /// Handle a deleted pod.
    pub fn observe_deleted(&mut self, pod: &Pod) {
        let key = pod_key(pod);
        info!(pod = %key, "pod deleted");
        self.clean_interfaces(&key);
    }

    fn set_interfaces(&mut self, key: &str, pod: &Pod) -> Result<()> {
        let Some(container_id) = pod_container_id(pod) else {
            debug!(pod = %key, "pod has no container id yet");
            return Ok(());
        };

        let mapping = self
            .resolver
            .node_interface_mapping(container_id)
            .with_context(|| format!("pod ({key}) resolve container interfaces"))?;
        if mapping.is_empty() {
            debug!(pod = %key, "no container interfaces resolved");
            return Ok(());
        }

        let mut written = Vec::new();
        for (container_interface, node_interface) in mapping {
            let info = InterfaceInfo {
                owner: key.to_string(),
                container_interface_name: container_interface,
                node_interface_name: node_interface.clone(),
            };
            let path = self.dynamic_dir.join(&node_interface);
            write_interface_info(&path, &info)
                .with_context(|| format!("pod ({key}) write interface info file"))?;
            info!(pod = %key, file = %path.display(), "write file succeeded");
            written.push(node_interface);
        }

        self.registered.insert(key.to_string(), written);
        Ok(())
    }

    /// Remove every file written for the pod. Removal failures are logged;
    /// the next event retries nothing for already-forgotten pods, matching
    /// the exporter's tolerance of stale stop signals.
    fn clean_interfaces(&mut self, key: &str) {
        let Some(interfaces) = self.registered.remove(key) else {
            return;
        };

        for interface in interfaces {
            let path = self.dynamic_dir.join(&interface);
            match std::fs::remove_file(&path) {
                Ok(()) => info!(pod = %key, file = %path.display(), "removed interface info file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(pod = %key, file = %path.display(), "remove failed: {e}"),
            }
        }
    }

    #[cfg(test)]
    fn registered_interfaces(&self, key: &str) -> Option<&Vec<String>> {
        self.registered.get(key)
    }
}

fn write_interface_info(path: &std::path::Path, info: &InterfaceInfo) -> Result<()> {
    let mut contents = serde_json::to_string_pretty(info)?;
    contents.push('\n');
    std::fs::write(path, contents)?;
    // The exporter may run under a different uid.
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))?;
    Ok(())
}

/// Watch pods (cluster-wide or per namespace) and feed the reconciler until
/// the stream ends.
pub async fn run(client: Client, namespaces: &[String], mut reconciler: PodReconciler) -> Result<()> {
    let apis: Vec<Api<Pod>> = if namespaces.is_empty() {
        vec![Api::all(client)]
    } else {
        namespaces
            .iter()
            .map(|namespace| Api::namespaced(client.clone(), namespace))
            .collect()
    };

    let config = watcher::Config::default().any_semantic();
    let streams = apis
        .into_iter()
        .map(|api| watcher::watcher(api, config.clone()).boxed());
    let mut events = select_all(streams);

    info!(node = %reconciler.node_name, "pod reconciliation started");
    while let Some(event) = events.next().await {
        match event {
            Ok(Event::Apply(pod)) | Ok(Event::InitApply(pod)) => {
                let key = pod_key(&pod);
                if let Err(e) = reconciler.observe_pod(&pod) {
                    warn!(pod = %key, "reconcile failed: {e:#}");
                }
            }
            Ok(Event::Delete(pod)) => reconciler.observe_deleted(&pod),
            Ok(Event::Init | Event::InitDone) => {}
            Err(e) => warn!("watch error, stream will retry: {e}"),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerStatus, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::collections::BTreeMap;

    const CONTAINER_ID: &str = "0123456789abcdef0123456789abcdef";

    fn fake_rootfs() -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();

        let proc_dir = root.path().join("proc/4242");
        std::fs::create_dir_all(&proc_dir).unwrap();
        std::fs::write(
            proc_dir.join("cgroup"),
            format!("0::/kubepods/podx/{CONTAINER_ID}\n"),
        )
        .unwrap();

        let eth0 = root.path().join("proc/4242/root/sys/class/net/eth0");
        std::fs::create_dir_all(&eth0).unwrap();
        std::fs::write(eth0.join("iflink"), "7").unwrap();

        let veth = root.path().join("sys/class/net/vethABC");
        std::fs::create_dir_all(&veth).unwrap();
        std::fs::write(veth.join("ifindex"), "7").unwrap();

        root
    }

    fn running_pod(namespace: &str, name: &str, labels: &[(&str, &str)], node: &str) -> Pod {
        let labels: BTreeMap<String, String> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Pod {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node.to_string()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                container_statuses: Some(vec![ContainerStatus {
                    container_id: Some(format!("containerd://{CONTAINER_ID}")),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    fn reconciler(
        rootfs: &std::path::Path,
        dynamic_dir: &std::path::Path,
        selectors: &[&str],
    ) -> PodReconciler {
        let inputs: Vec<String> = selectors.iter().map(|s| s.to_string()).collect();
        PodReconciler::new(
            InterfaceResolver::new(rootfs),
            Selectors::parse_all(&inputs).unwrap(),
            dynamic_dir,
            "node-1".to_string(),
        )
    }

    #[test]
    fn test_matching_pod_writes_interface_info() {
        let rootfs = fake_rootfs();
        let dynamic_dir = tempfile::tempdir().unwrap();
        let mut reconciler = reconciler(rootfs.path(), dynamic_dir.path(), &["web:app==nginx"]);

        let pod = running_pod("ns", "p", &[("app", "nginx")], "node-1");
        reconciler.observe_pod(&pod).unwrap();

        let file = dynamic_dir.path().join("vethABC");
        assert!(file.is_file());
        let contents = std::fs::read_to_string(&file).unwrap();
        assert!(contents.ends_with('\n'), "trailing newline required");
        let decoded: HashMap<String, String> = serde_json::from_str(&contents).unwrap();
        assert_eq!(decoded["owner"], "ns/p");
        assert_eq!(decoded["container_interface_name"], "eth0");
        assert_eq!(decoded["node_interface_name"], "vethABC");

        let mode = std::fs::metadata(&file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o666);

        assert_eq!(
            reconciler.registered_interfaces("ns/p"),
            Some(&vec!["vethABC".to_string()])
        );
    }

    #[test]
    fn test_non_matching_pod_is_ignored() {
        let rootfs = fake_rootfs();
        let dynamic_dir = tempfile::tempdir().unwrap();
        let mut reconciler = reconciler(rootfs.path(), dynamic_dir.path(), &["web:app==nginx"]);

        let pod = running_pod("ns", "p", &[("app", "redis")], "node-1");
        reconciler.observe_pod(&pod).unwrap();

        assert!(std::fs::read_dir(dynamic_dir.path()).unwrap().next().is_none());
        assert!(reconciler.registered_interfaces("ns/p").is_none());
    }

    #[test]
    fn test_pod_on_other_node_is_ignored() {
        let rootfs = fake_rootfs();
        let dynamic_dir = tempfile::tempdir().unwrap();
        let mut reconciler = reconciler(rootfs.path(), dynamic_dir.path(), &["web:app"]);

        let pod = running_pod("ns", "p", &[("app", "nginx")], "node-2");
        reconciler.observe_pod(&pod).unwrap();

        assert!(reconciler.registered_interfaces("ns/p").is_none());
    }

    #[test]
    fn test_pending_pod_is_ignored() {
        let rootfs = fake_rootfs();
        let dynamic_dir = tempfile::tempdir().unwrap();
        let mut reconciler = reconciler(rootfs.path(), dynamic_dir.path(), &["web:app"]);

        let mut pod = running_pod("ns", "p", &[("app", "nginx")], "node-1");
        pod.status.as_mut().unwrap().phase = Some("Pending".to_string());
        reconciler.observe_pod(&pod).unwrap();

        assert!(reconciler.registered_interfaces("ns/p").is_none());
    }

    #[test]
    fn test_registered_pod_is_not_reprocessed() {
        let rootfs = fake_rootfs();
        let dynamic_dir = tempfile::tempdir().unwrap();
        let mut reconciler = reconciler(rootfs.path(), dynamic_dir.path(), &["web:app"]);

        let pod = running_pod("ns", "p", &[("app", "nginx")], "node-1");
        reconciler.observe_pod(&pod).unwrap();

        // Delete the file out from under the reconciler; a repeat event must
        // not rewrite it (the pod is memoized).
        std::fs::remove_file(dynamic_dir.path().join("vethABC")).unwrap();
        reconciler.observe_pod(&pod).unwrap();
        assert!(!dynamic_dir.path().join("vethABC").exists());
    }

    #[test]
    fn test_terminating_pod_cleans_files() {
        let rootfs = fake_rootfs();
        let dynamic_dir = tempfile::tempdir().unwrap();
        let mut reconciler = reconciler(rootfs.path(), dynamic_dir.path(), &["web:app"]);

        let mut pod = running_pod("ns", "p", &[("app", "nginx")], "node-1");
        reconciler.observe_pod(&pod).unwrap();
        assert!(dynamic_dir.path().join("vethABC").is_file());

        pod.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
        reconciler.observe_pod(&pod).unwrap();

        assert!(!dynamic_dir.path().join("vethABC").exists());
        assert!(reconciler.registered_interfaces("ns/p").is_none());
    }

    #[test]
    fn test_delete_event_cleans_files() {
        let rootfs = fake_rootfs();
        let dynamic_dir = tempfile::tempdir().unwrap();
        let mut reconciler = reconciler(rootfs.path(), dynamic_dir.path(), &["web:app"]);

        let pod = running_pod("ns", "p", &[("app", "nginx")], "node-1");
        reconciler.observe_pod(&pod).unwrap();
        reconciler.observe_deleted(&pod);

        assert!(!dynamic_dir.path().join("vethABC").exists());
        // A second delete is a no-op.
        reconciler.observe_deleted(&pod);
    }

    #[test]
    fn test_pod_without_container_id_is_skipped() {
        let rootfs = fake_rootfs();
        let dynamic_dir = tempfile::tempdir().unwrap();
        let mut reconciler = reconciler(rootfs.path(), dynamic_dir.path(), &["web:app"]);

        let mut pod = running_pod("ns", "p", &[("app", "nginx")], "node-1");
        pod.status.as_mut().unwrap().container_statuses = Some(vec![]);
        reconciler.observe_pod(&pod).unwrap();
        assert!(reconciler.registered_interfaces("ns/p").is_none());
    }

    #[test]
    fn test_unresolvable_container_is_an_error() {
        let rootfs = fake_rootfs();
        let dynamic_dir = tempfile::tempdir().unwrap();
        let mut reconciler = reconciler(rootfs.path(), dynamic_dir.path(), &["web:app"]);

        let mut pod = running_pod("ns", "p", &[("app", "nginx")], "node-1");
        pod.status.as_mut().unwrap().container_statuses = Some(vec![ContainerStatus {
            container_id: Some("containerd://not-there".to_string()),
            ..Default::default()
        }]);
        assert!(reconciler.observe_pod(&pod).is_err());
        // Not registered, so the next event retries.
        assert!(reconciler.registered_interfaces("ns/p").is_none());
    }
}
