// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Resolution of container interfaces to their host-side veth peers.
//!
//! Every veth pair shares link indices across the namespace boundary: the
//! container-side interface's `iflink` is the host-side interface's
//! `ifindex`. Given a container ID, the resolver finds one of the container's
//! PIDs via the cgroup files under `/proc`, reads the interface list through
//! `/proc/<pid>/root/sys/class/net`, and matches each `iflink` against the
//! host's interfaces.
//!
//! All paths are taken relative to a configurable rootfs so the helper works
//! from inside a privileged container with the host root mounted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::debug;

/// Kubernetes reports container IDs as `containerd://abc...`,
/// `docker://abc...` or `cri-o://abc...`; cgroup paths carry the bare ID.
pub fn strip_runtime_prefix(id: &str) -> &str {
    id.find("://").map(|i| &id[i + 3..]).unwrap_or(id)
}

pub struct InterfaceResolver {
    rootfs: PathBuf,
}

impl InterfaceResolver {
    pub fn new(rootfs: impl Into<PathBuf>) -> Self {
        InterfaceResolver {
            rootfs: rootfs.into(),
        }
    }

    /// Map each of the container's interfaces (except `lo`) to the host-side
    /// interface name of its veth peer.
    pub fn node_interface_mapping(&self, container_id: &str) -> Result<HashMap<String, String>> {
        let container_id = strip_runtime_prefix(container_id);
        let pid = self
            .find_container_pid(container_id)
            .with_context(|| format!("find pid for container ({container_id})"))?;
        let host_by_ifindex = self.host_interfaces()?;

        let container_net = self
            .rootfs
            .join("proc")
            .join(pid.to_string())
            .join("root/sys/class/net");

        let mut mapping = HashMap::new();
        let entries = std::fs::read_dir(&container_net)
            .with_context(|| format!("read {}", container_net.display()))?;
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("skipping unreadable interface entry: {e}");
                    continue;
                }
            };
            let Some(name) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            if name == "lo" {
                continue;
            }

            let Some(iflink) = read_index_file(&entry.path().join("iflink")) else {
                continue;
            };
            if let Some(node_interface) = host_by_ifindex.get(&iflink) {
                mapping.insert(name, node_interface.clone());
            } else {
                debug!("no host interface with ifindex {iflink} for {name}");
            }
        }

        Ok(mapping)
    }

    /// Scan `<rootfs>/proc` for a process whose cgroup file mentions the
    /// container ID.
    fn find_container_pid(&self, container_id: &str) -> Result<u32> {
        let proc_dir = self.rootfs.join("proc");
        let entries = std::fs::read_dir(&proc_dir)
            .with_context(|| format!("read {}", proc_dir.display()))?;

        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            // Processes may exit mid-scan; unreadable cgroup files are skipped.
            let Ok(cgroup) = std::fs::read_to_string(entry.path().join("cgroup")) else {
                continue;
            };
            if cgroup.lines().any(|line| line.contains(container_id)) {
                return Ok(pid);
            }
        }

        bail!("no process found for container ({container_id})");
    }

    /// Host-side `ifindex -> interface name` from `<rootfs>/sys/class/net`.
    fn host_interfaces(&self) -> Result<HashMap<u32, String>> {
        let net_dir = self.rootfs.join("sys/class/net");
        let entries =
            std::fs::read_dir(&net_dir).with_context(|| format!("read {}", net_dir.display()))?;

        let mut interfaces = HashMap::new();
        for entry in entries.flatten() {
            let Some(name) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            if let Some(ifindex) = read_index_file(&entry.path().join("ifindex")) {
                interfaces.insert(ifindex, name);
            }
        }
        Ok(interfaces)
    }
}

fn read_index_file(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|contents| contents.trim().parse().ok())
}
