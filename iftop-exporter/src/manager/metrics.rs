// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Projection of task states into Prometheus gauges.
//!
//! Every tick the manager snapshots all live tasks and hands them here. The
//! gauge vectors are fully reset before re-population so that flows which
//! disappeared between rounds do not linger in the exposition.

use anyhow::Result;
use prometheus::{GaugeVec, Opts, Registry};

use crate::iftop::{FlowDirection, State};

const FLOW_LABELS: &[&str] = &["interface", "src", "dst", "direction", "type", "owner"];
const TOTAL_LABELS: &[&str] = &["interface", "direction", "owner"];

/// A task's state captured under the registry lock, together with the owner
/// label resolved from the dynamic interface info.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub state: State,
    pub owner: String,
}

pub struct ExporterMetrics {
    flow_last2: GaugeVec,
    flow_last10: GaugeVec,
    flow_last40: GaugeVec,
    flow_cumulative: GaugeVec,

    total_last2: GaugeVec,
    total_last10: GaugeVec,
    total_last40: GaugeVec,
    peak: GaugeVec,
    cumulative: GaugeVec,
}

fn flow_gauge(registry: &Registry, name: &str, help: &str) -> Result<GaugeVec> {
    let gauge = GaugeVec::new(Opts::new(name, help), FLOW_LABELS)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn total_gauge(registry: &Registry, name: &str, help: &str) -> Result<GaugeVec> {
    let gauge = GaugeVec::new(Opts::new(name, help), TOTAL_LABELS)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl ExporterMetrics {
    /// Create and register all gauge families with the registry.
    pub fn new(registry: &Registry) -> Result<Self> {
        Ok(ExporterMetrics {
            flow_last2: flow_gauge(
                registry,
                "iftop_flow_last2_speed_bps",
                "data transfer rate (bits per second) of the flow over the preceding 2 seconds",
            )?,
            flow_last10: flow_gauge(
                registry,
                "iftop_flow_last10_speed_bps",
                "data transfer rate (bits per second) of the flow over the preceding 10 seconds",
            )?,
            flow_last40: flow_gauge(
                registry,
                "iftop_flow_last40_speed_bps",
                "data transfer rate (bits per second) of the flow over the preceding 40 seconds",
            )?,
            flow_cumulative: flow_gauge(
                registry,
                "iftop_flow_cumulative_bytes",
                "cumulative bytes of the flow",
            )?,
            total_last2: total_gauge(
                registry,
                "iftop_total_last2_speed_bps",
                "data transfer rate (bits per second) of all flows over the preceding 2 seconds",
            )?,
            total_last10: total_gauge(
                registry,
                "iftop_total_last10_speed_bps",
                "data transfer rate (bits per second) of all flows over the preceding 10 seconds",
            )?,
            total_last40: total_gauge(
                registry,
                "iftop_total_last40_speed_bps",
                "data transfer rate (bits per second) of all flows over the preceding 40 seconds",
            )?,
            peak: total_gauge(
                registry,
                "iftop_peak_speed_bps",
                "the peak data transfer rate (bits per second) of all flows",
            )?,
            cumulative: total_gauge(
                registry,
                "iftop_cumulative_bytes",
                "the cumulative bytes of all flows",
            )?,
        })
    }

    /// Reset every family and re-emit from the given snapshots.
    ///
    /// An empty snapshot set leaves the previous exposition untouched.
    pub fn update(&self, snapshots: &[TaskSnapshot]) {
        if snapshots.is_empty() {
            return;
        }

        self.flow_last2.reset();
        self.flow_last10.reset();
        self.flow_last40.reset();
        self.flow_cumulative.reset();
        self.total_last2.reset();
        self.total_last10.reset();
        self.total_last40.reset();
        self.peak.reset();
        self.cumulative.reset();

        for snapshot in snapshots {
            let Some(stats) = &snapshot.state.flow_stats else {
                continue;
            };
            let interface = snapshot.state.interface.as_str();
            let owner = snapshot.owner.as_str();

            for flow in &stats.flows {
                if flow.src.is_empty() || flow.dst.is_empty() {
                    continue;
                }
                let labels = [
                    interface,
                    flow.src.as_str(),
                    flow.dst.as_str(),
                    flow.direction.as_str(),
                    flow.flow_type.as_str(),
                    owner,
                ];
                self.flow_last2
                    .with_label_values(&labels)
                    .set(flow.last2_rate_bits);
                self.flow_last10
                    .with_label_values(&labels)
                    .set(flow.last10_rate_bits);
                self.flow_last40
                    .with_label_values(&labels)
                    .set(flow.last40_rate_bits);
                self.flow_cumulative
                    .with_label_values(&labels)
                    .set(flow.cumulative_bytes);
            }

            let out = FlowDirection::Out.as_str();
            let r#in = FlowDirection::In.as_str();
            let x = FlowDirection::X.as_str();

            self.total_last2
                .with_label_values(&[interface, out, owner])
                .set(stats.total_sent_last2_rate_bits);
            self.total_last2
                .with_label_values(&[interface, r#in, owner])
                .set(stats.total_recv_last2_rate_bits);
            self.total_last2
                .with_label_values(&[interface, x, owner])
                .set(stats.total_sent_and_recv_last2_rate_bits);

            self.total_last10
                .with_label_values(&[interface, out, owner])
                .set(stats.total_sent_last10_rate_bits);
            self.total_last10
                .with_label_values(&[interface, r#in, owner])
                .set(stats.total_recv_last10_rate_bits);
            self.total_last10
                .with_label_values(&[interface, x, owner])
                .set(stats.total_sent_and_recv_last10_rate_bits);

            self.total_last40
                .with_label_values(&[interface, out, owner])
                .set(stats.total_sent_last40_rate_bits);
            self.total_last40
                .with_label_values(&[interface, r#in, owner])
                .set(stats.total_recv_last40_rate_bits);
            self.total_last40
                .with_label_values(&[interface, x, owner])
                .set(stats.total_sent_and_recv_last40_rate_bits);

            self.peak
                .with_label_values(&[interface, out, owner])
                .set(stats.peak_sent_rate_bits);
            self.peak
                .with_label_values(&[interface, r#in, owner])
                .set(stats.peak_recv_rate_bits);
            self.peak
                .with_label_values(&[interface, x, owner])
                .set(stats.peak_sent_and_recv_rate_bits);

            self.cumulative
                .with_label_values(&[interface, out, owner])
                .set(stats.cumulative_sent_bytes);
            self.cumulative
                .with_label_values(&[interface, r#in, owner])
                .set(stats.cumulative_recv_bytes);
            self.cumulative
                .with_label_values(&[interface, x, owner])
                .set(stats.cumulative_sent_and_recv_bytes);
        }
    }
}
