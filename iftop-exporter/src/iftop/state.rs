// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! The flow-state machine: turns stripped `iftop` report lines into a
//! [`State`] value.
//!
//! One `iftop -t` report round runs from the `index == 1` flow line through
//! the closing `Cumulative (sent/received/total):` line. The machine
//! accumulates the round into a pending [`FlowStats`] and publishes it into
//! the shared state only when the round closes, so a reader never observes a
//! half-parsed round.

use std::sync::{Arc, LazyLock, Mutex};

use regex::Regex;
use serde::Serialize;

use crate::iftop::addr::{extract_ip, is_private_ip};
use crate::iftop::values::{parse_value_to_bits, parse_value_to_bytes};

//    1 10.0.10.201:36674     =>     7.52Kb     7.52Kb     7.52Kb     1.88KB
static FLOW_OUT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?P<index>\d+)\s*(?P<addr>\S+)\s*=>\s*(?P<last2>\S+)\s*(?P<last10>\S+)\s*(?P<last40>\S+)\s*(?P<cumulative>\S+)",
    )
    .expect("static pattern")
});

//      10.0.10.204:http      <=     7.19Mb     7.19Mb     7.19Mb     1.80MB
static FLOW_IN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?P<addr>\S+)\s*<=\s*(?P<last2>\S+)\s*(?P<last10>\S+)\s*(?P<last40>\S+)\s*(?P<cumulative>\S+)",
    )
    .expect("static pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowDirection {
    /// src => dst
    Out,
    /// src <= dst
    In,
    /// src <=> dst, aggregated both ways
    X,
}

impl FlowDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            FlowDirection::Out => "out",
            FlowDirection::In => "in",
            FlowDirection::X => "x",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowType {
    Public,
    Private,
}

impl FlowType {
    pub fn as_str(self) -> &'static str {
        match self {
            FlowType::Public => "public",
            FlowType::Private => "private",
        }
    }
}

/// One directed host pair observed during a report window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Flow {
    pub index: u64,
    pub src: String,
    pub dst: String,
    pub direction: FlowDirection,
    pub flow_type: FlowType,

    /// bits per second
    pub last2_rate_bits: f64,
    /// bits per second
    pub last10_rate_bits: f64,
    /// bits per second
    pub last40_rate_bits: f64,
    /// bytes
    pub cumulative_bytes: f64,
}

impl Flow {
    fn synthetic(direction: FlowDirection, flow_type: FlowType) -> Self {
        Flow {
            index: 0,
            src: "all".to_string(),
            dst: "all".to_string(),
            direction,
            flow_type,
            last2_rate_bits: 0.0,
            last10_rate_bits: 0.0,
            last40_rate_bits: 0.0,
            cumulative_bytes: 0.0,
        }
    }

    fn add(&mut self, other: &Flow) {
        self.last2_rate_bits += other.last2_rate_bits;
        self.last10_rate_bits += other.last10_rate_bits;
        self.last40_rate_bits += other.last40_rate_bits;
        self.cumulative_bytes += other.cumulative_bytes;
    }
}

/// One complete report round: ordered flows plus the report footer.
///
/// Flows are appended as `out` then `in` pairs in emission order, followed by
/// four synthetic `all` aggregates (public/private x out/in) when the round
/// saw at least one real flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlowStats {
    pub flows: Vec<Flow>,

    /// bits per second
    pub total_sent_last2_rate_bits: f64,
    pub total_sent_last10_rate_bits: f64,
    pub total_sent_last40_rate_bits: f64,

    pub total_recv_last2_rate_bits: f64,
    pub total_recv_last10_rate_bits: f64,
    pub total_recv_last40_rate_bits: f64,

    pub total_sent_and_recv_last2_rate_bits: f64,
    pub total_sent_and_recv_last10_rate_bits: f64,
    pub total_sent_and_recv_last40_rate_bits: f64,

    pub peak_sent_rate_bits: f64,
    pub peak_recv_rate_bits: f64,
    pub peak_sent_and_recv_rate_bits: f64,

    /// bytes
    pub cumulative_sent_bytes: f64,
    pub cumulative_recv_bytes: f64,
    pub cumulative_sent_and_recv_bytes: f64,
}

/// Everything the exporter knows about one interface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct State {
    pub interface: String,
    pub ipv4: String,
    pub ipv6: String,
    pub mac: String,
    pub flow_stats: Option<FlowStats>,
}

/// Apply one stderr line: `iftop -t` prints the interface header (name,
/// addresses) on stderr. Everything else on that stream is ignored.
pub fn apply_stderr_line(state: &Mutex<State>, raw: &str) {
    let line = raw.trim();
    if line.is_empty() || line.starts_with(['#', '-', '=']) {
        return;
    }
    apply_header_line(state, line);
}

fn apply_header_line(state: &Mutex<State>, line: &str) -> bool {
    if let Some(rest) = line.strip_prefix("interface:") {
        state.lock().unwrap().interface = rest.trim().to_string();
        return true;
    }
    if let Some(rest) = line.strip_prefix("IP address is:") {
        state.lock().unwrap().ipv4 = rest.trim().to_string();
        return true;
    }
    if let Some(rest) = line.strip_prefix("IPv6 address is:") {
        state.lock().unwrap().ipv6 = rest.trim().to_string();
        return true;
    }
    if let Some(rest) = line.strip_prefix("MAC address is:") {
        state.lock().unwrap().mac = rest.trim().to_string();
        return true;
    }

    false
}

/// Per-round accumulation that has not been published yet.
#[derive(Debug)]
struct PendingRound {
    stats: FlowStats,
    sum_public_out: Flow,
    sum_public_in: Flow,
    sum_private_out: Flow,
    sum_private_in: Flow,
}

impl PendingRound {
    fn new() -> Self {
        PendingRound {
            stats: FlowStats::default(),
            sum_public_out: Flow::synthetic(FlowDirection::Out, FlowType::Public),
            sum_public_in: Flow::synthetic(FlowDirection::In, FlowType::Public),
            sum_private_out: Flow::synthetic(FlowDirection::Out, FlowType::Private),
            sum_private_in: Flow::synthetic(FlowDirection::In, FlowType::Private),
        }
    }

    fn accumulate(&mut self, flow: &Flow) {
        let sum = match (flow.flow_type, flow.direction) {
            (FlowType::Public, FlowDirection::Out) => &mut self.sum_public_out,
            (FlowType::Public, _) => &mut self.sum_public_in,
            (FlowType::Private, FlowDirection::Out) => &mut self.sum_private_out,
            (FlowType::Private, _) => &mut self.sum_private_in,
        };
        sum.add(flow);
    }
}

/// Interprets the stdout line stream of one `iftop` child.
///
/// Owned by the task's stdout pump; publishes completed rounds into the
/// shared [`State`].
#[derive(Debug)]
pub struct FlowParser {
    state: Arc<Mutex<State>>,
    pending: Option<PendingRound>,
    out_flow: Option<Flow>,
    processing_index: u64,
}

impl FlowParser {
    pub fn new(state: Arc<Mutex<State>>) -> Self {
        FlowParser {
            state,
            pending: None,
            out_flow: None,
            processing_index: 0,
        }
    }

    /// Classify and apply one stripped stdout line.
    ///
    /// Lines that fail to parse are dropped; the round continues.
    pub fn process_line(&mut self, raw: &str) {
        let line = raw.trim();
        if line.is_empty() || line.starts_with(['#', '-', '=']) {
            return;
        }

        if apply_header_line(&self.state, line) {
            return;
        }

        if line.contains("=>") {
            self.process_flow_out(line);
            return;
        }
        if line.contains("<=") {
            self.process_flow_in(line);
            return;
        }

        if let Some(rest) = line.strip_prefix("Total send rate:") {
            if let Some([last2, last10, last40]) = three_rates(rest)
                && let Some(pending) = self.pending.as_mut()
            {
                pending.stats.total_sent_last2_rate_bits = last2;
                pending.stats.total_sent_last10_rate_bits = last10;
                pending.stats.total_sent_last40_rate_bits = last40;
            }
            return;
        }
        if let Some(rest) = line.strip_prefix("Total receive rate:") {
            if let Some([last2, last10, last40]) = three_rates(rest)
                && let Some(pending) = self.pending.as_mut()
            {
                pending.stats.total_recv_last2_rate_bits = last2;
                pending.stats.total_recv_last10_rate_bits = last10;
                pending.stats.total_recv_last40_rate_bits = last40;
            }
            return;
        }
        if let Some(rest) = line.strip_prefix("Total send and receive rate:") {
            if let Some([last2, last10, last40]) = three_rates(rest)
                && let Some(pending) = self.pending.as_mut()
            {
                pending.stats.total_sent_and_recv_last2_rate_bits = last2;
                pending.stats.total_sent_and_recv_last10_rate_bits = last10;
                pending.stats.total_sent_and_recv_last40_rate_bits = last40;
            }
            return;
        }
        if let Some(rest) = line.strip_prefix("Peak rate (sent/received/total):") {
            if let Some([sent, recv, both]) = three_rates(rest)
                && let Some(pending) = self.pending.as_mut()
            {
                pending.stats.peak_sent_rate_bits = sent;
                pending.stats.peak_recv_rate_bits = recv;
                pending.stats.peak_sent_and_recv_rate_bits = both;
            }
            return;
        }
        if let Some(rest) = line.strip_prefix("Cumulative (sent/received/total):") {
            self.process_cumulative(rest);
        }
    }

    fn process_flow_out(&mut self, line: &str) {
        let Some(caps) = FLOW_OUT.captures(line) else {
            return;
        };
        let Ok(index) = caps["index"].parse::<u64>() else {
            return;
        };
        if index == 0 {
            return;
        }

        if index == 1 {
            // A fresh round begins; anything unfinished is discarded.
            self.pending = Some(PendingRound::new());
        }
        if self.pending.is_none() {
            return;
        }

        self.processing_index = index;
        self.out_flow = Some(Flow {
            index,
            src: caps["addr"].to_string(),
            dst: String::new(),
            direction: FlowDirection::Out,
            flow_type: FlowType::Public,
            last2_rate_bits: parse_value_to_bits(&caps["last2"]),
            last10_rate_bits: parse_value_to_bits(&caps["last10"]),
            last40_rate_bits: parse_value_to_bits(&caps["last40"]),
            cumulative_bytes: parse_value_to_bytes(&caps["cumulative"]),
        });
    }

    fn process_flow_in(&mut self, line: &str) {
        if self.processing_index == 0 {
            return;
        }
        let Some(caps) = FLOW_IN.captures(line) else {
            return;
        };
        let Some(mut out_flow) = self.out_flow.take() else {
            return;
        };
        let Some(pending) = self.pending.as_mut() else {
            return;
        };

        out_flow.dst = caps["addr"].to_string();
        let mut in_flow = Flow {
            index: out_flow.index,
            src: out_flow.src.clone(),
            dst: out_flow.dst.clone(),
            direction: FlowDirection::In,
            flow_type: FlowType::Public,
            last2_rate_bits: parse_value_to_bits(&caps["last2"]),
            last10_rate_bits: parse_value_to_bits(&caps["last10"]),
            last40_rate_bits: parse_value_to_bits(&caps["last40"]),
            cumulative_bytes: parse_value_to_bytes(&caps["cumulative"]),
        };

        if is_private_ip(extract_ip(&out_flow.src)) && is_private_ip(extract_ip(&out_flow.dst)) {
            out_flow.flow_type = FlowType::Private;
            in_flow.flow_type = FlowType::Private;
        }

        pending.accumulate(&out_flow);
        pending.accumulate(&in_flow);
        pending.stats.flows.push(out_flow);
        pending.stats.flows.push(in_flow);
    }

    fn process_cumulative(&mut self, rest: &str) {
        let words: Vec<&str> = rest.split_whitespace().collect();
        if words.len() != 3 {
            return;
        }
        let Some(mut pending) = self.pending.take() else {
            return;
        };

        pending.stats.cumulative_sent_bytes = parse_value_to_bytes(words[0]);
        pending.stats.cumulative_recv_bytes = parse_value_to_bytes(words[1]);
        pending.stats.cumulative_sent_and_recv_bytes = parse_value_to_bytes(words[2]);

        if !pending.stats.flows.is_empty() {
            pending.stats.flows.push(pending.sum_public_out);
            pending.stats.flows.push(pending.sum_public_in);
            pending.stats.flows.push(pending.sum_private_out);
            pending.stats.flows.push(pending.sum_private_in);
        }

        // The round is complete: publish atomically.
        self.state.lock().unwrap().flow_stats = Some(pending.stats);
        self.processing_index = 0;
        self.out_flow = None;
    }
}

fn three_rates(rest: &str) -> Option<[f64; 3]> {
    let words: Vec<&str> = rest.split_whitespace().collect();
    if words.len() != 3 {
        return None;
    }
    Some([
        parse_value_to_bits(words[0]),
        parse_value_to_bits(words[1]),
        parse_value_to_bits(words[2]),
    ])
}
