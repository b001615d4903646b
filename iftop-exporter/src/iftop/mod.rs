// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Supervision and parsing of a single `iftop` child process.
//!
//! One [`Task`] wraps one run of `iftop -t` on one interface: it spawns the
//! child through [`command::IftopCommand`], pumps stdout through the framing
//! [`scanner`] into the [`state`] flow machine, pumps stderr into the header
//! fields, and waits for the child to exit. The manager layer decides when
//! tasks are created, respawned and torn down.

pub mod addr;
pub mod command;
pub mod options;
pub mod scanner;
pub mod state;
pub mod task;
pub mod values;

pub use options::{Options, SortBy};
pub use state::{Flow, FlowDirection, FlowStats, FlowType, State};
pub use task::Task;
