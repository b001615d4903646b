// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::fmt;

use anyhow::{Result, bail};

/// Flow-sort order understood by `iftop -o`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    Last2s,
    Last10s,
    Last40s,
    Source,
    Destination,
}

impl fmt::Display for SortBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortBy::Last2s => write!(f, "2s"),
            SortBy::Last10s => write!(f, "10s"),
            SortBy::Last40s => write!(f, "40s"),
            SortBy::Source => write!(f, "source"),
            SortBy::Destination => write!(f, "destination"),
        }
    }
}

/// Invocation options for one `iftop` child.
///
/// Text mode (`-t`) is not an option: the runner always forces it, since the
/// parser only understands the text report format.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub interface: String,
    pub no_hostname_lookup: bool,
    pub no_port_convert: bool,
    pub show_port: bool,
    pub sort_by: Option<SortBy>,
    pub show_bandwidth_in_bytes: bool,
    /// `-L`: number of flow lines per report; 0 leaves iftop's default.
    pub number_of_lines: u32,
    /// `-s`: print one report after this many seconds, then exit. 0 disables
    /// the flag (continuous mode).
    pub single_seconds: u64,
}

impl Options {
    pub fn validate(&self) -> Result<()> {
        if self.interface.is_empty() {
            bail!("interface name is required");
        }
        Ok(())
    }

    /// Build the iftop flag vector (everything after the binary name).
    pub fn arguments(&self) -> Vec<String> {
        let mut args = Vec::new();

        if !self.interface.is_empty() {
            args.push("-i".to_string());
            args.push(self.interface.clone());
        }
        if self.no_hostname_lookup {
            args.push("-n".to_string());
        }
        if self.no_port_convert {
            args.push("-N".to_string());
        }
        if self.show_port {
            args.push("-P".to_string());
        }
        if let Some(sort_by) = self.sort_by {
            args.push("-o".to_string());
            args.push(sort_by.to_string());
        }
        if self.show_bandwidth_in_bytes {
            args.push("-B".to_string());
        }

        // Text mode is unconditional; -L and -s are only meaningful with it.
        args.push("-t".to_string());

        if self.number_of_lines != 0 {
            args.push("-L".to_string());
            args.push(self.number_of_lines.to_string());
        }
        if self.single_seconds != 0 {
            args.push("-s".to_string());
            args.push(self.single_seconds.to_string());
        }

        args
    }
}
