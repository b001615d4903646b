// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};

use crate::iftop::options::Options;

/// Builder for one `iftop` child process.
///
/// The invocation is `stdbuf -oL iftop -t <flags>`: stdbuf forces
/// line-buffered stdout so report lines reach the pipe as they are printed
/// instead of in 4KiB bursts.
#[derive(Debug, Clone)]
pub struct IftopCommand {
    argv: Vec<String>,
}

impl IftopCommand {
    pub fn new(options: &Options) -> Self {
        let mut argv = vec![
            "stdbuf".to_string(),
            "-oL".to_string(),
            "iftop".to_string(),
        ];
        argv.extend(options.arguments());
        Self { argv }
    }

    #[cfg(test)]
    pub(crate) fn from_argv(argv: Vec<String>) -> Self {
        Self { argv }
    }

    /// The full command line, for logging.
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }

    /// Spawn the child with stdout and stderr piped.
    ///
    /// The child is killed when its handle is dropped, so that cancelling a
    /// supervision future cannot leak a running iftop.
    pub fn spawn(&self) -> Result<Child> {
        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd.spawn()
            .with_context(|| format!("failed to spawn: {}", self.command_line()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iftop::options::SortBy;

    #[test]
    fn test_command_line() {
        let options = Options {
            interface: "eth0".to_string(),
            no_hostname_lookup: true,
            sort_by: Some(SortBy::Last2s),
            ..Default::default()
        };
        let command = IftopCommand::new(&options);
        assert_eq!(
            command.command_line(),
            "stdbuf -oL iftop -i eth0 -n -o 2s -t"
        );
    }

    #[test]
    fn test_single_seconds_appended_for_periodic_runs() {
        let options = Options {
            interface: "eth0".to_string(),
            single_seconds: 3,
            ..Default::default()
        };
        let command = IftopCommand::new(&options);
        assert!(command.command_line().ends_with("-s 3"));
    }
}
