// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::process::ExitStatus;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout};

use crate::iftop::command::IftopCommand;
use crate::iftop::options::Options;
use crate::iftop::scanner::{LineScanner, strip_ansi};
use crate::iftop::state::{FlowParser, State, apply_stderr_line};

/// One `iftop` run on one interface.
///
/// A `Task` survives a single child process: the manager constructs a fresh
/// one for every respawn so that each run starts from an empty report. The
/// accumulated [`State`] can be snapshotted at any time with [`Task::state`].
pub struct Task {
    options: Options,
    command: IftopCommand,
    state: Arc<Mutex<State>>,
    child_pid: Mutex<Option<u32>>,
}

impl Task {
    pub fn new(options: Options) -> Self {
        let command = IftopCommand::new(&options);
        Task {
            options,
            command,
            state: Arc::new(Mutex::new(State::default())),
            child_pid: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_command(options: Options, command: IftopCommand) -> Self {
        Task {
            options,
            command,
            state: Arc::new(Mutex::new(State::default())),
            child_pid: Mutex::new(None),
        }
    }

    pub fn interface(&self) -> &str {
        &self.options.interface
    }

    /// The exec command line of this task, for logging.
    pub fn command_line(&self) -> String {
        self.command.command_line()
    }

    /// Value copy of the current state.
    pub fn state(&self) -> State {
        self.state.lock().unwrap().clone()
    }

    /// Send SIGKILL to the running child, logging the outcome. A no-op when
    /// no child is alive.
    ///
    /// The handle's `kill_on_drop` remains as a backstop for supervision
    /// futures dropped mid-run.
    pub fn kill(&self) {
        let Some(pid) = *self.child_pid.lock().unwrap() else {
            return;
        };
        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) => info!(
                "kill process for interface ({}) succeeded",
                self.interface()
            ),
            Err(e) => warn!(
                "kill process for interface ({}) failed: {e}",
                self.interface()
            ),
        }
    }

    /// Spawn the child and wait for it to exit, feeding stdout through the
    /// flow parser and stderr through the header parser.
    ///
    /// Both pump tasks are joined before returning. Dropping the returned
    /// future kills the child (the handle is `kill_on_drop`); the pumps then
    /// drain to EOF on their own.
    pub async fn run(&self) -> Result<ExitStatus> {
        let mut child = self.command.spawn()?;
        *self.child_pid.lock().unwrap() = child.id();
        let stdout = child.stdout.take().context("stdout pipe missing")?;
        let stderr = child.stderr.take().context("stderr pipe missing")?;

        let stdout_pump = tokio::spawn(pump_stdout(stdout, self.state.clone()));
        let stderr_pump = tokio::spawn(pump_stderr(stderr, self.state.clone()));

        let status = child.wait().await;
        *self.child_pid.lock().unwrap() = None;
        let _ = stdout_pump.await;
        let _ = stderr_pump.await;

        status.with_context(|| format!("wait failed: {}", self.command_line()))
    }
}

/// Frame stdout into logical lines (iftop moves the cursor with `\r`) and
/// feed them to the flow-state machine.
async fn pump_stdout(mut stdout: ChildStdout, state: Arc<Mutex<State>>) {
    let mut scanner = LineScanner::new();
    let mut parser = FlowParser::new(state);
    let mut buf = [0u8; 4096];

    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for line in scanner.push(&buf[..n]) {
                    parser.process_line(&strip_ansi(&line));
                }
            }
            Err(e) => {
                debug!("stdout read failed: {e}");
                break;
            }
        }
    }

    if let Some(line) = scanner.finish() {
        parser.process_line(&strip_ansi(&line));
    }
}

/// stderr carries the interface header; plain newline framing is enough.
async fn pump_stderr(stderr: ChildStderr, state: Arc<Mutex<State>>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => apply_stderr_line(&state, &strip_ansi(&line)),
            Ok(None) => break,
            Err(e) => {
                debug!("stderr read failed: {e}");
                break;
            }
        }
    }
}
