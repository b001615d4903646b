// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Startup handshake with the exporter.
//!
//! The exporter creates `.watching` inside the dynamic directory once its
//! directory watcher is armed. Until that file exists, anything the helper
//! writes would be lost, so reconciliation must not begin.

use std::io;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

pub const WATCHING_FILE: &str = ".watching";

pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Block until `<dynamic_dir>/.watching` exists as a regular file, polling at
/// the given interval. Errors other than absence are fatal.
pub async fn wait_for_exporter(dynamic_dir: &Path, poll_interval: Duration) -> Result<()> {
    let watching = dynamic_dir.join(WATCHING_FILE);
    loop {
        match watching_file_exists(&watching) {
            Ok(true) => {
                info!(file = %watching.display(), "found watching file, continue");
                return Ok(());
            }
            Ok(false) => {
                info!(file = %watching.display(), "waiting for watching file");
                tokio::time::sleep(poll_interval).await;
            }
            Err(e) => {
                return Err(e).context("check the existence of watching file");
            }
        }
    }
}

fn watching_file_exists(path: &Path) -> io::Result<bool> {
    match std::fs::metadata(path) {
        Ok(metadata) => Ok(metadata.is_file()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_returns_immediately_when_file_exists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(WATCHING_FILE), "").unwrap();

        wait_for_exporter(dir.path(), Duration::from_millis(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_waits_until_file_appears() {
        let dir = tempfile::tempdir().unwrap();
        let sentinel = dir.path().join(WATCHING_FILE);

        let writer = {
            let sentinel = sentinel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                std::fs::write(&sentinel, "").unwrap();
            })
        };

        tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_exporter(dir.path(), Duration::from_millis(10)),
        )
        .await
        .expect("should observe the file well before the timeout")
        .unwrap();

        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_directory_is_not_a_watching_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(WATCHING_FILE)).unwrap();

        let result = tokio::time::timeout(
            Duration::from_millis(200),
            wait_for_exporter(dir.path(), Duration::from_millis(20)),
        )
        .await;
        assert!(result.is_err(), "a directory must not satisfy the handshake");
    }
}
