// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use kube::Client;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use iftop_exporter_helper::controller::{self, PodReconciler};
use iftop_exporter_helper::interfaces::InterfaceResolver;
use iftop_exporter_helper::readiness;
use iftop_exporter_helper::selector::Selectors;

/// Discovers pod network interfaces on this node and publishes their
/// host-side names for iftop-exporter.
#[derive(Parser, Debug)]
#[command(name = "iftop-exporter-helper", version)]
struct Args {
    /// The address the metric endpoint binds to (accepted for manifest
    /// compatibility; no metrics are served yet)
    #[arg(long, default_value = ":8080")]
    metrics_bind_address: String,

    /// The address the probe endpoint binds to
    #[arg(long, default_value = ":8081")]
    health_probe_bind_address: String,

    /// Enable leader election (accepted for manifest compatibility; a
    /// per-node helper needs none)
    #[arg(long)]
    leader_elect: bool,

    /// The path of the host rootfs mount
    #[arg(long, default_value = "/")]
    rootfs: PathBuf,

    /// The namespaces to watch, separated by comma; empty means cluster-wide
    #[arg(long, default_value = "")]
    namespaces: String,

    /// Pod label selector, repeatable; at least one required
    #[arg(long = "selectors")]
    selectors: Vec<String>,

    /// The iftop-exporter dynamic dir to store interface info
    #[arg(long, default_value = "/var/run/iftop-exporter/dynamic")]
    dynamic_dir: PathBuf,
}

fn split_namespaces(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|namespace| !namespace.is_empty())
        .map(String::from)
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let selectors =
        Selectors::parse_all(&args.selectors).context("parse selectors")?;
    if selectors.is_empty() {
        error!("zero selectors found, at least one --selectors is required");
        std::process::exit(1);
    }
    info!(count = selectors.len(), "parsed selectors");

    if args.leader_elect {
        warn!("leader election requested but not needed for a per-node helper; ignored");
    }
    info!(
        addr = %args.metrics_bind_address,
        "metrics endpoint not served; flag accepted for manifest compatibility"
    );

    let node_name = std::env::var("NODE_NAME").unwrap_or_default();
    if node_name.is_empty() {
        warn!("NODE_NAME is not set; no pod will match this node");
    }

    // Do not reconcile into a directory nobody is watching.
    readiness::wait_for_exporter(&args.dynamic_dir, readiness::POLL_INTERVAL).await?;

    if let Ok(listener) = TcpListener::bind(normalize_addr(&args.health_probe_bind_address)).await
    {
        tokio::spawn(serve_probes(listener));
    } else {
        warn!(
            "health probe endpoint listen failed on {}",
            args.health_probe_bind_address
        );
    }

    let client = Client::try_default()
        .await
        .context("create kubernetes client")?;
    let reconciler = PodReconciler::new(
        InterfaceResolver::new(&args.rootfs),
        selectors,
        &args.dynamic_dir,
        node_name,
    );

    let namespaces = split_namespaces(&args.namespaces);
    controller::run(client, &namespaces, reconciler).await
}

/// `:8081` listens on all addresses, like Go's net.Listen.
fn normalize_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// controller-runtime style healthz/readyz endpoints.
async fn serve_probes(listener: TcpListener) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("probe accept failed: {e}");
                continue;
            }
        };

        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                let response = match (req.method(), req.uri().path()) {
                    (&Method::GET, "/healthz") | (&Method::GET, "/readyz") => {
                        Response::new(Full::new(Bytes::from_static(b"ok")))
                    }
                    _ => {
                        let mut response =
                            Response::new(Full::new(Bytes::from_static(b"Not found")));
                        *response.status_mut() = StatusCode::NOT_FOUND;
                        response
                    }
                };
                Ok::<_, std::convert::Infallible>(response)
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!("error serving probe connection: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_namespaces() {
        assert_eq!(split_namespaces(""), Vec::<String>::new());
        assert_eq!(split_namespaces("default"), vec!["default"]);
        assert_eq!(
            split_namespaces(" kube-system, default ,,prod "),
            vec!["kube-system", "default", "prod"]
        );
    }

    #[test]
    fn test_normalize_addr() {
        assert_eq!(normalize_addr(":8081"), "0.0.0.0:8081");
        assert_eq!(normalize_addr("127.0.0.1:8081"), "127.0.0.1:8081");
    }
}
