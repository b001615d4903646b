// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{error, info, warn};
use prometheus::{Encoder, TextEncoder};
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};

use iftop_exporter::manager::{Manager, ManagerConfig};

/// Export per-flow bandwidth metrics by running iftop on watched interfaces.
#[derive(Parser, Debug)]
#[command(name = "iftop-exporter", version)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = ":9999")]
    addr: String,

    /// Interface names separated by comma
    #[arg(long, default_value = "")]
    interfaces: String,

    /// Watch the dynamic directory for interfaces appearing at runtime
    #[arg(long)]
    dynamic: bool,

    /// Directory holding one label file per dynamic interface
    #[arg(long, default_value = "/var/lib/iftop-exporter/dynamic")]
    dynamic_dir: std::path::PathBuf,

    /// Let each iftop run until it exits on its own instead of one report per
    /// run
    #[arg(long)]
    continuous: bool,

    /// Interval between two iftop runs, and must not be less than 10 seconds
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    interval: Duration,

    /// Duration of each iftop run, and must not be less than 3 seconds, and
    /// duration must be less than interval
    #[arg(long, default_value = "3s", value_parser = parse_duration)]
    duration: Duration,

    /// Debug logging
    #[arg(long)]
    debug: bool,
}

/// Accept `90`, `90s` or `2m`.
fn parse_duration(input: &str) -> Result<Duration, String> {
    let (digits, unit) = match input.strip_suffix(['s', 'm']) {
        Some(head) => (head, &input[head.len()..]),
        None => (input, ""),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration: {input}"))?;
    match unit {
        "m" => Ok(Duration::from_secs(value * 60)),
        _ => Ok(Duration::from_secs(value)),
    }
}

fn split_interfaces(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect()
}

/// `:9999` listens on all addresses, like Go's net.Listen.
fn normalize_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.debug {
        log::Level::Debug
    } else {
        log::Level::Info
    };
    simple_logger::init_with_level(level)?;
    info!(
        "iftop-exporter starting (version {})",
        env!("CARGO_PKG_VERSION")
    );

    let static_interfaces = split_interfaces(&args.interfaces);
    if !args.dynamic && static_interfaces.is_empty() {
        error!("the --dynamic and/or --interfaces option must be specified");
        std::process::exit(1);
    }
    info!("got ({}) static interfaces", static_interfaces.len());

    info!(
        "iftop execution pattern: continuous={}, interval={:?}, duration={:?}",
        args.continuous, args.interval, args.duration
    );
    if args.continuous {
        warn!("continuous mode enabled, this mode may cause high CPU usage");
    } else {
        if args.interval < Duration::from_secs(10) {
            error!(
                "interval ({:?}) must not be less than 10 seconds",
                args.interval
            );
            std::process::exit(1);
        }
        if args.duration < Duration::from_secs(3) {
            error!(
                "duration ({:?}) must not be less than 3 seconds",
                args.duration
            );
            std::process::exit(1);
        }
        if args.duration >= args.interval {
            error!(
                "duration ({:?}) must be less than interval ({:?})",
                args.duration, args.interval
            );
            std::process::exit(1);
        }
    }

    let registry = prometheus::Registry::new();
    let config = ManagerConfig {
        static_interfaces,
        dynamic: args.dynamic,
        dynamic_dir: args.dynamic_dir,
        continuous: args.continuous,
        interval: args.interval,
        duration: args.duration,
    };
    let manager = Arc::new(Manager::new(config, &registry).context("create manager")?);

    let runner = manager.clone();
    tokio::spawn(async move { runner.run().await });

    let addr = normalize_addr(&args.addr);
    match TcpListener::bind(&addr).await {
        Ok(listener) => {
            info!("metrics endpoint listening on {addr}");
            tokio::spawn(serve_metrics(listener, registry));
        }
        // The exporter keeps supervising without a metrics endpoint; scrapes
        // will fail until it is restarted with a usable address.
        Err(e) => error!("metrics endpoint listen failed on {addr}: {e}"),
    }

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    manager.shutdown().await;
    info!("iftop-exporter shutting down");
    Ok(())
}

async fn serve_metrics(listener: TcpListener, registry: prometheus::Registry) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("accept failed: {e}");
                continue;
            }
        };

        let io = TokioIo::new(stream);
        let registry = registry.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let registry = registry.clone();
                async move {
                    Ok::<_, std::convert::Infallible>(
                        handle_request(req, &registry).unwrap_or_else(|e| {
                            error!("request handling failed: {e}");
                            let mut response =
                                Response::new(Full::new(Bytes::from_static(b"Internal Server Error")));
                            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                            response
                        }),
                    )
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                log::debug!("error serving connection: {e}");
            }
        });
    }
}

fn handle_request(
    req: Request<hyper::body::Incoming>,
    registry: &prometheus::Registry,
) -> Result<Response<Full<Bytes>>> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let encoder = TextEncoder::new();
            let mut buf = Vec::new();
            encoder
                .encode(&registry.gather(), &mut buf)
                .context("encode metrics")?;
            Response::builder()
                .header(CONTENT_TYPE, encoder.format_type())
                .body(Full::new(Bytes::from(buf)))
                .map_err(|e| anyhow!("build response: {e}"))
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"Not found")))
            .map_err(|e| anyhow!("build response: {e}")),
    }
}
