//! rpcmux CLI — talk to a JSON-RPC WebSocket endpoint from the terminal.
//!
//! Usage:
//! ```bash
//! # Invoke a method and print the result
//! rpcmux call --url ws://127.0.0.1:9222/devtools/page/ID --method Page.navigate \
//!     --params '{"url":"https://example.com"}'
//!
//! # Print notifications for a method, enabling them first
//! rpcmux listen --url ws://... --method Page.loadEventFired --call Page.enable --count 1
//!
//! # Fire-and-forget notification
//! rpcmux notify --url ws://... --method log.Line --params '["hello"]'
//! ```

mod logging;

use std::env;
use std::process;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use rpcmux_core::{Codec, Conn, JsonCodec};
use rpcmux_ws::WsConfig;

use crate::logging::{init_tracing, LogConfig};

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let mut log = LogConfig::default();
    if has_flag(&args, "--verbose") || has_flag(&args, "-v") {
        log.level = "debug".into();
    }
    match log_components(&args) {
        Ok(components) => log.components.extend(components),
        Err(e) => {
            eprintln!("Error: {e:#}");
            process::exit(1);
        }
    }
    init_tracing(&log);

    let result = match args[1].as_str() {
        "call" => cmd_call(&args[2..]).await,
        "notify" => cmd_notify(&args[2..]).await,
        "listen" => cmd_listen(&args[2..]).await,
        "version" | "--version" | "-V" => {
            println!("rpcmux {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("rpcmux {}", env!("CARGO_PKG_VERSION"));
    println!("Call methods and listen for notifications over a JSON-RPC WebSocket\n");
    println!("USAGE:");
    println!("    rpcmux <COMMAND> [FLAGS]\n");
    println!("COMMANDS:");
    println!("    call       Invoke a method and print its result");
    println!("    notify     Send a notification (no reply)");
    println!("    listen     Print notifications for a method");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("FLAGS:");
    println!("    --url <URL>          WebSocket endpoint  [default: $RPCMUX_URL]");
    println!("    --method <NAME>      Method to call, send or listen to  [required]");
    println!("    --params <JSON>      Params for call/notify");
    println!("    --timeout-ms <N>     Call timeout in milliseconds  [default: 30000]");
    println!("    --call <NAME>        (listen) method to invoke once subscribed");
    println!("    --count <N>          (listen) exit after N notifications");
    println!("    --log <CRATE=LEVEL>  Per-crate log level, repeatable  [default level: info]");
    println!("    -v, --verbose        Debug logging (or set RUST_LOG)");
}

async fn connect(args: &[String]) -> Result<Conn> {
    let url = parse_flag(args, "--url")
        .or_else(|| env::var("RPCMUX_URL").ok())
        .ok_or_else(|| anyhow!("--url is required"))?;
    let conn = rpcmux_ws::dial_with(&url, WsConfig::default())
        .await
        .with_context(|| format!("connecting to {url}"))?;
    Ok(conn)
}

fn timeout(args: &[String]) -> Result<Duration> {
    let ms = match parse_flag(args, "--timeout-ms") {
        Some(raw) => raw.parse().context("--timeout-ms must be an integer")?,
        None => 30_000,
    };
    Ok(Duration::from_millis(ms))
}

async fn cmd_call(args: &[String]) -> Result<()> {
    let method = parse_flag(args, "--method").ok_or_else(|| anyhow!("--method is required"))?;
    let params = parse_params(parse_flag(args, "--params"))?;
    let timeout = timeout(args)?;

    let conn = connect(args).await?;
    let started = std::time::Instant::now();
    let result = conn.call_timeout(&method, params, timeout).await;
    let latency = started.elapsed();
    let _ = conn.close().await;

    let result = result.with_context(|| format!("calling {method}"))?;
    let value: serde_json::Value = serde_json::from_slice(&result).context("result is not JSON")?;
    println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
    tracing::info!(method = %method, latency_ms = latency.as_millis() as u64, "call finished");
    Ok(())
}

async fn cmd_notify(args: &[String]) -> Result<()> {
    let method = parse_flag(args, "--method").ok_or_else(|| anyhow!("--method is required"))?;
    let params = parse_params(parse_flag(args, "--params"))?;

    let conn = connect(args).await?;
    conn.notify(&method, params)
        .await
        .with_context(|| format!("sending {method}"))?;
    let _ = conn.close().await;
    Ok(())
}

async fn cmd_listen(args: &[String]) -> Result<()> {
    let method = parse_flag(args, "--method").ok_or_else(|| anyhow!("--method is required"))?;
    let count: Option<u64> = parse_flag(args, "--count")
        .map(|raw| raw.parse().context("--count must be an integer"))
        .transpose()?;

    let conn = connect(args).await?;
    let sub = conn.subscribe(&method)?;

    if let Some(enable) = parse_flag(args, "--call") {
        let params = parse_params(parse_flag(args, "--params"))?;
        conn.call_timeout(&enable, params, timeout(args)?)
            .await
            .with_context(|| format!("calling {enable}"))?;
    }

    let mut seen = 0u64;
    loop {
        tokio::select! {
            payload = sub.recv() => {
                let payload = payload.with_context(|| format!("listening to {method}"))?;
                println!("{}", String::from_utf8_lossy(&payload));
                seen += 1;
                if count.is_some_and(|n| seen >= n) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if sub.dropped() > 0 {
        eprintln!("warning: {} notifications dropped (slow consumer)", sub.dropped());
    }
    sub.close();
    let _ = conn.close().await;
    Ok(())
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].clone())
}

/// Every `--log crate=level` pair, e.g. `--log rpcmux-core=debug`.
fn log_components(args: &[String]) -> Result<Vec<(String, String)>> {
    args.windows(2)
        .filter(|w| w[0] == "--log")
        .map(|w| {
            w[1].split_once('=')
                .map(|(component, level)| (component.to_string(), level.to_string()))
                .ok_or_else(|| anyhow!("--log expects CRATE=LEVEL, got {:?}", w[1]))
        })
        .collect()
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

/// Validate `--params` as JSON and re-encode it compactly.
fn parse_params(raw: Option<String>) -> Result<Option<Bytes>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value: serde_json::Value =
        serde_json::from_str(&raw).context("--params must be valid JSON")?;
    Ok(Some(JsonCodec.encode_payload(&value)?))
}
