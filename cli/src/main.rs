//! rpcguard CLI — validate pipeline configs and drive synthetic load through them.
//!
//! Usage:
//! ```bash
//! # Validate a config and print its route table
//! rpcguard check --config guard.json
//!
//! # Fire 50 concurrent calls at billing.Ledger/Get, failing every 5th
//! rpcguard simulate --config guard.json --target billing.Ledger/Get \
//!     --calls 50 --latency-ms 20 --fail-every 5
//! ```

mod tracing_setup;

use std::collections::BTreeMap;
use std::env;
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use serde::Deserialize;
use serde_json::json;

use rpcguard_core::{
    handler_fn, CallEnvelope, CallError, Code, GuardConfig, Handler, Interceptor, RoutePattern,
};

use crate::tracing_setup::{init_tracing, LogConfig};

/// Config file layout: the core route document plus a `log` section.
#[derive(Debug, Deserialize)]
struct CliConfig {
    #[serde(default)]
    log: LogConfig,
    #[serde(flatten)]
    guard: GuardConfig,
}

fn load_config(path: &str) -> anyhow::Result<CliConfig> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "check" => cmd_check(&args[2..]),
        "simulate" => cmd_simulate(&args[2..]).await,
        "version" | "--version" | "-V" => {
            println!("rpcguard {}", env!("CARGO_PKG_VERSION"));
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
    println!("rpcguard {}", env!("CARGO_PKG_VERSION"));
    println!("Validate RPC interceptor pipelines and exercise them with synthetic load\n");
    println!("USAGE:");
    println!("    rpcguard <COMMAND>\n");
    println!("COMMANDS:");
    println!("    check      Validate a config file and print its route table");
    println!("    simulate   Drive concurrent synthetic calls through a config");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("FLAGS:");
    println!("    --config <FILE>        JSON config file  [required]");
    println!("    --target <SVC/METHOD>  Method to call     [simulate, required]");
    println!("    --calls <N>            Concurrent calls   [simulate, default 10]");
    println!("    --latency-ms <MS>      Handler latency    [simulate, default 20]");
    println!("    --fail-every <K>       Fail every K-th call with `unavailable`");
    println!("                           [simulate, default never]");
    println!("    --streaming            Flag the calls as streaming [simulate]");
}

fn cmd_check(args: &[String]) -> anyhow::Result<()> {
    let path = parse_flag(args, "--config").context("--config is required")?;
    let config = load_config(&path)?;
    let router = config.guard.build_router()?;

    println!("{path}: OK ({} routes)\n", config.guard.routes.len());
    for (pattern, stages) in router.describe() {
        let stages = if stages.is_empty() {
            "(none)".to_string()
        } else {
            stages.join(" → ")
        };
        println!("  {pattern:<32} {stages}");
    }
    Ok(())
}

/// Synthetic terminal handler: sleeps `latency` (honouring cancellation)
/// and fails every `fail_every`-th invocation.
fn synthetic_handler(
    latency: Duration,
    fail_every: usize,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
) -> Handler {
    let counter = Arc::new(AtomicUsize::new(0));
    handler_fn(move |call: CallEnvelope| {
        let counter = counter.clone();
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        async move {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);

            let outcome = tokio::select! {
                _ = tokio::time::sleep(latency) => {
                    if fail_every > 0 && n % fail_every == 0 {
                        Err(CallError::unavailable(format!("synthetic failure #{n}")))
                    } else {
                        Ok(json!({ "call": n }))
                    }
                }
                _ = call.cancel.cancelled() => Err(CallError::status(Code::Cancelled, "cancelled")),
            };
            in_flight.fetch_sub(1, Ordering::SeqCst);
            outcome
        }
    })
}

async fn cmd_simulate(args: &[String]) -> anyhow::Result<()> {
    let path = parse_flag(args, "--config").context("--config is required")?;
    let target = parse_flag(args, "--target").context("--target is required")?;
    let calls: usize = parse_num(args, "--calls", 10)?;
    let latency_ms: u64 = parse_num(args, "--latency-ms", 20)?;
    let fail_every: usize = parse_num(args, "--fail-every", 0)?;
    let streaming = args.iter().any(|a| a == "--streaming");

    let (service, method) = match target.parse::<RoutePattern>()? {
        RoutePattern::Exact { service, method } => (service, method),
        other => bail!("--target must name one method, got `{other}`"),
    };

    let config = load_config(&path)?;
    init_tracing(&config.log);
    let router = config.guard.build_router()?;

    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let handler = router.intercept(synthetic_handler(
        Duration::from_millis(latency_ms),
        fail_every,
        in_flight,
        peak.clone(),
    ));

    tracing::info!(calls, %service, %method, streaming, "starting simulation");
    let started = Instant::now();
    let tasks = (0..calls).map(|i| {
        let handler = handler.clone();
        let mut call = CallEnvelope::new(service.clone(), method.clone(), json!({ "seq": i }));
        call.streaming = streaming;
        tokio::spawn(async move { handler.call(call).await })
    });
    let results = futures::future::join_all(tasks).await;
    let elapsed = started.elapsed();

    let mut outcomes: BTreeMap<String, usize> = BTreeMap::new();
    for result in results {
        let key = match result {
            Ok(Ok(_)) => "ok".to_string(),
            Ok(Err(e)) if e.is_rejection() => format!("{} (rejected)", e.code()),
            Ok(Err(e)) => e.code().to_string(),
            Err(join) => format!("task failed: {join}"),
        };
        *outcomes.entry(key).or_default() += 1;
    }

    println!("Simulated {calls} calls to {service}/{method} in {}ms", elapsed.as_millis());
    println!("  Peak concurrency: {}", peak.load(Ordering::SeqCst));
    println!("  Outcomes:");
    for (outcome, count) in outcomes {
        println!("    {outcome:<32} {count}");
    }
    Ok(())
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

fn parse_num<T>(args: &[String], flag: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match parse_flag(args, flag) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{flag} expects a number, got `{raw}`")),
        None => Ok(default),
    }
}
