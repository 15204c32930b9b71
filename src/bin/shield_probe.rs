//! shield-probe — inspect the distributed rate limiter configuration
//!
//! Usage:
//!   shield-probe routes [--config <file>]                       Print the route table
//!   shield-probe check <identifier> [--type <kind>] [--count N]
//!                      [--config <file>]                        Run N checks
//!   shield-probe status [--config <file>]                       Show store status

use anyhow::{anyhow, bail, Context};
use std::path::PathBuf;
use throttle_shield::config::ShieldConfig;
use throttle_shield::resilience::distributed::{DistributedRateLimiter, LimitSource, RateLimitType};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let result = match args[1].as_str() {
        "routes" => cmd_routes(&args[2..]),
        "check" => cmd_check(&args[2..]).await,
        "status" => cmd_status(&args[2..]).await,
        "version" | "--version" | "-V" => {
            println!("shield-probe {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn print_usage() {
    println!(
        r#"shield-probe — distributed rate limiter probe

USAGE:
    shield-probe <COMMAND> [OPTIONS]

COMMANDS:
    routes                          Print the effective route table
    check <identifier>              Count requests for an identifier
        --type <kind>               Route category (default: read)
        --count <n>                 Number of checks (default: 1)
    status                          Show shared store status
    version                         Show version information
    help                            Show this help message

OPTIONS:
    --config <file>                 YAML configuration file

ENVIRONMENT:
    UPSTASH_REDIS_REST_URL          Shared store endpoint
    UPSTASH_REDIS_REST_TOKEN        Shared store access token
    RUST_LOG                        Log filter (default: info)"#
    );
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn load_config(args: &[String]) -> anyhow::Result<ShieldConfig> {
    match flag(args, "--config") {
        Some(path) => {
            let path = PathBuf::from(path);
            ShieldConfig::from_yaml_file(&path)
                .with_context(|| format!("loading {}", path.display()))
        }
        None => {
            let cfg = ShieldConfig::from_env();
            cfg.validate().context("environment configuration")?;
            Ok(cfg)
        }
    }
}

fn parse_kind(raw: &str) -> anyhow::Result<RateLimitType> {
    RateLimitType::ALL
        .iter()
        .copied()
        .find(|k| k.as_str().eq_ignore_ascii_case(raw))
        .ok_or_else(|| {
            let known: Vec<&str> = RateLimitType::ALL.iter().map(|k| k.as_str()).collect();
            anyhow!("unknown route type '{}' (expected one of: {})", raw, known.join(", "))
        })
}

fn cmd_routes(args: &[String]) -> anyhow::Result<()> {
    let cfg = load_config(args)?;
    let limiter = DistributedRateLimiter::local_only(&cfg);
    println!("{:<10} {:>8} {:>10}  strict", "type", "limit", "window");
    for (kind, limit) in limiter.routes().entries() {
        println!(
            "{:<10} {:>8} {:>9}s  {}",
            kind.as_str(),
            limit.limit,
            limit.window.as_secs(),
            if limit.strict { "yes" } else { "no" }
        );
    }
    Ok(())
}

async fn cmd_check(args: &[String]) -> anyhow::Result<()> {
    let identifier = args
        .first()
        .filter(|a| !a.starts_with("--"))
        .ok_or_else(|| anyhow!("missing <identifier>"))?;
    let kind = parse_kind(flag(args, "--type").unwrap_or("read"))?;
    let count: u32 = match flag(args, "--count") {
        Some(raw) => raw.parse().with_context(|| format!("invalid --count '{}'", raw))?,
        None => 1,
    };
    if count == 0 {
        bail!("--count must be at least 1");
    }

    let cfg = load_config(args)?;
    let limiter = DistributedRateLimiter::new(&cfg)?;
    let mut allowed = 0u32;
    for i in 1..=count {
        let outcome = limiter.check(identifier, kind).await;
        if outcome.success {
            allowed += 1;
        }
        let source = match outcome.source {
            LimitSource::Shared => "shared",
            LimitSource::Local => "local",
            LimitSource::StoreUnavailable => "unavailable",
        };
        println!(
            "#{:<4} {:<7} remaining={:<5} retry_after={}ms source={}",
            i,
            if outcome.success { "allow" } else { "deny" },
            outcome.remaining,
            outcome.retry_after().as_millis(),
            source
        );
    }
    println!("{}/{} allowed for {} ({})", allowed, count, identifier, kind);
    Ok(())
}

async fn cmd_status(args: &[String]) -> anyhow::Result<()> {
    let cfg = load_config(args)?;
    let limiter = DistributedRateLimiter::new(&cfg)?;
    if cfg.store.is_configured() {
        // A single probe decides availability.
        limiter.check("shield-probe:status", RateLimitType::Read).await;
    }
    let status = limiter.status();
    println!("configured: {}", status.configured);
    println!("available:  {}", status.available);
    if let Some(down) = status.down_for {
        println!("down for:   {}s", down.as_secs());
    }
    Ok(())
}
