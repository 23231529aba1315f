//! wintrack CLI — operator interface to the tracking engine.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use wintrack::config::Config;
use wintrack::engine::Engine;
use wintrack::model::{ClosureReason, ScanEvent, WindowId};
use wintrack::reclaim::{OrphanPolicy, reclaim_orphans};
use wintrack::store::PgIntervalStore;
use wintrack::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "wintrack", about = "Window tracking across workstations")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run pending database migrations
    Migrate,
    /// Record a scan of a window at a workstation
    Scan {
        /// Batch label
        lote: String,
        /// Instance number within the batch
        instancia: i32,
        /// Instance version
        version: i32,
        /// Target workstation id
        workstation: i32,
        /// Scan timestamp, RFC 3339 (defaults to now)
        #[arg(long)]
        at: Option<String>,
        /// Actor recorded for audit
        #[arg(long)]
        by: Option<String>,
    },
    /// Show a tracking interval
    Show {
        /// Interval id
        id: i64,
    },
    /// Manually close an interval (resolves a genuine occupancy conflict)
    Close {
        /// Interval id
        id: i64,
        /// Close timestamp, RFC 3339 (defaults to now)
        #[arg(long)]
        at: Option<String>,
    },
    /// Audit stored intervals for same-workstation overlaps
    Overlaps,
    /// Close orphaned intervals left open past the policy age
    Reclaim {
        /// Override ORPHAN_MAX_OPEN_HOURS
        #[arg(long)]
        max_open_hours: Option<i64>,
        /// Override ORPHAN_BUFFER_MINUTES
        #[arg(long)]
        buffer_minutes: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let _telemetry = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "wintrack".to_string(),
    })?;

    let store = PgIntervalStore::connect(config.database_url.expose_secret()).await?;

    match cli.command {
        Command::Migrate => {
            store.migrate().await?;
            println!("migrations applied");
            Ok(())
        }
        Command::Scan {
            lote,
            instancia,
            version,
            workstation,
            at,
            by,
        } => {
            let engine = Engine::new(store);
            let start_time = parse_at(at)?;
            let mut scan =
                ScanEvent::new(WindowId::new(lote, instancia, version), workstation, start_time);
            if let Some(actor) = by {
                scan = scan.recorded_by(actor);
            }

            // A lost race just means another scanner committed first;
            // re-running re-reads current state.
            let mut attempts = 0;
            let interval = loop {
                match engine.record_scan(scan.clone()).await {
                    Ok(interval) => break interval,
                    Err(err) if err.is_retryable() && attempts < 3 => {
                        attempts += 1;
                    }
                    Err(err) => return Err(err.into()),
                }
            };
            println!("{}", serde_json::to_string_pretty(&interval)?);
            Ok(())
        }
        Command::Show { id } => {
            let engine = Engine::new(store);
            let interval = engine.get_interval(id).await?;
            println!("{}", serde_json::to_string_pretty(&interval)?);
            Ok(())
        }
        Command::Close { id, at } => {
            let engine = Engine::new(store);
            engine
                .close_interval(id, parse_at(at)?, ClosureReason::ManualClose)
                .await?;
            println!("interval {id} closed");
            Ok(())
        }
        Command::Overlaps => {
            let engine = Engine::new(store);
            let pairs = engine.detect_overlaps().await?;
            if pairs.is_empty() {
                println!("no overlaps");
            } else {
                println!("{}", serde_json::to_string_pretty(&pairs)?);
            }
            Ok(())
        }
        Command::Reclaim {
            max_open_hours,
            buffer_minutes,
        } => {
            let policy = OrphanPolicy {
                max_open: max_open_hours
                    .map(chrono::Duration::hours)
                    .unwrap_or(config.orphan_policy.max_open),
                buffer: buffer_minutes
                    .map(chrono::Duration::minutes)
                    .unwrap_or(config.orphan_policy.buffer),
            };
            let reclaimed = reclaim_orphans(&store, &policy).await?;
            println!("reclaimed {} interval(s): {:?}", reclaimed.len(), reclaimed);
            Ok(())
        }
    }
}

fn parse_at(at: Option<String>) -> anyhow::Result<DateTime<Utc>> {
    match at {
        None => Ok(Utc::now()),
        Some(raw) => Ok(DateTime::parse_from_rfc3339(&raw)
            .map_err(|e| anyhow::anyhow!("invalid --at timestamp {raw:?}: {e}"))?
            .with_timezone(&Utc)),
    }
}
