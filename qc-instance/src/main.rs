//! qc-instance: drives instance lifecycles against a simulated control plane.
//!
//! Records are persisted in a local SQLite store between steps, the same way
//! a declarative driver keeps state between runs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use qc_instance::config::{DeleteWait, Field, PollSettings, UnsupportedUpdatePolicy};
use qc_instance::reconciler::ReconcileAction;
use qc_instance::{
    ClientBundle, DesiredConfiguration, EngineSettings, InstanceReconciler, Reconciler,
    RecordStore, ResourceRecord, SimulatedCloud,
};

/// qc-instance lifecycle driver
#[derive(Parser, Debug)]
#[command(name = "qc-instance", version, about)]
struct Args {
    /// Directory holding the record database
    #[arg(short, long, global = true, default_value = "/var/lib/qc-instance")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug)]
struct EngineArgs {
    /// Delay between instance state polls, in milliseconds
    #[arg(long, default_value = "3000")]
    poll_interval_ms: u64,

    /// Maximum instance state polls per wait
    #[arg(long, default_value = "200")]
    max_attempts: u32,

    /// Delay between EIP state polls, in milliseconds
    #[arg(long, default_value = "3000")]
    eip_poll_interval_ms: u64,

    /// Maximum EIP state polls per wait
    #[arg(long, default_value = "200")]
    eip_max_attempts: u32,

    /// When delete considers the instance gone
    #[arg(long, value_enum, default_value = "accepted")]
    delete_wait: DeleteWaitArg,

    /// Fail updates that change fields which cannot be changed in place
    #[arg(long)]
    reject_unsupported_updates: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DeleteWaitArg {
    Accepted,
    Terminated,
}

impl From<&EngineArgs> for EngineSettings {
    fn from(args: &EngineArgs) -> Self {
        EngineSettings {
            instance_poll: PollSettings::new(
                Duration::from_millis(args.poll_interval_ms),
                args.max_attempts,
            ),
            eip_poll: PollSettings::new(
                Duration::from_millis(args.eip_poll_interval_ms),
                args.eip_max_attempts,
            ),
            delete_wait: match args.delete_wait {
                DeleteWaitArg::Accepted => DeleteWait::Accepted,
                DeleteWaitArg::Terminated => DeleteWait::Terminated,
            },
            unsupported_updates: if args.reject_unsupported_updates {
                UnsupportedUpdatePolicy::Reject
            } else {
                UnsupportedUpdatePolicy::Ignore
            },
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create (or converge), optionally rename, then delete one instance
    Simulate {
        /// Desired configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Local name of the record
        #[arg(short, long, default_value = "default")]
        name: String,

        /// Rename the instance after creation
        #[arg(long)]
        rename: Option<String>,

        /// Keep the instance instead of deleting it at the end
        #[arg(long)]
        keep: bool,

        /// Describe calls before a simulated transition settles
        #[arg(long, default_value = "2")]
        transition_polls: u32,

        /// Address of the simulated EIP
        #[arg(long, default_value = "139.198.0.10")]
        eip_addr: String,

        #[command(flatten)]
        engine: EngineArgs,
    },
    /// List stored records
    Records,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "qc_instance=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    tokio::fs::create_dir_all(&args.data_dir)
        .await
        .with_context(|| format!("Failed to create {}", args.data_dir.display()))?;
    let store = RecordStore::open(&args.data_dir)
        .await
        .context("Failed to open record store")?;

    match args.command {
        Command::Simulate {
            config,
            name,
            rename,
            keep,
            transition_polls,
            eip_addr,
            engine,
        } => {
            let settings = EngineSettings::from(&engine);
            let raw = tokio::fs::read_to_string(&config)
                .await
                .with_context(|| format!("Failed to read {}", config.display()))?;
            let mut desired: DesiredConfiguration =
                serde_json::from_str(&raw).context("Invalid desired configuration")?;

            let cloud = Arc::new(SimulatedCloud::new(transition_polls));
            if !desired.eip_id.is_empty() {
                cloud.add_eip(&desired.eip_id, &eip_addr).await;
            }
            let reconciler = InstanceReconciler::new(ClientBundle::simulated(cloud), settings);

            let mut record = store
                .load(&name)
                .await?
                .map(|entry| entry.record)
                .unwrap_or_default();

            let result = reconciler.reconcile(&desired, &mut record).await;
            store.save(&name, &record).await?;
            match result? {
                ReconcileAction::Created => info!(instance_id = %record.id, "Created"),
                ReconcileAction::Recreated => info!(instance_id = %record.id, "Recreated"),
                ReconcileAction::Updated(report) => info!(
                    instance_id = %record.id,
                    applied = ?report.applied.fields,
                    unsupported = ?report.unsupported,
                    "Updated"
                ),
            }
            print_record(&name, &record);

            if let Some(new_name) = rename {
                desired.name = new_name;
                let result = reconciler.update(&desired, &mut record).await;
                store.save(&name, &record).await?;
                let report = result?;
                info!(instance_id = %record.id, applied = ?report.applied.fields, "Renamed");
                print_record(&name, &record);
            }

            if !keep {
                let result = reconciler.delete(&mut record).await;
                store.save(&name, &record).await?;
                if let Err(e) = result {
                    error!(error = %e, "Delete failed");
                    return Err(e.into());
                }
                info!(name = %name, "Deleted");
            }
        }
        Command::Records => {
            for entry in store.list().await? {
                println!(
                    "{:<16} {:<14} {:<12} {}",
                    entry.name,
                    if entry.record.id.is_empty() {
                        "-"
                    } else {
                        entry.record.id.as_str()
                    },
                    entry.record.state.map(|s| s.as_str()).unwrap_or("-"),
                    entry.updated_at.to_rfc3339()
                );
            }
        }
    }

    Ok(())
}

fn print_record(name: &str, record: &ResourceRecord) {
    println!("{name}: {}", record.id);
    for field in [
        Field::Name,
        Field::Description,
        Field::InstanceType,
        Field::VxnetId,
        Field::PrivateIp,
        Field::EipId,
        Field::PublicIp,
    ] {
        println!("  {:<18} {}", field.as_str(), record.get_str(field));
    }
}
