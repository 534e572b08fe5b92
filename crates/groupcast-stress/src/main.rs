mod cluster;
mod events;
mod output;
mod scenario_common;
mod scenario_runner;
mod scenarios;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use groupcast_protocol::testing::FaultConfig;
use groupcast_protocol::DeliveryConfig;

use cluster::Cluster;
use events::{emit, now_iso, EventStarted};
use scenarios::{RunSettings, Scenario};

#[derive(Parser)]
#[command(
    name = "groupcast-stress",
    about = "Exercise the groupcast delivery layer over a duplicating, lossy network"
)]
struct Cli {
    /// Members in the simulated group.
    #[arg(long, default_value = "3")]
    members: usize,

    /// Copies of every packet put on the wire.
    #[arg(long, default_value = "2")]
    outgoing_copies: usize,

    /// Copies of every packet handed up on receipt.
    #[arg(long, default_value = "2")]
    incoming_copies: usize,

    /// Probability that an outgoing copy is lost.
    #[arg(long, default_value = "0.0")]
    drop_rate: f64,

    /// Reorder window for inbound packets (0 keeps arrival order).
    #[arg(long, default_value = "0")]
    reorder: usize,

    /// Seed for the fault injector.
    #[arg(long, default_value = "1")]
    seed: u64,

    /// Values each sender sends per scenario.
    #[arg(long, default_value = "10")]
    messages: u64,

    /// Seconds to wait for deliveries before a scenario fails.
    #[arg(long, default_value = "10")]
    timeout: u64,

    /// Directory for a JSONL copy of the event stream.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single scenario on a fresh cluster.
    Scenario {
        #[arg(value_enum)]
        name: Scenario,
    },
    /// Run every scenario in sequence on one shared cluster.
    All,
    /// Print the scenario names.
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let (mode, selected): (&str, Vec<Scenario>) = match cli.command {
        Command::List => {
            for scenario in Scenario::ALL {
                println!("{}", scenario.name());
            }
            return Ok(());
        }
        Command::Scenario { name } => (name.name(), vec![name]),
        Command::All => ("all", Scenario::ALL.to_vec()),
    };

    if !(0.0..1.0).contains(&cli.drop_rate) {
        anyhow::bail!("--drop-rate must be in [0, 1), got {}", cli.drop_rate);
    }
    if cli.outgoing_copies == 0 || cli.incoming_copies == 0 {
        anyhow::bail!("copy counts must be at least 1");
    }

    if let Some(dir) = &cli.output_dir {
        let path = output::resolve_jsonl_path(dir, mode)?;
        output::init_jsonl_writer(&path)?;
        eprintln!("JSONL output: {}", path.display());
    }

    eprintln!("groupcast-stress v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "{} members, x{} out / x{} in, drop {:.2}, reorder {}, seed {}",
        cli.members, cli.outgoing_copies, cli.incoming_copies, cli.drop_rate, cli.reorder, cli.seed
    );
    eprintln!();

    emit(&EventStarted {
        event: "started",
        mode: mode.to_string(),
        members: cli.members,
        outgoing_copies: cli.outgoing_copies,
        incoming_copies: cli.incoming_copies,
        drop_rate: cli.drop_rate,
        reorder_window: cli.reorder,
        seed: cli.seed,
        timestamp: now_iso(),
    });

    let faults = FaultConfig::duplicating(cli.outgoing_copies, cli.incoming_copies)
        .drop_rate(cli.drop_rate)
        .reorder(cli.reorder)
        .seed(cli.seed);
    let config = DeliveryConfig::new()
        .gap_timeout(Duration::from_millis(50))
        .retransmit_backoff(Duration::from_millis(50), Duration::from_millis(500), 20)
        .stability_interval(Duration::from_secs(1));
    let settings = RunSettings {
        messages: cli.messages,
        delivery_timeout: Duration::from_secs(cli.timeout),
        quiet_period: Duration::from_millis(200),
        stability_timeout: Duration::from_secs(cli.timeout),
    };

    let mut cluster = Cluster::start(cli.members, &faults, &config).await?;
    let passed = scenario_runner::run(&mut cluster, &selected, &settings).await?;
    cluster.shutdown().await;

    if !passed {
        std::process::exit(1);
    }
    Ok(())
}
