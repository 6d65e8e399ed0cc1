//! debtflow CLI - ingress server, stage workers and broker/database bootstrap

use clap::{Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use debtflow::config::Settings;
use debtflow::health::HealthCheck;
use debtflow::ingress::{self, AppState};
use debtflow::persistence::{Database, PgStore};
use debtflow::pipeline::{shutdown, Publisher};
use debtflow::worker::{self, Services};
use debtflow::{AmqpBroker, Broker, StageKind};

#[derive(Parser)]
#[command(name = "debtflow")]
#[command(version, about = "Queue-driven ingestion pipeline for bulk debt files", long_about = None)]
struct Cli {
    /// YAML settings file (defaults to $DEBTFLOW_CONFIG when set)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP upload and health endpoints
    Serve,

    /// Consume one stage (or all of them)
    Worker {
        #[arg(value_enum)]
        stage: WorkerStage,

        /// Consumer instances per stage
        #[arg(short, long, default_value_t = 1)]
        instances: usize,
    },

    /// Declare exchanges and queues for every stage
    Declare,

    /// Create database tables when missing
    Migrate,
}

#[derive(Clone, Copy, ValueEnum)]
enum WorkerStage {
    FileSplit,
    ChunkIngest,
    Document,
    Notification,
    All,
}

impl WorkerStage {
    fn kinds(self) -> Vec<StageKind> {
        match self {
            WorkerStage::FileSplit => vec![StageKind::FileSplit],
            WorkerStage::ChunkIngest => vec![StageKind::ChunkIngest],
            WorkerStage::Document => vec![StageKind::DocumentGeneration],
            WorkerStage::Notification => vec![StageKind::Notification],
            WorkerStage::All => StageKind::ALL.to_vec(),
        }
    }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .or_else(|| std::env::var_os("DEBTFLOW_CONFIG").map(PathBuf::from));

    let settings = match Settings::load(config_path.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(2);
        }
    };

    let result = match cli.command {
        Commands::Serve => serve(settings).await,
        Commands::Worker { stage, instances } => run_worker(settings, stage, instances).await,
        Commands::Declare => declare(settings).await,
        Commands::Migrate => migrate(settings).await,
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "debtflow exited with an error");
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn connect_store(settings: &Settings) -> Result<PgStore, Box<dyn std::error::Error>> {
    let db = Database::connect(&settings.database)?;
    Ok(PgStore::new(db))
}

async fn serve(settings: Settings) -> CliResult {
    let broker: Arc<dyn Broker> = Arc::new(AmqpBroker::connect(&settings.broker).await?);
    let store = connect_store(&settings)?;

    let channel = broker.open_channel().await?;
    let file_topology = StageKind::FileSplit.topology(settings.pipeline.retry_delay_ms);
    file_topology.declare(channel.as_ref()).await?;

    let state = AppState {
        publisher: Publisher::new(channel),
        file_route: file_topology.route(),
        upload_dir: settings.ingress.upload_dir.clone(),
        health: HealthCheck::new(Arc::new(store), Arc::clone(&broker), settings.ingress.health_timeout()),
    };
    let app = ingress::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.ingress.port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("debtflow ingress listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown::os_signal())
        .await?;
    broker.close().await?;
    Ok(())
}

async fn run_worker(settings: Settings, stage: WorkerStage, instances: usize) -> CliResult {
    let broker: Arc<dyn Broker> = Arc::new(AmqpBroker::connect(&settings.broker).await?);
    let store = Arc::new(connect_store(&settings)?);

    let services = Services {
        broker: Arc::clone(&broker),
        debts: store.clone(),
        documents: store,
        settings: settings.pipeline.clone(),
    };

    let (trigger, signal) = shutdown::channel();
    tokio::spawn(async move {
        shutdown::os_signal().await;
        trigger.trigger();
    });

    let result = worker::run_workers(&stage.kinds(), instances, services, signal).await;
    broker.close().await?;
    result?;
    Ok(())
}

async fn declare(settings: Settings) -> CliResult {
    let broker = AmqpBroker::connect(&settings.broker).await?;
    worker::declare_all(&broker, settings.pipeline.retry_delay_ms).await?;
    tracing::info!("Declared topology for {} stages", StageKind::ALL.len());
    broker.close().await?;
    Ok(())
}

async fn migrate(settings: Settings) -> CliResult {
    let store = connect_store(&settings)?;
    store.ensure_tables().await?;
    Ok(())
}
