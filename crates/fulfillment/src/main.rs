//! Order-processing worker entry point.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use event_store::{EventStore, InMemoryEventStore, PostgresEventStore};
use fulfillment::{Config, LogFormat, ORDER_WORKFLOW, Order, Services, order_start_options};
use runtime::{Runtime, WorkflowClient};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn open_store(config: &Config) -> Result<Arc<dyn EventStore>, Box<dyn Error>> {
    match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
            let store = PostgresEventStore::new(pool);
            store.run_migrations().await?;
            tracing::info!("using PostgreSQL event store");
            Ok(Arc::new(store))
        }
        None => {
            tracing::info!("DATABASE_URL not set, keeping history in memory");
            Ok(Arc::new(InMemoryEventStore::new()))
        }
    }
}

/// Starts the demo order and logs how it ends.
async fn run_sample_order(client: WorkflowClient) -> Result<(), Box<dyn Error + Send + Sync>> {
    let order_id = Uuid::new_v4().simple().to_string();
    let order = Order::sample(format!("order-{}", &order_id[..8]));
    let execution = client
        .start_workflow(ORDER_WORKFLOW, serde_json::to_value(&order)?, order_start_options(&order))
        .await?;
    tracing::info!(%execution, order_id = %order.order_id, total = order.total_amount, "order workflow started");

    let outcome = client.get_result(&execution, Duration::from_secs(600)).await?;
    match &outcome.result {
        Ok(result) => {
            metrics::counter!("orders_total", "status" => "completed").increment(1);
            tracing::info!(attempt = outcome.attempt, %result, "order completed");
        }
        Err(failure) => {
            let status = failure.status().unwrap_or("failed").to_string();
            metrics::counter!("orders_total", "status" => status.clone()).increment(1);
            tracing::warn!(attempt = outcome.attempt, status, error = %failure, "order failed");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // 1. Load configuration and initialize tracing
    let config = Config::from_env();
    init_tracing(&config);

    // 2. Open the history store
    let store = open_store(&config).await?;

    // 3. Register the saga and start the runtime (recovers open executions)
    let services = Services::in_memory();
    let runtime = fulfillment::install(Runtime::builder(store), &services)
        .options(config.runtime_options())
        .start()
        .await?;
    let report = runtime.recovery();
    tracing::info!(resumed = report.resumed, closed = report.closed, "worker ready");

    // 4. Run the sample order in the background
    let client = runtime.client();
    let sample = tokio::spawn(async move {
        if let Err(err) = run_sample_order(client).await {
            tracing::error!(error = %err, "sample order failed to run");
        }
    });

    // 5. Serve until told to stop
    shutdown_signal().await;
    sample.abort();
    runtime.shutdown().await;

    tracing::info!("worker shut down gracefully");
    Ok(())
}
