//! Minimal end-to-end run over the in-memory store.
//!
//! ```sh
//! cargo run --example basic --features testing
//! ```
//!
//! Swap `memory_store()` for `PgStore::connect(&database_url)` to run the
//! same flow against PostgreSQL.

use std::sync::Arc;
use std::time::Duration;

use dotenvy::dotenv;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use duron::testing::memory_store;
use duron::{Action, Client, ClientConfig, Store, WaitOptions};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct GreetInput {
    name: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct GreetOutput {
    greeting: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present (development); DATABASE_URL comes from here
    // when running against PostgreSQL.
    let _ = dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,duron=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store = memory_store();
    let client = Client::builder(store as Arc<dyn Store>)
        .config(ClientConfig {
            pull_interval: Duration::from_millis(500),
            ..ClientConfig::default()
        })
        .action(
            Action::builder("greet").handler(|ctx, input: GreetInput| async move {
                let upper: String = ctx
                    .step("uppercase", |_step| {
                        let name = input.name.clone();
                        async move { Ok(name.to_uppercase()) }
                    })
                    .await?;
                Ok(GreetOutput {
                    greeting: format!("hello, {upper}"),
                })
            })?,
        )
        .build()?;

    client.start().await?;

    let job_id = client.run_action("greet", GreetInput { name: "world".into() }).await?;
    tracing::info!(%job_id, "job enqueued");

    match client
        .wait_for_job(
            job_id,
            WaitOptions {
                timeout: Some(Duration::from_secs(5)),
                signal: None,
            },
        )
        .await
    {
        Some(job) => tracing::info!(status = ?job.status, output = ?job.output, "job finished"),
        None => tracing::warn!("job did not finish in time"),
    }

    client.stop().await?;
    Ok(())
}
