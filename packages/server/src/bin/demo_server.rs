//! Demo server with two toy models behind the staged pipeline.
//!
//! Routes:
//! - `POST /v1/analyze` -- lexicon-based sentiment scoring
//! - `GET /v1/models` -- model catalog listing
//! - `GET /v1/models/{name}` -- one catalog entry
//!
//! ```text
//! demo-server --port 8080
//! curl -s localhost:8080/v1/analyze -d '{"text":"what a great day"}'
//! curl -s localhost:8080/v1/models/sentiment-tiny
//! ```

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use conveyor_core::{Model, ServiceRequest};
use conveyor_server::network::Endpoint;
use conveyor_server::{
    Dispatcher, ModelService, NetworkConfig, NetworkModule, ServiceConfig, ServiceEndpoint,
};
use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Conveyor demo server.
#[derive(Parser, Debug)]
#[command(name = "demo-server")]
#[command(about = "Staged model serving over HTTP with toy models")]
struct Args {
    /// Host address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind (0 picks a free port)
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Worker threads per pipeline stage
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Emit logs as JSON
    #[arg(long, default_value_t = false)]
    json_logs: bool,
}

// ---------------------------------------------------------------------------
// Sentiment model
// ---------------------------------------------------------------------------

const POSITIVE: &[&str] = &[
    "good", "great", "excellent", "love", "happy", "fast", "wonderful",
];
const NEGATIVE: &[&str] = &[
    "bad", "awful", "terrible", "hate", "sad", "slow", "broken",
];

/// Lexicon sentiment scorer with simulated inference latency.
#[derive(Debug)]
struct SentimentModel;

struct TokenCounts {
    positive: usize,
    negative: usize,
    total: usize,
}

#[derive(Debug, Serialize)]
struct SentimentReport {
    text: String,
    label: &'static str,
    score: f64,
    tokens: usize,
}

impl Model for SentimentModel {
    type Input = String;
    type Output = TokenCounts;
    type Ret = SentimentReport;

    fn load(&self) -> anyhow::Result<()> {
        // A real model would map weights here; the lexicon is compiled in.
        Ok(())
    }

    fn preprocess(&self, request: &ServiceRequest) -> anyhow::Result<Self::Input> {
        let text = request
            .payload
            .get("text")
            .and_then(|v| v.as_str())
            .context("request body must carry a \"text\" string field")?;
        Ok(text.to_lowercase())
    }

    fn inference(&self, input: &Self::Input) -> anyhow::Result<Self::Output> {
        // Sleep a few milliseconds so the bounded pools are observable
        // under concurrent load.
        let mut rng = rand::rng();
        thread::sleep(Duration::from_millis(rng.random_range(5..=25)));

        let mut counts = TokenCounts {
            positive: 0,
            negative: 0,
            total: 0,
        };
        for token in input.split_whitespace() {
            let token = token.trim_matches(|c: char| !c.is_alphanumeric());
            counts.total += 1;
            if POSITIVE.contains(&token) {
                counts.positive += 1;
            } else if NEGATIVE.contains(&token) {
                counts.negative += 1;
            }
        }
        Ok(counts)
    }

    #[allow(clippy::cast_precision_loss)]
    fn postprocess(
        &self,
        _request: &ServiceRequest,
        input: &Self::Input,
        output: Self::Output,
    ) -> anyhow::Result<Self::Ret> {
        let spread = output.positive as f64 - output.negative as f64;
        let score = spread / output.total.max(1) as f64;
        let label = if score > 0.0 {
            "positive"
        } else if score < 0.0 {
            "negative"
        } else {
            "neutral"
        };
        Ok(SentimentReport {
            text: input.clone(),
            label,
            score,
            tokens: output.total,
        })
    }
}

// ---------------------------------------------------------------------------
// Catalog model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize)]
struct CatalogEntry {
    name: &'static str,
    task: &'static str,
    version: &'static str,
}

const CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        name: "sentiment-tiny",
        task: "sentiment-analysis",
        version: "0.3.1",
    },
    CatalogEntry {
        name: "echo",
        task: "diagnostics",
        version: "1.0.0",
    },
];

/// Serves the static model catalog. The same service backs both the
/// listing route and the `{name}` lookup route.
#[derive(Debug)]
struct CatalogModel;

impl Model for CatalogModel {
    type Input = Option<String>;
    type Output = Vec<CatalogEntry>;
    type Ret = serde_json::Value;

    fn load(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn preprocess(&self, request: &ServiceRequest) -> anyhow::Result<Self::Input> {
        Ok(request.param("name").map(String::from))
    }

    fn inference(&self, input: &Self::Input) -> anyhow::Result<Self::Output> {
        let entries = match input.as_deref() {
            Some(wanted) => CATALOG
                .iter()
                .copied()
                .filter(|entry| entry.name == wanted)
                .collect(),
            None => CATALOG.to_vec(),
        };
        Ok(entries)
    }

    fn postprocess(
        &self,
        _request: &ServiceRequest,
        input: &Self::Input,
        output: Self::Output,
    ) -> anyhow::Result<Self::Ret> {
        match input {
            Some(wanted) => {
                let entry = output
                    .into_iter()
                    .next()
                    .with_context(|| format!("unknown model {wanted:?}"))?;
                Ok(serde_json::to_value(entry)?)
            }
            None => Ok(serde_json::json!({ "models": output })),
        }
    }
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

fn init_tracing(json_logs: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("demo_server=info,conveyor_server=info,warn"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if json_logs {
        builder.json().flatten_event(true).init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    info!(workers = args.workers, "starting demo server");

    let service_config = ServiceConfig::uniform(args.workers);

    let sentiment = Arc::new(ModelService::new(SentimentModel, &service_config)?);
    sentiment.start().await?;

    let catalog = Arc::new(ModelService::new(CatalogModel, &service_config)?);
    catalog.start().await?;

    let endpoints: Vec<Arc<dyn Endpoint>> = vec![
        Arc::new(ServiceEndpoint::new("/v1/analyze", "POST", sentiment)),
        Arc::new(ServiceEndpoint::new("/v1/models", "GET", catalog.clone())),
        Arc::new(ServiceEndpoint::new("/v1/models/{name}", "GET", catalog)),
    ];

    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.register(endpoints)?;

    let network_config = NetworkConfig {
        host: args.host,
        port: args.port,
        ..NetworkConfig::default()
    };

    let mut module = NetworkModule::new(network_config, dispatcher);
    let port = module.start().await?;
    info!("demo server ready on port {port}");

    let report = module
        .serve(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupt received, draining");
        })
        .await?;

    for failure in &report.failures {
        warn!(endpoint = %failure.key, "teardown failure: {:#}", failure.error);
    }
    Ok(())
}
