//! Kiln Runtime
//!
//! Serves scripts from a directory: runs each path given on the command
//! line, or with `--watch` every path read from stdin while source changes
//! are picked up in the background.

use anyhow::{bail, Context, Result};
use clap::Parser;
use kiln_asset::FsSourceStore;
use kiln_core::{Engine, RequestContext, SourceStore};
use kiln_script::QuickJsCompiler;
use kiln_services::Settings;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "kiln", version, about = "Run compiled script units")]
struct Args {
    /// Directory scripts are served from.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// JSON settings file. Missing means defaults.
    #[arg(long, default_value = "kiln.json")]
    settings: PathBuf,

    /// Keep serving paths read from stdin and watch the root for changes.
    #[arg(long)]
    watch: bool,

    /// Compile every script under the root before serving.
    #[arg(long)]
    preload: bool,

    /// Script paths to run, e.g. `/index.js`.
    paths: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    tracing::info!("Kiln v{}", kiln_core::VERSION);

    let mut settings = Settings::load_or_default(&args.settings)
        .with_context(|| format!("loading {}", args.settings.display()))?;
    if args.watch {
        settings.watch.enabled = true;
    }

    let store = Arc::new(FsSourceStore::new(&args.root));
    let engine = Engine::builder(Arc::new(QuickJsCompiler::new(settings.script.clone())), store.clone())
        .config(settings.engine.clone())
        .build();

    if args.preload {
        let failed = engine
            .preload(store.list())
            .into_iter()
            .filter_map(|(path, outcome)| outcome.err().map(|err| (path, err)))
            .inspect(|(path, err)| tracing::warn!(path = %path, error = %err, "preload failed"))
            .count();
        tracing::info!(units = engine.unit_count(), failed, "preload finished");
    }

    let mut failures = 0usize;
    for path in &args.paths {
        if !serve(&engine, path.clone()).await {
            failures += 1;
        }
    }

    if args.watch {
        let watching = kiln_services::start_watching(&engine, store, &settings.watch);
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await.context("reading stdin")? {
            let path = line.trim();
            if !path.is_empty() && !serve(&engine, path.to_string()).await {
                failures += 1;
            }
        }
        watching.stop().await;
    }

    let stats = engine.stats();
    for (event, count) in stats.iter().filter(|(_, count)| *count > 0) {
        tracing::debug!(event = event.name(), count, "engine stats");
    }
    let (min_ms, max_ms) = engine.latency().range_ms();
    tracing::debug!(avg_ms = engine.latency().average_ms(), min_ms, max_ms, "execution latency");

    let shutdown = engine.clone();
    tokio::task::spawn_blocking(move || shutdown.shutdown())
        .await
        .context("shutting down engine")?;

    if failures > 0 {
        bail!("{failures} script(s) failed");
    }
    Ok(())
}

/// Run one script and print its body. Returns whether it succeeded.
async fn serve(engine: &Engine, path: String) -> bool {
    let engine = engine.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let mut request = RequestContext::new(path);
        let result = engine.run(&mut request);
        (request, result)
    })
    .await;

    match outcome {
        Ok((request, Ok(()))) => {
            println!("{}", request.body);
            true
        }
        Ok((request, Err(err))) => {
            if !request.body.is_empty() {
                println!("{}", request.body);
            }
            tracing::error!(path = %request.script_path, status = err.status_hint(), error = %err, "script failed");
            false
        }
        Err(err) => {
            tracing::error!(error = %err, "script worker failed");
            false
        }
    }
}
