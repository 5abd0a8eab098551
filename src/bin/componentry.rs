//! CLI front-end: reads a root description (and optional override delta)
//! off disk, resolves it, and starts the resulting tree's supervisor.
//!
//! This binary is the only part of the crate that touches the filesystem
//! directly — the library itself only ever consumes `Spec` values and
//! `serde_json::Value` overrides through a `ModuleLoader`'s resolver
//! chain. It registers no application module factories of its own: an
//! application embedding this crate as a library is expected to build its
//! own `Loader` with its own `StaticTableResolver` entries and either
//! reuse this binary's argument parsing or write its own entry point.

use std::path::PathBuf;
use std::rc::Rc;

use clap::Parser;
use componentry::loader::load_resource;
use componentry::{Loader, ModuleLoader, Spec, Supervisor};
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "componentry", about = "Run a component tree description")]
struct Cli {
    /// Path to the root description JSON file.
    #[arg(long)]
    root: PathBuf,

    /// Optional path to a spec-override JSON file merged on top of the
    /// resolved root description (after any sibling `++.json` delta),
    /// allowed to rename the root, before the tree is started.
    #[arg(long = "override")]
    override_path: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let local = tokio::task::LocalSet::new();
    local.run_until(run(cli)).await;
}

async fn run(cli: Cli) {
    let loader = Rc::new(Loader::new(Vec::new()));

    let spec = match load_spec(&cli, loader.as_ref()).await {
        Ok(spec) => spec,
        Err(err) => {
            error!("{:#}", anyhow_chain(&err));
            std::process::exit(1);
        }
    };

    let loader = loader as Rc<dyn ModuleLoader>;
    match Supervisor::start(spec, loader).await {
        Ok(_supervisor) => {
            // The supervisor's own tick loop now drives the tree; block
            // forever so the process stays alive to serve it.
            std::future::pending::<()>().await;
        }
        Err(err) => {
            error!("{:#}", anyhow_chain(&err));
            std::process::exit(1);
        }
    }
}

/// Loads the root description, threading the optional `--override` delta
/// through as `loadDescription`'s `specOverride` layer (§4.2 step 4,
/// `overrideName=true`) rather than merging it in separately — so a
/// renaming override (§8's **rename** scenario, applied at the file edge)
/// is accepted instead of rejected for a name mismatch.
async fn load_spec(cli: &Cli, loader: &Loader) -> componentry::Result<Spec> {
    let spec_override = match &cli.override_path {
        Some(override_path) => {
            let raw = load_resource(override_path).await?;
            let delta: Spec = serde_json::from_str(&raw).map_err(|err| {
                componentry::Error::invalid_spec(
                    override_path.to_string_lossy(),
                    format!("invalid JSON: {err}"),
                )
            })?;
            Some(delta)
        }
        None => None,
    };

    loader
        .load_description(&cli.root, spec_override.as_ref())
        .await
}

/// Walks `Error::source()` so the logged line includes the full causal
/// chain, matching `anyhow`'s `{:#}` alternate-format convention.
fn anyhow_chain(err: &componentry::Error) -> String {
    let mut chain = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}
