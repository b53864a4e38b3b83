//! Bundle a built workspace.

use anyhow::{bail, Context, Result};
use bundle_builder::config::{load_config, BundleConfig, DEFAULT_CONFIG_FILE};
use bundle_builder::{run_bundle, BundleError, BundleFormat, BundleOptions, InstallerRegistry};
use clap::Parser;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bundle-builder", version, about = "Bundle a workspace and its dependencies")]
struct Cli {
    /// Workspace manifest (default: ./bundle.toml when present)
    #[arg(long, env = "BUNDLE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory with the built workspace
    #[arg(long)]
    install_base: Option<PathBuf>,

    /// Directory for the bundle and its cache
    #[arg(long)]
    bundle_base: Option<PathBuf>,

    /// Bundle format to produce
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=2))]
    bundle_version: Option<u32>,

    /// Also archive installer sources into sources.tar.gz
    #[arg(long)]
    include_sources: bool,

    /// Re-run installers even if no dependency declaration changed
    #[arg(long)]
    upgrade: bool,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            if let Some(hint) = e.downcast_ref::<BundleError>().and_then(BundleError::hint) {
                eprintln!("Hint: {hint}");
            }
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match cli.verbose {
        0 => EnvFilter::new("bundle_builder=warn"),
        1 => EnvFilter::new("bundle_builder=info"),
        _ => EnvFilter::new("bundle_builder=debug"),
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    let config = load_manifest(cli.config.as_deref())?;
    let options = apply_overrides(config.options, &cli)?;

    if !options.install_base.exists() {
        bail!(
            "Install base '{}' does not exist. You must build your workspace before bundling it.",
            options.install_base.display()
        );
    }

    let installers = InstallerRegistry::with_builtin().instantiate_all(&config.installers)?;
    let outcome = run_bundle(&options, &config.packages, installers)?;
    debug!("{outcome:?}");
    println!("Bundle written to {}", outcome.output_path.display());
    Ok(())
}

fn load_manifest(explicit: Option<&Path>) -> Result<BundleConfig> {
    if let Some(path) = explicit {
        return Ok(load_config(path)?);
    }
    let default = Path::new(DEFAULT_CONFIG_FILE);
    if default.is_file() {
        return Ok(load_config(default)?);
    }
    debug!("No {DEFAULT_CONFIG_FILE} found, bundling without dependencies");
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    Ok(BundleConfig {
        path: cwd.join(DEFAULT_CONFIG_FILE),
        options: BundleOptions::new(cwd.join("install"), cwd.join("bundle")),
        packages: vec![],
        installers: BTreeMap::new(),
    })
}

fn apply_overrides(mut options: BundleOptions, cli: &Cli) -> Result<BundleOptions> {
    if let Some(path) = &cli.install_base {
        options.install_base = absolute(path)?;
    }
    if let Some(path) = &cli.bundle_base {
        options.bundle_base = absolute(path)?;
    }
    if let Some(version) = cli.bundle_version {
        options.format = BundleFormat::try_from(version)?;
    }
    options.include_sources |= cli.include_sources;
    options.upgrade |= cli.upgrade;
    Ok(options)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    Ok(cwd.join(path))
}
