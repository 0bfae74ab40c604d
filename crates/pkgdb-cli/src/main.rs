use anyhow::Result;
use clap::{Parser, Subcommand};
use pkgdb_core::{Subtree, SUPPORTED_SYSTEMS};
use std::path::PathBuf;

mod commands;
mod config;
mod logging;

/// Package database and environment locker.
///
/// Resolves install descriptors against versioned package registries,
/// writes reproducible lockfiles, and searches cached package databases.
///
/// EXAMPLES:
///     pkgdb search params.json                 Search with a parameters file
///     pkgdb search '{"global-manifest": {}}'   Inline parameters
///     pkgdb lock --manifest manifest.toml      Lock a manifest
///     pkgdb scrape github:NixOS/nixpkgs        Populate a database
///     pkgdb list                               Show cached databases
///
/// ENVIRONMENT VARIABLES:
///     PKGDB_CACHEDIR          Database directory
///     PKGDB_SYSTEM            Default system
///     PKGDB_FIXTURES          JSON fixture file used as package provider
///     PKGDB_PROVIDER_COMMAND  External evaluator used as package provider
///     RUST_LOG                Log filter, overrides --log-level
#[derive(Parser)]
#[command(name = "pkgdb")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Minimum level of log messages written to stderr
    #[arg(long, global = true, value_enum, default_value_t = logging::LogLevel::Warn)]
    log_level: logging::LogLevel,

    /// Log message format
    #[arg(long, global = true, value_enum, default_value_t = logging::LogFormat::Compact)]
    log_format: logging::LogFormat,

    /// Configuration file to use instead of the global one
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding package databases
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// System to resolve for when the manifest declares none
    #[arg(long, global = true, value_parser = clap::builder::PossibleValuesParser::new(SUPPORTED_SYSTEMS))]
    system: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search registry inputs for packages
    ///
    /// Results are printed as one JSON object per line, input by input in
    /// registry priority order.
    ///
    /// EXAMPLES:
    ///     pkgdb search params.json
    ///     pkgdb search '{"global-manifest": "g.toml", "query": {"match-name": "hello"}}'
    ///     pkgdb search params.json --dump-query
    Search {
        /// Search parameters, inline JSON or a path to a JSON file
        params: String,
        /// Print the compiled query instead of searching
        #[arg(long)]
        dump_query: bool,
        /// Use the default registry; the manifest may not declare one
        #[arg(long)]
        ga_registry: bool,
    },

    /// Resolve a manifest into a lockfile
    ///
    /// The new lockfile is printed to stdout.
    ///
    /// EXAMPLES:
    ///     pkgdb lock --manifest manifest.toml
    ///     pkgdb lock --manifest manifest.toml --lockfile manifest.lock
    ///     pkgdb lock --manifest manifest.toml --lockfile manifest.lock --upgrade
    ///     pkgdb lock --manifest manifest.toml --lockfile manifest.lock --upgrade hello
    Lock {
        /// Manifest, inline JSON or a path (JSON, TOML or YAML)
        #[arg(long)]
        manifest: String,
        /// Global manifest, inline JSON or a path
        #[arg(long)]
        global_manifest: Option<String>,
        /// Previous lockfile whose pins and packages are kept when possible
        #[arg(long)]
        lockfile: Option<PathBuf>,
        /// Re-resolve these install ids or groups; every group if none are given
        #[arg(long, num_args = 0..)]
        upgrade: Option<Vec<String>>,
        /// Use the default registry; the manifest may not declare one
        #[arg(long)]
        ga_registry: bool,
    },

    /// Populate the database of a package source
    ///
    /// Prints the path of the database.
    ///
    /// EXAMPLES:
    ///     pkgdb scrape github:NixOS/nixpkgs
    ///     pkgdb scrape github:NixOS/nixpkgs --subtree packages --system aarch64-darwin
    Scrape {
        /// Source locator, e.g. `github:owner/repo` or `github:owner/repo/<rev>`
        locator: String,
        /// Subtree to scrape
        #[arg(long, default_value_t = Subtree::LegacyPackages)]
        subtree: Subtree,
    },

    /// List cached package databases
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check a lockfile
    ///
    /// Verifies lockfile integrity and the `allow` policy of its manifest.
    Check {
        /// Path to the lockfile
        lockfile: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.log_format, cli.log_level)?;

    let overrides = config::Overrides {
        config_file: cli.config,
        cache_dir: cli.cache_dir,
        system: cli.system,
    };

    match cli.command {
        Commands::Search {
            params,
            dump_query,
            ga_registry,
        } => {
            commands::search::run(commands::search::SearchArgs {
                params,
                dump_query,
                ga_registry,
                overrides,
            })?;
        }
        Commands::Lock {
            manifest,
            global_manifest,
            lockfile,
            upgrade,
            ga_registry,
        } => {
            commands::lock::run(commands::lock::LockArgs {
                manifest,
                global_manifest,
                lockfile,
                upgrade,
                ga_registry,
                overrides,
            })?;
        }
        Commands::Scrape { locator, subtree } => {
            commands::scrape::run(&locator, subtree, &overrides)?;
        }
        Commands::List { json } => {
            commands::list::run(json, &overrides)?;
        }
        Commands::Check { lockfile } => {
            commands::check::run(&lockfile)?;
        }
    }

    Ok(())
}
