//! Search command (pkgdb search)

use crate::config::{self, Overrides};
use anyhow::{Context, Result};
use pkgdb_core::{Search, SearchParams};
use std::io::{self, Write};

/// Arguments for the search command
#[derive(Debug, Clone)]
pub struct SearchArgs {
    /// Inline JSON or a path
    pub params: String,
    pub dump_query: bool,
    pub ga_registry: bool,
    pub overrides: Overrides,
}

/// Run the search command
pub fn run(args: SearchArgs) -> Result<()> {
    let params = SearchParams::from_arg(&args.params).context("Failed to load search parameters")?;
    let settings = config::load_settings(&args.overrides)?;
    let provider = config::provider(&settings)?;
    let search = Search::new(&params, &settings, provider, args.ga_registry)
        .context("Failed to prepare search")?;

    if args.dump_query {
        let query = search.query().context("Failed to compile query")?;
        println!("{}", query.to_sql_string());
        return Ok(());
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let count = search.run(|result| {
        serde_json::to_writer(&mut out, result)?;
        out.write_all(b"\n")?;
        // Results of one input become visible before the next is scraped
        out.flush()?;
        Ok(())
    })?;
    tracing::info!(results = count, "Search finished");
    Ok(())
}
