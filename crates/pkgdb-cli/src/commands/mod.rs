pub mod check;
pub mod list;
pub mod lock;
pub mod scrape;
pub mod search;

use anyhow::{Context, Result};
use std::path::Path;

/// Parse `arg` as inline JSON when it looks like an object, otherwise read
/// it as a file.
pub fn inline_or_file<T>(
    arg: &str,
    from_str: impl FnOnce(&str) -> pkgdb_core::Result<T>,
    from_file: impl FnOnce(&Path) -> pkgdb_core::Result<T>,
) -> Result<T> {
    if arg.trim_start().starts_with('{') {
        from_str(arg).context("Failed to parse inline JSON")
    } else {
        from_file(Path::new(arg)).with_context(|| format!("Failed to read {}", arg))
    }
}
