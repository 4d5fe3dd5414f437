pub mod context;
pub mod guess;
pub mod key;

use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use kiln_lib::Hints;
use owo_colors::OwoColorize;

/// Advisory sink that prints hints on the terminal instead of the log.
pub struct TermHints;

impl Hints for TermHints {
    fn hint(&self, message: &str, documentation: &str) {
        eprintln!(
            "{} {message} (see {documentation})",
            "hint:".yellow().bold()
        );
    }
}

/// Staging directory for a recipe's cached source material.
///
/// Each recipe gets its own subdirectory so concurrent builds of different
/// packages never share a working tree.
pub fn cache_dir(explicit: Option<PathBuf>, recipe_name: &str) -> Result<PathBuf> {
    let base = match explicit {
        Some(dir) => dir,
        None => dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("kiln"),
    };
    let dir = base.join(recipe_name);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}
