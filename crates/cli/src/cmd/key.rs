use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use kiln_lib::{Recipe, SourceTypes};

#[derive(Args)]
pub struct KeyOpts {
    /// Path to the recipe file
    #[arg(default_value = "recipe.toml")]
    pub recipe: PathBuf,

    /// Directory for cached source material
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,
}

pub fn run(opts: KeyOpts) -> Result<()> {
    let recipe = Recipe::load(&opts.recipe)?;
    let staging = super::cache_dir(opts.cache_dir, &recipe.name)?;

    let types = SourceTypes::with_defaults();
    let source = recipe.source(&types, Arc::new(super::TermHints))?;
    let key = source.build_cache(&staging).cachekey()?;
    println!("{key}");
    Ok(())
}
