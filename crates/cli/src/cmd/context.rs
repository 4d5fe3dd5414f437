use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Args;
use kiln_lib::{Recipe, SourceStage, SourceTypes, Variables};
use owo_colors::OwoColorize;

#[derive(Args)]
pub struct ContextOpts {
    /// Path to the recipe file
    #[arg(default_value = "recipe.toml")]
    pub recipe: PathBuf,

    /// Base image for the source stage
    #[arg(long, default_value = "ubuntu:22.04")]
    pub image: String,

    /// Target distribution
    #[arg(long, default_value = "ubuntu")]
    pub distribution: String,

    /// Target distribution version
    #[arg(long, default_value = "22.04")]
    pub distribution_version: String,

    /// Refresh the package index before installing build dependencies
    #[arg(long)]
    pub update: bool,

    /// Directory for cached source material
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Where to write the context archive
    #[arg(short, long, default_value = "context.tar")]
    pub output: PathBuf,
}

pub fn run(opts: ContextOpts) -> Result<()> {
    let recipe = Recipe::load(&opts.recipe)?;
    let staging = super::cache_dir(opts.cache_dir, &recipe.name)?;

    let types = SourceTypes::with_defaults();
    let source = recipe.source(&types, Arc::new(super::TermHints))?;
    let mut cache = source.build_cache(&staging);

    let variables = Variables {
        image: opts.image,
        distribution: opts.distribution,
        distribution_version: opts.distribution_version,
        flavour: None,
        codename: None,
        update: opts.update,
    }
    .resolve();

    let stage = SourceStage::new(variables);
    let mut stream = stage.tar_io(cache.as_mut())?;
    let mut out = File::create(&opts.output)
        .with_context(|| format!("cannot create {}", opts.output.display()))?;
    let bytes = io::copy(&mut stream, &mut out)?;

    println!(
        "{} {} ({bytes} bytes)",
        "context written:".green().bold(),
        opts.output.display()
    );
    Ok(())
}
