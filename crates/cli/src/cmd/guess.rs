use anyhow::Result;
use clap::Args;
use kiln_lib::SourceTypes;

#[derive(Args)]
pub struct GuessOpts {
    /// Location to classify
    pub url: String,
}

pub fn run(opts: GuessOpts) -> Result<()> {
    let types = SourceTypes::with_defaults();
    let ty = types.guess(&opts.url, None)?;
    println!("{}", ty.name());
    Ok(())
}
