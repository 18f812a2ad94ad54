use clap::Parser;
use color_eyre::eyre::{Context, Result};
use derive_more::Debug;
use ocimod_lib::{rebase::check_base, Reference};
use std::str::FromStr;
use tracing::info;

use crate::args::Connection;

#[derive(Debug, Parser)]
pub struct Options {
    /// Image to check (e.g. registry.example.com/app:1.0)
    #[arg(value_parser = Reference::from_str)]
    image: Reference,

    #[clap(flatten)]
    connection: Connection,

    /// Check against this base instead of the one recorded in the annotations
    #[arg(long, value_parser = Reference::from_str)]
    base: Option<Reference>,
}

#[tracing::instrument]
pub async fn main(opts: Options) -> Result<()> {
    let registry = opts.connection.registry();
    check_base(&registry, &opts.image, opts.base.as_ref())
        .await
        .with_context(|| format!("check base of {}", opts.image))?;

    info!(image = %opts.image, "base is current");
    Ok(())
}
