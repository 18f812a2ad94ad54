use clap::Parser;
use color_eyre::eyre::{Context, Result};
use derive_more::Debug;
use ocimod_lib::{
    modify::{self, Modification},
    Reference,
};
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::args::Connection;

#[derive(Debug, Parser)]
pub struct Options {
    /// Image to rebase (e.g. registry.example.com/app:1.0)
    #[arg(value_parser = Reference::from_str)]
    image: Reference,

    #[clap(flatten)]
    connection: Connection,

    /// The base the image was built on, pinned to a digest
    #[arg(long, requires = "new", value_parser = Reference::from_str)]
    old: Option<Reference>,

    /// The base to rebase onto
    #[arg(long, requires = "old", value_parser = Reference::from_str)]
    new: Option<Reference>,

    /// Where to push the result; defaults to the image being rebased
    #[arg(long, value_parser = Reference::from_str)]
    target: Option<Reference>,
}

#[tracing::instrument(skip(cancel))]
pub async fn main(opts: Options, cancel: CancellationToken) -> Result<()> {
    let option = match (opts.old, opts.new) {
        (Some(old), Some(new)) => {
            info!(%old, %new, "rebasing onto explicit base");
            modify::with_rebase_refs(old, new)
        }
        _ => modify::with_rebase(),
    };

    let registry = opts.connection.registry();
    let outcome = Modification::builder()
        .reference(opts.image.clone())
        .maybe_target(opts.target)
        .options(vec![option])
        .cancel(cancel)
        .build()
        .apply(&registry)
        .await
        .with_context(|| format!("rebase {}", opts.image))?;

    if outcome.modified {
        info!(digest = %outcome.descriptor.digest, "rebased image");
    } else {
        info!("base is unchanged");
    }
    println!("{}", outcome.reference.with_digest(&outcome.descriptor.digest));
    Ok(())
}
