use clap::Parser;
use color_eyre::eyre::{Context, Result};
use derive_more::Debug;
use ocimod_lib::{
    modify::{self, Modification, Opt},
    Digest, Reference,
};
use pluralizer::pluralize;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::args::{self, Connection};

#[derive(Debug, Parser)]
pub struct Options {
    /// Image to modify (e.g. registry.example.com/app:1.0)
    #[arg(value_parser = Reference::from_str)]
    image: Reference,

    #[clap(flatten)]
    connection: Connection,

    /// Set an annotation on the top manifest; an empty value removes it
    #[arg(long, value_name = "NAME=VALUE", value_parser = args::pair)]
    annotation: Vec<(String, String)>,

    /// Record the base image in the standard base annotations
    #[arg(long, value_name = "NAME@DIGEST", value_parser = args::base)]
    annotation_base: Option<(Reference, Digest)>,

    /// Set a label in each image config; an empty value removes it
    #[arg(long, value_name = "NAME=VALUE", value_parser = args::pair)]
    label: Vec<(String, String)>,

    /// Copy the labels of each image config into annotations on its manifest
    #[arg(long)]
    labels_to_annotations: bool,

    /// Strip external URLs from layers, making foreign layers regular layers
    #[arg(long)]
    external_urls_rm: bool,

    /// Convert manifests, configs, and layers to OCI media types
    #[arg(long)]
    to_oci: bool,

    /// Rebase onto the current version of the base recorded in the annotations
    #[arg(long, conflicts_with = "rebase_ref")]
    rebase: bool,

    /// Rebase from the old base onto the new base
    #[arg(long, value_name = "OLD,NEW", value_parser = args::reference_pair)]
    rebase_ref: Option<(Reference, Reference)>,

    /// Where to push the result; defaults to the image being modified
    #[arg(long, value_parser = Reference::from_str)]
    target: Option<Reference>,
}

impl Options {
    /// The modifications requested, in the order they are applied.
    fn options(&self) -> Vec<Opt> {
        let mut options = Vec::new();
        if self.rebase {
            options.push(modify::with_rebase());
        }
        if let Some((old, new)) = &self.rebase_ref {
            options.push(modify::with_rebase_refs(old.clone(), new.clone()));
        }
        if self.external_urls_rm {
            options.push(modify::with_external_urls_rm());
        }
        if self.to_oci {
            options.push(modify::with_manifest_to_oci());
        }
        for (name, value) in &self.label {
            options.push(modify::with_label(name, value));
        }
        if self.labels_to_annotations {
            options.push(modify::with_labels_to_annotations());
        }
        if let Some((base, digest)) = &self.annotation_base {
            options.push(modify::with_annotation_base(base.clone(), digest.clone()));
        }
        for (name, value) in &self.annotation {
            options.push(modify::with_annotation(name, value));
        }
        options
    }
}

#[tracing::instrument(skip(cancel))]
pub async fn main(opts: Options, cancel: CancellationToken) -> Result<()> {
    let options = opts.options();
    info!(image = %opts.image, "applying {}", pluralize("modification", options.len() as isize, true));

    let registry = opts.connection.registry();
    let outcome = Modification::builder()
        .reference(opts.image.clone())
        .maybe_target(opts.target)
        .options(options)
        .cancel(cancel)
        .build()
        .apply(&registry)
        .await
        .with_context(|| format!("modify {}", opts.image))?;

    if !outcome.modified {
        info!("image was already up to date");
    }
    println!("{}", outcome.reference.with_digest(&outcome.descriptor.digest));
    Ok(())
}
