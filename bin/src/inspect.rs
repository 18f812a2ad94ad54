use clap::Parser;
use color_eyre::eyre::{Context as _, Result};
use derive_more::Debug;
use ocimod_lib::{
    dag::{Dag, NodeId, NodeKind},
    descriptor::Descriptor,
    pipeline::Context,
    Reference,
};
use pluralizer::pluralize;
use serde::Serialize;
use std::{collections::BTreeMap, str::FromStr};
use tap::Pipe;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::args::Connection;

#[derive(Debug, Parser)]
pub struct Options {
    /// Image to inspect (e.g. registry.example.com/app:1.0)
    #[arg(value_parser = Reference::from_str)]
    image: Reference,

    #[clap(flatten)]
    connection: Connection,
}

#[derive(Debug, Serialize)]
struct Manifest {
    reference: String,
    media_type: String,
    digest: String,
    size: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    platform: Option<String>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    annotations: BTreeMap<String, String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    manifests: Vec<Manifest>,

    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<Blob>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    layers: Vec<Blob>,
}

#[derive(Debug, Serialize)]
struct Blob {
    media_type: String,
    digest: String,
    size: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    diff_id: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    urls: Vec<String>,
}

impl Blob {
    fn new(descriptor: &Descriptor, diff_id: Option<String>) -> Self {
        Self {
            media_type: descriptor.media_type.clone(),
            digest: descriptor.digest.to_string(),
            size: descriptor.size,
            diff_id,
            urls: descriptor.urls.clone(),
        }
    }
}

fn render(dag: &Dag, id: NodeId) -> Manifest {
    let node = dag.node(id);
    let descriptor = node.descriptor();
    let mut rendered = Manifest {
        reference: node.reference.to_string(),
        media_type: node.manifest.media_type().to_string(),
        digest: descriptor.digest.to_string(),
        size: descriptor.size,
        platform: descriptor.platform.as_ref().map(ToString::to_string),
        annotations: node.manifest.annotations().clone(),
        manifests: Vec::new(),
        config: None,
        layers: Vec::new(),
    };

    match &node.kind {
        NodeKind::Index(children) => {
            rendered.manifests = children.iter().map(|child| render(dag, *child)).collect();
        }
        NodeKind::Image(image) => {
            rendered.config = Blob::new(image.config.descriptor(), None).pipe(Some);
            rendered.layers = image
                .layers
                .iter()
                .map(|layer| Blob::new(layer.descriptor(), layer.diff_id.as_ref().map(ToString::to_string)))
                .collect();
        }
    }
    rendered
}

#[tracing::instrument(skip(cancel))]
pub async fn main(opts: Options, cancel: CancellationToken) -> Result<()> {
    let registry = opts.connection.registry();
    let mut ctx = Context::new(&registry, opts.image.clone(), cancel);
    let dag = Dag::load(&mut ctx, &opts.image)
        .await
        .with_context(|| format!("load {}", opts.image))?;
    info!("loaded {}", pluralize("manifest", dag.len() as isize, true));

    let rendered = render(&dag, dag.root())
        .pipe_ref(serde_json::to_string_pretty)
        .context("render image")?;
    println!("{rendered}");
    Ok(())
}
