//! Steps that modify a [`Dag`], and the context they run with.
//!
//! Steps come in three kinds, depending on which nodes they act on.
//! A [`Pipeline`] runs its steps in the order they were added; each step visits
//! every node in the graph, children before parents, before the next step starts.
//! The first failure stops the pipeline.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
};

use async_trait::async_trait;
use color_eyre::{eyre::Context as _, Result};
use derive_more::Debug;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    config::ImageConfig,
    dag::{ConfigNode, Dag, LayerNode, ManifestNode, NodeKind, State},
    descriptor::Descriptor,
    error::ErrorKind,
    manifest::Manifest,
    registry::Registry,
    Digest, Reference,
};

/// A step that acts on each layer of each image.
#[async_trait]
pub trait LayerStep: std::fmt::Debug + Send + Sync {
    async fn apply(&mut self, ctx: &mut Context<'_>, layer: &mut LayerNode) -> Result<()>;
}

/// A step that acts on the config of each image.
#[async_trait]
pub trait ConfigStep: std::fmt::Debug + Send + Sync {
    async fn apply(&mut self, ctx: &mut Context<'_>, config: &mut ConfigNode) -> Result<()>;
}

/// A step that acts on each manifest, indexes included.
#[async_trait]
pub trait ManifestStep: std::fmt::Debug + Send + Sync {
    async fn apply(&mut self, ctx: &mut Context<'_>, node: &mut ManifestNode) -> Result<()>;
}

/// A registered step.
#[derive(Debug)]
pub enum Step {
    Layer(Box<dyn LayerStep>),
    Config(Box<dyn ConfigStep>),
    Manifest(Box<dyn ManifestStep>),
}

/// An ordered list of steps.
#[derive(Debug, Default)]
pub struct Pipeline {
    steps: Vec<Step>,
}

impl Pipeline {
    /// Add a step acting on layers.
    pub fn layer(&mut self, step: impl LayerStep + 'static) -> &mut Self {
        self.steps.push(Step::Layer(Box::new(step)));
        self
    }

    /// Add a step acting on configs.
    pub fn config(&mut self, step: impl ConfigStep + 'static) -> &mut Self {
        self.steps.push(Step::Config(Box::new(step)));
        self
    }

    /// Add a step acting on manifests.
    pub fn manifest(&mut self, step: impl ManifestStep + 'static) -> &mut Self {
        self.steps.push(Step::Manifest(Box::new(step)));
        self
    }

    /// Run every step over the graph.
    ///
    /// Deleted manifests and layers are skipped, as are images whose config could not be parsed
    /// when running config steps.
    #[tracing::instrument(skip_all, fields(steps = self.steps.len()))]
    pub async fn run(&mut self, ctx: &mut Context<'_>, dag: &mut Dag) -> Result<()> {
        let order = dag.walk();
        for (position, step) in self.steps.iter_mut().enumerate() {
            debug!(position, ?step, "running step");
            for id in order.iter().copied() {
                ctx.check_canceled()?;

                let node = dag.node_mut(id);
                if node.state == State::Deleted {
                    continue;
                }

                let result = match step {
                    Step::Manifest(step) => step.apply(ctx, node).await,
                    Step::Config(step) => match &mut node.kind {
                        NodeKind::Image(image) if image.config.image.is_some() => {
                            step.apply(ctx, &mut image.config).await
                        }
                        _ => Ok(()),
                    },
                    Step::Layer(step) => match &mut node.kind {
                        NodeKind::Image(image) => {
                            let mut result = Ok(());
                            for layer in image.layers.iter_mut() {
                                if layer.state == State::Deleted {
                                    continue;
                                }
                                result = step.apply(ctx, layer).await;
                                if result.is_err() {
                                    break;
                                }
                            }
                            result
                        }
                        NodeKind::Index(_) => Ok(()),
                    },
                };

                let reference = &dag.node(id).reference;
                result.with_context(|| format!("apply step {position} to {reference}"))?;
            }
        }
        Ok(())
    }
}

/// State shared by the steps of a pipeline.
///
/// Manifests and configs fetched through the context are cached for the lifetime of the run,
/// so steps that visit many nodes only fetch shared content once.
#[derive(Debug)]
pub struct Context<'a> {
    #[debug(skip)]
    registry: &'a dyn Registry,
    target: Reference,
    cancel: CancellationToken,
    manifests: HashMap<Reference, Manifest>,
    configs: HashMap<Digest, ImageConfig>,
    copied: HashSet<Digest>,
}

impl<'a> Context<'a> {
    /// Create a context that pushes modified content to `target`.
    pub fn new(registry: &'a dyn Registry, target: Reference, cancel: CancellationToken) -> Self {
        Self {
            registry,
            target,
            cancel,
            manifests: HashMap::new(),
            configs: HashMap::new(),
            copied: HashSet::new(),
        }
    }

    pub fn registry(&self) -> &'a dyn Registry {
        self.registry
    }

    /// Where modified content is pushed.
    pub fn target(&self) -> &Reference {
        &self.target
    }

    /// Fail if the run has been canceled.
    pub fn check_canceled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ErrorKind::Canceled.report("operation canceled"));
        }
        Ok(())
    }

    /// Run a registry operation, abandoning it if the run is canceled.
    pub async fn guard<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        self.check_canceled()?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ErrorKind::Canceled.report("operation canceled")),
            result = operation => result,
        }
    }

    /// Fetch a manifest without caching it.
    pub async fn fetch_manifest(&self, reference: &Reference) -> Result<Manifest> {
        self.guard(self.registry.manifest_get(reference)).await
    }

    /// Fetch a manifest, reusing an earlier fetch of the same reference.
    pub async fn manifest(&mut self, reference: &Reference) -> Result<Manifest> {
        if let Some(manifest) = self.manifests.get(reference) {
            return Ok(manifest.clone());
        }
        let manifest = self.fetch_manifest(reference).await?;
        self.manifests.insert(reference.clone(), manifest.clone());
        Ok(manifest)
    }

    /// Fetch an image config, reusing an earlier fetch of the same digest.
    pub async fn image_config(
        &mut self,
        reference: &Reference,
        descriptor: &Descriptor,
    ) -> Result<ImageConfig> {
        if let Some(config) = self.configs.get(&descriptor.digest) {
            return Ok(config.clone());
        }
        let config = self
            .guard(self.registry.image_config(reference, descriptor))
            .await?;
        self.configs.insert(descriptor.digest.clone(), config.clone());
        Ok(config)
    }

    /// Copy a blob from `source` into the target repository.
    ///
    /// Blobs are copied at most once per run.
    pub async fn copy_blob(&mut self, source: &Reference, descriptor: &Descriptor) -> Result<()> {
        if self.copied.contains(&descriptor.digest) {
            return Ok(());
        }
        self.guard(self.registry.blob_copy(source, &self.target, descriptor))
            .await
            .with_context(|| format!("copy blob {} from {source}", descriptor.digest))?;
        info!(digest = %descriptor.digest, from = %source.repository_path(), to = %self.target.repository_path(), "copied blob");
        self.copied.insert(descriptor.digest.clone());
        Ok(())
    }

    /// Reports whether the blob has already been copied into the target repository during this run.
    pub fn copied(&self, digest: &Digest) -> bool {
        self.copied.contains(digest)
    }
}
