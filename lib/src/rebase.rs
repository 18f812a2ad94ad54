//! Rebasing images onto a new version of their base image.
//!
//! An image built `FROM` a base starts with the layers, history, and diff IDs of that base.
//! Rebasing verifies that prefix against the old base, removes it,
//! and splices in the corresponding content of the new base.

use color_eyre::{eyre::Context as _, Result};
use tap::Pipe;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    config::ImageConfig,
    dag::{Dag, ImageNode, LayerNode, ManifestNode, NodeKind, State},
    descriptor::{self, Descriptor, MatchOptions},
    error::ErrorKind,
    manifest::{Body, Manifest},
    pipeline::{Context, ManifestStep},
    registry::Registry,
    steps::{ANNOTATION_BASE_DIGEST, ANNOTATION_BASE_NAME},
    Digest, Platform, Reference,
};

/// Replace the old base of each image with the new base.
#[derive(Debug, Clone)]
pub struct Rebase {
    /// The base the image was built on, pinned to a digest.
    pub old: Reference,

    /// The base to rebase onto.
    pub new: Reference,
}

/// The platform specific image of a base.
#[derive(Debug, Clone)]
struct Base {
    /// Where the image manifest lives.
    reference: Reference,
    layers: Vec<Descriptor>,
    config: ImageConfig,
}

impl Base {
    /// Fail unless layers, history, and diff IDs of the base line up.
    fn validate(&self) -> Result<()> {
        let history = self.config.layer_history_len();
        let diff_ids = self.config.rootfs.diff_ids.len();
        if self.layers.len() != history || self.layers.len() != diff_ids {
            return Err(ErrorKind::Mismatch.report(format!(
                "base {} is inconsistent: {} layers, {history} layer history entries, {diff_ids} diff ids",
                self.reference,
                self.layers.len(),
            )));
        }
        Ok(())
    }
}

/// The base name and digest recorded in the annotations.
fn base_names(annotations: &std::collections::BTreeMap<String, String>) -> Result<(Reference, Digest)> {
    let name = annotations
        .get(ANNOTATION_BASE_NAME)
        .ok_or_else(|| ErrorKind::MissingAnnotation.report(format!("annotation missing: {ANNOTATION_BASE_NAME}")))?;
    let digest = annotations
        .get(ANNOTATION_BASE_DIGEST)
        .ok_or_else(|| ErrorKind::MissingAnnotation.report(format!("annotation missing: {ANNOTATION_BASE_DIGEST}")))?;

    let name = name
        .parse::<Reference>()
        .with_context(|| format!("parse base name annotation {name}"))?;
    let digest = digest
        .parse::<Digest>()
        .with_context(|| format!("parse base digest annotation {digest}"))?;
    Ok((name, digest))
}

impl Rebase {
    /// Create a rebase step from the base annotations of the top manifest of the graph.
    ///
    /// The old base is the annotated name pinned to the annotated digest;
    /// the new base is whatever the annotated name points to now.
    pub fn from_annotations(dag: &Dag) -> Result<Self> {
        let (name, digest) = base_names(dag.top().manifest.annotations())?;
        Ok(Self {
            old: name.with_digest(digest),
            new: name,
        })
    }
}

#[async_trait::async_trait]
impl ManifestStep for Rebase {
    #[tracing::instrument(skip_all, fields(image = %node.reference, old = %self.old, new = %self.new))]
    async fn apply(&mut self, ctx: &mut Context<'_>, node: &mut ManifestNode) -> Result<()> {
        let NodeKind::Image(image) = &mut node.kind else {
            return Ok(());
        };

        // Attestations and other artifacts in an index have no base.
        let Some(config) = image.config.image.as_ref() else {
            debug!(media_type = %image.config.original.media_type, "not an image config, skipping");
            return Ok(());
        };
        let platform = config.platform();

        let old_top = ctx.manifest(&self.old).await.context("fetch old base")?;
        let new_top = ctx.manifest(&self.new).await.context("fetch new base")?;
        if old_top.descriptor().digest == new_top.descriptor().digest {
            debug!("base is unchanged, nothing to rebase");
            return Ok(());
        }

        let old = resolve(ctx, &self.old, &old_top, &platform)
            .await
            .context("resolve old base")?;
        let new = resolve(ctx, &self.new, &new_top, &platform)
            .await
            .context("resolve new base")?;
        verify_derived(image, &old)?;
        new.validate().context("validate new base")?;

        for layer in &new.layers {
            ctx.copy_blob(&new.reference, layer).await?;
        }

        splice(image, &old, &new)?;
        image.config.commit()?;
        node.replace()?;
        info!(digest = %node.descriptor().digest, "rebased image");
        Ok(())
    }
}

/// Find the image for the platform within a base, descending through indexes.
async fn resolve(
    ctx: &mut Context<'_>,
    reference: &Reference,
    top: &Manifest,
    platform: &Platform,
) -> Result<Base> {
    let mut reference = reference.with_digest(&top.descriptor().digest);
    let mut manifest = top.clone();
    loop {
        match manifest.body() {
            Body::Image(image) => {
                let config = ctx
                    .image_config(&reference, &image.config)
                    .await
                    .with_context(|| format!("fetch config of {reference}"))?;
                return Base {
                    layers: image.layers.clone(),
                    config,
                    reference,
                }
                .pipe(Ok);
            }
            Body::Index(index) => {
                let opts = MatchOptions::builder().platform(platform.clone()).build();
                let entry = descriptor::search(&index.manifests, &opts)
                    .with_context(|| format!("find {platform} in {reference}"))?;
                if !crate::media_type::MANIFESTS.contains(&entry.media_type.as_str()) {
                    return Err(ErrorKind::NotImage.report(format!(
                        "entry {} of {reference} is not a manifest",
                        entry.digest
                    )));
                }
                reference = reference.with_digest(&entry.digest);
                manifest = ctx.manifest(&reference).await?;
            }
        }
    }
}

/// Fail unless the image starts with the content of the base.
fn verify_derived(image: &ImageNode, base: &Base) -> Result<()> {
    let mismatch = |message: String| Err(ErrorKind::Mismatch.report(message));
    let Some(config) = image.config.image.as_ref() else {
        return Err(ErrorKind::NotImage.report("image has no config"));
    };

    // Layers added by earlier steps are not part of the base.
    let layers = image
        .layers
        .iter()
        .filter(|layer| layer.state != State::Added && layer.state != State::Deleted)
        .map(|layer| &layer.original)
        .collect::<Vec<_>>();

    if layers.len() < base.layers.len() {
        return mismatch(format!(
            "image has {} layers, fewer than the {} layers of base {}",
            layers.len(),
            base.layers.len(),
            base.reference
        ));
    }
    for (i, (layer, expected)) in layers.iter().zip(&base.layers).enumerate() {
        if !layer.same(expected) {
            return mismatch(format!(
                "layer {i} is {}, base {} has {}",
                layer.digest, base.reference, expected.digest
            ));
        }
    }

    if config.history.len() < base.config.history.len() {
        return mismatch(format!(
            "image has {} history entries, fewer than the {} entries of base {}",
            config.history.len(),
            base.config.history.len(),
            base.reference
        ));
    }
    for (i, (entry, expected)) in config.history.iter().zip(&base.config.history).enumerate() {
        if !entry.same_step(expected) {
            return mismatch(format!(
                "history entry {i} ({:?}) does not match base {} ({:?})",
                entry.created_by.as_deref().unwrap_or_default(),
                base.reference,
                expected.created_by.as_deref().unwrap_or_default(),
            ));
        }
    }

    base.validate()?;

    let diff_ids = &config.rootfs.diff_ids;
    if diff_ids.len() < base.config.rootfs.diff_ids.len() {
        return mismatch(format!(
            "image has {} diff ids, fewer than the {} of base {}",
            diff_ids.len(),
            base.config.rootfs.diff_ids.len(),
            base.reference
        ));
    }
    for (i, (diff_id, expected)) in diff_ids.iter().zip(&base.config.rootfs.diff_ids).enumerate() {
        if diff_id != expected {
            return mismatch(format!(
                "diff id {i} is {diff_id}, base {} has {expected}",
                base.reference
            ));
        }
    }

    Ok(())
}

/// Replace the content of the old base at the start of the image with the new base.
fn splice(image: &mut ImageNode, old: &Base, new: &Base) -> Result<()> {
    let mut remaining = old.layers.len();
    let mut position = 0;
    while remaining > 0 {
        let Some(layer) = image.layers.get(position) else {
            return Err(ErrorKind::Mismatch.report(format!(
                "ran out of layers while removing {} layers of base {}",
                old.layers.len(),
                old.reference
            )));
        };
        if matches!(layer.state, State::Added | State::Deleted) {
            position += 1;
            continue;
        }
        image.layers.remove(position);
        remaining -= 1;
    }

    let fresh = new
        .layers
        .iter()
        .zip(&new.config.rootfs.diff_ids)
        .map(|(layer, diff_id)| LayerNode::new(layer.clone(), Some(diff_id.clone())));
    image.layers.splice(0..0, fresh);

    let Some(config) = image.config.image.as_mut() else {
        return Err(ErrorKind::NotImage.report("image has no config"));
    };
    config.history.splice(
        ..old.config.history.len(),
        new.config.history.iter().cloned(),
    );
    config.rootfs.diff_ids.splice(
        ..old.config.rootfs.diff_ids.len(),
        new.config.rootfs.diff_ids.iter().cloned(),
    );

    let layers = image
        .layers
        .iter()
        .filter(|layer| layer.state != State::Deleted)
        .count();
    let history = config.layer_history_len();
    let diff_ids = config.rootfs.diff_ids.len();
    if layers != history || layers != diff_ids {
        return Err(ErrorKind::Mismatch.report(format!(
            "rebased image is inconsistent: {layers} layers, {history} layer history entries, {diff_ids} diff ids"
        )));
    }
    Ok(())
}

/// Check whether an image is still built on the current version of its base.
///
/// Without `base`, the base is read from the annotations of the image,
/// and is current if the annotated name still points to the annotated digest.
/// With `base`, each image is checked to start with the content of that base for its platform.
///
/// Fails with [`ErrorKind::Mismatch`] if the base has changed,
/// or [`ErrorKind::MissingAnnotation`] if no base is known.
#[tracing::instrument(skip(registry))]
pub async fn check_base(
    registry: &dyn Registry,
    reference: &Reference,
    base: Option<&Reference>,
) -> Result<()> {
    let mut ctx = Context::new(registry, reference.clone(), CancellationToken::new());
    let dag = Dag::load(&mut ctx, reference).await?;

    let (name, expected) = match base {
        Some(base) => (base.clone(), None),
        None => {
            let (name, digest) = base_names(dag.top().manifest.annotations())?;
            (name, Some(digest))
        }
    };

    let current = ctx.manifest(&name).await.context("fetch base")?;
    if let Some(expected) = expected {
        let digest = &current.descriptor().digest;
        if digest != &expected {
            return Err(ErrorKind::Mismatch.report(format!(
                "base {name} is now {digest}, image was built on {expected}"
            )));
        }
        debug!(%name, %digest, "base digest is current");
        return Ok(());
    }

    for id in dag.walk() {
        let node = dag.node(id);
        let NodeKind::Image(image) = &node.kind else {
            continue;
        };
        let Some(config) = image.config.image.as_ref() else {
            debug!(reference = %node.reference, "not an image config, skipping");
            continue;
        };
        let base = resolve(&mut ctx, &name, &current, &config.platform())
            .await
            .with_context(|| format!("resolve base for {}", node.reference))?;
        verify_derived(image, &base).with_context(|| format!("check {}", node.reference))?;
    }
    Ok(())
}
