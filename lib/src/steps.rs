//! Built-in modification steps.
//!
//! Every step is idempotent: running it against an image it has already modified changes nothing.

use std::str::FromStr;

use async_trait::async_trait;
use color_eyre::Result;
use tracing::{debug, warn};

use crate::{
    dag::{ConfigNode, LayerNode, ManifestNode, NodeKind, State},
    media_type::{self, LayerMediaType},
    pipeline::{ConfigStep, Context, LayerStep, ManifestStep},
    Digest, Reference,
};

/// The annotation naming the base image an image was built from.
pub const ANNOTATION_BASE_NAME: &str = "org.opencontainers.image.base.name";

/// The annotation recording the digest of the base image an image was built from.
pub const ANNOTATION_BASE_DIGEST: &str = "org.opencontainers.image.base.digest";

/// Set an annotation on the top manifest, or remove it when the value is empty.
#[derive(Debug, Clone)]
pub struct Annotation {
    pub name: String,
    pub value: String,
}

#[async_trait]
impl ManifestStep for Annotation {
    async fn apply(&mut self, _: &mut Context<'_>, node: &mut ManifestNode) -> Result<()> {
        if !node.top {
            return Ok(());
        }

        let annotations = node.manifest.annotations_mut();
        let changed = if self.value.is_empty() {
            annotations.remove(&self.name).is_some()
        } else if annotations.get(&self.name) != Some(&self.value) {
            annotations.insert(self.name.clone(), self.value.clone());
            true
        } else {
            false
        };

        if changed {
            debug!(name = %self.name, value = %self.value, "set annotation");
            node.replace()?;
        }
        Ok(())
    }
}

/// Record the base image in the standard annotations of the top manifest.
#[derive(Debug, Clone)]
pub struct BaseAnnotation {
    pub base: Reference,
    pub digest: Digest,
}

#[async_trait]
impl ManifestStep for BaseAnnotation {
    async fn apply(&mut self, ctx: &mut Context<'_>, node: &mut ManifestNode) -> Result<()> {
        let mut name = Annotation {
            name: ANNOTATION_BASE_NAME.to_string(),
            value: self.base.to_string(),
        };
        let mut digest = Annotation {
            name: ANNOTATION_BASE_DIGEST.to_string(),
            value: self.digest.to_string(),
        };
        name.apply(ctx, node).await?;
        digest.apply(ctx, node).await
    }
}

/// Copy the labels of each image config into annotations on its manifest.
///
/// Existing annotations with the same name are overwritten.
#[derive(Debug, Clone, Default)]
pub struct LabelsToAnnotations;

#[async_trait]
impl ManifestStep for LabelsToAnnotations {
    async fn apply(&mut self, _: &mut Context<'_>, node: &mut ManifestNode) -> Result<()> {
        let NodeKind::Image(image) = &node.kind else {
            return Ok(());
        };
        let Some(labels) = image.config.image.as_ref().and_then(|config| config.labels()) else {
            return Ok(());
        };

        let labels = labels.clone();
        let annotations = node.manifest.annotations_mut();
        let mut changed = false;
        for (name, value) in labels {
            if annotations.get(&name) != Some(&value) {
                annotations.insert(name, value);
                changed = true;
            }
        }

        if changed {
            node.replace()?;
        }
        Ok(())
    }
}

/// Strip external URLs from layers, converting foreign and nondistributable
/// media types to their regular counterparts.
///
/// The layer content must already be in the registry for the result to be pullable.
#[derive(Debug, Clone, Default)]
pub struct ExternalUrlsRm;

#[async_trait]
impl ManifestStep for ExternalUrlsRm {
    async fn apply(&mut self, _: &mut Context<'_>, node: &mut ManifestNode) -> Result<()> {
        let NodeKind::Image(image) = &mut node.kind else {
            return Ok(());
        };

        let mut changed = false;
        for layer in image.layers.iter_mut() {
            if layer.state == State::Deleted {
                continue;
            }
            let current = layer.descriptor();
            if current.urls.is_empty() {
                continue;
            }

            let mut descriptor = current.clone();
            descriptor.urls.clear();
            match LayerMediaType::from_str(&descriptor.media_type) {
                Ok(parsed) => descriptor.media_type = parsed.distributable().to_string(),
                Err(err) => warn!(media_type = %descriptor.media_type, ?err, "unrecognized layer media type, keeping it"),
            }
            debug!(digest = %descriptor.digest, media_type = %descriptor.media_type, "stripped external urls");
            layer.replace(descriptor);
            changed = true;
        }

        if changed {
            node.replace()?;
        }
        Ok(())
    }
}

/// Set a label in each image config, or remove it when the value is empty.
#[derive(Debug, Clone)]
pub struct Label {
    pub name: String,
    pub value: String,
}

#[async_trait]
impl ConfigStep for Label {
    async fn apply(&mut self, _: &mut Context<'_>, config: &mut ConfigNode) -> Result<()> {
        let Some(image) = config.image.as_mut() else {
            return Ok(());
        };

        let changed = if self.value.is_empty() {
            image
                .config
                .as_mut()
                .and_then(|runtime| runtime.labels.as_mut())
                .is_some_and(|labels| labels.remove(&self.name).is_some())
        } else if image.labels().and_then(|labels| labels.get(&self.name)) != Some(&self.value) {
            image.labels_mut().insert(self.name.clone(), self.value.clone());
            true
        } else {
            false
        };

        if changed {
            config.commit()?;
        }
        Ok(())
    }
}

/// Convert layer media types to their OCI equivalents.
#[derive(Debug, Clone, Default)]
pub struct LayerToOci;

#[async_trait]
impl LayerStep for LayerToOci {
    async fn apply(&mut self, _: &mut Context<'_>, layer: &mut LayerNode) -> Result<()> {
        let current = layer.descriptor();
        match media_type::to_oci(&current.media_type) {
            Some(oci) if oci != current.media_type => {
                let mut descriptor = current.clone();
                descriptor.media_type = oci.to_string();
                layer.replace(descriptor);
            }
            Some(_) => {}
            None => warn!(media_type = %current.media_type, "layer media type has no OCI equivalent"),
        }
        Ok(())
    }
}

/// Convert config media types to their OCI equivalents.
#[derive(Debug, Clone, Default)]
pub struct ConfigToOci;

#[async_trait]
impl ConfigStep for ConfigToOci {
    async fn apply(&mut self, _: &mut Context<'_>, config: &mut ConfigNode) -> Result<()> {
        let current = config.descriptor();
        if let Some(oci) = media_type::to_oci(&current.media_type) {
            if oci != current.media_type {
                let mut descriptor = current.clone();
                descriptor.media_type = oci.to_string();
                config.new_descriptor = Some(descriptor);
            }
        }
        Ok(())
    }
}

/// Convert manifest media types to their OCI equivalents.
///
/// Layer and config conversion are separate steps; this only converts the manifests themselves.
#[derive(Debug, Clone, Default)]
pub struct ManifestToOci;

#[async_trait]
impl ManifestStep for ManifestToOci {
    async fn apply(&mut self, _: &mut Context<'_>, node: &mut ManifestNode) -> Result<()> {
        let current = node.manifest.media_type();
        match media_type::to_oci(current) {
            Some(oci) if oci != current => {
                node.manifest.set_media_type(oci);
                node.replace()?;
            }
            _ => {}
        }
        Ok(())
    }
}
