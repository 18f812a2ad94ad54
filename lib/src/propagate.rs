//! Pushes the result of a pipeline run back to the registry.
//!
//! Nodes are visited children first, so by the time an index is visited
//! every child has been pushed and has its final descriptor.

use color_eyre::{eyre::Context as _, Result};
use tracing::{debug, info};

use crate::{
    dag::{Dag, NodeId, NodeKind, State},
    descriptor::Descriptor,
    pipeline::Context,
    Reference,
};

/// The result of modifying an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Where the image was pushed.
    pub reference: Reference,

    /// The descriptor of the top manifest.
    pub descriptor: Descriptor,

    /// Whether anything about the image changed.
    pub modified: bool,
}

/// Push every changed node to the target of the context, bottom up.
///
/// When the target is a different repository than the source,
/// unchanged content is copied there too so the result is complete.
#[tracing::instrument(skip_all, fields(source = %source, target = %ctx.target()))]
pub(crate) async fn propagate(ctx: &mut Context<'_>, dag: &mut Dag, source: &Reference) -> Result<Outcome> {
    let target = ctx.target().clone();
    let relocate = !source.same_repository(&target);

    for id in dag.walk() {
        ctx.check_canceled()?;
        if dag.node(id).state == State::Deleted {
            continue;
        }

        if let Some(children) = index_children(dag, id) {
            let entries = dag.node(id).manifest.manifests()?.to_vec();
            let mut updated = Vec::with_capacity(entries.len());
            let mut changed = false;
            for (entry, child) in entries.into_iter().zip(children) {
                let child = dag.node(child);
                match child.state {
                    State::Deleted => changed = true,
                    State::Unchanged => updated.push(entry),
                    State::Replaced | State::Added => {
                        let descriptor = child.descriptor();
                        changed |= !descriptor.equal(&entry);
                        updated.push(Descriptor {
                            media_type: descriptor.media_type.clone(),
                            digest: descriptor.digest.clone(),
                            size: descriptor.size,
                            ..entry
                        });
                    }
                }
            }

            let node = dag.node_mut(id);
            if changed {
                node.manifest.set_manifests(updated)?;
                node.replace()?;
            }
        }

        let node = dag.node_mut(id);
        if let NodeKind::Image(image) = &mut node.kind {
            if image.config.modified {
                if let Some(config) = &image.config.image {
                    let (descriptor, content) = config.serialize(image.config.descriptor())?;
                    if relocate || descriptor.digest != image.config.original.digest {
                        ctx.guard(ctx.registry().blob_put(&target, &descriptor, content))
                            .await
                            .context("push config")?;
                        debug!(digest = %descriptor.digest, "pushed config");
                    }
                    image.config.new_descriptor = Some(descriptor);
                }
            }
            if node.sync()? {
                node.replace()?;
            }
        }

        if relocate {
            copy_blobs(ctx, dag, id, source).await?;
        }

        let node = dag.node(id);
        let push_to = if node.top {
            target.clone()
        } else {
            target.with_digest(&node.manifest.descriptor().digest)
        };
        if node.changed() || relocate || (node.top && source != &target) {
            ctx.guard(ctx.registry().manifest_put(&push_to, &node.manifest))
                .await
                .with_context(|| format!("push manifest {push_to}"))?;
            debug!(reference = %push_to, state = %node.state, "pushed manifest");
        }
    }

    let top = dag.top();
    let outcome = Outcome {
        reference: target,
        descriptor: top.manifest.descriptor().clone(),
        modified: top.changed(),
    };
    info!(reference = %outcome.reference, digest = %outcome.descriptor.digest, modified = outcome.modified, "finished");
    Ok(outcome)
}

fn index_children(dag: &Dag, id: NodeId) -> Option<Vec<NodeId>> {
    match &dag.node(id).kind {
        NodeKind::Index(children) => Some(children.clone()),
        NodeKind::Image(_) => None,
    }
}

/// Copy the blobs an image needs from the source repository into the target.
async fn copy_blobs(ctx: &mut Context<'_>, dag: &Dag, id: NodeId, source: &Reference) -> Result<()> {
    let NodeKind::Image(image) = &dag.node(id).kind else {
        return Ok(());
    };

    let mut blobs = Vec::new();
    if !image.config.modified {
        blobs.push(image.config.descriptor().clone());
    }
    blobs.extend(
        image
            .layers
            .iter()
            .filter(|layer| layer.state != State::Deleted)
            .map(|layer| layer.descriptor().clone())
            // Layers hosted elsewhere are not stored in the registry.
            .filter(|layer| layer.urls.is_empty()),
    );

    for blob in blobs {
        if ctx.copied(&blob.digest) {
            continue;
        }
        ctx.copy_blob(source, &blob).await?;
    }
    Ok(())
}
