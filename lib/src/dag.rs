//! The graph of manifests, configs, and layers that make up an image.
//!
//! Nodes live in an arena owned by [`Dag`] and refer to each other by [`NodeId`].
//! Indexes point at their children; images own their config and layer nodes directly.

use color_eyre::{eyre::Context as _, Result};
use derive_more::Display;
use tap::Pipe;
use tracing::debug;

use crate::{
    config::ImageConfig,
    descriptor::Descriptor,
    manifest::{Body, Manifest},
    media_type,
    pipeline::Context,
    Digest, Reference,
};

/// The modification state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum State {
    /// Unchanged since it was read.
    #[default]
    #[display("unchanged")]
    Unchanged,

    /// Changed; must be pushed under its new descriptor.
    #[display("replaced")]
    Replaced,

    /// Did not exist in the image as read.
    #[display("added")]
    Added,

    /// Removed from the image.
    #[display("deleted")]
    Deleted,
}

/// Identifies a manifest node within a [`Dag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub struct NodeId(usize);

/// An image as a graph of manifests.
#[derive(Debug, Clone)]
pub struct Dag {
    nodes: Vec<ManifestNode>,
    root: NodeId,
}

/// A manifest in the graph.
#[derive(Debug, Clone)]
pub struct ManifestNode {
    /// The manifest, including any edits made so far.
    pub manifest: Manifest,

    /// Where the manifest was read from.
    pub reference: Reference,

    /// The descriptor the manifest was read with.
    /// For index children this is the entry in the parent, including its platform.
    pub original: Descriptor,

    /// The descriptor after modification, once the manifest has been replaced.
    pub new_descriptor: Option<Descriptor>,

    /// Whether this is the manifest the graph was loaded from.
    pub top: bool,

    pub state: State,

    pub kind: NodeKind,
}

/// What a manifest node contains, matching the body of its manifest.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Children of an index, in the same order as its entries.
    Index(Vec<NodeId>),

    /// The config and layers of an image.
    Image(ImageNode),
}

/// The parts of an image manifest.
#[derive(Debug, Clone)]
pub struct ImageNode {
    pub config: ConfigNode,

    /// Layers from the base of the image to the top.
    /// Nodes in the [`State::Deleted`] state are kept but excluded from the manifest.
    pub layers: Vec<LayerNode>,
}

/// The config of an image.
#[derive(Debug, Clone)]
pub struct ConfigNode {
    /// The parsed config; `None` for config media types this library does not understand.
    pub image: Option<ImageConfig>,

    pub original: Descriptor,

    /// The descriptor after modification.
    pub new_descriptor: Option<Descriptor>,

    /// Whether the parsed config has been edited and must be serialized again.
    pub modified: bool,
}

/// A layer of an image.
#[derive(Debug, Clone)]
pub struct LayerNode {
    pub state: State,

    /// The digest of the uncompressed layer, from the image config.
    pub diff_id: Option<Digest>,

    pub original: Descriptor,

    /// The descriptor after modification.
    pub new_descriptor: Option<Descriptor>,
}

impl LayerNode {
    /// Create a node for a layer that has not been modified.
    pub fn new(descriptor: Descriptor, diff_id: Option<Digest>) -> Self {
        Self {
            state: State::Unchanged,
            diff_id,
            original: descriptor,
            new_descriptor: None,
        }
    }

    /// The current descriptor of the layer.
    pub fn descriptor(&self) -> &Descriptor {
        self.new_descriptor.as_ref().unwrap_or(&self.original)
    }

    /// Replace the descriptor of the layer.
    pub fn replace(&mut self, descriptor: Descriptor) {
        if self.state == State::Unchanged {
            self.state = State::Replaced;
        }
        self.new_descriptor = Some(descriptor);
    }
}

impl ConfigNode {
    /// The current descriptor of the config.
    pub fn descriptor(&self) -> &Descriptor {
        self.new_descriptor.as_ref().unwrap_or(&self.original)
    }

    /// Record an edit to the parsed config, recomputing its descriptor.
    pub fn commit(&mut self) -> Result<()> {
        if let Some(image) = &self.image {
            let (descriptor, _) = image.serialize(self.descriptor())?;
            self.new_descriptor = Some(descriptor);
            self.modified = true;
        }
        Ok(())
    }
}

impl ImageNode {
    /// The descriptors of the layers that are part of the image, in order.
    pub fn layer_descriptors(&self) -> Vec<Descriptor> {
        self.layers
            .iter()
            .filter(|layer| layer.state != State::Deleted)
            .map(|layer| layer.descriptor().clone())
            .collect()
    }
}

impl ManifestNode {
    /// The current descriptor of the manifest.
    pub fn descriptor(&self) -> &Descriptor {
        self.new_descriptor.as_ref().unwrap_or(&self.original)
    }

    /// Reports whether the node has been modified in any way.
    pub fn changed(&self) -> bool {
        self.state != State::Unchanged
    }

    /// Write the config and layer nodes of an image back into its manifest.
    /// Reports whether the manifest changed.
    pub fn sync(&mut self) -> Result<bool> {
        let NodeKind::Image(image) = &self.kind else {
            return Ok(false);
        };

        let layers = image.layer_descriptors();
        let config = image.config.descriptor().clone();
        let current_layers = self.manifest.layers()?;
        let layers_changed = current_layers.len() != layers.len()
            || current_layers.iter().zip(&layers).any(|(a, b)| !a.equal(b));
        let config_changed = !self.manifest.config()?.equal(&config);

        if layers_changed {
            self.manifest.set_layers(layers)?;
        }
        if config_changed {
            self.manifest.set_config(config)?;
        }
        Ok(layers_changed || config_changed)
    }

    /// Mark the manifest as replaced, re-serializing it and recomputing its descriptor.
    ///
    /// The new descriptor keeps the platform and annotations of the original,
    /// since those belong to the entry in the parent index.
    pub fn replace(&mut self) -> Result<()> {
        self.sync()?;
        let refreshed = self.manifest.refresh()?.clone();
        self.new_descriptor = Some(Descriptor {
            platform: self.original.platform.clone(),
            annotations: self.original.annotations.clone(),
            ..refreshed
        });
        if self.state == State::Unchanged {
            self.state = State::Replaced;
        }
        Ok(())
    }
}

impl Dag {
    /// Load the graph for the reference.
    #[tracing::instrument(skip(ctx))]
    pub async fn load(ctx: &mut Context<'_>, reference: &Reference) -> Result<Self> {
        let manifest = ctx
            .fetch_manifest(reference)
            .await
            .with_context(|| format!("fetch manifest {reference}"))?;
        let original = manifest.descriptor().clone();

        let mut dag = Self {
            nodes: Vec::new(),
            root: NodeId(0),
        };
        dag.root = dag.insert(ctx, reference.clone(), manifest, original, true).await?;

        let mut pending = vec![dag.root];
        while let Some(id) = pending.pop() {
            let node = dag.node(id);
            let Body::Index(index) = node.manifest.body() else {
                continue;
            };

            let entries = index.manifests.clone();
            let parent = node.reference.clone();
            let mut children = Vec::with_capacity(entries.len());
            for entry in entries {
                let reference = parent.with_digest(&entry.digest);
                let manifest = ctx
                    .fetch_manifest(&reference)
                    .await
                    .with_context(|| format!("fetch child manifest {reference}"))?;
                let child = dag.insert(ctx, reference, manifest, entry, false).await?;
                children.push(child);
                pending.push(child);
            }
            dag.node_mut(id).kind = NodeKind::Index(children);
        }

        debug!(nodes = dag.nodes.len(), "loaded manifest graph");
        Ok(dag)
    }

    async fn insert(
        &mut self,
        ctx: &mut Context<'_>,
        reference: Reference,
        manifest: Manifest,
        original: Descriptor,
        top: bool,
    ) -> Result<NodeId> {
        let kind = match manifest.body() {
            Body::Index(_) => NodeKind::Index(Vec::new()),
            Body::Image(image) => {
                let image_config = if media_type::is_image_config(&image.config.media_type) {
                    ctx.image_config(&reference, &image.config)
                        .await
                        .with_context(|| format!("fetch config for {reference}"))?
                        .pipe(Some)
                } else {
                    None
                };

                let diff_ids = image_config
                    .as_ref()
                    .map(|config| config.rootfs.diff_ids.clone())
                    .unwrap_or_default();
                let layers = image
                    .layers
                    .iter()
                    .enumerate()
                    .map(|(i, layer)| LayerNode::new(layer.clone(), diff_ids.get(i).cloned()))
                    .collect();

                NodeKind::Image(ImageNode {
                    config: ConfigNode {
                        image: image_config,
                        original: image.config.clone(),
                        new_descriptor: None,
                        modified: false,
                    },
                    layers,
                })
            }
        };

        let id = NodeId(self.nodes.len());
        self.nodes.push(ManifestNode {
            manifest,
            reference,
            original,
            new_descriptor: None,
            top,
            state: State::Unchanged,
            kind,
        });
        Ok(id)
    }

    /// The manifest the graph was loaded from.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// The node for the manifest the graph was loaded from.
    pub fn top(&self) -> &ManifestNode {
        self.node(self.root)
    }

    pub fn node(&self, id: NodeId) -> &ManifestNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut ManifestNode {
        &mut self.nodes[id.0]
    }

    /// The children of a node; empty for images.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        match &self.node(id).kind {
            NodeKind::Index(children) => children,
            NodeKind::Image(_) => &[],
        }
    }

    /// Every node in the graph, children before their parents.
    pub fn walk(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![(self.root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            stack.push((id, true));
            for child in self.children(id).iter().rev() {
                stack.push((*child, false));
            }
        }
        order
    }

    /// The number of manifest nodes in the graph.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false: a graph has at least the manifest it was loaded from.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
