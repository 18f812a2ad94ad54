//! Builds images in a [`Memory`] registry.

use std::collections::BTreeMap;

use color_eyre::Result;
use ocimod_lib::{
    config::{History, ImageConfig, RootFs, RuntimeConfig},
    descriptor::Descriptor,
    manifest::{Body, ImageIndex, ImageManifest, Manifest},
    media_type,
    registry::{Memory, Registry},
    Digest, Platform, Reference,
};

pub const CREATED: &str = "2024-03-01T12:00:00Z";

pub fn reference(input: &str) -> Reference {
    input.parse().expect("parse reference")
}

/// The diff ID the fixture assigns to a layer.
pub fn diff_id(content: &str) -> Digest {
    Digest::sha256(format!("uncompressed:{content}"))
}

/// A single platform image, described by the content of its layers.
#[derive(Debug, Clone)]
pub struct Image {
    pub platform: Platform,
    pub layers: Vec<String>,
    pub docker: bool,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub foreign: Vec<String>,

    /// History entries that add no layer, with the number of layers they follow.
    pub empty: Vec<(usize, String)>,
}

impl Image {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            layers: Vec::new(),
            docker: false,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            foreign: Vec::new(),
            empty: Vec::new(),
        }
    }

    /// Start an image with the layers and history of the base.
    pub fn on(base: &Image) -> Self {
        Self {
            layers: base.layers.clone(),
            foreign: base.foreign.clone(),
            empty: base.empty.clone(),
            docker: base.docker,
            ..Self::new(base.platform.clone())
        }
    }

    pub fn layer(mut self, content: &str) -> Self {
        self.layers.push(content.to_string());
        self
    }

    /// Add a layer whose content is hosted outside the registry.
    pub fn foreign_layer(mut self, content: &str) -> Self {
        self.foreign.push(content.to_string());
        self.layer(content)
    }

    /// Add a build step that does not produce a layer, like `ENV` or `LABEL`.
    pub fn step(mut self, created_by: &str) -> Self {
        self.empty.push((self.layers.len(), created_by.to_string()));
        self
    }

    pub fn docker(mut self) -> Self {
        self.docker = true;
        self
    }

    pub fn label(mut self, name: &str, value: &str) -> Self {
        self.labels.insert(name.to_string(), value.to_string());
        self
    }

    pub fn annotation(mut self, name: &str, value: &str) -> Self {
        self.annotations.insert(name.to_string(), value.to_string());
        self
    }

    pub fn config(&self) -> ImageConfig {
        ImageConfig {
            created: Some(CREATED.to_string()),
            architecture: self.platform.architecture.clone(),
            os: self.platform.os.clone(),
            variant: self.platform.variant.clone(),
            config: (!self.labels.is_empty()).then(|| RuntimeConfig {
                labels: Some(self.labels.clone()),
                ..Default::default()
            }),
            rootfs: RootFs {
                diff_ids: self.layers.iter().map(|layer| diff_id(layer)).collect(),
                ..Default::default()
            },
            history: self.history(),
            ..Default::default()
        }
    }

    /// History entries in build order; empty steps come before the layer that follows them.
    pub fn history(&self) -> Vec<History> {
        let empty = |position: usize| {
            self.empty
                .iter()
                .filter(move |(after, _)| *after == position)
                .map(|(_, created_by)| History {
                    created: Some(CREATED.to_string()),
                    created_by: Some(created_by.clone()),
                    empty_layer: true,
                    ..Default::default()
                })
        };

        let mut history = Vec::new();
        for (position, layer) in self.layers.iter().enumerate() {
            history.extend(empty(position));
            history.push(History {
                created: Some(CREATED.to_string()),
                created_by: Some(format!("ADD {layer}")),
                ..Default::default()
            });
        }
        history.extend(empty(self.layers.len()));
        history
    }

    /// Push the blobs and manifest of the image to the reference.
    pub async fn push(&self, registry: &Memory, reference: &Reference) -> Result<Manifest> {
        let manifest = self.manifest(registry, reference).await?;
        registry.manifest_put(reference, &manifest).await?;
        Ok(manifest)
    }

    /// Push the image with its config edited after the fact.
    pub async fn push_edited(
        &self,
        registry: &Memory,
        reference: &Reference,
        edit: impl FnOnce(&mut ImageConfig),
    ) -> Result<Manifest> {
        let mut config = self.config();
        edit(&mut config);

        let mut manifest = self.manifest(registry, reference).await?;
        let media_type = manifest.config()?.media_type.clone();
        let config = registry
            .push_blob(reference, &media_type, serde_json::to_vec(&config)?)
            .await?;
        manifest.set_config(config)?;
        manifest.refresh()?;
        registry.manifest_put(reference, &manifest).await?;
        Ok(manifest)
    }

    /// Push the blobs of the image and return its manifest without pushing it.
    pub async fn manifest(&self, registry: &Memory, reference: &Reference) -> Result<Manifest> {
        let (config_type, layer_type, manifest_type) = if self.docker {
            (media_type::DOCKER_CONFIG, media_type::DOCKER_LAYER, media_type::DOCKER_MANIFEST)
        } else {
            (media_type::OCI_CONFIG, media_type::OCI_LAYER_GZIP, media_type::OCI_MANIFEST)
        };

        let mut layers = Vec::new();
        for content in &self.layers {
            if self.foreign.contains(content) {
                let mut descriptor = Descriptor::for_content(
                    media_type::DOCKER_LAYER_FOREIGN,
                    content.as_bytes(),
                );
                descriptor.urls = vec![format!("https://example.com/{content}")];
                layers.push(descriptor);
                continue;
            }
            layers.push(registry.push_blob(reference, layer_type, content.clone()).await?);
        }

        let config = serde_json::to_vec(&self.config())?;
        let config = registry.push_blob(reference, config_type, config).await?;

        Manifest::new(Body::Image(ImageManifest {
            schema_version: 2,
            media_type: Some(manifest_type.to_string()),
            artifact_type: None,
            config,
            layers,
            subject: None,
            annotations: self.annotations.clone(),
            extra: Default::default(),
        }))
    }
}

/// Push a multi platform index of the images to the reference.
pub async fn push_index(
    registry: &Memory,
    reference: &Reference,
    images: &[Image],
    annotations: &[(&str, &str)],
) -> Result<Manifest> {
    let docker = images.iter().all(|image| image.docker);
    let manifests = push_children(registry, reference, images).await?;
    push_entries(registry, reference, docker, manifests, annotations).await
}

/// Push a multi platform index of the images to the reference,
/// with a build attestation for each image as buildx does.
pub async fn push_attested_index(
    registry: &Memory,
    reference: &Reference,
    images: &[Image],
    annotations: &[(&str, &str)],
) -> Result<Manifest> {
    let mut manifests = push_children(registry, reference, images).await?;
    for subject in manifests.clone() {
        let statement = format!(
            r#"{{"_type":"https://in-toto.io/Statement/v0.1","subject":"{}"}}"#,
            subject.digest
        );
        let layer = registry
            .push_blob(reference, "application/vnd.in-toto+json", statement)
            .await?;
        let config = registry
            .push_blob(reference, "application/vnd.in-toto+json", "{}")
            .await?;
        let attestation = Manifest::new(Body::Image(ImageManifest {
            schema_version: 2,
            media_type: Some(media_type::OCI_MANIFEST.to_string()),
            artifact_type: None,
            config,
            layers: vec![layer],
            subject: None,
            annotations: BTreeMap::new(),
            extra: Default::default(),
        }))?;
        registry
            .manifest_put(&reference.with_digest(&attestation.descriptor().digest), &attestation)
            .await?;

        manifests.push(Descriptor {
            platform: Some(Platform::builder().os("unknown").architecture("unknown").build()),
            annotations: BTreeMap::from([
                (String::from("vnd.docker.reference.digest"), subject.digest.to_string()),
                (String::from("vnd.docker.reference.type"), String::from("attestation-manifest")),
            ]),
            ..attestation.descriptor().clone()
        });
    }
    push_entries(registry, reference, false, manifests, annotations).await
}

async fn push_children(registry: &Memory, reference: &Reference, images: &[Image]) -> Result<Vec<Descriptor>> {
    let mut manifests = Vec::new();
    for image in images {
        let manifest = image.manifest(registry, reference).await?;
        let child = reference.with_digest(&manifest.descriptor().digest);
        registry.manifest_put(&child, &manifest).await?;
        manifests.push(Descriptor {
            platform: Some(image.platform.clone()),
            ..manifest.descriptor().clone()
        });
    }
    Ok(manifests)
}

async fn push_entries(
    registry: &Memory,
    reference: &Reference,
    docker: bool,
    manifests: Vec<Descriptor>,
    annotations: &[(&str, &str)],
) -> Result<Manifest> {
    let index = Manifest::new(Body::Index(ImageIndex {
        schema_version: 2,
        media_type: Some(
            if docker {
                media_type::DOCKER_MANIFEST_LIST
            } else {
                media_type::OCI_INDEX
            }
            .to_string(),
        ),
        artifact_type: None,
        manifests,
        subject: None,
        annotations: annotations
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        extra: Default::default(),
    }))?;
    registry.manifest_put(reference, &index).await?;
    Ok(index)
}

/// Fetch the config of the image at the reference.
pub async fn config_of(registry: &Memory, reference: &Reference) -> Result<ImageConfig> {
    let manifest = registry.manifest_get(reference).await?;
    let descriptor = manifest.config()?.clone();
    registry.image_config(reference, &descriptor).await
}

/// Fetch the image manifest for the platform at the reference, descending into an index if needed.
pub async fn image_for(registry: &Memory, reference: &Reference, platform: &Platform) -> Result<Manifest> {
    let manifest = registry.manifest_get(reference).await?;
    match manifest.body() {
        Body::Image(_) => Ok(manifest),
        Body::Index(index) => {
            let entry = index
                .manifests
                .iter()
                .find(|entry| entry.platform.as_ref() == Some(platform))
                .expect("platform in index");
            registry.manifest_get(&reference.with_digest(&entry.digest)).await
        }
    }
}
