//! Image manifests and indexes.
//!
//! A [`Manifest`] keeps the exact bytes it was read from alongside the parsed document,
//! so that unmodified manifests are pushed byte for byte and keep their digest.
//! After editing the parsed document, call [`Manifest::refresh`] to re-serialize it.

use std::collections::BTreeMap;

use bytes::Bytes;
use color_eyre::{eyre::Context, Result, Section, SectionExt};
use serde::{de::IgnoredAny, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{descriptor::Descriptor, error::ErrorKind, media_type, Digest};

/// An image manifest, in either Docker schema 2 or OCI format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Always `2` for supported manifests.
    pub schema_version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,

    /// The image config.
    pub config: Descriptor,

    /// Layers in order from the base of the image to the top.
    #[serde(default)]
    pub layers: Vec<Descriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Fields this library does not interpret, preserved as read.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An image index, in either Docker manifest list or OCI format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    /// Always `2` for supported indexes.
    pub schema_version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,

    /// The manifests referenced by the index.
    #[serde(default)]
    pub manifests: Vec<Descriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Fields this library does not interpret, preserved as read.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The parsed content of a manifest.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// A list of manifests, usually one per platform.
    Index(ImageIndex),

    /// A single image.
    Image(ImageManifest),
}

/// A manifest along with the bytes it was serialized as.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    body: Body,
    raw: Bytes,
    descriptor: Descriptor,
}

/// Fields used to classify a manifest before parsing it fully.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Probe {
    schema_version: Option<u32>,
    media_type: Option<String>,
    manifests: Option<IgnoredAny>,
}

impl Manifest {
    /// Parse a manifest from its serialized form.
    ///
    /// The media type is read from the document; if it is absent, documents with a
    /// `manifests` field are treated as OCI indexes and all others as OCI image manifests.
    pub fn parse(raw: impl Into<Bytes>) -> Result<Self> {
        Self::parse_as(None, raw)
    }

    /// Parse a manifest from its serialized form, using the provided media type
    /// (usually from a `Content-Type` header) when the document does not declare one.
    pub fn parse_as(media_type: Option<&str>, raw: impl Into<Bytes>) -> Result<Self> {
        let raw = raw.into();
        let content_section = || String::from_utf8_lossy(&raw).to_string().header("Content:");

        let probe = serde_json::from_slice::<Probe>(&raw)
            .map_err(|err| ErrorKind::ParsingFailed.report(format!("parse manifest: {err}")))
            .with_section(content_section)?;
        let media_type = match (probe.media_type, media_type) {
            (Some(declared), _) => declared,
            (None, Some(provided)) => provided.to_string(),
            (None, None) if probe.manifests.is_some() => media_type::OCI_INDEX.to_string(),
            (None, None) => media_type::OCI_MANIFEST.to_string(),
        };

        let body = match media_type.as_str() {
            media_type::OCI_INDEX | media_type::DOCKER_MANIFEST_LIST => {
                serde_json::from_slice::<ImageIndex>(&raw)
                    .map(Body::Index)
                    .map_err(|err| ErrorKind::ParsingFailed.report(format!("parse index: {err}")))
            }
            media_type::OCI_MANIFEST | media_type::DOCKER_MANIFEST => {
                serde_json::from_slice::<ImageManifest>(&raw)
                    .map(Body::Image)
                    .map_err(|err| ErrorKind::ParsingFailed.report(format!("parse image manifest: {err}")))
            }
            other => Err(ErrorKind::UnsupportedMediaType.report(format!(
                "unsupported manifest media type: {other}"
            ))),
        }
        .with_section(content_section)?;

        if probe.schema_version != Some(2) {
            return Err(ErrorKind::UnsupportedMediaType.report(format!(
                "unsupported manifest schema version: {:?}",
                probe.schema_version
            )));
        }

        let descriptor = Descriptor::builder()
            .media_type(media_type)
            .digest(Digest::sha256(&raw))
            .size(raw.len() as i64)
            .build();
        Ok(Self {
            body,
            raw,
            descriptor,
        })
    }

    /// Create a manifest by serializing the body.
    pub fn new(body: Body) -> Result<Self> {
        let media_type = match &body {
            Body::Index(index) => index.media_type.clone(),
            Body::Image(image) => image.media_type.clone(),
        };
        let raw = match &body {
            Body::Index(index) => serde_json::to_vec(index),
            Body::Image(image) => serde_json::to_vec(image),
        }
        .context("serialize manifest")?;
        Self::parse_as(media_type.as_deref(), raw)
    }

    /// The parsed document.
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// The parsed document, for editing.
    ///
    /// Edits are not reflected in [`Manifest::raw`] or [`Manifest::descriptor`]
    /// until [`Manifest::refresh`] is called.
    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    /// The bytes of the manifest as last read or refreshed.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// The descriptor of the manifest as last read or refreshed.
    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// The media type of the manifest.
    pub fn media_type(&self) -> &str {
        &self.descriptor.media_type
    }

    /// Set the media type of the manifest.
    pub fn set_media_type(&mut self, media_type: &str) {
        let value = Some(media_type.to_string());
        match &mut self.body {
            Body::Index(index) => index.media_type = value,
            Body::Image(image) => image.media_type = value,
        }
        self.descriptor.media_type = media_type.to_string();
    }

    /// Re-serialize the manifest after edits, returning the new descriptor.
    pub fn refresh(&mut self) -> Result<&Descriptor> {
        let raw = match &self.body {
            Body::Index(index) => serde_json::to_vec(index),
            Body::Image(image) => serde_json::to_vec(image),
        }
        .context("serialize manifest")?;
        self.raw = Bytes::from(raw);
        self.descriptor.digest = Digest::sha256(&self.raw);
        self.descriptor.size = self.raw.len() as i64;
        Ok(&self.descriptor)
    }

    /// The annotations of the manifest.
    pub fn annotations(&self) -> &BTreeMap<String, String> {
        match &self.body {
            Body::Index(index) => &index.annotations,
            Body::Image(image) => &image.annotations,
        }
    }

    /// The annotations of the manifest, for editing.
    pub fn annotations_mut(&mut self) -> &mut BTreeMap<String, String> {
        match &mut self.body {
            Body::Index(index) => &mut index.annotations,
            Body::Image(image) => &mut image.annotations,
        }
    }

    /// The layers of an image manifest.
    pub fn layers(&self) -> Result<&[Descriptor]> {
        Ok(&self.image()?.layers)
    }

    /// Replace the layers of an image manifest.
    pub fn set_layers(&mut self, layers: Vec<Descriptor>) -> Result<()> {
        self.image_mut()?.layers = layers;
        Ok(())
    }

    /// The config of an image manifest.
    pub fn config(&self) -> Result<&Descriptor> {
        Ok(&self.image()?.config)
    }

    /// Replace the config of an image manifest.
    pub fn set_config(&mut self, config: Descriptor) -> Result<()> {
        self.image_mut()?.config = config;
        Ok(())
    }

    /// The entries of an index.
    pub fn manifests(&self) -> Result<&[Descriptor]> {
        Ok(&self.index()?.manifests)
    }

    /// Replace the entries of an index.
    pub fn set_manifests(&mut self, manifests: Vec<Descriptor>) -> Result<()> {
        self.index_mut()?.manifests = manifests;
        Ok(())
    }

    fn image(&self) -> Result<&ImageManifest> {
        match &self.body {
            Body::Image(image) => Ok(image),
            Body::Index(_) => Err(ErrorKind::NotImage.report(format!(
                "manifest {} is an index",
                self.descriptor.digest
            ))),
        }
    }

    fn image_mut(&mut self) -> Result<&mut ImageManifest> {
        let digest = &self.descriptor.digest;
        match &mut self.body {
            Body::Image(image) => Ok(image),
            Body::Index(_) => Err(ErrorKind::NotImage.report(format!("manifest {digest} is an index"))),
        }
    }

    fn index(&self) -> Result<&ImageIndex> {
        match &self.body {
            Body::Index(index) => Ok(index),
            Body::Image(_) => Err(ErrorKind::NotList.report(format!(
                "manifest {} is an image",
                self.descriptor.digest
            ))),
        }
    }

    fn index_mut(&mut self) -> Result<&mut ImageIndex> {
        let digest = &self.descriptor.digest;
        match &mut self.body {
            Body::Index(index) => Ok(index),
            Body::Image(_) => Err(ErrorKind::NotList.report(format!("manifest {digest} is an image"))),
        }
    }
}
