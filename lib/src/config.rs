//! Image configuration.
//!
//! Only the fields needed to rebase and relabel images are interpreted;
//! everything else is preserved as read so re-serialized configs lose nothing.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::DateTime;
use color_eyre::{eyre::Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{descriptor::Descriptor, error::ErrorKind, Digest, Platform};

/// An image config, in either Docker or OCI format.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(default)]
    pub architecture: String,

    #[serde(default)]
    pub os: String,

    #[serde(rename = "os.version", default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,

    #[serde(rename = "os.features", default, skip_serializing_if = "Vec::is_empty")]
    pub os_features: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,

    /// Runtime configuration for containers created from the image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<RuntimeConfig>,

    /// The uncompressed digests of each layer.
    #[serde(default)]
    pub rootfs: RootFs,

    /// Build history; entries with `empty_layer` set do not correspond to a layer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,

    /// Fields this library does not interpret, preserved as read.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The parts of the container runtime configuration this library edits.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(rename = "Labels", default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The layer filesystem of an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub diff_ids: Vec<Digest>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            kind: String::from("layers"),
            diff_ids: Vec::new(),
        }
    }
}

/// A single entry of build history.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct History {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

impl History {
    /// Reports whether the entries describe the same build step.
    ///
    /// Timestamps are compared as instants, so the same moment written
    /// with a different offset or precision still compares equal.
    pub fn same_step(&self, other: &History) -> bool {
        self.author == other.author
            && self.comment == other.comment
            && self.created_by == other.created_by
            && self.empty_layer == other.empty_layer
            && same_instant(self.created.as_deref(), other.created.as_deref())
    }
}

fn same_instant(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            match (DateTime::parse_from_rfc3339(a), DateTime::parse_from_rfc3339(b)) {
                (Ok(a), Ok(b)) => a == b,
                _ => a == b,
            }
        }
        _ => false,
    }
}

impl ImageConfig {
    /// Parse a config from its serialized form.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw)
            .map_err(|err| ErrorKind::ParsingFailed.report(format!("parse image config: {err}")))
    }

    /// Serialize the config, returning a descriptor for the new content along with the content.
    ///
    /// The media type is taken from `previous`; every other field describes the new content.
    pub fn serialize(&self, previous: &Descriptor) -> Result<(Descriptor, Bytes)> {
        let raw = serde_json::to_vec(self).context("serialize image config")?;
        let descriptor = Descriptor::for_content(previous.media_type.clone(), &raw);
        Ok((descriptor, Bytes::from(raw)))
    }

    /// The platform the image was built for.
    pub fn platform(&self) -> Platform {
        Platform {
            os: self.os.clone(),
            architecture: self.architecture.clone(),
            variant: self.variant.clone(),
            os_version: self.os_version.clone(),
            os_features: self.os_features.clone(),
        }
    }

    /// The labels of the image, if any.
    pub fn labels(&self) -> Option<&BTreeMap<String, String>> {
        self.config.as_ref().and_then(|config| config.labels.as_ref())
    }

    /// The labels of the image for editing, creating the map if needed.
    pub fn labels_mut(&mut self) -> &mut BTreeMap<String, String> {
        self.config
            .get_or_insert_with(RuntimeConfig::default)
            .labels
            .get_or_insert_with(BTreeMap::new)
    }

    /// The number of history entries that correspond to a layer.
    pub fn layer_history_len(&self) -> usize {
        self.history.iter().filter(|entry| !entry.empty_layer).count()
    }
}
