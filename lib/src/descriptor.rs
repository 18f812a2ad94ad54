//! Content descriptors and searching lists of them.

use std::collections::BTreeMap;

use bon::Builder;
use color_eyre::Result;
use serde::{Deserialize, Serialize};

use crate::{error::ErrorKind, ext::PriorityFind, media_type, Digest, Platform};

/// A reference to a piece of content by digest, size, and media type.
///
/// ```
/// # use ocimod_lib::{descriptor::Descriptor, media_type, Digest};
/// let descriptor = Descriptor::builder()
///     .media_type(media_type::OCI_LAYER_GZIP)
///     .digest(Digest::sha256(b"layer"))
///     .size(5)
///     .build();
/// let json = serde_json::to_string(&descriptor).expect("serialize");
/// assert!(json.starts_with(r#"{"mediaType":"application/vnd.oci.image.layer.v1.tar+gzip","digest":"sha256:"#));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// The media type of the referenced content.
    #[builder(into)]
    pub media_type: String,

    /// The digest of the referenced content.
    pub digest: Digest,

    /// The size of the referenced content in bytes.
    pub size: i64,

    /// Locations the content may be downloaded from other than the registry.
    #[builder(default)]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,

    /// Arbitrary metadata.
    #[builder(default)]
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// The referenced content, embedded in the descriptor.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_data")]
    pub data: Option<Vec<u8>>,

    /// The platform of the referenced manifest, when listed in an index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,

    /// The type of artifact, when the referenced content is an artifact.
    #[builder(into)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
}

impl Descriptor {
    /// Create a descriptor for the content.
    pub fn for_content(media_type: impl Into<String>, content: &[u8]) -> Self {
        Self::builder()
            .media_type(media_type)
            .digest(Digest::sha256(content))
            .size(content.len() as i64)
            .build()
    }

    /// Reports whether the descriptors reference the same content.
    ///
    /// Digest and size must agree, and the media types must either be identical
    /// or share an OCI equivalent. Every other field is ignored.
    ///
    /// ```
    /// # use ocimod_lib::{descriptor::Descriptor, media_type};
    /// let docker = Descriptor::for_content(media_type::DOCKER_LAYER, b"layer");
    /// let oci = Descriptor::for_content(media_type::OCI_LAYER_GZIP, b"layer");
    /// assert!(docker.same(&oci));
    /// assert!(!docker.equal(&oci));
    /// ```
    pub fn same(&self, other: &Descriptor) -> bool {
        self.digest == other.digest
            && self.size == other.size
            && media_type::equivalent(&self.media_type, &other.media_type)
    }

    /// Reports whether the descriptors are equal in every meaningful field.
    ///
    /// Embedded data is not compared; it is implied by the digest.
    pub fn equal(&self, other: &Descriptor) -> bool {
        let platform = match (&self.platform, &other.platform) {
            (None, None) => true,
            (Some(a), Some(b)) => a.matches(b),
            _ => false,
        };
        self.same(other)
            && self.media_type == other.media_type
            && self.artifact_type == other.artifact_type
            && platform
            && self.urls == other.urls
            && self.annotations == other.annotations
    }

    /// Return the embedded data after verifying it against the descriptor.
    ///
    /// Missing data is only valid if the descriptor references empty content.
    pub fn data(&self) -> Result<&[u8]> {
        let data = self.data.as_deref().unwrap_or_default();
        if data.len() as i64 != self.size {
            return Err(ErrorKind::ParsingFailed.report(format!(
                "embedded data size {} does not match descriptor size {}",
                data.len(),
                self.size
            )));
        }
        if !self.digest.verify(data)? {
            return Err(ErrorKind::ParsingFailed.report(format!(
                "embedded data does not match digest {}",
                self.digest
            )));
        }
        Ok(data)
    }

    /// Reports whether the descriptor satisfies the options.
    pub fn matches(&self, opts: &MatchOptions) -> bool {
        if let Some(artifact_type) = &opts.artifact_type {
            if self.artifact_type.as_ref() != Some(artifact_type) {
                return false;
            }
        }

        let annotations = opts.annotations.iter().all(|(key, value)| {
            match self.annotations.get(key) {
                Some(_) if value.is_empty() => true,
                Some(actual) => actual == value,
                None => false,
            }
        });
        if !annotations {
            return false;
        }

        match (&opts.platform, &self.platform) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(host), Some(target)) => host.compatible(target),
        }
    }
}

impl std::fmt::Display for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.digest, self.media_type)
    }
}

/// Criteria for matching, filtering, and searching descriptors.
///
/// ```
/// # use ocimod_lib::{descriptor::MatchOptions, Platform};
/// let opts = MatchOptions::builder()
///     .platform(Platform::linux_amd64())
///     .sort_annotation("org.example.priority")
///     .build();
/// assert!(!opts.sort_descending);
/// ```
#[derive(Debug, Clone, Default, Builder)]
pub struct MatchOptions {
    /// Only match descriptors whose platform can run on this one.
    pub platform: Option<Platform>,

    /// Only match descriptors with this artifact type.
    #[builder(into)]
    pub artifact_type: Option<String>,

    /// Only match descriptors carrying each annotation.
    /// An empty value only requires the annotation to be present.
    #[builder(default)]
    pub annotations: BTreeMap<String, String>,

    /// Sort filtered results by the value of this annotation.
    /// Descriptors without the annotation always sort last.
    #[builder(into)]
    pub sort_annotation: Option<String>,

    /// Sort in descending order.
    #[builder(default)]
    pub sort_descending: bool,
}

/// Return the descriptors that satisfy the options, sorted as requested.
///
/// Sorting is stable, so descriptors that compare equal keep their relative order.
pub fn filter(descriptors: &[Descriptor], opts: &MatchOptions) -> Vec<Descriptor> {
    let mut matched = descriptors
        .iter()
        .filter(|descriptor| descriptor.matches(opts))
        .cloned()
        .collect::<Vec<_>>();

    if let Some(key) = &opts.sort_annotation {
        matched.sort_by(|a, b| {
            use std::cmp::Ordering;
            match (a.annotations.get(key), b.annotations.get(key)) {
                (Some(a), Some(b)) if opts.sort_descending => b.cmp(a),
                (Some(a), Some(b)) => a.cmp(b),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        });
    }

    matched
}

/// Return the best descriptor that satisfies the options.
///
/// When a platform is requested, an exact platform match is preferred over a merely compatible one.
/// Fails with [`ErrorKind::NotFound`] if nothing matches.
pub fn search(descriptors: &[Descriptor], opts: &MatchOptions) -> Result<Descriptor> {
    let matched = filter(descriptors, opts);
    let found = match &opts.platform {
        Some(platform) => matched.into_iter().priority_find(|descriptor| {
            match &descriptor.platform {
                Some(candidate) if candidate.matches(platform) => 0,
                _ => 1,
            }
        }),
        None => matched.into_iter().next(),
    };
    found.ok_or_else(|| ErrorKind::NotFound.report("no matching descriptor found"))
}

mod base64_data {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match data {
            Some(data) => serializer.serialize_str(&STANDARD.encode(data)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| STANDARD.decode(encoded).map_err(de::Error::custom))
            .transpose()
    }
}
