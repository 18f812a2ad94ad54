//! Media types understood by this library.
//!
//! Spec reference: https://github.com/opencontainers/image-spec/blob/main/media-types.md

use color_eyre::eyre::{self, bail, eyre};
use itertools::Itertools;
use std::str::FromStr;
use strum::{AsRefStr, EnumIter, IntoEnumIterator};

/// Docker schema 2 image manifest.
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Docker schema 2 manifest list.
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

/// Docker schema 1 manifest, which is not supported.
pub const DOCKER_MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";

/// Docker schema 1 signed manifest, which is not supported.
pub const DOCKER_MANIFEST_V1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";

/// Docker image config.
pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";

/// Docker gzipped layer.
pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Docker foreign layer, whose content is hosted outside the registry.
pub const DOCKER_LAYER_FOREIGN: &str = "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";

/// OCI image manifest.
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI image index.
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// OCI image config.
pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

/// OCI uncompressed layer.
pub const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";

/// OCI gzipped layer.
pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// OCI zstd layer.
pub const OCI_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";

/// OCI nondistributable uncompressed layer.
pub const OCI_LAYER_NONDIST: &str = "application/vnd.oci.image.layer.nondistributable.v1.tar";

/// OCI nondistributable gzipped layer.
pub const OCI_LAYER_NONDIST_GZIP: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";

/// OCI nondistributable zstd layer.
pub const OCI_LAYER_NONDIST_ZSTD: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar+zstd";

/// The media types that can be fetched as a manifest.
pub const MANIFESTS: &[&str] = &[OCI_INDEX, OCI_MANIFEST, DOCKER_MANIFEST_LIST, DOCKER_MANIFEST];

/// The OCI equivalent of a media type, for media types that have one.
///
/// OCI media types map to themselves;
/// media types without an OCI counterpart return `None`.
///
/// ```
/// # use ocimod_lib::media_type::{self, to_oci};
/// assert_eq!(to_oci(media_type::DOCKER_LAYER), Some(media_type::OCI_LAYER_GZIP));
/// assert_eq!(to_oci(media_type::OCI_INDEX), Some(media_type::OCI_INDEX));
/// assert_eq!(to_oci(media_type::DOCKER_LAYER_FOREIGN), None);
/// ```
pub fn to_oci(media_type: &str) -> Option<&'static str> {
    match media_type {
        DOCKER_MANIFEST_LIST | OCI_INDEX => Some(OCI_INDEX),
        DOCKER_MANIFEST | OCI_MANIFEST => Some(OCI_MANIFEST),
        DOCKER_CONFIG | OCI_CONFIG => Some(OCI_CONFIG),
        DOCKER_LAYER | OCI_LAYER_GZIP => Some(OCI_LAYER_GZIP),
        OCI_LAYER => Some(OCI_LAYER),
        OCI_LAYER_ZSTD => Some(OCI_LAYER_ZSTD),
        OCI_LAYER_NONDIST => Some(OCI_LAYER_NONDIST),
        OCI_LAYER_NONDIST_GZIP => Some(OCI_LAYER_NONDIST_GZIP),
        OCI_LAYER_NONDIST_ZSTD => Some(OCI_LAYER_NONDIST_ZSTD),
        _ => None,
    }
}

/// Reports whether the media types are the same or share an OCI equivalent.
pub fn equivalent(a: &str, b: &str) -> bool {
    a == b || matches!((to_oci(a), to_oci(b)), (Some(a), Some(b)) if a == b)
}

/// Reports whether the media type is an image config this library can parse.
pub fn is_image_config(media_type: &str) -> bool {
    matches!(media_type, DOCKER_CONFIG | OCI_CONFIG)
}

/// Media types for OCI container image layers.
///
/// Each entry in this enum is a unique media type "base"; some of them then can have flags applied.
/// For example, even though `Foreign` is a valid [`LayerMediaTypeFlag`], [`LayerMediaType::DockerForeign`]
/// is distinct from [`LayerMediaType::Docker`] because it is an entirely different media type.
#[derive(Debug, Clone, PartialEq, Eq, AsRefStr, EnumIter)]
pub enum LayerMediaType {
    /// A standard Docker container layer in gzipped tar format.
    #[strum(serialize = "application/vnd.docker.image.rootfs.diff.tar.gzip")]
    Docker,

    /// A Docker layer whose content is hosted somewhere other than the registry,
    /// at one of the URLs listed in its descriptor.
    #[strum(serialize = "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip")]
    DockerForeign,

    /// A standard OCI container layer.
    #[strum(serialize = "application/vnd.oci.image.layer.v1.tar")]
    Oci(Vec<LayerMediaTypeFlag>),

    /// An OCI container layer that has restrictions on distribution.
    ///
    /// These are officially marked deprecated in the OCI spec, along with the directive
    /// that clients should download the layers as usual:
    /// https://github.com/opencontainers/image-spec/blob/main/layer.md#non-distributable-layers
    #[strum(serialize = "application/vnd.oci.image.layer.nondistributable.v1.tar")]
    OciNonDistributable(Vec<LayerMediaTypeFlag>),
}

impl LayerMediaType {
    /// Overwrite the flags for the media type.
    fn replace_flags(self, flags: Vec<LayerMediaTypeFlag>) -> Self {
        match self {
            LayerMediaType::Oci(_) => LayerMediaType::Oci(flags),
            LayerMediaType::OciNonDistributable(_) => LayerMediaType::OciNonDistributable(flags),
            LayerMediaType::Docker | LayerMediaType::DockerForeign => self,
        }
    }

    /// The distributable counterpart of the media type.
    ///
    /// Foreign and nondistributable layers become their regular counterparts,
    /// keeping any compression flags. Other media types are returned unchanged.
    ///
    /// ```
    /// # use ocimod_lib::media_type::{LayerMediaType, LayerMediaTypeFlag};
    /// let mt = LayerMediaType::OciNonDistributable(vec![LayerMediaTypeFlag::Zstd]);
    /// assert_eq!(mt.distributable(), LayerMediaType::Oci(vec![LayerMediaTypeFlag::Zstd]));
    /// assert_eq!(LayerMediaType::DockerForeign.distributable(), LayerMediaType::Docker);
    /// ```
    pub fn distributable(self) -> Self {
        match self {
            LayerMediaType::DockerForeign => LayerMediaType::Docker,
            LayerMediaType::OciNonDistributable(flags) => LayerMediaType::Oci(flags),
            other => other,
        }
    }
}

impl FromStr for LayerMediaType {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, flags) = s.split_once('+').unwrap_or((s, ""));
        for media_type in LayerMediaType::iter() {
            if base == media_type.as_ref() {
                return match media_type {
                    // Docker layers don't have flags.
                    LayerMediaType::Docker | LayerMediaType::DockerForeign => Ok(media_type),

                    // OCI layers have flags; handle both bases the same way.
                    mt @ LayerMediaType::Oci(_) | mt @ LayerMediaType::OciNonDistributable(_) => {
                        flags
                            .split('+')
                            .filter(|flag| !flag.is_empty())
                            .map(LayerMediaTypeFlag::from_str)
                            .try_collect()
                            .map(|flags| mt.replace_flags(flags))
                    }
                };
            }
        }
        bail!("unknown media type: {s}");
    }
}

impl std::fmt::Display for LayerMediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_ref())?;
        match self {
            LayerMediaType::Oci(flags) | LayerMediaType::OciNonDistributable(flags) => {
                for flag in flags {
                    write!(f, "+{}", flag.as_ref())?;
                }
                Ok(())
            }
            LayerMediaType::Docker | LayerMediaType::DockerForeign => Ok(()),
        }
    }
}

/// Flags for layer media types.
///
/// Flags are written after the base media type separated by `+`,
/// for example `application/vnd.oci.image.layer.v1.tar+gzip`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, AsRefStr, EnumIter)]
pub enum LayerMediaTypeFlag {
    /// The layer is hosted outside the registry.
    #[strum(serialize = "foreign")]
    Foreign,

    /// The layer is compressed with zstd.
    #[strum(serialize = "zstd")]
    Zstd,

    /// The layer is compressed with gzip.
    #[strum(serialize = "gzip")]
    Gzip,
}

impl FromStr for LayerMediaTypeFlag {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::iter()
            .find(|flag| flag.as_ref() == s)
            .ok_or_else(|| eyre!("unknown flag: {s}"))
    }
}
