//! Core library for `ocimod`, a tool for modifying and rebasing OCI images in place in a registry.
//!
//! Images are loaded into a [`dag::Dag`] of manifests, configs, and layers.
//! A [`modify::Modification`] registers steps against the graph, runs them,
//! and then pushes whatever changed back to the registry bottom up.

use bon::Builder;
use color_eyre::{
    eyre::{self, bail, eyre, Context},
    Result, Section, SectionExt,
};
use derive_more::derive::Display;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256, Sha512};
use std::str::FromStr;
use tap::Pipe;

mod ext;
pub mod config;
pub mod dag;
pub mod descriptor;
pub mod error;
pub mod manifest;
pub mod media_type;
pub mod modify;
pub mod pipeline;
pub mod rebase;
pub mod registry;
pub mod steps;

mod propagate;

#[doc(hidden)]
pub mod __private {
    pub use hex_magic;
    pub use static_assertions;
}

/// Platform represents the platform a container image is built for.
/// This follows the OCI Image Spec's platform definition while also supporting
/// Docker's platform string format (e.g. "linux/amd64").
///
/// ```
/// # use ocimod_lib::Platform;
/// # use std::str::FromStr;
/// let platform = Platform::from_str("linux/amd64").expect("parse platform");
/// assert_eq!(platform.to_string(), "linux/amd64");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Builder, Serialize, Deserialize)]
pub struct Platform {
    /// Operating system the container runs on (e.g. "linux", "windows", "darwin").
    ///
    /// Per the OCI spec, OS values must correspond with GOOS.
    /// https://github.com/opencontainers/image-spec/blob/main/image-index.md
    #[builder(into)]
    pub os: String,

    /// CPU architecture (e.g. "amd64", "arm64").
    ///
    /// Per the OCI spec, architecture values must correspond with GOARCH.
    /// https://github.com/opencontainers/image-spec/blob/main/image-index.md
    #[builder(into)]
    pub architecture: String,

    /// Variant of the CPU (e.g. "v7" for armv7).
    ///
    /// Per the OCI spec, this is one of the following features:
    /// https://github.com/opencontainers/image-spec/blob/main/image-index.md#platform-variants
    #[builder(into)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,

    /// Operating system version (e.g. "10.0.14393.1066" for windows).
    #[builder(into)]
    #[serde(rename = "os.version", default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,

    /// Additional platform features required.
    #[builder(into, default)]
    #[serde(rename = "os.features", default, skip_serializing_if = "Vec::is_empty")]
    pub os_features: Vec<String>,
}

impl Platform {
    /// Canonical name for the linux operating system.
    pub const LINUX: &'static str = "linux";

    /// Canonical name for the macOS operating system.
    pub const DARWIN: &'static str = "darwin";

    /// Canonical name for the Windows operating system.
    pub const WINDOWS: &'static str = "windows";

    /// Canonical name for the AMD64 architecture.
    pub const AMD64: &'static str = "amd64";

    /// Canonical name for the ARM64 architecture.
    pub const ARM64: &'static str = "arm64";

    /// Canonical name for the 32 bit ARM architecture.
    pub const ARM: &'static str = "arm";

    /// Clone the instance with the given variant.
    pub fn with_variant(self, variant: &str) -> Self {
        Self {
            variant: Some(variant.to_string()),
            ..self
        }
    }

    /// Create an instance for Linux AMD64
    pub fn linux_amd64() -> Self {
        Self::builder()
            .os(Self::LINUX)
            .architecture(Self::AMD64)
            .build()
    }

    /// Create an instance for Linux ARM64
    pub fn linux_arm64() -> Self {
        Self::builder()
            .os(Self::LINUX)
            .architecture(Self::ARM64)
            .build()
    }

    /// Create an instance for Windows AMD64
    pub fn windows_amd64() -> Self {
        Self::builder()
            .os(Self::WINDOWS)
            .architecture(Self::AMD64)
            .build()
    }

    /// Create an instance for macOS ARM64
    pub fn macos_arm64() -> Self {
        Self::builder()
            .os(Self::DARWIN)
            .architecture(Self::ARM64)
            .build()
    }

    /// Normalize the platform so that equivalent spellings compare equal.
    ///
    /// Architecture variants that are implied by the architecture are dropped
    /// (`arm64/v8`, `amd64/v1`), while 32 bit ARM always carries an explicit variant.
    ///
    /// ```
    /// # use ocimod_lib::Platform;
    /// # use std::str::FromStr;
    /// let platform = Platform::from_str("linux/arm64/v8").expect("parse platform");
    /// assert_eq!(platform.normalized(), Platform::linux_arm64());
    ///
    /// let platform = Platform::from_str("linux/arm").expect("parse platform");
    /// assert_eq!(platform.normalized().to_string(), "linux/arm/v7");
    /// ```
    pub fn normalized(&self) -> Self {
        let mut platform = self.clone();
        platform.os = platform.os.to_lowercase();
        platform.architecture = match platform.architecture.to_lowercase().as_str() {
            "x86_64" | "x86-64" => String::from(Self::AMD64),
            "aarch64" => String::from(Self::ARM64),
            other => other.to_string(),
        };

        let variant = platform.variant.take().map(|v| v.to_lowercase());
        platform.variant = match (platform.architecture.as_str(), variant.as_deref()) {
            (Self::ARM64, Some("8" | "v8")) => None,
            (Self::AMD64, Some("v1")) => None,
            (Self::ARM, None) => Some(String::from("v7")),
            (Self::ARM, Some(v)) if !v.starts_with('v') => Some(format!("v{v}")),
            (_, variant) => variant.map(String::from),
        };
        platform
    }

    /// Reports whether the platforms are the same after normalization.
    ///
    /// OS features are informational and do not participate in matching.
    pub fn matches(&self, other: &Platform) -> bool {
        let (a, b) = (self.normalized(), other.normalized());
        a.os == b.os
            && a.architecture == b.architecture
            && a.variant == b.variant
            && a.os_version == b.os_version
    }

    /// Reports whether content built for `target` can run on this platform.
    ///
    /// - Linux and macOS hosts are treated as able to run each other's content,
    ///   since macOS runs linux containers through a virtual machine.
    /// - Newer architecture variants run content built for older variants of the same architecture.
    /// - Windows content must share the major, minor, and build numbers of the host OS version.
    ///
    /// ```
    /// # use ocimod_lib::Platform;
    /// # use std::str::FromStr;
    /// let host = Platform::from_str("linux/amd64/v3").expect("parse platform");
    /// assert!(host.compatible(&Platform::linux_amd64()));
    /// assert!(!Platform::linux_amd64().compatible(&host));
    /// ```
    pub fn compatible(&self, target: &Platform) -> bool {
        let (host, target) = (self.normalized(), target.normalized());

        let os = host.os == target.os
            || matches!(
                (host.os.as_str(), target.os.as_str()),
                (Self::LINUX, Self::DARWIN) | (Self::DARWIN, Self::LINUX)
            );
        if !os || host.architecture != target.architecture {
            return false;
        }

        if host.os == Self::WINDOWS && target.os == Self::WINDOWS {
            if let (Some(host), Some(target)) = (&host.os_version, &target.os_version) {
                if windows_build(host) != windows_build(target) {
                    return false;
                }
            }
        }

        if host.variant == target.variant {
            return true;
        }
        match (
            variant_level(&host.architecture, host.variant.as_deref()),
            variant_level(&target.architecture, target.variant.as_deref()),
        ) {
            (Some(host), Some(target)) => host >= target,
            _ => false,
        }
    }
}

/// The numeric level of a variant for architectures whose variants are ordered.
fn variant_level(architecture: &str, variant: Option<&str>) -> Option<u32> {
    let default = match architecture {
        Platform::AMD64 => 1,
        Platform::ARM64 => 8,
        Platform::ARM => 7,
        _ => return None,
    };
    match variant {
        None => Some(default),
        Some(variant) => variant.trim_start_matches('v').parse().ok(),
    }
}

/// The major, minor, and build components of a windows version string.
fn windows_build(version: &str) -> Vec<&str> {
    version.split('.').take(3).collect()
}

impl FromStr for Platform {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input_section = || s.to_string().header("Input:");
        let expected_section = || {
            "{os}/{architecture}[/{variant}]"
                .to_string()
                .header("Expected:")
        };
        let examples_section = || {
            vec!["linux/arm/v7", "darwin/arm64"]
                .join("\n")
                .header("Examples:")
        };

        // Docker platform strings are of the form: os/arch[/variant]
        let parts = s.split('/').collect::<Vec<_>>();
        if parts.iter().any(|part| part.is_empty()) {
            return eyre!("invalid platform format")
                .with_section(input_section)
                .with_section(expected_section)
                .with_section(examples_section)
                .pipe(Err);
        }

        match parts.as_slice() {
            [os, architecture] => Self::builder()
                .os(*os)
                .architecture(*architecture)
                .build()
                .pipe(Ok),
            [os, architecture, variant] => Self::builder()
                .os(*os)
                .architecture(*architecture)
                .variant(*variant)
                .build()
                .pipe(Ok),
            _ => eyre!("invalid platform format")
                .with_section(input_section)
                .with_section(expected_section)
                .with_section(examples_section)
                .pipe(Err),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}

/// Create a [`Digest`] from a hex string at compile time.
/// ```
/// let digest = ocimod_lib::digest!("sha256", "a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4");
/// assert_eq!(digest.algorithm, "sha256");
/// assert_eq!(digest.as_hex(), "a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4");
/// ```
///
/// If algorithm is not provided, it defaults to [`Digest::SHA256`].
/// ```
/// let digest = ocimod_lib::digest!("a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4");
/// assert_eq!(digest.algorithm, "sha256");
/// ```
///
/// This macro currently assumes that the hash is 32 bytes long.
/// Providing a value of a different length will result in a compile-time error.
/// ```compile_fail
/// let digest = ocimod_lib::digest!("a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4deadbeef");
/// ```
#[macro_export]
macro_rules! digest {
    ($hex:expr) => {{
        $crate::digest!($crate::Digest::SHA256, $hex, 32)
    }};
    ($algorithm:expr, $hex:expr) => {{
        $crate::digest!($algorithm, $hex, 32)
    }};
    ($algorithm:expr, $hex:expr, $size:expr) => {{
        const HASH: [u8; $size] = $crate::__private::hex_magic::hex!($hex);
        $crate::__private::static_assertions::const_assert_ne!(HASH.len(), 0);
        $crate::__private::static_assertions::const_assert_ne!($algorithm.len(), 0);
        $crate::Digest {
            algorithm: $algorithm.to_string(),
            hash: HASH.to_vec(),
        }
    }};
}

/// A content-addressable digest in the format `algorithm:hash`.
///
/// The `FromStr` implementation parses the format used in OCI containers by default,
/// which is `algorithm:hex`.
///
/// ```
/// # use std::str::FromStr;
/// let digest = ocimod_lib::Digest::from_str("sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4").expect("parse digest");
/// assert_eq!(digest.algorithm, "sha256");
/// assert_eq!(digest.as_hex(), "a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    /// The hashing algorithm used (e.g. "sha256")
    pub algorithm: String,

    /// The raw hash bytes
    pub hash: Vec<u8>,
}

impl Digest {
    /// The SHA256 algorithm
    pub const SHA256: &'static str = "sha256";

    /// The SHA512 algorithm
    pub const SHA512: &'static str = "sha512";

    /// Returns the hash as a hex string
    pub fn as_hex(&self) -> String {
        hex::encode(&self.hash)
    }

    /// Compute the SHA256 digest of the content.
    ///
    /// ```
    /// let digest = ocimod_lib::Digest::sha256(b"");
    /// assert_eq!(digest.to_string(), "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855");
    /// ```
    pub fn sha256(content: impl AsRef<[u8]>) -> Self {
        Self {
            algorithm: Self::SHA256.to_string(),
            hash: Sha256::digest(content.as_ref()).to_vec(),
        }
    }

    /// Compute the digest of the content using the same algorithm as this digest,
    /// and report whether the content matches.
    pub fn verify(&self, content: impl AsRef<[u8]>) -> Result<bool> {
        let hash = match self.algorithm.as_str() {
            Self::SHA256 => Sha256::digest(content.as_ref()).to_vec(),
            Self::SHA512 => Sha512::digest(content.as_ref()).to_vec(),
            other => bail!("unsupported digest algorithm: {other}"),
        };
        Ok(hash == self.hash)
    }
}

impl FromStr for Digest {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input_section = || s.to_string().header("Input:");
        let (algorithm, hex) = s.split_once(':').ok_or_else(|| {
            eyre!("invalid digest format: missing algorithm separator ':'")
                .with_section(input_section)
        })?;

        if algorithm.is_empty() {
            bail!("algorithm cannot be empty");
        }
        if hex.is_empty() {
            bail!("hex cannot be empty");
        }

        Ok(Self {
            algorithm: algorithm.to_string(),
            hash: hex::decode(hex).map_err(|e| eyre!("invalid hex string: {e}"))?,
        })
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.as_hex())
    }
}

impl From<&Digest> for Digest {
    fn from(digest: &Digest) -> Self {
        digest.clone()
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Digest::from_str(&raw).map_err(|err| de::Error::custom(format!("{err:#}")))
    }
}

/// Version identifier for a container image.
///
/// This can be a named tag or a digest.
///
/// ```
/// # use ocimod_lib::Version;
/// assert_eq!(Version::latest().to_string(), "latest");
/// assert_eq!(Version::tag("other").to_string(), "other");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
pub enum Version {
    /// A named tag (e.g. "latest", "1.0.0")
    Tag(String),

    /// A digest (e.g. "sha256:123abc...")
    Digest(Digest),
}

impl Version {
    /// Returns the tag for "latest".
    pub fn latest() -> Self {
        Self::Tag(String::from("latest"))
    }

    /// Create a tagged instance.
    pub fn tag(tag: &str) -> Self {
        Self::Tag(tag.to_string())
    }

    /// Create a digest instance.
    pub fn digest(digest: Digest) -> Self {
        Self::Digest(digest)
    }
}

/// A parsed container image reference.
///
/// Parsing follows the conventions of the docker CLI:
/// references without a registry host are read from Docker Hub,
/// and single component Docker Hub repositories live under `library/`.
///
/// ```
/// # use ocimod_lib::{Reference, Version};
/// # use std::str::FromStr;
/// // Default to latest tag
/// let reference = Reference::from_str("ubuntu").expect("parse reference");
/// assert_eq!(reference.host, "docker.io");
/// assert_eq!(reference.repository, "library/ubuntu");
/// assert_eq!(reference.version, Version::tag("latest"));
///
/// // Parse a tag on a custom registry
/// let reference = Reference::from_str("localhost:5000/project/app:other").expect("parse reference");
/// assert_eq!(reference.host, "localhost:5000");
/// assert_eq!(reference.repository, "project/app");
/// assert_eq!(reference.version, Version::tag("other"));
///
/// // Parse a digest
/// let reference = Reference::from_str("ghcr.io/org/app@sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4").expect("parse reference");
/// assert_eq!(reference.host, "ghcr.io");
/// assert_eq!(reference.repository, "org/app");
/// assert_eq!(reference.version.to_string(), "sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Builder)]
pub struct Reference {
    /// Registry host (e.g. "docker.io", "ghcr.io")
    #[builder(into)]
    pub host: String,

    /// Repository name including namespace (e.g. "library/ubuntu", "username/project")
    #[builder(into)]
    pub repository: String,

    /// Version identifier, either a tag or digest
    #[builder(into, default = Version::latest())]
    pub version: Version,
}

impl<S: reference_builder::State> ReferenceBuilder<S> {
    /// Set the reference to a tag version.
    pub fn tag(self, tag: &str) -> ReferenceBuilder<reference_builder::SetVersion<S>>
    where
        S::Version: reference_builder::IsUnset,
    {
        self.version(Version::tag(tag))
    }

    /// Set the reference to a digest version.
    pub fn digest(
        self,
        digest: impl Into<Digest>,
    ) -> ReferenceBuilder<reference_builder::SetVersion<S>>
    where
        S::Version: reference_builder::IsUnset,
    {
        self.version(Version::Digest(digest.into()))
    }
}

impl Reference {
    /// The registry host used when a reference does not name one.
    pub const DOCKER_HUB: &'static str = "docker.io";

    /// Clone the reference, pointing it at the provided digest in the same repository.
    pub fn with_digest(&self, digest: impl Into<Digest>) -> Self {
        Self {
            host: self.host.clone(),
            repository: self.repository.clone(),
            version: Version::Digest(digest.into()),
        }
    }

    /// Clone the reference, pointing it at the provided tag in the same repository.
    pub fn with_tag(&self, tag: &str) -> Self {
        Self {
            host: self.host.clone(),
            repository: self.repository.clone(),
            version: Version::tag(tag),
        }
    }

    /// The digest of the reference, if it is pinned to one.
    pub fn digest(&self) -> Option<&Digest> {
        match &self.version {
            Version::Digest(digest) => Some(digest),
            Version::Tag(_) => None,
        }
    }

    /// Reports whether the references name the same repository on the same host.
    pub fn same_repository(&self, other: &Reference) -> bool {
        self.host == other.host && self.repository == other.repository
    }

    /// The fully qualified repository, without a version.
    pub fn repository_path(&self) -> String {
        format!("{}/{}", self.host, self.repository)
    }
}

impl FromStr for Reference {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input_section = || s.to_string().header("Input:");
        let invalid = |msg: &str| eyre!("invalid reference: {msg}").with_section(input_section);

        // Check for '@' first since digest identifiers also contain ':'.
        let (name, digest) = match s.split_once('@') {
            Some((name, digest)) => {
                let digest = Digest::from_str(digest)
                    .context("parse digest")
                    .with_section(input_section)?;
                (name, Some(digest))
            }
            None => (s, None),
        };

        // A tag can only appear after the last path separator,
        // otherwise the ':' belongs to a registry port.
        let last_separator = name.rfind('/').map(|idx| idx + 1).unwrap_or(0);
        let (path, tag) = match name[last_separator..].rfind(':') {
            Some(idx) => {
                let idx = last_separator + idx;
                (&name[..idx], Some(&name[idx + 1..]))
            }
            None => (name, None),
        };
        if tag.is_some_and(str::is_empty) {
            return Err(invalid("tag cannot be empty"));
        }

        let (host, repository) = match path.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (Self::DOCKER_HUB.to_string(), path.to_string()),
        };
        let repository = if host == Self::DOCKER_HUB && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };

        if repository.split('/').any(str::is_empty) {
            return Err(invalid("repository components cannot be empty"));
        }
        if repository.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(invalid("repository must be lowercase"));
        }

        let version = match (digest, tag) {
            (Some(digest), _) => Version::Digest(digest),
            (None, Some(tag)) => Version::tag(tag),
            (None, None) => Version::latest(),
        };

        Ok(Reference {
            host,
            repository,
            version,
        })
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.host, self.repository)?;
        match &self.version {
            Version::Tag(tag) => write!(f, ":{}", tag),
            Version::Digest(digest) => write!(f, "@{}", digest),
        }
    }
}
