//! Access to manifests and blobs stored in OCI registries.
//!
//! [`Registry`] is the seam between graph operations and storage.
//! [`Remote`] talks to real registries over HTTP, while [`Memory`] keeps
//! everything in process and is what the tests use.

use async_trait::async_trait;
use bytes::Bytes;
use color_eyre::{eyre::Context, Result};

use crate::{
    config::ImageConfig, descriptor::Descriptor, error::ErrorKind, manifest::Manifest, Reference,
};

mod memory;
mod remote;

pub use memory::Memory;
pub use remote::{Authentication, Remote};

/// Storage for manifests and blobs, addressed by [`Reference`].
///
/// Blob operations use only the host and repository of the reference;
/// the blob itself is identified by the descriptor.
#[async_trait]
pub trait Registry: std::fmt::Debug + Send + Sync {
    /// Fetch the manifest the reference points to.
    async fn manifest_get(&self, reference: &Reference) -> Result<Manifest>;

    /// Fetch the descriptor of the manifest the reference points to.
    async fn manifest_head(&self, reference: &Reference) -> Result<Descriptor>;

    /// Store the manifest at the reference.
    ///
    /// Tagged references update the tag; digest references must match the manifest digest.
    async fn manifest_put(&self, reference: &Reference, manifest: &Manifest) -> Result<()>;

    /// Fetch the content of a blob.
    async fn blob_get(&self, reference: &Reference, descriptor: &Descriptor) -> Result<Bytes>;

    /// Fetch the descriptor of a blob, failing if it does not exist.
    async fn blob_head(&self, reference: &Reference, descriptor: &Descriptor) -> Result<Descriptor>;

    /// Store the content of a blob, which must match the descriptor.
    async fn blob_put(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        content: Bytes,
    ) -> Result<Descriptor>;

    /// Copy a blob from one repository to another.
    async fn blob_copy(
        &self,
        source: &Reference,
        target: &Reference,
        descriptor: &Descriptor,
    ) -> Result<()>;

    /// Fetch and parse the image config referenced by the descriptor.
    #[tracing::instrument(skip(self))]
    async fn image_config(&self, reference: &Reference, descriptor: &Descriptor) -> Result<ImageConfig> {
        let content = self
            .blob_get(reference, descriptor)
            .await
            .with_context(|| format!("fetch config {}", descriptor.digest))?;
        if !descriptor.digest.verify(&content)? {
            return Err(ErrorKind::ParsingFailed.report(format!(
                "config content does not match digest {}",
                descriptor.digest
            )));
        }
        ImageConfig::parse(&content)
    }
}
