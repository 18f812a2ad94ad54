use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use color_eyre::{eyre::bail, Result};
use tokio::sync::RwLock;
use tracing::debug;

use super::Registry;
use crate::{descriptor::Descriptor, error::ErrorKind, manifest::Manifest, Digest, Reference, Version};

/// A registry held entirely in memory.
///
/// Content is addressed by digest and verified when stored,
/// so it behaves like a strict remote registry without the network.
#[derive(Debug, Default)]
pub struct Memory {
    repositories: RwLock<HashMap<String, Repository>>,
    manifest_fetches: AtomicUsize,
}

#[derive(Debug, Default)]
struct Repository {
    manifests: HashMap<Digest, Bytes>,
    media_types: HashMap<Digest, String>,
    tags: HashMap<String, Digest>,
    blobs: HashMap<Digest, Bytes>,
}

impl Repository {
    fn resolve(&self, reference: &Reference) -> Result<Digest> {
        let digest = match &reference.version {
            Version::Digest(digest) => digest,
            Version::Tag(tag) => self
                .tags
                .get(tag)
                .ok_or_else(|| ErrorKind::NotFound.report(format!("tag not found: {reference}")))?,
        };
        if !self.manifests.contains_key(digest) {
            return Err(ErrorKind::NotFound.report(format!("manifest not found: {reference}")));
        }
        Ok(digest.clone())
    }
}

impl Memory {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of times a manifest has been fetched with [`Registry::manifest_get`].
    pub fn manifest_fetches(&self) -> usize {
        self.manifest_fetches.load(Ordering::Relaxed)
    }

    /// Store a blob, computing its descriptor with the provided media type.
    pub async fn push_blob(
        &self,
        reference: &Reference,
        media_type: &str,
        content: impl Into<Bytes>,
    ) -> Result<Descriptor> {
        let content = content.into();
        let descriptor = Descriptor::for_content(media_type, &content);
        self.blob_put(reference, &descriptor, content).await
    }

    /// Reports whether the repository of the reference holds the blob.
    pub async fn has_blob(&self, reference: &Reference, digest: &Digest) -> bool {
        self.repositories
            .read()
            .await
            .get(&reference.repository_path())
            .is_some_and(|repository| repository.blobs.contains_key(digest))
    }
}

#[async_trait]
impl Registry for Memory {
    async fn manifest_get(&self, reference: &Reference) -> Result<Manifest> {
        self.manifest_fetches.fetch_add(1, Ordering::Relaxed);
        let repositories = self.repositories.read().await;
        let repository = repositories
            .get(&reference.repository_path())
            .ok_or_else(|| ErrorKind::NotFound.report(format!("repository not found: {reference}")))?;
        let digest = repository.resolve(reference)?;
        let media_type = repository.media_types.get(&digest).map(String::as_str);
        let raw = repository.manifests.get(&digest).cloned().unwrap_or_default();
        Manifest::parse_as(media_type, raw)
    }

    async fn manifest_head(&self, reference: &Reference) -> Result<Descriptor> {
        let repositories = self.repositories.read().await;
        let repository = repositories
            .get(&reference.repository_path())
            .ok_or_else(|| ErrorKind::NotFound.report(format!("repository not found: {reference}")))?;
        let digest = repository.resolve(reference)?;
        let raw = repository.manifests.get(&digest).cloned().unwrap_or_default();
        let media_type = repository.media_types.get(&digest).cloned().unwrap_or_default();
        Ok(Descriptor::for_content(media_type, &raw))
    }

    async fn manifest_put(&self, reference: &Reference, manifest: &Manifest) -> Result<()> {
        let digest = manifest.descriptor().digest.clone();
        if let Version::Digest(expected) = &reference.version {
            if expected != &digest {
                bail!("manifest digest {digest} does not match reference {reference}");
            }
        }

        let mut repositories = self.repositories.write().await;
        let repository = repositories.entry(reference.repository_path()).or_default();
        repository.manifests.insert(digest.clone(), manifest.raw().clone());
        repository
            .media_types
            .insert(digest.clone(), manifest.media_type().to_string());
        if let Version::Tag(tag) = &reference.version {
            repository.tags.insert(tag.clone(), digest.clone());
        }
        debug!(%reference, %digest, "stored manifest");
        Ok(())
    }

    async fn blob_get(&self, reference: &Reference, descriptor: &Descriptor) -> Result<Bytes> {
        self.repositories
            .read()
            .await
            .get(&reference.repository_path())
            .and_then(|repository| repository.blobs.get(&descriptor.digest))
            .cloned()
            .ok_or_else(|| {
                ErrorKind::NotFound.report(format!(
                    "blob {} not found in {}",
                    descriptor.digest,
                    reference.repository_path()
                ))
            })
    }

    async fn blob_head(&self, reference: &Reference, descriptor: &Descriptor) -> Result<Descriptor> {
        let content = self.blob_get(reference, descriptor).await?;
        Ok(Descriptor {
            size: content.len() as i64,
            ..descriptor.clone()
        })
    }

    async fn blob_put(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        content: Bytes,
    ) -> Result<Descriptor> {
        if content.len() as i64 != descriptor.size || !descriptor.digest.verify(&content)? {
            bail!(
                "blob content does not match descriptor {} ({} bytes)",
                descriptor.digest,
                descriptor.size
            );
        }

        self.repositories
            .write()
            .await
            .entry(reference.repository_path())
            .or_default()
            .blobs
            .insert(descriptor.digest.clone(), content);
        debug!(reference = %reference.repository_path(), digest = %descriptor.digest, "stored blob");
        Ok(descriptor.clone())
    }

    async fn blob_copy(
        &self,
        source: &Reference,
        target: &Reference,
        descriptor: &Descriptor,
    ) -> Result<()> {
        if source.same_repository(target) {
            self.blob_head(source, descriptor).await?;
            return Ok(());
        }
        let content = self.blob_get(source, descriptor).await?;
        self.blob_put(target, descriptor, content).await?;
        Ok(())
    }
}
