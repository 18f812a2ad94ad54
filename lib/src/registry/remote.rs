use async_trait::async_trait;
use bytes::Bytes;
use color_eyre::{
    eyre::{bail, Context},
    Result, Section, SectionExt,
};
use derive_more::Debug;
use http::HeaderValue;
use oci_client::{
    client::{ClientConfig, ClientProtocol},
    secrets::RegistryAuth,
    Client, Reference as OciReference, RegistryOperation,
};
use tracing::{debug, warn};

use super::Registry;
use crate::{
    descriptor::Descriptor, error::ErrorKind, manifest::Manifest, media_type, Reference, Version,
};

/// Authentication for a remote registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Authentication {
    /// No authentication.
    #[default]
    None,

    /// Basic authentication with a username and password.
    Basic {
        username: String,
        #[debug(skip)]
        password: String,
    },
}

impl Authentication {
    /// Create a basic authentication.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl From<&Authentication> for RegistryAuth {
    fn from(auth: &Authentication) -> Self {
        match auth {
            Authentication::None => RegistryAuth::Anonymous,
            Authentication::Basic { username, password } => {
                RegistryAuth::Basic(username.clone(), password.clone())
            }
        }
    }
}

/// A registry reached over the network.
#[derive(Debug, Clone)]
pub struct Remote {
    #[debug(skip)]
    client: Client,

    #[debug(skip)]
    auth: RegistryAuth,
}

#[bon::bon]
impl Remote {
    /// Create a client for remote registries.
    #[builder]
    pub fn new(
        /// Authentication used for every request.
        #[builder(default)]
        auth: Authentication,

        /// Use plain HTTP instead of HTTPS.
        #[builder(default)]
        insecure: bool,
    ) -> Self {
        let config = ClientConfig {
            protocol: if insecure {
                ClientProtocol::Http
            } else {
                ClientProtocol::Https
            },
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth: RegistryAuth::from(&auth),
        }
    }
}

impl Remote {
    /// Authenticate with the registry for the operation.
    /// The client caches the resulting token for later requests to the same repository.
    async fn authorize(&self, reference: &Reference, operation: RegistryOperation) -> Result<()> {
        let oci_ref = OciReference::from(reference);
        self.client
            .auth(&oci_ref, &self.auth, operation)
            .await
            .with_context(|| format!("authenticate to {}", reference.repository_path()))?;
        Ok(())
    }

    async fn pull_raw(&self, reference: &Reference) -> Result<Manifest> {
        let oci_ref = OciReference::from(reference);
        let (raw, digest) = self
            .client
            .pull_manifest_raw(&oci_ref, &self.auth, media_type::MANIFESTS)
            .await
            .with_context(|| format!("pull manifest {reference}"))?;

        let manifest = Manifest::parse(raw.to_vec())
            .with_section(|| reference.to_string().header("Reference:"))?;
        if manifest.descriptor().digest.to_string() != digest {
            warn!(%reference, reported = %digest, computed = %manifest.descriptor().digest, "registry reported a different manifest digest");
        }
        if let Version::Digest(expected) = &reference.version {
            if expected != &manifest.descriptor().digest {
                return Err(ErrorKind::ParsingFailed.report(format!(
                    "manifest content does not match {reference}"
                )));
            }
        }
        Ok(manifest)
    }
}

#[async_trait]
impl Registry for Remote {
    #[tracing::instrument(skip(self))]
    async fn manifest_get(&self, reference: &Reference) -> Result<Manifest> {
        self.pull_raw(reference).await
    }

    /// Registries answer HEAD requests for manifests, but the client only exposes the digest,
    /// so this fetches the manifest to learn its media type and size.
    #[tracing::instrument(skip(self))]
    async fn manifest_head(&self, reference: &Reference) -> Result<Descriptor> {
        self.pull_raw(reference)
            .await
            .map(|manifest| manifest.descriptor().clone())
    }

    #[tracing::instrument(skip(self, manifest), fields(digest = %manifest.descriptor().digest))]
    async fn manifest_put(&self, reference: &Reference, manifest: &Manifest) -> Result<()> {
        self.authorize(reference, RegistryOperation::Push).await?;
        let content_type = HeaderValue::from_str(manifest.media_type())
            .with_context(|| format!("encode media type {}", manifest.media_type()))?;
        let oci_ref = OciReference::from(reference);
        self.client
            .push_manifest_raw(&oci_ref, manifest.raw().to_vec(), content_type)
            .await
            .with_context(|| format!("push manifest {reference}"))?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn blob_get(&self, reference: &Reference, descriptor: &Descriptor) -> Result<Bytes> {
        self.authorize(reference, RegistryOperation::Pull).await?;
        let oci_ref = OciReference::from(reference);
        let mut content = Vec::new();
        self.client
            .pull_blob(&oci_ref, descriptor.digest.to_string().as_str(), &mut content)
            .await
            .with_context(|| format!("pull blob {} from {}", descriptor.digest, reference.repository_path()))?;
        Ok(Bytes::from(content))
    }

    /// The client has no HEAD request for blobs, so this downloads the blob to confirm it exists.
    #[tracing::instrument(skip(self))]
    async fn blob_head(&self, reference: &Reference, descriptor: &Descriptor) -> Result<Descriptor> {
        let content = self.blob_get(reference, descriptor).await?;
        Ok(Descriptor {
            size: content.len() as i64,
            ..descriptor.clone()
        })
    }

    #[tracing::instrument(skip(self, content))]
    async fn blob_put(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        content: Bytes,
    ) -> Result<Descriptor> {
        if content.len() as i64 != descriptor.size || !descriptor.digest.verify(&content)? {
            bail!("blob content does not match descriptor {}", descriptor.digest);
        }

        self.authorize(reference, RegistryOperation::Push).await?;
        let oci_ref = OciReference::from(reference);
        self.client
            .push_blob(&oci_ref, &content, &descriptor.digest.to_string())
            .await
            .with_context(|| format!("push blob {} to {}", descriptor.digest, reference.repository_path()))?;
        Ok(descriptor.clone())
    }

    /// Within a registry, blobs are mounted from the source repository without transferring content.
    /// Across registries the blob is downloaded and uploaded again.
    #[tracing::instrument(skip(self))]
    async fn blob_copy(
        &self,
        source: &Reference,
        target: &Reference,
        descriptor: &Descriptor,
    ) -> Result<()> {
        if source.same_repository(target) {
            return Ok(());
        }

        if source.host == target.host {
            self.authorize(source, RegistryOperation::Pull).await?;
            self.authorize(target, RegistryOperation::Push).await?;
            let mounted = self
                .client
                .mount_blob(
                    &OciReference::from(target),
                    &OciReference::from(source),
                    &descriptor.digest.to_string(),
                )
                .await;
            match mounted {
                Ok(()) => return Ok(()),
                Err(err) => debug!(?err, "mount failed, falling back to copy"),
            }
        }

        let content = self.blob_get(source, descriptor).await?;
        self.blob_put(target, descriptor, content).await?;
        Ok(())
    }
}

impl From<&Reference> for OciReference {
    fn from(reference: &Reference) -> Self {
        match &reference.version {
            Version::Tag(tag) => Self::with_tag(
                reference.host.clone(),
                reference.repository.clone(),
                tag.clone(),
            ),
            Version::Digest(digest) => Self::with_digest(
                reference.host.clone(),
                reference.repository.clone(),
                digest.to_string(),
            ),
        }
    }
}
