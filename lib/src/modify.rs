//! Modifying images in a registry.
//!
//! ```no_run
//! # use ocimod_lib::{modify::{self, Modification}, registry::Remote, Reference};
//! # use std::str::FromStr;
//! # async fn example() -> color_eyre::Result<()> {
//! let registry = Remote::builder().build();
//! let outcome = Modification::builder()
//!     .reference(Reference::from_str("registry.example.com/app:1.0")?)
//!     .options(vec![
//!         modify::with_annotation("org.example.reviewed", "true"),
//!         modify::with_rebase(),
//!     ])
//!     .build()
//!     .apply(&registry)
//!     .await?;
//! println!("{}", outcome.descriptor.digest);
//! # Ok(())
//! # }
//! ```

use bon::Builder;
use color_eyre::{eyre::Context as _, Result};
use derive_more::Debug;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    dag::Dag,
    pipeline::{Context, Pipeline},
    rebase::Rebase,
    registry::Registry,
    steps::{
        Annotation, BaseAnnotation, ConfigToOci, ExternalUrlsRm, Label, LabelsToAnnotations,
        LayerToOci, ManifestToOci,
    },
    Digest, Reference,
};

pub use crate::propagate::Outcome;

/// A modification to apply to an image.
///
/// Options register steps on the pipeline once the image graph is loaded,
/// so they can read the image while deciding what to do.
#[derive(Debug)]
pub struct Opt {
    name: &'static str,
    #[debug(skip)]
    register: Box<dyn FnOnce(&mut Pipeline, &Dag) -> Result<()> + Send>,
}

impl Opt {
    /// Create an option from a function that registers steps.
    pub fn new(
        name: &'static str,
        register: impl FnOnce(&mut Pipeline, &Dag) -> Result<()> + Send + 'static,
    ) -> Self {
        Self {
            name,
            register: Box::new(register),
        }
    }

    /// The name of the option, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    fn register(self, pipeline: &mut Pipeline, dag: &Dag) -> Result<()> {
        let name = self.name();
        debug!(option = name, "registering option");
        (self.register)(pipeline, dag).with_context(|| format!("register option {name}"))
    }
}

/// Set an annotation on the top manifest. An empty value removes the annotation.
pub fn with_annotation(name: impl Into<String>, value: impl Into<String>) -> Opt {
    let step = Annotation {
        name: name.into(),
        value: value.into(),
    };
    Opt::new("annotation", move |pipeline, _| {
        pipeline.manifest(step);
        Ok(())
    })
}

/// Record the base image in the standard base annotations of the top manifest.
pub fn with_annotation_base(base: Reference, digest: Digest) -> Opt {
    Opt::new("annotation-base", move |pipeline, _| {
        pipeline.manifest(BaseAnnotation { base, digest });
        Ok(())
    })
}

/// Copy the labels of each image config into annotations on its manifest.
pub fn with_labels_to_annotations() -> Opt {
    Opt::new("labels-to-annotations", |pipeline, _| {
        pipeline.manifest(LabelsToAnnotations);
        Ok(())
    })
}

/// Set a label in each image config. An empty value removes the label.
pub fn with_label(name: impl Into<String>, value: impl Into<String>) -> Opt {
    let step = Label {
        name: name.into(),
        value: value.into(),
    };
    Opt::new("label", move |pipeline, _| {
        pipeline.config(step);
        Ok(())
    })
}

/// Strip external URLs from layers, making foreign layers regular layers.
pub fn with_external_urls_rm() -> Opt {
    Opt::new("external-urls-rm", |pipeline, _| {
        pipeline.manifest(ExternalUrlsRm);
        Ok(())
    })
}

/// Convert every manifest, config, and layer to OCI media types.
pub fn with_manifest_to_oci() -> Opt {
    Opt::new("to-oci", |pipeline, _| {
        pipeline
            .layer(LayerToOci)
            .config(ConfigToOci)
            .manifest(ManifestToOci);
        Ok(())
    })
}

/// Rebase the image onto the current version of the base recorded in its annotations.
///
/// Fails with [`crate::error::ErrorKind::MissingAnnotation`] if the image does not record its base.
pub fn with_rebase() -> Opt {
    Opt::new("rebase", |pipeline, dag| {
        let rebase = Rebase::from_annotations(dag)?;
        info!(old = %rebase.old, new = %rebase.new, "rebasing from annotations");
        pipeline.manifest(rebase);
        Ok(())
    })
}

/// Rebase the image from `old` onto `new`.
///
/// `old` should be pinned to the digest the image was built on.
pub fn with_rebase_refs(old: Reference, new: Reference) -> Opt {
    Opt::new("rebase-refs", move |pipeline, _| {
        pipeline.manifest(Rebase { old, new });
        Ok(())
    })
}

/// A set of modifications to an image.
#[derive(Debug, Builder)]
pub struct Modification {
    /// The image to modify.
    reference: Reference,

    /// Where to push the result. Defaults to the image being modified.
    target: Option<Reference>,

    /// The modifications, applied in order.
    #[builder(default)]
    options: Vec<Opt>,

    /// Cancels the modification between registry operations.
    #[builder(default)]
    cancel: CancellationToken,
}

impl Modification {
    /// Load the image, run every option, and push the result.
    ///
    /// No manifest is pushed unless every step succeeds.
    #[tracing::instrument(skip_all, fields(reference = %self.reference))]
    pub async fn apply(self, registry: &dyn Registry) -> Result<Outcome> {
        let target = self.target.unwrap_or_else(|| self.reference.clone());
        let mut ctx = Context::new(registry, target, self.cancel);
        let mut dag = Dag::load(&mut ctx, &self.reference)
            .await
            .context("load image")?;

        let mut pipeline = Pipeline::default();
        for opt in self.options {
            opt.register(&mut pipeline, &dag)?;
        }

        pipeline
            .run(&mut ctx, &mut dag)
            .await
            .context("modify image")?;
        crate::propagate::propagate(&mut ctx, &mut dag, &self.reference)
            .await
            .context("push image")
    }
}
