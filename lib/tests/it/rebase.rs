use color_eyre::{eyre::Report, Result};
use ocimod_lib::{
    error::ErrorKind,
    manifest::Manifest,
    modify::{self, Modification},
    rebase::check_base,
    registry::{Memory, Registry},
    steps::{ANNOTATION_BASE_DIGEST, ANNOTATION_BASE_NAME},
    Platform, Reference,
};
use pretty_assertions::assert_eq;

use crate::fixture::{
    config_of, diff_id, image_for, push_attested_index, push_index, reference, Image,
};

/// Two versions of a multi platform base image, with `base:3` pointing at the first.
/// The first version has three layers per platform, the second has four.
struct Bases {
    old: [Image; 2],
    new: [Image; 2],
    old_index: Manifest,
    tag: Reference,
}

impl Bases {
    async fn push(registry: &Memory) -> Result<Self> {
        let tag = reference("registry.test/base:3");
        let old = [
            layered(Platform::linux_amd64(), "base-v1-amd64", 3),
            layered(Platform::linux_arm64(), "base-v1-arm64", 3),
        ];
        let new = [
            layered(Platform::linux_amd64(), "base-v2-amd64", 4),
            layered(Platform::linux_arm64(), "base-v2-arm64", 4),
        ];
        let old_index = push_index(registry, &tag, &old, &[]).await?;
        Ok(Self {
            old,
            new,
            old_index,
            tag,
        })
    }

    /// Move the tag to the new version of the base.
    async fn update(&self, registry: &Memory) -> Result<Manifest> {
        push_index(registry, &self.tag, &self.new, &[]).await
    }

    fn annotations(&self) -> [(&'static str, String); 2] {
        [
            (ANNOTATION_BASE_NAME, self.tag.to_string()),
            (ANNOTATION_BASE_DIGEST, self.old_index.descriptor().digest.to_string()),
        ]
    }
}

fn layered(platform: Platform, prefix: &str, count: usize) -> Image {
    (0..count).fold(Image::new(platform), |image, i| image.layer(&format!("{prefix}-{i}")))
}

fn annotated(image: Image, bases: &Bases) -> Image {
    bases
        .annotations()
        .into_iter()
        .fold(image, |image, (name, value)| image.annotation(name, &value))
}

/// Reports whether any error in the chain mentions the message.
fn caused_by(err: &Report, message: &str) -> bool {
    err.chain().any(|cause| cause.to_string().contains(message))
}

async fn rebase(registry: &Memory, app: &Reference, opt: modify::Opt) -> Result<modify::Outcome> {
    Modification::builder()
        .reference(app.clone())
        .options(vec![opt])
        .build()
        .apply(registry)
        .await
}

async fn assert_rebased(registry: &Memory, app: &Reference, expected: &Image) -> Result<()> {
    let manifest = image_for(registry, app, &expected.platform).await?;
    let pinned = app.with_digest(&manifest.descriptor().digest);
    let layers = manifest.layers()?;
    assert_eq!(layers.len(), expected.layers.len());
    for (layer, content) in layers.iter().zip(&expected.layers) {
        assert_eq!(layer.digest, ocimod_lib::Digest::sha256(content));
        assert!(registry.has_blob(app, &layer.digest).await, "layer {content} in {app}");
    }

    let config = config_of(registry, &pinned).await?;
    let expected_config = expected.config();
    assert_eq!(config.rootfs.diff_ids, expected_config.rootfs.diff_ids);
    assert_eq!(config.history, expected_config.history);
    assert_eq!(config.platform(), expected.platform);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn rebase_single_platform() -> Result<()> {
    let registry = Memory::new();
    let bases = Bases::push(&registry).await?;
    let app = reference("registry.test/app:1.0");
    let original = annotated(Image::on(&bases.old[0]).layer("app"), &bases)
        .push(&registry, &app)
        .await?;
    bases.update(&registry).await?;

    let outcome = Modification::builder()
        .reference(app.clone())
        .options(vec![modify::with_rebase()])
        .build()
        .apply(&registry)
        .await?;
    assert!(outcome.modified);
    assert_ne!(outcome.descriptor.digest, original.descriptor().digest);

    assert_rebased(&registry, &app, &Image::on(&bases.new[0]).layer("app")).await?;

    let manifest = registry.manifest_get(&app).await?;
    assert_eq!(manifest.annotations(), original.annotations());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn rebase_index() -> Result<()> {
    let registry = Memory::new();
    let bases = Bases::push(&registry).await?;
    let app = reference("registry.test/app:1.0");
    let images = [
        Image::on(&bases.old[0]).layer("app-amd64"),
        Image::on(&bases.old[1]).layer("app-arm64"),
    ];
    let annotations = bases.annotations();
    let annotations = annotations
        .iter()
        .map(|(name, value)| (*name, value.as_str()))
        .collect::<Vec<_>>();
    let original = push_index(&registry, &app, &images, &annotations).await?;
    bases.update(&registry).await?;

    let before = registry.manifest_fetches();
    let outcome = Modification::builder()
        .reference(app.clone())
        .options(vec![modify::with_rebase()])
        .build()
        .apply(&registry)
        .await?;
    assert!(outcome.modified);

    // The graph of the image, then each base top manifest and platform image once.
    assert_eq!(registry.manifest_fetches() - before, 3 + 2 + 4);

    assert_rebased(&registry, &app, &Image::on(&bases.new[0]).layer("app-amd64")).await?;
    assert_rebased(&registry, &app, &Image::on(&bases.new[1]).layer("app-arm64")).await?;
    for platform in [Platform::linux_amd64(), Platform::linux_arm64()] {
        let manifest = image_for(&registry, &app, &platform).await?;
        assert_eq!(manifest.layers()?.len(), 5);
    }

    let index = registry.manifest_get(&app).await?;
    assert_eq!(index.annotations(), original.annotations());
    for (entry, previous) in index.manifests()?.iter().zip(original.manifests()?) {
        assert_eq!(entry.platform, previous.platform);
        assert_ne!(entry.digest, previous.digest);
    }
    Ok(())
}

#[test_log::test(tokio::test)]
async fn rebase_then_record_base() -> Result<()> {
    let registry = Memory::new();
    let bases = Bases::push(&registry).await?;
    let app = reference("registry.test/app:1.0");
    annotated(Image::on(&bases.old[0]).layer("app"), &bases)
        .push(&registry, &app)
        .await?;
    let new_index = bases.update(&registry).await?;

    let rebased = Modification::builder()
        .reference(app.clone())
        .options(vec![
            modify::with_rebase(),
            modify::with_annotation_base(bases.tag.clone(), new_index.descriptor().digest.clone()),
        ])
        .build()
        .apply(&registry)
        .await?;
    assert!(rebased.modified);

    let manifest = registry.manifest_get(&app).await?;
    assert_eq!(
        manifest.annotations().get(ANNOTATION_BASE_DIGEST),
        Some(&new_index.descriptor().digest.to_string())
    );
    check_base(&registry, &app, None).await?;

    let again = Modification::builder()
        .reference(app.clone())
        .options(vec![modify::with_rebase()])
        .build()
        .apply(&registry)
        .await?;
    assert!(!again.modified);
    assert_eq!(again.descriptor.digest, rebased.descriptor.digest);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn rebase_unchanged_base() -> Result<()> {
    let registry = Memory::new();
    let bases = Bases::push(&registry).await?;
    let app = reference("registry.test/app:1.0");
    let original = annotated(Image::on(&bases.old[0]).layer("app"), &bases)
        .push(&registry, &app)
        .await?;

    let outcome = Modification::builder()
        .reference(app.clone())
        .options(vec![modify::with_rebase()])
        .build()
        .apply(&registry)
        .await?;
    assert!(!outcome.modified);
    assert_eq!(outcome.descriptor.digest, original.descriptor().digest);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn rebase_explicit_refs() -> Result<()> {
    let registry = Memory::new();
    let bases = Bases::push(&registry).await?;
    let app = reference("registry.test/app:1.0");
    Image::on(&bases.old[1])
        .layer("app")
        .push(&registry, &app)
        .await?;
    bases.update(&registry).await?;

    let old = bases.tag.with_digest(&bases.old_index.descriptor().digest);
    let outcome = Modification::builder()
        .reference(app.clone())
        .options(vec![modify::with_rebase_refs(old, bases.tag.clone())])
        .build()
        .apply(&registry)
        .await?;
    assert!(outcome.modified);

    assert_rebased(&registry, &app, &Image::on(&bases.new[1]).layer("app")).await?;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn rebase_not_derived() -> Result<()> {
    let registry = Memory::new();
    let bases = Bases::push(&registry).await?;
    let app = reference("registry.test/app:1.0");
    let original = annotated(
        Image::new(Platform::linux_amd64()).layer("scratch").layer("app"),
        &bases,
    )
    .push(&registry, &app)
    .await?;
    bases.update(&registry).await?;

    let err = Modification::builder()
        .reference(app.clone())
        .options(vec![modify::with_rebase()])
        .build()
        .apply(&registry)
        .await
        .expect_err("image is not built on the base");
    assert_eq!(ErrorKind::of(&err), Some(ErrorKind::Mismatch));

    let manifest = registry.manifest_get(&app).await?;
    assert_eq!(manifest.descriptor().digest, original.descriptor().digest);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn rebase_history_mismatch() -> Result<()> {
    let registry = Memory::new();
    let bases = Bases::push(&registry).await?;
    let app = reference("registry.test/app:1.0");

    // Same layers as the base, but the history says they were made differently.
    annotated(Image::on(&bases.old[0]).layer("app"), &bases)
        .push_edited(&registry, &app, |config| {
            config.history[0].created_by = Some(String::from("RUN something else"));
        })
        .await?;
    bases.update(&registry).await?;

    let err = Modification::builder()
        .reference(app.clone())
        .options(vec![modify::with_rebase()])
        .build()
        .apply(&registry)
        .await
        .expect_err("history differs from the base");
    assert_eq!(ErrorKind::of(&err), Some(ErrorKind::Mismatch));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn rebase_empty_layer_history() -> Result<()> {
    let registry = Memory::new();
    let tag = reference("registry.test/base:3");
    let old = Image::new(Platform::linux_amd64())
        .layer("base-v1-0")
        .step("ENV PATH=/opt/v1/bin")
        .layer("base-v1-1")
        .step(r#"CMD ["sh"]"#);
    let old_manifest = old.push(&registry, &tag).await?;

    let app = reference("registry.test/app:1.0");
    Image::on(&old)
        .step("WORKDIR /app")
        .layer("app")
        .step(r#"ENTRYPOINT ["app"]"#)
        .push(&registry, &app)
        .await?;

    let new = Image::new(Platform::linux_amd64())
        .step("ARG VERSION=2")
        .layer("base-v2-0")
        .layer("base-v2-1")
        .layer("base-v2-2")
        .step(r#"CMD ["sh"]"#);
    new.push(&registry, &tag).await?;

    let old = tag.with_digest(&old_manifest.descriptor().digest);
    let outcome = rebase(&registry, &app, modify::with_rebase_refs(old, tag)).await?;
    assert!(outcome.modified);

    let expected = Image::on(&new)
        .step("WORKDIR /app")
        .layer("app")
        .step(r#"ENTRYPOINT ["app"]"#);
    assert_rebased(&registry, &app, &expected).await?;

    let config = config_of(&registry, &app).await?;
    assert_eq!(config.history.len(), 8);
    assert_eq!(config.layer_history_len(), 4);
    assert_eq!(config.rootfs.diff_ids.len(), 4);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn rebase_layer_mismatch() -> Result<()> {
    let registry = Memory::new();
    let bases = Bases::push(&registry).await?;
    let app = reference("registry.test/app:1.0");

    // Enough layers, but the second one was swapped out.
    annotated(
        Image::new(Platform::linux_amd64())
            .layer("base-v1-amd64-0")
            .layer("patched")
            .layer("base-v1-amd64-2")
            .layer("app"),
        &bases,
    )
    .push(&registry, &app)
    .await?;
    bases.update(&registry).await?;

    let err = rebase(&registry, &app, modify::with_rebase())
        .await
        .expect_err("second layer differs from the base");
    assert_eq!(ErrorKind::of(&err), Some(ErrorKind::Mismatch));
    assert!(caused_by(&err, "layer 1 is"), "{err:?}");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn rebase_diff_id_mismatch() -> Result<()> {
    let registry = Memory::new();
    let bases = Bases::push(&registry).await?;
    let app = reference("registry.test/app:1.0");
    let original = annotated(Image::on(&bases.old[0]).layer("app"), &bases)
        .push_edited(&registry, &app, |config| {
            config.rootfs.diff_ids[2] = diff_id("rebuilt");
        })
        .await?;
    bases.update(&registry).await?;

    let err = rebase(&registry, &app, modify::with_rebase())
        .await
        .expect_err("diff id differs from the base");
    assert_eq!(ErrorKind::of(&err), Some(ErrorKind::Mismatch));
    assert!(caused_by(&err, "diff id 2 is"), "{err:?}");

    let manifest = registry.manifest_get(&app).await?;
    assert_eq!(manifest.descriptor().digest, original.descriptor().digest);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn rebase_inconsistent_old_base() -> Result<()> {
    let registry = Memory::new();
    let tag = reference("registry.test/base:3");
    let old = Image::new(Platform::linux_amd64()).layer("base-v1-0").layer("base-v1-1");
    let old_manifest = old
        .push_edited(&registry, &tag, |config| {
            config.rootfs.diff_ids.push(diff_id("missing"));
        })
        .await?;

    let app = reference("registry.test/app:1.0");
    Image::on(&old).layer("app").push(&registry, &app).await?;
    Image::new(Platform::linux_amd64())
        .layer("base-v2-0")
        .push(&registry, &tag)
        .await?;

    let old = tag.with_digest(&old_manifest.descriptor().digest);
    let err = rebase(&registry, &app, modify::with_rebase_refs(old, tag))
        .await
        .expect_err("old base has more diff ids than layers");
    assert_eq!(ErrorKind::of(&err), Some(ErrorKind::Mismatch));
    assert!(caused_by(&err, "is inconsistent"), "{err:?}");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn rebase_inconsistent_new_base() -> Result<()> {
    let registry = Memory::new();
    let bases = Bases::push(&registry).await?;
    let app = reference("registry.test/app:1.0");
    let original = annotated(Image::on(&bases.old[0]).layer("app"), &bases)
        .push(&registry, &app)
        .await?;
    layered(Platform::linux_amd64(), "base-v2-amd64", 4)
        .push_edited(&registry, &bases.tag, |config| {
            config.history.pop();
        })
        .await?;

    let err = rebase(&registry, &app, modify::with_rebase())
        .await
        .expect_err("new base has fewer history entries than layers");
    assert_eq!(ErrorKind::of(&err), Some(ErrorKind::Mismatch));
    assert!(caused_by(&err, "validate new base"), "{err:?}");
    assert!(caused_by(&err, "is inconsistent"), "{err:?}");

    let manifest = registry.manifest_get(&app).await?;
    assert_eq!(manifest.descriptor().digest, original.descriptor().digest);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn rebase_no_matching_platform() -> Result<()> {
    let registry = Memory::new();
    let bases = Bases::push(&registry).await?;
    let app = reference("registry.test/app:1.0");
    let platform = "linux/s390x".parse::<Platform>()?;
    annotated(Image::new(platform).layer("base").layer("app"), &bases)
        .push(&registry, &app)
        .await?;
    bases.update(&registry).await?;

    let err = rebase(&registry, &app, modify::with_rebase())
        .await
        .expect_err("base has no s390x image");
    assert_eq!(ErrorKind::of(&err), Some(ErrorKind::NotFound));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn rebase_after_external_urls_rm() -> Result<()> {
    let registry = Memory::new();
    let tag = reference("registry.test/base:3");
    let old = Image::new(Platform::linux_amd64())
        .foreign_layer("base-v1-0")
        .layer("base-v1-1");
    let old_manifest = old.push(&registry, &tag).await?;

    let app = reference("registry.test/app:1.0");
    Image::on(&old).layer("app").push(&registry, &app).await?;
    let new = layered(Platform::linux_amd64(), "base-v2", 3);
    new.push(&registry, &tag).await?;

    // Stripping URLs replaces the first layer, which rebasing must still remove as part of the base.
    let old = tag.with_digest(&old_manifest.descriptor().digest);
    let outcome = Modification::builder()
        .reference(app.clone())
        .options(vec![
            modify::with_external_urls_rm(),
            modify::with_rebase_refs(old, tag),
        ])
        .build()
        .apply(&registry)
        .await?;
    assert!(outcome.modified);

    assert_rebased(&registry, &app, &Image::on(&new).layer("app")).await?;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn rebase_index_with_attestations() -> Result<()> {
    let registry = Memory::new();
    let bases = Bases::push(&registry).await?;
    let app = reference("registry.test/app:1.0");
    let images = [
        Image::on(&bases.old[0]).layer("app-amd64"),
        Image::on(&bases.old[1]).layer("app-arm64"),
    ];
    let original = push_attested_index(&registry, &app, &images, &[]).await?;
    assert_eq!(original.manifests()?.len(), 4);
    check_base(&registry, &app, Some(&bases.tag)).await?;
    bases.update(&registry).await?;

    let old = bases.tag.with_digest(&bases.old_index.descriptor().digest);
    let outcome = rebase(&registry, &app, modify::with_rebase_refs(old.clone(), bases.tag.clone())).await?;
    assert!(outcome.modified);

    assert_rebased(&registry, &app, &Image::on(&bases.new[0]).layer("app-amd64")).await?;
    assert_rebased(&registry, &app, &Image::on(&bases.new[1]).layer("app-arm64")).await?;

    let index = registry.manifest_get(&app).await?;
    let entries = index.manifests()?;
    assert_eq!(entries.len(), 4);
    for (entry, previous) in entries.iter().zip(original.manifests()?) {
        assert_eq!(entry.platform, previous.platform);
        assert_eq!(entry.annotations, previous.annotations);
        if previous.annotations.contains_key("vnd.docker.reference.type") {
            assert_eq!(entry.digest, previous.digest);
        } else {
            assert_ne!(entry.digest, previous.digest);
        }
    }

    check_base(&registry, &app, Some(&bases.tag)).await?;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn rebase_missing_annotation() -> Result<()> {
    let registry = Memory::new();
    let bases = Bases::push(&registry).await?;
    let app = reference("registry.test/app:1.0");
    Image::on(&bases.old[0])
        .layer("app")
        .annotation(ANNOTATION_BASE_NAME, &bases.tag.to_string())
        .push(&registry, &app)
        .await?;

    let err = Modification::builder()
        .reference(app.clone())
        .options(vec![modify::with_rebase()])
        .build()
        .apply(&registry)
        .await
        .expect_err("no base digest");
    assert_eq!(ErrorKind::of(&err), Some(ErrorKind::MissingAnnotation));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn check_base_annotations() -> Result<()> {
    let registry = Memory::new();
    let bases = Bases::push(&registry).await?;
    let app = reference("registry.test/app:1.0");
    annotated(Image::on(&bases.old[0]).layer("app"), &bases)
        .push(&registry, &app)
        .await?;

    check_base(&registry, &app, None).await?;

    bases.update(&registry).await?;
    let err = check_base(&registry, &app, None)
        .await
        .expect_err("base has moved");
    assert_eq!(ErrorKind::of(&err), Some(ErrorKind::Mismatch));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn check_base_explicit() -> Result<()> {
    let registry = Memory::new();
    let bases = Bases::push(&registry).await?;
    let app = reference("registry.test/app:1.0");
    let images = [
        Image::on(&bases.old[0]).layer("app-amd64"),
        Image::on(&bases.old[1]).layer("app-arm64"),
    ];
    push_index(&registry, &app, &images, &[]).await?;

    check_base(&registry, &app, Some(&bases.tag)).await?;

    bases.update(&registry).await?;
    let err = check_base(&registry, &app, Some(&bases.tag))
        .await
        .expect_err("base has moved");
    assert_eq!(ErrorKind::of(&err), Some(ErrorKind::Mismatch));

    let old = bases.tag.with_digest(&bases.old_index.descriptor().digest);
    check_base(&registry, &app, Some(&old)).await?;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn check_base_unknown() -> Result<()> {
    let registry = Memory::new();
    let app = reference("registry.test/app:1.0");
    Image::new(Platform::linux_amd64())
        .layer("app")
        .push(&registry, &app)
        .await?;

    let err = check_base(&registry, &app, None).await.expect_err("no base");
    assert_eq!(ErrorKind::of(&err), Some(ErrorKind::MissingAnnotation));
    Ok(())
}

