//! Walks directory forests for OCI layouts and decodes what each one holds.

use anyhow::{anyhow, Context, Result};
use oci_spec::image::{Descriptor, ImageManifest, MediaType};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use crate::digest;
use crate::knowledge::KnowledgeBase;
use crate::manifest::{self, LayoutBlobs, ManifestSubject};
use crate::tree::{ImageInfo, ImageRef, LayoutNode, ReferrerTarget, SubIndexInfo};

/// Default bound on how deep below a root the walk descends
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Builds the layout forest, naming every tagged image's top layer in the
/// knowledge base as it goes
pub struct GraphBuilder<'kb> {
    knowledge: &'kb mut KnowledgeBase,
    max_depth: usize,
}

impl<'kb> GraphBuilder<'kb> {
    pub fn new(knowledge: &'kb mut KnowledgeBase, max_depth: usize) -> Self {
        GraphBuilder {
            knowledge,
            max_depth,
        }
    }

    /// Build the forest under `root`. Only an unreadable `root` itself is an
    /// error; problems further down are logged and skipped.
    pub fn build(&mut self, root: &Path) -> Result<LayoutNode> {
        self.walk(root, 0)
    }

    fn walk(&mut self, dir: &Path, depth: usize) -> Result<LayoutNode> {
        if manifest::is_oci_layout(dir) {
            return Ok(self.load_layout(dir));
        }

        let mut node = LayoutNode::new_dir(dir);
        if depth >= self.max_depth {
            warn!(path = %dir.display(), max_depth = self.max_depth, "not descending further");
            return Ok(node);
        }

        let mut subdirs = Vec::new();
        for entry in fs::read_dir(dir)
            .with_context(|| format!("Failed to read directory {}", dir.display()))?
        {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    warn!(path = %dir.display(), "skipping unreadable entry: {}", err);
                    continue;
                }
            };
            // file_type() does not follow symlinks, so linked directories are skipped
            match entry.file_type() {
                Ok(file_type) if file_type.is_dir() => subdirs.push(entry.path()),
                _ => {}
            }
        }
        subdirs.sort();

        for subdir in subdirs {
            match self.walk(&subdir, depth + 1) {
                Ok(child) if child.layout_count > 0 => node.add_child(child),
                Ok(_) => {}
                Err(err) => warn!(path = %subdir.display(), "skipping directory: {:#}", err),
            }
        }

        Ok(node)
    }

    /// Decode one layout. Failing to open it or read its index yields an empty
    /// layout node rather than an error.
    pub fn load_layout(&mut self, root: &Path) -> LayoutNode {
        let blobs = match LayoutBlobs::open(root) {
            Ok(blobs) => blobs,
            Err(err) => {
                warn!(path = %root.display(), "error opening layout: {:#}", err);
                return LayoutNode::new_layout(root, Vec::new(), Vec::new());
            }
        };

        let index = match blobs.index() {
            Ok(index) => index,
            Err(err) => {
                warn!(path = %root.display(), "error getting index: {:#}", err);
                return LayoutNode::new_layout(root, Vec::new(), Vec::new());
            }
        };

        let mut images = Vec::new();
        let mut sub_indexes = Vec::new();

        // tagged or not, every top-level descriptor is decoded
        for descriptor in index.manifests() {
            let tag = descriptor
                .annotations()
                .as_ref()
                .and_then(|a| a.get(manifest::ANNOTATION_REF_NAME))
                .cloned();
            let reference = ImageRef::new(root, tag, descriptor.digest());

            match descriptor.media_type() {
                MediaType::ImageManifest => {
                    debug!(layout = %root.display(), digest = %reference.digest, "loading image manifest");
                    images.push(self.load_image(&blobs, reference, descriptor));
                }
                MediaType::ImageIndex => {
                    debug!(layout = %root.display(), digest = %reference.digest, "loading sub-index");
                    sub_indexes.push(load_sub_index(&blobs, reference, descriptor));
                }
                other => {
                    warn!(
                        layout = %root.display(),
                        digest = %reference.digest,
                        media_type = %other,
                        "skipping top-level descriptor with unsupported media type"
                    );
                }
            }
        }

        resolve_referrers(&mut images);

        LayoutNode::new_layout(root, images, sub_indexes)
    }

    fn load_image(&mut self, blobs: &LayoutBlobs, reference: ImageRef, descriptor: &Descriptor) -> ImageInfo {
        let mut info = ImageInfo::new(reference, descriptor.clone());

        if let Err(err) = self.decode_image(blobs, &mut info) {
            warn!(
                layout = %info.reference.layout_root.display(),
                digest = %info.reference.digest,
                "error reading image: {:#}",
                err
            );
            info.error = Some(format!("{:#}", err));
        }

        assign_display_names(&mut info);
        info
    }

    fn decode_image(&mut self, blobs: &LayoutBlobs, info: &mut ImageInfo) -> Result<()> {
        let manifest_digest = info.descriptor.digest().to_string();
        let bytes = blobs.read_blob(&manifest_digest)?;

        let fields: ManifestSubject = manifest::decode_blob(&bytes, "manifest", &manifest_digest)?;
        info.artifact_type = fields.artifact_type;
        info.subject = fields.subject.map(|s| digest::bare(&s.digest).to_string());

        let image_manifest: ImageManifest = manifest::decode_blob(&bytes, "image manifest", &manifest_digest)?;
        let config = image_manifest.config();
        info.config_media_type = Some(config.media_type().to_string());
        if matches!(config.media_type(), MediaType::ImageConfig) {
            info.config = Some(blobs.config(config)?);
        }

        info.layer_digests = image_manifest
            .layers()
            .iter()
            .map(|layer| digest::bare(layer.digest()).to_string())
            .collect();
        info.manifest = Some(image_manifest);

        let top = info
            .top_layer()
            .ok_or_else(|| anyhow!("manifest {} has no layers", digest::short(&manifest_digest)))?;

        // the image's own tag names its top layer
        if let Some(tag) = &info.reference.tag {
            self.knowledge.insert(top, tag.clone());
        }

        Ok(())
    }
}

fn load_sub_index(blobs: &LayoutBlobs, reference: ImageRef, descriptor: &Descriptor) -> SubIndexInfo {
    let tag = reference.tag.clone().unwrap_or_else(|| digest::short(&reference.digest).to_string());
    let mut info = SubIndexInfo {
        reference,
        display_name: format!("subindex '{}'", tag),
        display_label: format!("Subindex '{}'", tag),
        manifests: Vec::new(),
        error: None,
    };

    match blobs.sub_index(descriptor) {
        Ok(index) => {
            info.manifests = index.manifests().clone();
            info.display_label = format!("Subindex '{}' with {} manifests", tag, info.manifests.len());
        }
        Err(err) => {
            warn!(
                layout = %info.reference.layout_root.display(),
                digest = %info.reference.digest,
                "error reading sub-index: {:#}",
                err
            );
            info.error = Some(format!("{:#}", err));
        }
    }

    info
}

/// Label an image by its tag, or failing that by what kind of config it carries
fn assign_display_names(info: &mut ImageInfo) {
    let short = digest::short(&info.reference.digest).to_string();

    if let Some(tag) = &info.reference.tag {
        info.display_name = tag.clone();
        info.display_label = format!("image \"{}\"", tag);
        return;
    }

    let config_media_type = info.config_media_type.as_deref().unwrap_or_default();
    match config_media_type {
        media_type if media_type == MediaType::ImageConfig.to_string() => {
            info.display_name = short.clone();
            info.display_label = format!("image {}", short);
        }
        manifest::MEDIA_TYPE_EMPTY => {
            info.filename = info
                .manifest
                .as_ref()
                .filter(|m| m.layers().len() == 1)
                .and_then(|m| m.layers()[0].annotations().as_ref())
                .and_then(|a| a.get(manifest::ANNOTATION_TITLE))
                .map(|title| {
                    Path::new(title)
                        .file_name()
                        .map(|f| f.to_string_lossy().to_string())
                        .unwrap_or_else(|| title.clone())
                });
            info.display_name = short.clone();
            info.display_label = format!(
                "\"{}\" ({})",
                info.filename.as_deref().unwrap_or(""),
                info.artifact_type.as_deref().unwrap_or("unset")
            );
        }
        media_type if media_type == MediaType::ImageIndex.to_string() => {
            info.display_name = "Notary Signature Index".to_string();
            info.display_label = info.display_name.clone();
        }
        manifest::MEDIA_TYPE_NOTARY_SIGNATURE => {
            info.display_name = format!("Notary Signature {}", short);
            info.display_label = info.display_name.clone();
        }
        "" => {
            info.display_name = short.clone();
            info.display_label = format!("image {}", short);
        }
        other => {
            info.display_name = other.to_string();
            info.display_label = format!("unknown config {} {}", other, short);
        }
    }
}

/// Attach referrers to their subjects.
///
/// Nothing indexes manifests by subject, so each image scans the layout's
/// other manifests for one whose subject is its digest.
fn resolve_referrers(images: &mut [ImageInfo]) {
    for idx in 0..images.len() {
        let target = ReferrerTarget {
            tag: images[idx].reference.tag.clone(),
            digest: images[idx].reference.digest.clone(),
            label: images[idx].display_label.clone(),
        };

        let referrers: Vec<usize> = images
            .iter()
            .enumerate()
            .filter(|(other, info)| {
                *other != idx
                    && info.reference.digest != target.digest
                    && info.subject.as_deref() == Some(target.digest.as_str())
            })
            .map(|(other, _)| other)
            .collect();

        for other in referrers {
            debug!(subject = %target.digest, referrer = %images[other].reference.digest, "found referrer");
            images[other].reference.target = Some(target.clone());
            let reference = images[other].reference.clone();
            images[idx].referrers.push(reference);
        }
    }
}
