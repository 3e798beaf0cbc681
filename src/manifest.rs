use anyhow::{Context, Result};
use oci_spec::image::{Descriptor, ImageConfiguration, ImageIndex};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::digest;

/// Top-level index file whose presence marks a directory as an OCI layout
pub const INDEX_FILE: &str = "index.json";

/// Annotation carrying an image's tag in the top-level index
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// Annotation carrying an artifact's file name on its layer descriptor
pub const ANNOTATION_TITLE: &str = "org.opencontainers.image.title";

/// Annotation umoci puts on layers with the uncompressed blob size
pub const ANNOTATION_UNCOMPRESSED_SIZE: &str = "ci.umo.uncompressed_blob_size";

pub const MEDIA_TYPE_EMPTY: &str = "application/vnd.oci.empty.v1+json";
pub const MEDIA_TYPE_NOTARY_SIGNATURE: &str = "application/vnd.cncf.notary.signature";
pub const MEDIA_TYPE_COSIGN_SIGNATURE: &str = "application/vnd.dev.cosign.artifact.sig.v1+json";

/// The fields of a manifest needed to find referrers.
///
/// Read separately from the full image manifest so a manifest that does not fully
/// decode can still be matched against its subject.
#[derive(Debug, Default, Deserialize)]
pub struct ManifestSubject {
    #[serde(rename = "artifactType")]
    pub artifact_type: Option<String>,

    pub subject: Option<SubjectDescriptor>,
}

#[derive(Debug, Deserialize)]
pub struct SubjectDescriptor {
    pub digest: String,
}

/// Check whether `path` holds an OCI layout
pub fn is_oci_layout(path: &Path) -> bool {
    path.join(INDEX_FILE).exists()
}

/// Read-only access to the blobs of one OCI layout
#[derive(Debug)]
pub struct LayoutBlobs {
    root: PathBuf,
}

impl LayoutBlobs {
    pub fn open(root: &Path) -> Result<Self> {
        if !is_oci_layout(root) {
            anyhow::bail!("{} has no {}", root.display(), INDEX_FILE);
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Parse the top-level index.json
    pub fn index(&self) -> Result<ImageIndex> {
        let path = self.root.join(INDEX_FILE);
        let bytes = fs::read(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Path of a blob: `blobs/<algorithm>/<hex>`. Digests that could
    /// step outside the blob directory are rejected.
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let (algorithm, encoded) = digest::checked(digest).with_context(|| format!("Invalid digest {:?}", digest))?;
        Ok(self.root.join("blobs").join(algorithm).join(encoded))
    }

    pub fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest)?;
        fs::read(&path).with_context(|| format!("Failed to read blob {}", path.display()))
    }

    pub fn sub_index(&self, descriptor: &Descriptor) -> Result<ImageIndex> {
        self.decode(descriptor, "image index")
    }

    pub fn config(&self, descriptor: &Descriptor) -> Result<ImageConfiguration> {
        self.decode(descriptor, "image config")
    }

    fn decode<T: DeserializeOwned>(&self, descriptor: &Descriptor, what: &str) -> Result<T> {
        let bytes = self.read_blob(descriptor.digest())?;
        decode_blob(&bytes, what, descriptor.digest())
    }
}

/// Display path of a blob, without validating the digest
pub fn blob_path(root: &Path, digest: &str) -> PathBuf {
    let (algorithm, hex) = digest::split(digest);
    root.join("blobs").join(algorithm).join(hex)
}

/// Decode raw blob bytes as `T`, naming the blob on failure
pub fn decode_blob<T: DeserializeOwned>(bytes: &[u8], what: &str, digest: &str) -> Result<T> {
    serde_json::from_slice(bytes)
        .with_context(|| format!("Failed to parse {} {}", what, digest::short(digest)))
}
