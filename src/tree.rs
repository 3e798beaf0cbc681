use oci_spec::image::{Descriptor, ImageConfiguration, ImageManifest};
use std::path::{Path, PathBuf};

use crate::digest;

/// Identifies one manifest inside a layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub layout_root: PathBuf,
    /// Value of the ref.name annotation, if the index tags it
    pub tag: Option<String>,
    /// Bare manifest digest
    pub digest: String,
    /// Set when this manifest is a referrer of another manifest in the layout
    pub target: Option<ReferrerTarget>,
}

/// The subject a referrer points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferrerTarget {
    pub tag: Option<String>,
    pub digest: String,
    pub label: String,
}

impl ImageRef {
    pub fn new(layout_root: &Path, tag: Option<String>, digest: &str) -> Self {
        ImageRef {
            layout_root: layout_root.to_path_buf(),
            tag,
            digest: digest::bare(digest).to_string(),
            target: None,
        }
    }

    /// `<layout dir name>/<tag>`, how images are listed in summaries
    pub fn usage_label(&self) -> String {
        format!("{}/{}", layout_name(&self.layout_root), self.tag.as_deref().unwrap_or(""))
    }
}

/// One decoded image manifest
#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub reference: ImageRef,
    pub descriptor: Descriptor,
    pub manifest: Option<ImageManifest>,
    pub artifact_type: Option<String>,
    /// Bare digest of the manifest's `subject`, if any
    pub subject: Option<String>,
    pub config_media_type: Option<String>,
    pub config: Option<ImageConfiguration>,
    /// Bare layer digests, base first
    pub layer_digests: Vec<String>,
    pub display_name: String,
    pub display_label: String,
    /// Title of the single layer of a file artifact
    pub filename: Option<String>,
    /// Manifests in the same layout whose subject is this one
    pub referrers: Vec<ImageRef>,
    /// Decode failure; manifest/config fields are incomplete when set
    pub error: Option<String>,
}

impl ImageInfo {
    pub fn new(reference: ImageRef, descriptor: Descriptor) -> Self {
        ImageInfo {
            reference,
            descriptor,
            manifest: None,
            artifact_type: None,
            subject: None,
            config_media_type: None,
            config: None,
            layer_digests: Vec::new(),
            display_name: String::new(),
            display_label: String::new(),
            filename: None,
            referrers: Vec::new(),
            error: None,
        }
    }

    pub fn top_layer(&self) -> Option<&str> {
        self.layer_digests.last().map(String::as_str)
    }

    /// True when the layer chain can be used for base-layer statistics
    pub fn is_usable(&self) -> bool {
        self.error.is_none() && !self.layer_digests.is_empty()
    }
}

/// A nested index listed in a layout's top-level index
#[derive(Debug, Clone)]
pub struct SubIndexInfo {
    pub reference: ImageRef,
    pub display_name: String,
    pub display_label: String,
    pub manifests: Vec<Descriptor>,
    pub error: Option<String>,
}

/// A directory in the forest: either an OCI layout or a directory containing some
#[derive(Debug, Clone)]
pub struct LayoutNode {
    pub root_path: PathBuf,
    pub is_layout: bool,
    /// Number of OCI layouts at or beneath this node
    pub layout_count: usize,
    pub images: Vec<ImageInfo>,
    pub sub_indexes: Vec<SubIndexInfo>,
    pub children: Vec<LayoutNode>,
}

impl LayoutNode {
    pub fn new_dir(root_path: &Path) -> Self {
        LayoutNode {
            root_path: root_path.to_path_buf(),
            is_layout: false,
            layout_count: 0,
            images: Vec::new(),
            sub_indexes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn new_layout(root_path: &Path, images: Vec<ImageInfo>, sub_indexes: Vec<SubIndexInfo>) -> Self {
        LayoutNode {
            root_path: root_path.to_path_buf(),
            is_layout: true,
            layout_count: 1,
            images,
            sub_indexes,
            children: Vec::new(),
        }
    }

    /// Attach a child directory, summing its layout count into this node
    pub fn add_child(&mut self, child: LayoutNode) {
        self.layout_count += child.layout_count;
        self.children.push(child);
    }

    /// Every image at or beneath this node, depth first
    pub fn all_images(&self) -> Vec<&ImageInfo> {
        let mut images: Vec<&ImageInfo> = self.images.iter().collect();
        for child in &self.children {
            images.extend(child.all_images());
        }
        images
    }

    /// Every layout node at or beneath this node
    pub fn layouts(&self) -> Vec<&LayoutNode> {
        let mut layouts = Vec::new();
        if self.is_layout {
            layouts.push(self);
        }
        for child in &self.children {
            layouts.extend(child.layouts());
        }
        layouts
    }

    /// Look up an image of this layout by (possibly prefixed) manifest digest
    pub fn find_image(&self, manifest_digest: &str) -> Option<&ImageInfo> {
        let wanted = digest::bare(manifest_digest);
        self.images.iter().find(|info| info.reference.digest == wanted)
    }

    pub fn label(&self) -> String {
        let name = layout_name(&self.root_path);
        if self.is_layout {
            format!("{} ({} images)", name, self.images.len())
        } else {
            format!("{} ({} layouts)", name, self.layout_count)
        }
    }
}

/// Last path component, or the whole path when there is none (e.g. `.`)
pub fn layout_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// What a displayed tree node refers to
#[derive(Debug, Clone, Copy)]
pub enum TreeRef<'a> {
    Layout(&'a LayoutNode),
    Image(&'a ImageInfo),
    SubIndex(&'a SubIndexInfo),
}

impl TreeRef<'_> {
    pub fn label(&self) -> String {
        match self {
            TreeRef::Layout(node) => node.label(),
            TreeRef::Image(info) if info.error.is_some() => format!("{} (error)", info.display_label),
            TreeRef::Image(info) => info.display_label.clone(),
            TreeRef::SubIndex(info) => info.display_label.clone(),
        }
    }
}

/// Display tree built over a [`LayoutNode`]: layouts hold their images and
/// sub-indexes, images hold their referrers, sub-indexes hold the child
/// manifests that are also listed in the layout
#[derive(Debug, Clone)]
pub struct TreeNode<'a> {
    pub item: TreeRef<'a>,
    pub children: Vec<TreeNode<'a>>,
    pub highlighted: bool,
}

impl<'a> TreeNode<'a> {
    fn leaf(item: TreeRef<'a>) -> Self {
        TreeNode {
            item,
            children: Vec::new(),
            highlighted: false,
        }
    }

    pub fn from_layout(node: &'a LayoutNode) -> Self {
        let mut tree = TreeNode::leaf(TreeRef::Layout(node));

        if !node.is_layout {
            tree.children = node.children.iter().map(TreeNode::from_layout).collect();
            return tree;
        }

        for info in &node.images {
            let mut image = TreeNode::leaf(TreeRef::Image(info));
            image.children = info
                .referrers
                .iter()
                .filter_map(|r| node.find_image(&r.digest))
                .map(|referrer| TreeNode::leaf(TreeRef::Image(referrer)))
                .collect();
            tree.children.push(image);
        }

        for info in &node.sub_indexes {
            let mut sub_index = TreeNode::leaf(TreeRef::SubIndex(info));
            sub_index.children = info
                .manifests
                .iter()
                .filter_map(|d| node.find_image(d.digest()))
                .map(|child| TreeNode::leaf(TreeRef::Image(child)))
                .collect();
            tree.children.push(sub_index);
        }

        tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(digest: &str) -> Descriptor {
        serde_json::from_value(serde_json::json!({
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "digest": digest,
            "size": 100
        }))
        .unwrap()
    }

    fn image(root: &Path, tag: &str, digest: &str, layers: &[&str]) -> ImageInfo {
        let reference = ImageRef::new(root, Some(tag.to_string()), digest);
        let mut info = ImageInfo::new(reference, descriptor(digest));
        info.layer_digests = layers.iter().map(|l| l.to_string()).collect();
        info.display_label = format!("image \"{}\"", tag);
        info
    }

    #[test]
    fn test_usage_label() {
        let reference = ImageRef::new(Path::new("/srv/layouts/app"), Some("v1".into()), "sha256:abc");
        assert_eq!(reference.usage_label(), "app/v1");
        assert_eq!(reference.digest, "abc");
    }

    #[test]
    fn test_layout_counts_aggregate() {
        let root = Path::new("/forest");
        let mut top = LayoutNode::new_dir(root);
        let mut middle = LayoutNode::new_dir(&root.join("team"));
        middle.add_child(LayoutNode::new_layout(
            &root.join("team/a"),
            vec![image(&root.join("team/a"), "one", "sha256:m1", &["l1"])],
            vec![],
        ));
        middle.add_child(LayoutNode::new_layout(
            &root.join("team/b"),
            vec![
                image(&root.join("team/b"), "two", "sha256:m2", &["l1", "l2"]),
                image(&root.join("team/b"), "three", "sha256:m3", &["l3"]),
            ],
            vec![],
        ));
        top.add_child(middle);

        assert_eq!(top.layout_count, 2);
        assert_eq!(top.all_images().len(), 3);
        assert_eq!(top.layouts().len(), 2);
        assert_eq!(top.label(), "forest (2 layouts)");
        assert_eq!(top.children[0].children[1].label(), "b (2 images)");
    }

    #[test]
    fn test_tree_nests_referrers_under_subject() {
        let root = Path::new("/forest/app");
        let mut subject = image(root, "v1", "sha256:m1", &["l1"]);
        let referrer = image(root, "sig", "sha256:r1", &["s1"]);
        subject.referrers.push(referrer.reference.clone());
        let layout = LayoutNode::new_layout(root, vec![subject, referrer], vec![]);

        let tree = TreeNode::from_layout(&layout);
        assert_eq!(tree.children.len(), 2);
        assert_eq!(tree.children[0].children.len(), 1);
        assert_eq!(tree.children[0].children[0].item.label(), "image \"sig\"");
        assert!(tree.children[1].children.is_empty());
    }
}
