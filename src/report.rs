use comfy_table::{presets, CellAlignment, Table};
use oci_spec::image::{ImageConfiguration, MediaType};
use std::collections::BTreeMap;

use crate::digest;
use crate::knowledge::KnowledgeBase;
use crate::manifest::{self, blob_path};
use crate::tree::{layout_name, ImageInfo, LayoutNode, SubIndexInfo, TreeRef};

fn media_type_description(media_type: &MediaType) -> String {
    match media_type {
        MediaType::ImageLayer => "Tar Image Layer".to_string(),
        MediaType::ImageLayerGzip => "tgz Image Layer".to_string(),
        MediaType::ImageLayerZstd => "zstd Image Layer".to_string(),
        other => other.to_string(),
    }
}

/// RFC 822-ish rendering of an RFC 3339 timestamp, or the raw value
fn format_created(created: Option<&String>) -> String {
    match created {
        Some(ts) => chrono::DateTime::parse_from_rfc3339(ts)
            .map(|dt| dt.format("%d %b %y %H:%M %z").to_string())
            .unwrap_or_else(|_| ts.clone()),
        None => "-".to_string(),
    }
}

fn table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(presets::NOTHING).set_header(header.to_vec());
    table
}

fn format_command(args: Option<&Vec<String>>) -> String {
    format!("[{}]", args.map(|a| a.join(" ")).unwrap_or_default())
}

/// Human-readable description of one image
pub fn image_summary(info: &ImageInfo, knowledge: &KnowledgeBase) -> String {
    let layout_root = &info.reference.layout_root;
    let mut out = format!(
        "# {}:{}\nmanifest blob path: {}\n\n",
        layout_name(layout_root),
        info.display_name,
        blob_path(layout_root, info.descriptor.digest()).display()
    );
    out.push_str(&format!(
        "# ArtifactType: {}\n\n",
        info.artifact_type.as_deref().unwrap_or("unset")
    ));

    if let Some(err) = &info.error {
        out.push_str(&format!("ERROR reading image: {}\n\n", err));
    }

    if let Some(subject) = &info.subject {
        let target = info.reference.target.as_ref();
        out.push_str(&format!(
            "# Referrer Info:\nsubject hash: {}\nsubject name: {}\nsubject tag: {}\n\n",
            subject,
            target.map(|t| t.label.as_str()).unwrap_or("-"),
            target.and_then(|t| t.tag.as_deref()).unwrap_or("-")
        ));
    }

    if !info.referrers.is_empty() {
        out.push_str(&format!("# {} referrers\n", info.referrers.len()));
        for referrer in &info.referrers {
            out.push_str(&format!("{}\n", referrer.digest));
        }
        out.push('\n');
    }

    if let Some(image_manifest) = &info.manifest {
        let diff_ids: &[String] = info
            .config
            .as_ref()
            .map(|c| c.rootfs().diff_ids().as_slice())
            .unwrap_or(&[]);

        out.push_str(&format!(
            "# {} layers in manifest\n(note tar* fields refer to the uncompressed blob)\n",
            image_manifest.layers().len()
        ));
        let mut layers = table(&["blob sha", "tar sha", "names", "type", "sz (kb)", "tar sz (kb)"]);
        for (idx, layer) in image_manifest.layers().iter().enumerate() {
            let uncompressed = layer
                .annotations()
                .as_ref()
                .and_then(|a| a.get(manifest::ANNOTATION_UNCOMPRESSED_SIZE))
                .cloned()
                .unwrap_or_else(|| "missing".to_string());
            let diff_id = diff_ids
                .get(idx)
                .map(|d| digest::short(d).to_string())
                .unwrap_or_else(|| "-".to_string());
            layers.add_row(vec![
                digest::short(layer.digest()).to_string(),
                diff_id,
                knowledge.short_names_for(layer.digest()).join(","),
                media_type_description(layer.media_type()),
                (layer.size() / 1024).to_string(),
                uncompressed,
            ]);
        }
        if let Some(column) = layers.column_mut(4) {
            column.set_cell_alignment(CellAlignment::Right);
        }
        out.push_str(&layers.to_string());
        out.push('\n');

        if let Some(config) = &info.config {
            out.push_str(&history_section(info, config, knowledge));
        }
    }

    out.push_str("\n# Config\n");
    out.push_str(&config_section(info));
    out.push_str("\n\n# Annotations\n");
    if let Some(annotations) = info.manifest.as_ref().and_then(|m| m.annotations().as_ref()) {
        let sorted: BTreeMap<&String, &String> = annotations.iter().collect();
        for (key, value) in sorted {
            out.push_str(&format!("{}:\n{}\n\n", key, value));
        }
    }

    out
}

fn history_section(info: &ImageInfo, config: &ImageConfiguration, knowledge: &KnowledgeBase) -> String {
    let history = config.history();
    if history.is_empty() {
        return String::new();
    }

    let layers = info.manifest.as_ref().map(|m| m.layers().as_slice()).unwrap_or(&[]);
    let mut out = format!(
        "\n# {} entries in Runtime Config History:\n(note, some entries here do not correspond to blob layers)\n",
        history.len()
    );
    let mut rows = table(&["blob digest", "names", "type", "created", "blob size (kb)", "created by"]);

    let mut layer_idx = 0;
    for entry in history {
        let created = format_created(entry.created().as_ref());
        let created_by = entry.created_by().clone().unwrap_or_default();

        if entry.empty_layer().unwrap_or(false) {
            rows.add_row(vec![
                "empty".to_string(),
                "-".to_string(),
                "(cfg update)".to_string(),
                created,
                "-".to_string(),
                created_by,
            ]);
            continue;
        }

        match layers.get(layer_idx) {
            Some(layer) => rows.add_row(vec![
                digest::short(layer.digest()).to_string(),
                knowledge.names_for(layer.digest()).join(","),
                media_type_description(layer.media_type()),
                created,
                (layer.size() / 1024).to_string(),
                created_by,
            ]),
            None => rows.add_row(vec![
                "?".to_string(),
                "-".to_string(),
                "(no matching layer)".to_string(),
                created,
                "-".to_string(),
                created_by,
            ]),
        };
        layer_idx += 1;
    }

    out.push_str(&rows.to_string());
    out.push('\n');
    out
}

fn config_section(info: &ImageInfo) -> String {
    let media_type = match info.config_media_type.as_deref() {
        Some(media_type) => media_type,
        None => return "no config".to_string(),
    };

    if let Some(config) = &info.config {
        let (entrypoint, cmd) = match config.config() {
            Some(c) => (c.entrypoint().as_ref(), c.cmd().as_ref()),
            None => (None, None),
        };
        return format!("Entrypoint: {}\nCmd: {}", format_command(entrypoint), format_command(cmd));
    }

    match media_type {
        "application/vnd.oci.image.manifest.v1+json" => "got a manifest config media type, expected?".to_string(),
        manifest::MEDIA_TYPE_COSIGN_SIGNATURE => "cosign artifact signature".to_string(),
        manifest::MEDIA_TYPE_NOTARY_SIGNATURE => "Notary Signatures have empty Config".to_string(),
        manifest::MEDIA_TYPE_EMPTY => "No Config".to_string(),
        other => format!("parsing {:?} not yet supported", other),
    }
}

/// Human-readable description of a sub-index and the manifests it lists
pub fn sub_index_summary(info: &SubIndexInfo, layout: &LayoutNode) -> String {
    let mut out = format!(
        "# {}:{}\nsub-index with {} manifests\n",
        layout_name(&info.reference.layout_root),
        info.display_name,
        info.manifests.len()
    );
    if let Some(err) = &info.error {
        out.push_str(&format!("ERROR reading sub-index: {}\n", err));
    }
    for descriptor in &info.manifests {
        let label = layout
            .find_image(descriptor.digest())
            .map(|image| image.display_label.as_str())
            .unwrap_or("-");
        out.push_str(&format!("{} {}\n", digest::bare(descriptor.digest()), label));
    }
    out
}

/// Strings a search needle is matched against for a tree node
pub fn search_haystacks(item: TreeRef<'_>) -> Vec<String> {
    match item {
        TreeRef::Layout(node) => vec![node.root_path.display().to_string()],
        TreeRef::SubIndex(info) => info
            .manifests
            .iter()
            .map(|d| digest::bare(d.digest()).to_string())
            .collect(),
        TreeRef::Image(info) => {
            let mut haystacks = vec![
                info.descriptor.digest().to_string(),
                info.reference.layout_root.display().to_string(),
                info.reference.tag.clone().unwrap_or_default(),
                info.reference.digest.clone(),
                info.artifact_type.clone().unwrap_or_default(),
                info.subject.clone().unwrap_or_default(),
            ];
            if let Some(target) = &info.reference.target {
                haystacks.push(target.label.clone());
            }
            if let Some(config) = &info.config {
                let history: Vec<&str> = config
                    .history()
                    .iter()
                    .filter_map(|h| h.created_by().as_deref())
                    .collect();
                haystacks.push(history.join(" "));
                if let Some(c) = config.config() {
                    haystacks.push(format!(
                        "{} {}",
                        format_command(c.entrypoint().as_ref()),
                        format_command(c.cmd().as_ref())
                    ));
                }
            }
            if let Some(annotations) = info.manifest.as_ref().and_then(|m| m.annotations().as_ref()) {
                for (key, value) in annotations {
                    haystacks.push(format!("{} {}", key, value));
                }
            }
            haystacks.extend(info.layer_digests.iter().cloned());
            haystacks
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::tests::LayoutFixture;
    use crate::layout::{GraphBuilder, DEFAULT_MAX_DEPTH};
    use tempfile::TempDir;

    fn build(fixture: &LayoutFixture, kb: &mut KnowledgeBase) -> LayoutNode {
        GraphBuilder::new(kb, DEFAULT_MAX_DEPTH).load_layout(&fixture.root)
    }

    #[test]
    fn test_image_summary_sections() {
        let temp_dir = TempDir::new().unwrap();
        let mut fixture = LayoutFixture::new(temp_dir.path().join("app"));
        fixture.image("m1aaaaaaaa", Some("v1"), &["base000000", "top0000000"]);
        fixture.write_index();

        let mut kb = KnowledgeBase::new();
        kb.insert("base000000", "reg/base:1");
        let layout = build(&fixture, &mut kb);
        let text = image_summary(&layout.images[0], &kb);

        assert!(text.starts_with("# app:v1\n"));
        assert!(text.contains("blobs/sha256/m1aaaaaaaa"));
        assert!(text.contains("# ArtifactType: unset"));
        assert!(text.contains("# 2 layers in manifest"));
        assert!(text.contains("base000"));
        assert!(text.contains("reg/base:1"));
        assert!(text.contains("tgz Image Layer"));
        assert!(text.contains("missing"));
        assert!(text.contains("1 entries in Runtime Config History"));
        assert!(text.contains("ADD rootfs"));
        assert!(text.contains("Entrypoint: [/bin/sh]\nCmd: [-c true]"));
        assert!(!text.contains("ERROR"));
    }

    #[test]
    fn test_image_summary_shows_error_and_referrer() {
        let temp_dir = TempDir::new().unwrap();
        let mut fixture = LayoutFixture::new(temp_dir.path().join("app"));
        fixture.image("m1", Some("v1"), &["l1"]);
        fixture.image_with("r1", None, &["s1"], Some("m1"));
        fixture.entry("application/vnd.oci.image.manifest.v1+json", "gone", Some("gone"));
        fixture.write_index();

        let mut kb = KnowledgeBase::new();
        let layout = build(&fixture, &mut kb);

        let referrer = image_summary(layout.find_image("r1").unwrap(), &kb);
        assert!(referrer.contains("subject hash: m1"));
        assert!(referrer.contains("subject name: image \"v1\""));
        assert!(referrer.contains("subject tag: v1"));
        assert!(referrer.contains("# ArtifactType: application/vnd.example.signature"));

        let subject = image_summary(layout.find_image("m1").unwrap(), &kb);
        assert!(subject.contains("# 1 referrers\nr1\n"));

        let broken = image_summary(layout.find_image("gone").unwrap(), &kb);
        assert!(broken.contains("ERROR reading image"));
        assert!(broken.contains("no config"));
    }

    #[test]
    fn test_sub_index_summary_labels_known_children() {
        let temp_dir = TempDir::new().unwrap();
        let mut fixture = LayoutFixture::new(temp_dir.path().join("multi"));
        fixture.image("m1", Some("amd64"), &["l1"]);
        fixture.blob(
            "idx1",
            &serde_json::json!({
                "schemaVersion": 2,
                "manifests": [
                    {"mediaType": "application/vnd.oci.image.manifest.v1+json", "digest": "sha256:m1", "size": 10},
                    {"mediaType": "application/vnd.oci.image.manifest.v1+json", "digest": "sha256:m9", "size": 10}
                ]
            }),
        );
        fixture.entry("application/vnd.oci.image.index.v1+json", "idx1", None);
        fixture.write_index();

        let mut kb = KnowledgeBase::new();
        let layout = build(&fixture, &mut kb);
        let text = sub_index_summary(&layout.sub_indexes[0], &layout);

        assert!(text.starts_with("# multi:subindex 'idx1'\nsub-index with 2 manifests\n"));
        assert!(text.contains("m1 image \"amd64\""));
        assert!(text.contains("m9 -"));
    }

    #[test]
    fn test_search_haystacks_for_image() {
        let temp_dir = TempDir::new().unwrap();
        let mut fixture = LayoutFixture::new(temp_dir.path().join("app"));
        fixture.image("m1", Some("release"), &["l1", "l2"]);
        fixture.write_index();

        let mut kb = KnowledgeBase::new();
        let layout = build(&fixture, &mut kb);
        let haystacks = search_haystacks(TreeRef::Image(&layout.images[0]));

        assert!(haystacks.contains(&"sha256:m1".to_string()));
        assert!(haystacks.contains(&"release".to_string()));
        assert!(haystacks.contains(&"l2".to_string()));
        assert!(haystacks.iter().any(|h| h.contains("ADD rootfs")));
        assert!(haystacks.iter().any(|h| h.contains("/bin/sh")));
    }

    #[test]
    fn test_format_created() {
        assert_eq!(
            format_created(Some(&"2024-01-02T03:04:05Z".to_string())),
            "02 Jan 24 03:04 +0000"
        );
        assert_eq!(format_created(Some(&"yesterday".to_string())), "yesterday");
        assert_eq!(format_created(None), "-");
    }
}
