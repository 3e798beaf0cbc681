//! Base-layer usage across the images of a layout forest

use comfy_table::{presets, Table};
use std::collections::{BTreeMap, HashMap};

use crate::digest;
use crate::knowledge::{self, KnowledgeBase, UNKNOWN};
use crate::tree::{ImageInfo, LayoutNode};

/// digest -> digests seen directly above it in some image, each edge once
#[derive(Debug, Default, Clone)]
pub struct LayerAdjacency {
    children: HashMap<String, Vec<String>>,
}

impl LayerAdjacency {
    pub fn add_edge(&mut self, from: &str, to: &str) {
        let children = self.children.entry(from.to_string()).or_default();
        if !children.iter().any(|c| c == to) {
            children.push(to.to_string());
        }
    }

    pub fn children(&self, digest: &str) -> &[String] {
        self.children.get(digest).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// One row of the base-layer table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseLayerRow {
    pub digest: String,
    pub names: Vec<String>,
    pub count: usize,
    pub users: Vec<String>,
}

#[derive(Debug, Default)]
pub struct BaseLayerSummary {
    /// Sorted by descending count, then ascending digest
    pub rows: Vec<BaseLayerRow>,
    /// Known names of internal layers -> images containing them
    pub internal_names: BTreeMap<String, Vec<String>>,
    pub adjacency: LayerAdjacency,
}

/// Compute base-layer usage for `images`. Images whose manifest did not
/// decode are left out.
pub fn summarize<'a>(images: impl IntoIterator<Item = &'a ImageInfo>, knowledge: &KnowledgeBase) -> BaseLayerSummary {
    let mut summary = BaseLayerSummary::default();
    let mut base_usage: HashMap<String, Vec<String>> = HashMap::new();

    for info in images.into_iter().filter(|info| info.is_usable()) {
        let label = info.reference.usage_label();
        let layers = &info.layer_digests;

        base_usage.entry(layers[0].clone()).or_default().push(label.clone());

        // the top layer is named by the image's tag, it is not internal
        for (idx, layer) in layers.iter().enumerate().take(layers.len() - 1) {
            summary.adjacency.add_edge(layer, &layers[idx + 1]);
            for name in knowledge.names_for(layer) {
                if name != UNKNOWN {
                    summary.internal_names.entry(name).or_default().push(label.clone());
                }
            }
        }
    }

    summary.rows = base_usage
        .into_iter()
        .map(|(base, users)| BaseLayerRow {
            names: knowledge::short_names(&knowledge.unique_descendant_names(&base, &summary.adjacency)),
            count: users.len(),
            users,
            digest: base,
        })
        .collect();
    summary
        .rows
        .sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.digest.cmp(&b.digest)));

    summary
}

/// The text report for one root of the forest
pub fn report(node: &LayoutNode, knowledge: &KnowledgeBase) -> String {
    let images = node.all_images();
    let summary = summarize(images.iter().copied(), knowledge);

    let mut out = format!(
        "{}: {} layouts, {} images\n\nbase image info:\n (base images marked with a * are not the first layer, just the first named layer)\n",
        node.root_path.display(),
        node.layout_count,
        images.len()
    );

    let mut table = Table::new();
    table
        .load_preset(presets::NOTHING)
        .set_header(vec!["digest7", "base layer names", "number of uses", "images using that base"]);
    for row in &summary.rows {
        table.add_row(vec![
            digest::short(&row.digest).to_string(),
            row.names.join(","),
            row.count.to_string(),
            row.users.join(", "),
        ]);
    }
    out.push_str(&table.to_string());

    if summary.internal_names.is_empty() {
        out.push_str("\n\nNo known layer tags detected in internal layers in images in this layout.\n");
    } else {
        out.push_str("\n\nAll known tags used internally in these images:\n");
        for (name, users) in &summary.internal_names {
            out.push_str(&format!("{} in {}\n\n", name, users.join(", ")));
        }
    }

    out
}
