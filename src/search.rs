//! Narrowing the display tree to nodes that match a needle

use crate::report::search_haystacks;
use crate::tree::{TreeNode, TreeRef};

/// Check whether any of a node's haystacks contains `needle`
pub fn matches(item: TreeRef<'_>, needle: &str) -> bool {
    search_haystacks(item).iter().any(|haystack| haystack.contains(needle))
}

/// Keep matching nodes (with everything beneath them) and the ancestors
/// leading to them. Matching nodes come back highlighted.
pub fn filter<'a>(node: &TreeNode<'a>, needle: &str) -> Option<TreeNode<'a>> {
    if matches(node.item, needle) {
        let mut kept = node.clone();
        kept.highlighted = true;
        return Some(kept);
    }

    let children: Vec<TreeNode<'a>> = node
        .children
        .iter()
        .filter_map(|child| filter(child, needle))
        .collect();
    if children.is_empty() {
        return None;
    }

    Some(TreeNode {
        item: node.item,
        children,
        highlighted: false,
    })
}
