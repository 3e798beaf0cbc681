use owo_colors::OwoColorize;
use std::io::{self, Write};

use crate::theme::Theme;
use crate::tree::{TreeNode, TreeRef};

const COLOR_RESET: &str = "\x1b[0m";

pub struct RenderOptions {
    pub use_color: bool,
    pub icon_style: IconStyle,
    pub theme: Theme,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum IconStyle {
    None,
    Emoji,
    Nerd,
}

/// How a node is drawn, decided by its kind and position
#[derive(Clone, Copy)]
enum NodeKind {
    Layout,
    Image,
    Referrer,
    SubIndex,
    Error,
}

impl IconStyle {
    fn icon(&self, kind: NodeKind) -> &'static str {
        match (self, kind) {
            (IconStyle::None, _) => "",
            (IconStyle::Emoji, NodeKind::Layout) => "📁 ",
            (IconStyle::Emoji, NodeKind::Image) => "📦 ",
            (IconStyle::Emoji, NodeKind::Referrer) => "🔏 ",
            (IconStyle::Emoji, NodeKind::SubIndex) => "🗂️ ",
            (IconStyle::Emoji, NodeKind::Error) => "⚠️ ",
            (IconStyle::Nerd, NodeKind::Layout) => "\u{f115} ",   // nf-fa-folder_open_o
            (IconStyle::Nerd, NodeKind::Image) => "\u{f1b2} ",    // nf-fa-cube
            (IconStyle::Nerd, NodeKind::Referrer) => "\u{f0c1} ", // nf-fa-link
            (IconStyle::Nerd, NodeKind::SubIndex) => "\u{f1b3} ", // nf-fa-cubes
            (IconStyle::Nerd, NodeKind::Error) => "\u{f071} ",    // nf-fa-warning
        }
    }
}

fn node_kind(item: TreeRef<'_>, under_image: bool) -> NodeKind {
    match item {
        TreeRef::Layout(_) => NodeKind::Layout,
        TreeRef::Image(info) if info.error.is_some() => NodeKind::Error,
        TreeRef::Image(_) if under_image => NodeKind::Referrer,
        TreeRef::Image(_) => NodeKind::Image,
        TreeRef::SubIndex(info) if info.error.is_some() => NodeKind::Error,
        TreeRef::SubIndex(_) => NodeKind::SubIndex,
    }
}

fn kind_color(theme: &Theme, kind: NodeKind) -> &str {
    match kind {
        NodeKind::Layout => &theme.layout,
        NodeKind::Image => &theme.image,
        NodeKind::Referrer => &theme.referrer,
        NodeKind::SubIndex => &theme.sub_index,
        NodeKind::Error => &theme.error,
    }
}

/// Print each tree to stdout
pub fn render_forest(trees: &[TreeNode<'_>], options: &RenderOptions) -> io::Result<()> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    for tree in trees {
        render_to(&mut handle, tree, options)?;
    }
    handle.flush()
}

/// Root line, then its descendants with box-drawing branches
pub fn render_to<W: Write>(writer: &mut W, root: &TreeNode<'_>, options: &RenderOptions) -> io::Result<()> {
    write_label(writer, root, false, options)?;
    writeln!(writer)?;
    render_children(writer, root, "", options)
}

fn render_children<W: Write>(writer: &mut W, node: &TreeNode<'_>, prefix: &str, options: &RenderOptions) -> io::Result<()> {
    let under_image = matches!(node.item, TreeRef::Image(_));

    for (idx, child) in node.children.iter().enumerate() {
        let is_last = idx + 1 == node.children.len();
        let branch = if is_last { "└── " } else { "├── " };

        if options.use_color {
            write!(writer, "{}{}{}{}", options.theme.tree_chars, prefix, branch, COLOR_RESET)?;
        } else {
            write!(writer, "{}{}", prefix, branch)?;
        }

        write_label(writer, child, under_image, options)?;
        writeln!(writer)?;

        if !child.children.is_empty() {
            let new_prefix = if is_last {
                format!("{}    ", prefix)
            } else {
                format!("{}│   ", prefix)
            };
            render_children(writer, child, &new_prefix, options)?;
        }
    }

    Ok(())
}

fn write_label<W: Write>(writer: &mut W, node: &TreeNode<'_>, under_image: bool, options: &RenderOptions) -> io::Result<()> {
    let kind = node_kind(node.item, under_image);
    let icon = options.icon_style.icon(kind);
    let label = node.item.label();

    if !options.use_color {
        let marker = if node.highlighted { "* " } else { "" };
        return write!(writer, "{}{}{}", marker, icon, label);
    }

    let color = if node.highlighted {
        &options.theme.highlight
    } else {
        kind_color(&options.theme, kind)
    };
    write!(writer, "{}{}{}{}", color, icon, label, COLOR_RESET)
}

/// Emphasise section headers (`# ...`) and error lines of a text report
pub fn paint_report(text: &str, use_color: bool) -> String {
    if !use_color {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        if line.starts_with("# ") {
            out.push_str(&line.bold().to_string());
        } else if line.starts_with("ERROR") {
            out.push_str(&line.red().bold().to_string());
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::KnowledgeBase;
    use crate::layout::tests::LayoutFixture;
    use crate::layout::{GraphBuilder, DEFAULT_MAX_DEPTH};
    use crate::search;
    use tempfile::TempDir;

    fn plain() -> RenderOptions {
        RenderOptions {
            use_color: false,
            icon_style: IconStyle::None,
            theme: Theme::default(),
        }
    }

    fn render(tree: &TreeNode<'_>, options: &RenderOptions) -> String {
        let mut out = Vec::new();
        render_to(&mut out, tree, options).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_render_plain_tree() {
        let temp_dir = TempDir::new().unwrap();
        let mut layout = LayoutFixture::new(temp_dir.path().join("app"));
        layout.image("aaaa1111", Some("one"), &["l1"]);
        layout.image_with("bbbb2222", None, &["sig"], Some("aaaa1111"));
        layout.write_index();

        let mut kb = KnowledgeBase::new();
        let forest = GraphBuilder::new(&mut kb, DEFAULT_MAX_DEPTH).build(temp_dir.path()).unwrap();
        let text = render(&TreeNode::from_layout(&forest.children[0]), &plain());

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "app (2 images)");
        assert_eq!(lines[1], "├── image \"one\"");
        assert!(lines[2].starts_with("│   └── "));
        assert!(lines[3].starts_with("└── "));
    }

    #[test]
    fn test_highlight_marker_without_color() {
        let temp_dir = TempDir::new().unwrap();
        let mut layout = LayoutFixture::new(temp_dir.path().join("app"));
        layout.image("aaaa1111", Some("one"), &["l1"]);
        layout.image("cccc3333", Some("two"), &["l2"]);
        layout.write_index();

        let mut kb = KnowledgeBase::new();
        let forest = GraphBuilder::new(&mut kb, DEFAULT_MAX_DEPTH).build(temp_dir.path()).unwrap();
        let tree = TreeNode::from_layout(&forest.children[0]);
        let found = search::filter(&tree, "two").unwrap();

        let text = render(&found, &plain());
        assert!(text.contains("└── * image \"two\""));
        assert!(!text.contains("\"one\""));
    }

    #[test]
    fn test_colored_output_uses_theme() {
        let temp_dir = TempDir::new().unwrap();
        let mut layout = LayoutFixture::new(temp_dir.path().join("app"));
        layout.image("aaaa1111", Some("one"), &["l1"]);
        layout.write_index();

        let mut kb = KnowledgeBase::new();
        let forest = GraphBuilder::new(&mut kb, DEFAULT_MAX_DEPTH).build(temp_dir.path()).unwrap();
        let options = RenderOptions {
            use_color: true,
            icon_style: IconStyle::Emoji,
            theme: Theme::default(),
        };
        let text = render(&TreeNode::from_layout(&forest.children[0]), &options);

        assert!(text.contains(&format!("{}📦 image \"one\"{}", options.theme.image, COLOR_RESET)));
        assert!(text.starts_with(&options.theme.layout));
    }

    #[test]
    fn test_paint_report() {
        let text = "# header\nplain\nERROR: bad\n";
        assert_eq!(paint_report(text, false), text);

        let painted = paint_report(text, true);
        assert!(painted.contains("plain\n"));
        assert!(painted.contains("\x1b[1m# header"));
        assert_ne!(painted, text);
    }
}
