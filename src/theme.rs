use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};

/// Color theme for the layout tree, each field an ANSI foreground sequence
#[derive(Debug, Clone, Deserialize)]
pub struct Theme {
    #[serde(default = "default_layout", deserialize_with = "deserialize_color")]
    pub layout: String,

    #[serde(default = "default_image", deserialize_with = "deserialize_color")]
    pub image: String,

    #[serde(default = "default_sub_index", deserialize_with = "deserialize_color")]
    pub sub_index: String,

    #[serde(default = "default_referrer", deserialize_with = "deserialize_color")]
    pub referrer: String,

    #[serde(default = "default_tree_chars", deserialize_with = "deserialize_color")]
    pub tree_chars: String,

    #[serde(default = "default_error", deserialize_with = "deserialize_color")]
    pub error: String,

    #[serde(default = "default_highlight", deserialize_with = "deserialize_color")]
    pub highlight: String,
}

/// Accepts `"#RRGGBB"`, `"RRGGBB"` or `[r, g, b]`
fn deserialize_color<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ColorValue {
        Hex(String),
        Rgb([u8; 3]),
    }

    match ColorValue::deserialize(deserializer)? {
        ColorValue::Hex(hex) => parse_hex(&hex).ok_or_else(|| D::Error::custom(format!("Invalid hex color: {}", hex))),
        ColorValue::Rgb([r, g, b]) => Ok(rgb_to_ansi(r, g, b)),
    }
}

fn parse_hex(hex: &str) -> Option<String> {
    let hex = hex.trim_start_matches('#');
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let channel = |range: std::ops::Range<usize>| u8::from_str_radix(&hex[range], 16).ok();
    Some(rgb_to_ansi(channel(0..2)?, channel(2..4)?, channel(4..6)?))
}

fn rgb_to_ansi(r: u8, g: u8, b: u8) -> String {
    format!("\x1b[38;2;{};{};{}m", r, g, b)
}

// Gruvbox Material Dark
fn default_layout() -> String {
    rgb_to_ansi(125, 174, 163) // #7daea3
}

fn default_image() -> String {
    rgb_to_ansi(169, 182, 101) // #a9b665
}

fn default_sub_index() -> String {
    rgb_to_ansi(137, 180, 130) // #89b482
}

fn default_referrer() -> String {
    rgb_to_ansi(211, 134, 155) // #d3869b
}

fn default_tree_chars() -> String {
    rgb_to_ansi(146, 131, 116) // #928374
}

fn default_error() -> String {
    rgb_to_ansi(234, 105, 98) // #ea6962
}

fn default_highlight() -> String {
    rgb_to_ansi(216, 166, 87) // #d8a657
}

impl Default for Theme {
    fn default() -> Self {
        Theme {
            layout: default_layout(),
            image: default_image(),
            sub_index: default_sub_index(),
            referrer: default_referrer(),
            tree_chars: default_tree_chars(),
            error: default_error(),
            highlight: default_highlight(),
        }
    }
}

impl Theme {
    /// Parse a theme from a JSON string; missing fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse theme JSON")
    }
}
