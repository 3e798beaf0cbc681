//! Known layer names: digest -> names observed for that layer
//!
//! Names come from two places: the persisted known-layers file written by
//! `ociv fetch`, and the tags of images found while walking layouts (an
//! image's tag names its top layer).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::digest;
use crate::summary::LayerAdjacency;

/// Marker returned for a digest nobody has named
pub const UNKNOWN: &str = "?";

/// One observed association between a layer digest and a `repo:tag` name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerNameEntry {
    #[serde(rename = "Hash", alias = "hash")]
    pub hash: String,

    #[serde(rename = "Name", alias = "name")]
    pub name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum KnowledgeError {
    #[error("failed to read known layers from {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed known layers file {}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no entries to save")]
    NoEntries,

    #[error("known layers filename is empty")]
    EmptyPath,

    #[error("failed to write known layers to {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Multi-map of bare layer digest -> names, in insertion order
#[derive(Debug, Default, Clone)]
pub struct KnowledgeBase {
    names: HashMap<String, Vec<String>>,
}

impl KnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = LayerNameEntry>) -> Self {
        let mut kb = Self::new();
        kb.extend(entries);
        kb
    }

    /// Load the persisted file. A missing file is an error here; see
    /// [`KnowledgeBase::load_or_empty`] for the forgiving variant.
    pub fn load(path: &Path) -> Result<Self, KnowledgeError> {
        Ok(Self::from_entries(load_entries(path)?))
    }

    /// Load the persisted file, degrading to an empty base when it does not exist
    pub fn load_or_empty(path: &Path) -> Result<Self, KnowledgeError> {
        match Self::load(path) {
            Ok(kb) => Ok(kb),
            Err(KnowledgeError::Read { path, source }) if source.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "no known layers file, layer names will be unknown");
                Ok(Self::new())
            }
            Err(err) => Err(err),
        }
    }

    /// Record `name` for `digest`. Repeating an existing name is a no-op.
    pub fn insert(&mut self, digest: &str, name: impl Into<String>) {
        let name = name.into();
        let names = self.names.entry(digest::bare(digest).to_string()).or_default();
        if !names.contains(&name) {
            names.push(name);
        }
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = LayerNameEntry>) {
        for entry in entries {
            self.insert(&entry.hash, entry.name);
        }
    }

    /// Number of distinct digests with at least one name
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Exact lookup. Never empty: unknown digests yield `["?"]`.
    pub fn names_for(&self, digest: &str) -> Vec<String> {
        match self.names.get(digest::bare(digest)) {
            Some(names) if !names.is_empty() => names.clone(),
            _ => vec![UNKNOWN.to_string()],
        }
    }

    /// [`short_names`] applied to [`KnowledgeBase::names_for`]
    pub fn short_names_for(&self, digest: &str) -> Vec<String> {
        short_names(&self.names_for(digest))
    }

    /// Resolve a display name for a digest that may be unnamed itself.
    ///
    /// Several names are returned unchanged; a single real name is returned
    /// with a trailing `*`. An unnamed digest with exactly one child in
    /// `adjacency` defers to that child, otherwise its unresolved names are
    /// returned.
    pub fn unique_descendant_names(&self, digest: &str, adjacency: &LayerAdjacency) -> Vec<String> {
        let mut current = digest::bare(digest);
        let mut visited = HashSet::new();

        loop {
            let names = self.names_for(current);
            if names.len() > 1 {
                return names;
            }
            if names[0] != UNKNOWN {
                return vec![format!("{}*", names[0])];
            }

            visited.insert(current);
            match adjacency.children(current) {
                [only] if !visited.contains(only.as_str()) => {
                    debug!(from = current, to = %only, "following unique descendant");
                    current = only.as_str();
                }
                _ => return names,
            }
        }
    }
}

/// Shorten a list of names by grouping those that share a tag.
///
/// `["a.com/x:v1", "a.com/y:v1"]` becomes `["{x,y}v1"]`. Names without a tag
/// are grouped under an empty tag. A single name is returned unchanged.
pub fn short_names(names: &[String]) -> Vec<String> {
    if names.len() == 1 {
        return names.to_vec();
    }

    let mut by_tag: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for name in names {
        let base = name.rsplit('/').next().unwrap_or(name);
        match base.split_once(':') {
            Some((image, tag)) => by_tag.entry(tag).or_default().push(image),
            None => by_tag.entry("").or_default().push(base),
        }
    }

    by_tag
        .into_iter()
        .map(|(tag, images)| format!("{{{}}}{}", images.join(","), tag))
        .collect()
}

/// Read the persisted entries, stripping any algorithm prefix from hashes
pub fn load_entries(path: &Path) -> Result<Vec<LayerNameEntry>, KnowledgeError> {
    if path.as_os_str().is_empty() {
        return Err(KnowledgeError::EmptyPath);
    }

    let bytes = fs::read(path).map_err(|source| KnowledgeError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let mut entries: Vec<LayerNameEntry> =
        serde_json::from_slice(&bytes).map_err(|source| KnowledgeError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;

    for entry in &mut entries {
        if entry.hash.contains(':') {
            entry.hash = digest::bare(&entry.hash).to_string();
        }
    }

    debug!(path = %path.display(), count = entries.len(), "loaded known layers");
    Ok(entries)
}

/// Overwrite `path` with `entries`, via a temporary file in the same directory
pub fn save_entries(path: &Path, entries: &[LayerNameEntry]) -> Result<(), KnowledgeError> {
    if entries.is_empty() {
        return Err(KnowledgeError::NoEntries);
    }
    if path.as_os_str().is_empty() {
        return Err(KnowledgeError::EmptyPath);
    }

    let write_err = |source: io::Error| KnowledgeError::Write {
        path: path.to_path_buf(),
        source,
    };

    let parent = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(write_err)?;

    let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(write_err)?;
    serde_json::to_writer(&mut temp, entries).map_err(|e| write_err(e.into()))?;
    temp.persist(path).map_err(|e| write_err(e.error))?;

    debug!(path = %path.display(), count = entries.len(), "saved known layers");
    Ok(())
}

/// Append `fresh` to `existing`, dropping exact duplicates
pub fn merge_entries(existing: Vec<LayerNameEntry>, fresh: Vec<LayerNameEntry>) -> Vec<LayerNameEntry> {
    let mut seen = HashSet::new();
    existing
        .into_iter()
        .chain(fresh)
        .filter(|entry| seen.insert((entry.hash.clone(), entry.name.clone())))
        .collect()
}

/// `~/.cache/ociv/known-layers.json`, using the invoking user's home under sudo
pub fn default_path() -> Option<PathBuf> {
    let home = sudo_user_home().or_else(dirs::home_dir)?;
    Some(home.join(".cache").join("ociv").join("known-layers.json"))
}

fn sudo_user_home() -> Option<PathBuf> {
    let user = std::env::var("SUDO_USER").ok().filter(|u| !u.is_empty())?;
    let home = Path::new("/home").join(user);
    home.is_dir().then_some(home)
}
