use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

/// Plug-in folders are shallow; anything deeper is not worth walking.
const MAX_SCAN_DEPTH: usize = 8;

/// Anything the supervisor can ask to refresh before a worker relaunch.
pub trait PluginCatalog: Send + Sync {
    /// Re-discovers plugins and returns how many were found.
    fn rescan(&self) -> Result<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginFormat {
    Clap,
    Vst3,
    AudioUnit,
    Vst2,
}

impl PluginFormat {
    pub fn label(self) -> &'static str {
        match self {
            PluginFormat::Clap => "CLAP",
            PluginFormat::Vst3 => "VST3",
            PluginFormat::AudioUnit => "AU",
            PluginFormat::Vst2 => "VST",
        }
    }

    fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        match ext.to_ascii_lowercase().as_str() {
            "clap" => Some(PluginFormat::Clap),
            "vst3" => Some(PluginFormat::Vst3),
            "component" => Some(PluginFormat::AudioUnit),
            "vst" => Some(PluginFormat::Vst2),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginDescriptor {
    pub name: String,
    pub format: PluginFormat,
    pub path: PathBuf,
    pub vendor: Option<String>,
}

impl PluginDescriptor {
    fn from_path(path: PathBuf, format: PluginFormat) -> Self {
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("Unknown Plugin")
            .to_string();
        let vendor = path
            .parent()
            .and_then(|parent| parent.file_name())
            .and_then(|name| name.to_str())
            .map(str::to_string);
        Self {
            name,
            format,
            vendor,
            path,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    plugins: Vec<PluginDescriptor>,
}

/// Persistent list of the plugins the sandbox workers may load.
///
/// The last scan is kept on disk so the server can fill the plugin list
/// panel on startup without touching the plugin folders.
#[derive(Debug)]
pub struct KnownPluginList {
    path: PathBuf,
    roots: Vec<PathBuf>,
    plugins: RwLock<Vec<PluginDescriptor>>,
}

impl KnownPluginList {
    /// Loads the cache at `path`. A missing file yields an empty list.
    pub fn load(path: PathBuf, roots: Vec<PathBuf>) -> Result<Self> {
        let plugins = read_cache(&path)?;
        tracing::debug!(path = %path.display(), count = plugins.len(), "loaded plugin cache");
        Ok(Self {
            path,
            roots,
            plugins: RwLock::new(plugins),
        })
    }

    pub fn plugins(&self) -> Vec<PluginDescriptor> {
        self.plugins.read().clone()
    }

    pub fn len(&self) -> usize {
        self.plugins.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.read().is_empty()
    }
}

impl PluginCatalog for KnownPluginList {
    fn rescan(&self) -> Result<usize> {
        let mut found = Vec::new();
        let mut seen = HashSet::new();
        for root in &self.roots {
            scan_root(root, &mut found, &mut seen);
        }
        found.sort_by(|a, b| {
            a.name
                .to_ascii_lowercase()
                .cmp(&b.name.to_ascii_lowercase())
                .then_with(|| a.format.label().cmp(b.format.label()))
        });
        let count = found.len();
        write_cache(&self.path, &found)?;
        *self.plugins.write() = found;
        tracing::info!(count, "plugin list rescanned");
        Ok(count)
    }
}

/// Symlinks are not followed, so links pointing back up the tree cannot
/// make the walk revisit a folder.
fn scan_root(root: &Path, found: &mut Vec<PluginDescriptor>, seen: &mut HashSet<PathBuf>) {
    if !root.exists() {
        return;
    }
    let mut walker = WalkDir::new(root).max_depth(MAX_SCAN_DEPTH).into_iter();
    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::debug!(root = %root.display(), %err, "skipping entry while scanning");
                continue;
            }
        };
        let Some(format) = PluginFormat::from_path(entry.path()) else {
            continue;
        };
        // Bundles are directories; never descend into them.
        if entry.file_type().is_dir() {
            walker.skip_current_dir();
        }
        let path = entry.into_path();
        if seen.insert(path.clone()) {
            found.push(PluginDescriptor::from_path(path, format));
        }
    }
}

fn read_cache(path: &Path) -> Result<Vec<PluginDescriptor>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read plugin cache at {}", path.display()))?;
    let file: CacheFile = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse plugin cache at {}", path.display()))?;
    Ok(file.plugins)
}

fn write_cache(path: &Path, plugins: &[PluginDescriptor]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create plugin cache directory at {}",
                parent.display()
            )
        })?;
    }
    let file = CacheFile {
        plugins: plugins.to_vec(),
    };
    let json = serde_json::to_string_pretty(&file).context("failed to serialize plugin cache")?;
    fs::write(path, json)
        .with_context(|| format!("failed to write plugin cache at {}", path.display()))?;
    Ok(())
}
