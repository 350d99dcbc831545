//! Screenshots, video frames and result files

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use webprobe_common::HarnessResult;

/// Lowercase file-name-safe form of a title
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut dash = false;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            dash = false;
        } else if !dash && !slug.is_empty() {
            slug.push('-');
            dash = true;
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug.chars().take(80).collect()
    }
}

fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write a PNG as `<dir>/<slug>-<hash12>.png`
///
/// The hash suffix keeps repeated captures under one name apart.
pub fn write_screenshot(dir: &Path, name: &str, png: &[u8]) -> HarnessResult<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let hash = content_hash(png);
    let path = dir.join(format!("{}-{}.png", slugify(name), &hash[..12]));
    std::fs::write(&path, png)?;
    debug!("Screenshot saved: {}", path.display());
    Ok(path)
}

/// Write frame `index` of a scenario recording as `<dir>/<slug>/NNNN.png`
pub fn write_frame(dir: &Path, slug: &str, index: usize, png: &[u8]) -> HarnessResult<PathBuf> {
    let dir = dir.join(slug);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{:04}.png", index));
    std::fs::write(&path, png)?;
    Ok(path)
}

/// Write results as pretty JSON to `<dir>/results.json`
pub fn write_results<T: Serialize>(dir: &Path, results: &T) -> HarnessResult<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join("results.json");
    let json = serde_json::to_string_pretty(results)?;
    std::fs::write(&path, json)?;
    info!("Results written to {}", path.display());
    Ok(path)
}
