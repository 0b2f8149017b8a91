use std::path::{Path, PathBuf};

use serde::Deserialize;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::fetch::Fetcher;
use crate::modules::util::{read_text, write_text};
use crate::workspace::WorkspacePaths;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    /// Upstream config to download. Without it the file at `path` is used as-is.
    pub url: Option<String>,
    pub path: String,
}

fn default_exclude() -> Vec<String> {
    vec!["README.md".into()]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OverlaysConfig {
    pub dir: Option<String>,
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,
}

impl Default for OverlaysConfig {
    fn default() -> Self {
        Self {
            dir: None,
            exclude: default_exclude(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Overlay {
    pub name: String,
    pub text: String,
}

/// Baseline followed by overlays, plus which overlays went in (in order).
#[derive(Debug, Clone)]
pub struct Assembled {
    pub text: String,
    pub overlays: Vec<String>,
}

/// Regular files directly inside `dir`, sorted by name, minus excluded names.
pub fn list_overlays(dir: &Path, exclude: &[String]) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::msg(format!(
            "overlay dir {} does not exist",
            dir.display()
        )));
    }
    let mut out = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name()
    {
        let entry = entry
            .map_err(|e| Error::msg(format!("failed to list overlays in {}: {e}", dir.display())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if exclude.iter().any(|x| x == name.as_ref()) {
            tracing::debug!(overlay = %name, "excluded");
            continue;
        }
        out.push(entry.into_path());
    }
    Ok(out)
}

pub fn read_overlays(paths: &[PathBuf]) -> Result<Vec<Overlay>> {
    paths
        .iter()
        .map(|p| {
            Ok(Overlay {
                name: p
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                text: read_text(p)?,
            })
        })
        .collect()
}

/// Each overlay is appended after a single newline. Duplicate options are left
/// for the kernel's normalizer to settle.
pub fn merge(baseline: &str, overlays: &[Overlay]) -> Assembled {
    let extra: usize = overlays.iter().map(|o| o.text.len() + 1).sum();
    let mut text = String::with_capacity(baseline.len() + extra);
    text.push_str(baseline);
    for overlay in overlays {
        text.push('\n');
        text.push_str(&overlay.text);
    }
    Assembled {
        text,
        overlays: overlays.iter().map(|o| o.name.clone()).collect(),
    }
}

pub fn run(
    baseline: &BaselineConfig,
    overlays: &OverlaysConfig,
    ws: &WorkspacePaths,
    variant: &str,
    fetcher: &dyn Fetcher,
    ctx: &ExecCtx,
) -> Result<Assembled> {
    let baseline_path = ws.resolve_config_path(&baseline.path)?;
    if let Some(url) = baseline.url.as_deref() {
        ctx.log(&format!("downloading baseline {url}"));
        let body = fetcher.get_text(url)?;
        write_text(&baseline_path, &body)?;
    }
    ctx.log(&format!("baseline = {}", baseline_path.display()));
    let base_text = read_text(&baseline_path)?;

    let overlay_files = match overlays.dir.as_deref() {
        Some(dir) => list_overlays(&ws.resolve_config_path(dir)?, &overlays.exclude)?,
        None => Vec::new(),
    };
    let assembled = merge(&base_text, &read_overlays(&overlay_files)?);
    for name in &assembled.overlays {
        ctx.log(&format!("overlay: {name}"));
    }

    let combined = ws.variant_dir(variant).join("combined.conf");
    write_text(&combined, &assembled.text)?;
    ctx.log(&format!(
        "combined config: {} ({} overlays)",
        combined.display(),
        assembled.overlays.len()
    ));
    Ok(assembled)
}
