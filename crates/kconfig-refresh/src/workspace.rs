use std::collections::BTreeMap;
use std::fs;
use std::path::Component;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_build_dir() -> String {
    "build".into()
}

fn default_root_dir() -> String {
    ".".into()
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CleanMode {
    #[default]
    None,
    Build,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
    #[serde(default = "default_build_dir")]
    pub build_dir: String,
    #[serde(default)]
    pub paths: BTreeMap<String, String>,
    #[serde(default)]
    pub clean: CleanMode,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            build_dir: default_build_dir(),
            paths: BTreeMap::new(),
            clean: CleanMode::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub build_dir: PathBuf,
    pub named_dirs: BTreeMap<String, PathBuf>,
}

impl WorkspacePaths {
    // Resolve a user-configured path:
    // - `@alias/...` expands from `[workspace.paths.alias]`
    // - absolute paths are used as-is
    // - relative paths are rooted at workspace root
    pub fn resolve_config_path(&self, raw: &str) -> Result<PathBuf> {
        resolve_config_path(self, raw)
    }

    /// Scratch directory for one variant's working files.
    pub fn variant_dir(&self, variant: &str) -> PathBuf {
        self.build_dir.join(variant)
    }

    pub fn remove_dir_all(&self, dir: &Path) -> Result<()> {
        safe_remove_dir_all(&self.root, dir)
    }
}

pub fn load_paths(cfg: &WorkspaceConfig) -> Result<WorkspacePaths> {
    let cwd = std::env::current_dir().map_err(|e| Error::msg(format!("cwd error: {e}")))?;
    load_paths_from(&cwd, cfg)
}

pub fn load_paths_from(base: &Path, cfg: &WorkspaceConfig) -> Result<WorkspacePaths> {
    let root = resolve_user_path(base, &cfg.root_dir)?;
    let build_dir = resolve_user_dir(&root, &cfg.build_dir)?;
    let named_dirs = resolve_named_dirs(&root, &build_dir, &cfg.paths)?;
    Ok(WorkspacePaths {
        root,
        build_dir,
        named_dirs,
    })
}

pub fn init_dirs(paths: &WorkspacePaths, clean: CleanMode) -> Result<()> {
    if clean == CleanMode::Build {
        safe_remove_dir_all(&paths.root, &paths.build_dir)?;
    }
    fs::create_dir_all(&paths.build_dir).map_err(|e| {
        Error::msg(format!(
            "failed to create build_dir {}: {e}",
            paths.build_dir.display()
        ))
    })
}

fn resolve_user_dir(root: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::msg("empty workspace dir"));
    }
    if Path::new(p)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::msg(format!(
            "invalid workspace dir '{}' (contains '..')",
            p
        )));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { root.join(pb) })
}

fn resolve_user_path(base: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::msg("empty workspace path"));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { base.join(pb) })
}

fn resolve_named_dirs(
    root: &Path,
    build_dir: &Path,
    paths: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, PathBuf>> {
    let mut out = BTreeMap::<String, PathBuf>::new();
    out.insert("root".into(), root.to_path_buf());
    out.insert("build".into(), build_dir.to_path_buf());

    for (name, raw) in paths {
        let key = name.trim();
        if key.is_empty() {
            return Err(Error::msg("workspace.paths has an empty key"));
        }
        if !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::msg(format!(
                "workspace.paths key '{}' is invalid (allowed: a-zA-Z0-9_-)",
                key
            )));
        }
        if key == "root" || key == "build" {
            return Err(Error::msg(format!(
                "workspace.paths key '{}' is reserved",
                key
            )));
        }
        out.insert(key.to_string(), resolve_user_path(root, raw)?);
    }

    Ok(out)
}

fn safe_remove_dir_all(root: &Path, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let root_can = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let dir_can = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    if !dir_can.starts_with(&root_can) || dir_can == root_can {
        return Err(Error::msg(format!(
            "refusing to remove '{}' (not inside workspace root '{}')",
            dir_can.display(),
            root_can.display()
        )));
    }
    fs::remove_dir_all(&dir_can)
        .map_err(|e| Error::msg(format!("failed to remove dir {}: {e}", dir_can.display())))
}

fn resolve_config_path(ws: &WorkspacePaths, raw: &str) -> Result<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::msg("empty path"));
    }

    if let Some(after_at) = raw.strip_prefix('@') {
        let (alias, rest) = match after_at.split_once('/') {
            Some((a, r)) => (a.trim(), Some(r)),
            None => (after_at.trim(), None),
        };
        if alias.is_empty() {
            return Err(Error::msg(format!("invalid alias path '{}'", raw)));
        }
        let base = ws.named_dirs.get(alias).ok_or_else(|| {
            let known = ws.named_dirs.keys().cloned().collect::<Vec<_>>().join(", ");
            Error::msg(format!(
                "unknown workspace path alias '{}' in '{}' (known: {})",
                alias, raw, known
            ))
        })?;
        return Ok(match rest {
            Some(r) if !r.is_empty() => base.join(r),
            _ => base.to_path_buf(),
        });
    }

    let pb = PathBuf::from(raw);
    Ok(if pb.is_absolute() {
        pb
    } else {
        ws.root.join(pb)
    })
}
