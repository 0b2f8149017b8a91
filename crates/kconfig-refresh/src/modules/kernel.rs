use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::release::ReleaseDescriptor;
use crate::modules::util::{ensure_dir, read_text, write_text};
use crate::workspace::WorkspacePaths;

const STABLE_KERNEL_REPO: &str = "https://git.kernel.org/pub/scm/linux/kernel/git/stable/linux.git";

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CheckoutMode {
    /// Shallow clone of the resolved tag.
    #[default]
    Clone,
    /// Fresh repo, shallow pull of the resolved branch.
    Pull,
    /// Use whatever tree is already at `src_dir`.
    Existing,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub repo: String,
    pub src_dir: String,
    pub checkout: CheckoutMode,
    /// Remove `src_dir` before cloning or pulling.
    pub clean: bool,
    pub target: String,
    pub make: String,
    pub git: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            repo: STABLE_KERNEL_REPO.into(),
            src_dir: "@build/linux".into(),
            checkout: CheckoutMode::Clone,
            clean: false,
            target: "olddefconfig".into(),
            make: "make".into(),
            git: "git".into(),
        }
    }
}

/// The kernel tree's own config tooling: turn a raw config into one with every
/// dependent option resolved.
pub trait Normalizer {
    fn normalize(&self, ctx: &ExecCtx, tree: &Path, raw: &str) -> Result<String>;

    fn kernel_version(&self, ctx: &ExecCtx, tree: &Path) -> Result<String>;
}

/// Runs `make <target>` against `<tree>/.config`.
#[derive(Debug, Clone)]
pub struct MakeNormalizer {
    pub make: String,
    pub target: String,
}

impl MakeNormalizer {
    pub fn from_config(cfg: &KernelConfig) -> Self {
        Self {
            make: cfg.make.clone(),
            target: cfg.target.clone(),
        }
    }
}

impl Normalizer for MakeNormalizer {
    fn normalize(&self, ctx: &ExecCtx, tree: &Path, raw: &str) -> Result<String> {
        let dot_config = tree.join(".config");
        write_text(&dot_config, raw)?;

        let mut cmd = Command::new(&self.make);
        cmd.arg("-C").arg(tree).arg(&self.target);
        ctx.run_cmd(cmd)?;

        read_text(&dot_config)
    }

    fn kernel_version(&self, ctx: &ExecCtx, tree: &Path) -> Result<String> {
        let mut cmd = Command::new(&self.make);
        cmd.args(["-s", "--no-print-directory", "-C"])
            .arg(tree)
            .arg("kernelversion");
        let out = ctx.run_cmd_output(cmd)?;
        let version = out.lines().last().unwrap_or_default().trim().to_string();
        if version.is_empty() {
            return Err(Error::msg(format!(
                "make kernelversion printed nothing in {}",
                tree.display()
            )));
        }
        Ok(version)
    }
}

/// Make sure a kernel tree matching the release exists at `src_dir`.
pub fn prepare_checkout(
    cfg: &KernelConfig,
    release: Option<&ReleaseDescriptor>,
    ws: &WorkspacePaths,
    ctx: &ExecCtx,
) -> Result<PathBuf> {
    let src_dir = ws.resolve_config_path(&cfg.src_dir)?;
    ctx.log(&format!("kernel.src_dir = {}", src_dir.display()));

    match cfg.checkout {
        CheckoutMode::Existing => {
            if !src_dir.is_dir() {
                return Err(Error::msg(format!(
                    "kernel.checkout = \"existing\" but {} is not a directory",
                    src_dir.display()
                )));
            }
        }
        CheckoutMode::Clone => {
            let release = require_release(release)?;
            clear_old_tree(cfg, &src_dir, ws, ctx)?;
            ctx.log(&format!("cloning {} at {}", cfg.repo, release.version));
            let mut cmd = Command::new(&cfg.git);
            cmd.arg("clone")
                .arg("--depth=1")
                .arg(format!("--branch={}", release.version))
                .arg(&cfg.repo)
                .arg(&src_dir);
            ctx.run_cmd(cmd)?;
        }
        CheckoutMode::Pull => {
            let branch = require_release(release)?
                .branch_name
                .as_deref()
                .ok_or_else(|| {
                    Error::msg("kernel.checkout = \"pull\" needs release.mode = \"branch-scan\"")
                })?;
            clear_old_tree(cfg, &src_dir, ws, ctx)?;
            ctx.log(&format!("pulling {branch} from {}", cfg.repo));
            let mut init = Command::new(&cfg.git);
            init.arg("init").arg(&src_dir);
            ctx.run_cmd(init)?;

            let mut remote = Command::new(&cfg.git);
            remote
                .arg("-C")
                .arg(&src_dir)
                .args(["remote", "add", "origin"])
                .arg(&cfg.repo);
            ctx.run_cmd(remote)?;

            let mut pull = Command::new(&cfg.git);
            pull.arg("-C")
                .arg(&src_dir)
                .args(["pull", "--depth=1", "origin", branch]);
            ctx.run_cmd(pull)?;
        }
    }
    Ok(src_dir)
}

fn require_release(release: Option<&ReleaseDescriptor>) -> Result<&ReleaseDescriptor> {
    release.ok_or_else(|| {
        Error::msg("kernel.checkout needs a resolved release (release.mode is \"none\")")
    })
}

/// Clone and pull both need `src_dir` gone; only `kernel.clean` may remove it.
fn clear_old_tree(
    cfg: &KernelConfig,
    src_dir: &Path,
    ws: &WorkspacePaths,
    ctx: &ExecCtx,
) -> Result<()> {
    if src_dir.exists() {
        if !cfg.clean {
            return Err(Error::msg(format!(
                "{} already exists; set kernel.clean = true to replace it",
                src_dir.display()
            )));
        }
        ctx.log(&format!("removing old tree {}", src_dir.display()));
        ws.remove_dir_all(src_dir)?;
    }
    if let Some(parent) = src_dir.parent() {
        ensure_dir(parent)?;
    }
    Ok(())
}

/// Normalized config plus the tree it came from (needed later for `kernelversion`).
#[derive(Debug, Clone)]
pub struct Normalized {
    pub tree: PathBuf,
    pub text: String,
}

pub fn run(
    cfg: &KernelConfig,
    release: Option<&ReleaseDescriptor>,
    combined: &str,
    ws: &WorkspacePaths,
    normalizer: &dyn Normalizer,
    ctx: &ExecCtx,
) -> Result<Normalized> {
    let tree = prepare_checkout(cfg, release, ws, ctx)?;
    ctx.log(&format!("normalizing with `{} {}`", cfg.make, cfg.target));
    let text = normalizer.normalize(ctx, &tree, combined)?;
    Ok(Normalized { tree, text })
}
