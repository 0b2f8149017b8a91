use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::fetch::{Fetcher, HttpConfig};
use crate::planner::Stage;
use crate::workspace::{WorkspaceConfig, WorkspacePaths};

pub mod artifacts;
pub mod assemble;
pub mod build_script;
pub mod kernel;
pub mod release;
pub mod util;

use artifacts::{ArtifactsConfig, BuildScriptConfig};
use assemble::{Assembled, BaselineConfig, OverlaysConfig};
use kernel::{CheckoutMode, KernelConfig, Normalized, Normalizer};
use release::{ReleaseConfig, ReleaseDescriptor, ReleaseMode};

const KNOWN_TABLES: &[&str] = &[
    "workspace",
    "http",
    "release",
    "baseline",
    "overlays",
    "kernel",
    "artifacts",
    "build_script",
];

/// A variant definition, deserialized and checked for combinations that can never run.
#[derive(Debug, Clone)]
pub struct Variant {
    pub name: String,
    pub workspace: WorkspaceConfig,
    pub http: HttpConfig,
    pub release: ReleaseConfig,
    pub baseline: BaselineConfig,
    pub overlays: OverlaysConfig,
    pub kernel: KernelConfig,
    pub artifacts: ArtifactsConfig,
    pub build_script: Option<BuildScriptConfig>,
}

impl Variant {
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        if let Some(tbl) = doc.value.as_table() {
            for key in tbl.keys() {
                if !KNOWN_TABLES.contains(&key.as_str()) {
                    return Err(Error::msg(format!(
                        "unknown key '{key}' in {} (expected one of: {})",
                        doc.path.display(),
                        KNOWN_TABLES.join(", ")
                    )));
                }
            }
        }

        let v = Variant {
            name: doc.variant_name(),
            workspace: doc.section("workspace")?,
            http: doc.section("http")?,
            release: doc.section("release")?,
            baseline: doc.section("baseline")?,
            overlays: doc.section("overlays")?,
            kernel: doc.section("kernel")?,
            artifacts: doc.section("artifacts")?,
            build_script: doc.deserialize_path("build_script")?,
        };
        v.validate().map_err(|e| e.context(doc.path.display()))?;
        Ok(v)
    }

    fn validate(&self) -> Result<()> {
        if self.baseline.path.trim().is_empty() {
            return Err(Error::msg("baseline.path is required"));
        }
        if self.artifacts.destinations.is_empty() {
            return Err(Error::msg("artifacts.destinations needs at least one path"));
        }
        match (self.release.mode, self.kernel.checkout) {
            (ReleaseMode::None, CheckoutMode::Clone | CheckoutMode::Pull) => {
                return Err(Error::msg(
                    "release.mode = \"none\" only works with kernel.checkout = \"existing\"",
                ));
            }
            (ReleaseMode::Metadata, CheckoutMode::Pull) => {
                return Err(Error::msg(
                    "kernel.checkout = \"pull\" needs release.mode = \"branch-scan\"",
                ));
            }
            _ => {}
        }
        if let Some(bs) = &self.build_script {
            if bs.path.trim().is_empty() {
                return Err(Error::msg("build_script.path is required"));
            }
            if bs.assignments.is_empty() {
                return Err(Error::msg("build_script.assignments is empty"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RunState {
    release: Option<ReleaseDescriptor>,
    assembled: Option<Assembled>,
    normalized: Option<Normalized>,
}

/// One variant's run: its collaborators plus what earlier stages produced.
pub struct Pipeline {
    variant: Variant,
    fetcher: Box<dyn Fetcher>,
    normalizer: Box<dyn Normalizer>,
    ws: Option<WorkspacePaths>,
    state: RunState,
}

impl Pipeline {
    pub fn new(variant: Variant, fetcher: Box<dyn Fetcher>, normalizer: Box<dyn Normalizer>) -> Self {
        Self {
            variant,
            fetcher,
            normalizer,
            ws: None,
            state: RunState::default(),
        }
    }

    fn workspace(&mut self) -> Result<WorkspacePaths> {
        if let Some(ws) = &self.ws {
            return Ok(ws.clone());
        }
        let ws = crate::workspace::load_paths(&self.variant.workspace)?;
        crate::workspace::init_dirs(&ws, self.variant.workspace.clean)?;
        self.ws = Some(ws.clone());
        Ok(ws)
    }

    pub fn resolve_release(&mut self, ctx: &ExecCtx) -> Result<ReleaseDescriptor> {
        let d = release::resolve(&self.variant.release, self.fetcher.as_ref(), ctx)?;
        ctx.log(&format!("release.version = {}", d.version));
        if let Some(url) = &d.source_url {
            ctx.log(&format!("release.source_url = {url}"));
        }
        self.state.release = Some(d.clone());
        Ok(d)
    }

    pub fn run_stage(&mut self, stage: Stage, ctx: &mut ExecCtx) -> Result<()> {
        let ws = self.workspace()?;
        let v = &self.variant;
        match stage {
            Stage::Resolve => {
                self.resolve_release(ctx)?;
            }
            Stage::Assemble => {
                let assembled = assemble::run(
                    &v.baseline,
                    &v.overlays,
                    &ws,
                    &v.name,
                    self.fetcher.as_ref(),
                    ctx,
                )?;
                self.state.assembled = Some(assembled);
            }
            Stage::Normalize => {
                let combined = self
                    .state
                    .assembled
                    .as_ref()
                    .ok_or_else(|| Error::msg("no assembled config (config.assemble did not run)"))?;
                let normalized = kernel::run(
                    &v.kernel,
                    self.state.release.as_ref(),
                    &combined.text,
                    &ws,
                    self.normalizer.as_ref(),
                    ctx,
                )?;
                self.state.normalized = Some(normalized);
            }
            Stage::Write => {
                let normalized = self.state.normalized.as_ref().ok_or_else(|| {
                    Error::msg("no normalized config (kernel.normalize did not run)")
                })?;
                let overlays = self
                    .state
                    .assembled
                    .as_ref()
                    .map(|a| a.overlays.as_slice())
                    .unwrap_or_default();
                let inputs = artifacts::WriteInputs {
                    variant: &v.name,
                    artifacts: &v.artifacts,
                    build_script: v.build_script.as_ref(),
                    release: self.state.release.as_ref(),
                    tag_prefix: &v.release.tag_prefix,
                    overlays,
                    normalized,
                };
                artifacts::run(&inputs, &ws, self.normalizer.as_ref(), ctx)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant(toml: &str) -> Result<Variant> {
        Variant::from_doc(&ConfigDoc::parse("mainline.toml", toml)?)
    }

    const MINIMAL: &str = r#"
[baseline]
path = "base.conf"

[artifacts]
destinations = ["out.conf"]
"#;

    #[test]
    fn minimal_variant_uses_defaults() {
        let v = variant(MINIMAL).expect("variant");
        assert_eq!(v.name, "mainline");
        assert_eq!(v.release.mode, ReleaseMode::Metadata);
        assert_eq!(v.kernel.target, "olddefconfig");
        assert_eq!(v.overlays.exclude, vec!["README.md"]);
        assert!(v.build_script.is_none());
    }

    #[test]
    fn rejects_unknown_tables() {
        let err = variant(&format!("{MINIMAL}\n[bootloader]\nkind = \"grub\"\n"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("bootloader"), "{err}");
    }

    #[test]
    fn rejects_missing_destinations() {
        let err = variant("[baseline]\npath = \"b\"\n").unwrap_err().to_string();
        assert!(err.contains("artifacts.destinations"), "{err}");
    }

    #[test]
    fn rejects_checkout_without_release() {
        let err = variant(&format!("{MINIMAL}\n[release]\nmode = \"none\"\n"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("existing"), "{err}");

        variant(&format!(
            "{MINIMAL}\n[release]\nmode = \"none\"\n[kernel]\ncheckout = \"existing\"\n"
        ))
        .expect("none + existing is fine");
    }

    #[test]
    fn rejects_pull_without_branch_scan() {
        let err = variant(&format!("{MINIMAL}\n[kernel]\ncheckout = \"pull\"\n"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("branch-scan"), "{err}");
    }

    #[test]
    fn rejects_unknown_enum_values() {
        assert!(variant(&format!("{MINIMAL}\n[release]\nmode = \"guess\"\n")).is_err());
    }
}
