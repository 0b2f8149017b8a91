use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::build_script::BuildScript;
use crate::modules::kernel::{Normalized, Normalizer};
use crate::modules::release::ReleaseDescriptor;
use crate::modules::util::{read_text, render_template, sha256_hex, write_json_pretty, write_text};
use crate::workspace::WorkspacePaths;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ArtifactsConfig {
    pub destinations: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BuildScriptConfig {
    pub path: String,
    /// Assignment name -> value template (`{version_bare}`, `{source_url}`, ...).
    pub assignments: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct WrittenConfig {
    pub path: PathBuf,
    pub sha256: String,
}

pub fn write_destinations(
    cfg: &ArtifactsConfig,
    normalized: &str,
    ws: &WorkspacePaths,
    ctx: &ExecCtx,
) -> Result<Vec<WrittenConfig>> {
    if cfg.destinations.is_empty() {
        return Err(Error::msg("artifacts.destinations is empty"));
    }
    let sha256 = sha256_hex(normalized.as_bytes());
    let mut out = Vec::with_capacity(cfg.destinations.len());
    for dest in &cfg.destinations {
        let path = ws.resolve_config_path(dest)?;
        write_text(&path, normalized)?;
        ctx.log(&format!("wrote {}", path.display()));
        out.push(WrittenConfig {
            path,
            sha256: sha256.clone(),
        });
    }
    Ok(out)
}

/// Values a build script template may reference. `None` means the variant
/// cannot supply it.
pub struct TemplateVars<'a> {
    pub release: Option<&'a ReleaseDescriptor>,
    pub tag_prefix: &'a str,
    pub kernel_version: Option<String>,
}

impl TemplateVars<'_> {
    fn as_map(&self) -> BTreeMap<&'static str, Option<String>> {
        let mut vars = BTreeMap::new();
        vars.insert("version", self.release.map(|r| r.version.clone()));
        vars.insert(
            "version_bare",
            self.release
                .map(|r| r.bare_version(self.tag_prefix).to_string()),
        );
        vars.insert("source_url", self.release.and_then(|r| r.source_url.clone()));
        vars.insert("branch", self.release.and_then(|r| r.branch_name.clone()));
        vars.insert("kernel_version", self.kernel_version.clone());
        vars
    }
}

/// Set each configured assignment in the build script text, returning the new text.
pub fn patch_build_script(
    text: &str,
    assignments: &BTreeMap<String, String>,
    vars: &TemplateVars<'_>,
) -> Result<String> {
    let map = vars.as_map();
    let mut script = BuildScript::parse(text);
    let before = script.assignments();
    for (key, template) in assignments {
        let value = render_template(template, &map).map_err(|e| e.context(key))?;
        script.set(key, &value)?;
        tracing::debug!(%key, from = ?before.get(key), to = %value, "build script assignment");
    }
    Ok(script.render())
}

fn uses_kernel_version(cfg: &BuildScriptConfig) -> bool {
    cfg.assignments
        .values()
        .any(|t| t.contains("{kernel_version}"))
}

pub struct RunReport<'a> {
    pub variant: &'a str,
    pub release: Option<&'a ReleaseDescriptor>,
    pub overlays: &'a [String],
    pub written: &'a [WrittenConfig],
    pub build_script: Option<PathBuf>,
    pub kernel_version: Option<&'a str>,
}

pub fn write_report(ws: &WorkspacePaths, report: &RunReport<'_>) -> Result<PathBuf> {
    let path = ws.variant_dir(report.variant).join("report.json");
    let written: Vec<_> = report
        .written
        .iter()
        .map(|w| serde_json::json!({ "path": w.path, "sha256": w.sha256 }))
        .collect();
    let v = serde_json::json!({
        "variant": report.variant,
        "generated_at": chrono::Utc::now().to_rfc3339(),
        "release": report.release,
        "kernel_version": report.kernel_version,
        "overlays": report.overlays,
        "configs": written,
        "build_script": report.build_script,
    });
    write_json_pretty(&path, &v)?;
    Ok(path)
}

pub struct WriteInputs<'a> {
    pub variant: &'a str,
    pub artifacts: &'a ArtifactsConfig,
    pub build_script: Option<&'a BuildScriptConfig>,
    pub release: Option<&'a ReleaseDescriptor>,
    pub tag_prefix: &'a str,
    pub overlays: &'a [String],
    pub normalized: &'a Normalized,
}

pub fn run(
    inputs: &WriteInputs<'_>,
    ws: &WorkspacePaths,
    normalizer: &dyn Normalizer,
    ctx: &ExecCtx,
) -> Result<PathBuf> {
    let written = write_destinations(inputs.artifacts, &inputs.normalized.text, ws, ctx)?;

    let mut kernel_version = None;
    let mut script_path = None;
    if let Some(bs) = inputs.build_script {
        if uses_kernel_version(bs) {
            let v = normalizer.kernel_version(ctx, &inputs.normalized.tree)?;
            ctx.log(&format!("kernel version: {v}"));
            kernel_version = Some(v);
        }
        let path = ws.resolve_config_path(&bs.path)?;
        let vars = TemplateVars {
            release: inputs.release,
            tag_prefix: inputs.tag_prefix,
            kernel_version: kernel_version.clone(),
        };
        let patched = patch_build_script(&read_text(&path)?, &bs.assignments, &vars)
            .map_err(|e| e.context(path.display()))?;
        write_text(&path, &patched)?;
        for key in bs.assignments.keys() {
            ctx.log(&format!("updated {key} in {}", path.display()));
        }
        script_path = Some(path);
    }

    let report = write_report(
        ws,
        &RunReport {
            variant: inputs.variant,
            release: inputs.release,
            overlays: inputs.overlays,
            written: &written,
            build_script: script_path,
            kernel_version: kernel_version.as_deref(),
        },
    )?;
    ctx.log(&format!("report: {}", report.display()));
    Ok(report)
}
