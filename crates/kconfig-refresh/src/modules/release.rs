use std::process::Command;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::fetch::Fetcher;

const KERNEL_ORG_RELEASES: &str = "https://www.kernel.org/releases.json";
const CHROMEOS_KERNEL_REPO: &str = "https://chromium.googlesource.com/chromiumos/third_party/kernel";
const CHROMEOS_ARCHIVE_TEMPLATE: &str =
    "https://chromium.googlesource.com/chromiumos/third_party/kernel.git/+archive/refs/heads/{branch}.tar.gz";

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseMode {
    /// Read the version from a releases JSON document.
    #[default]
    Metadata,
    /// Pick the highest-numbered release branch of a remote repository.
    BranchScan,
    /// No release lookup; the kernel checkout is used as it is.
    None,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReleaseConfig {
    pub mode: ReleaseMode,
    pub endpoint: String,
    pub version_field: String,
    pub source_field: Option<String>,
    pub tag_prefix: String,
    pub repo: String,
    pub branch_prefix: String,
    pub branch_suffix: String,
    pub source_url_template: String,
    /// git client used for `ls-remote`.
    pub git: String,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            mode: ReleaseMode::Metadata,
            endpoint: KERNEL_ORG_RELEASES.into(),
            version_field: "latest_stable.version".into(),
            source_field: None,
            tag_prefix: "v".into(),
            repo: CHROMEOS_KERNEL_REPO.into(),
            branch_prefix: "refs/heads/release-R".into(),
            branch_suffix: ".B-chromeos-5.10".into(),
            source_url_template: CHROMEOS_ARCHIVE_TEMPLATE.into(),
            git: "git".into(),
        }
    }
}

/// Which upstream kernel a run targets. Built once by the resolver, then only read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseDescriptor {
    pub version: String,
    pub source_url: Option<String>,
    pub branch_name: Option<String>,
}

impl ReleaseDescriptor {
    /// The version with the configured tag prefix removed (`v6.6.1` -> `6.6.1`).
    pub fn bare_version<'a>(&'a self, tag_prefix: &str) -> &'a str {
        self.version
            .strip_prefix(tag_prefix)
            .unwrap_or(&self.version)
    }
}

pub fn resolve(cfg: &ReleaseConfig, fetcher: &dyn Fetcher, ctx: &ExecCtx) -> Result<ReleaseDescriptor> {
    match cfg.mode {
        ReleaseMode::Metadata => {
            ctx.log(&format!("release.endpoint = {}", cfg.endpoint));
            let doc = fetcher.get_json(&cfg.endpoint)?;
            from_metadata(&doc, cfg)
        }
        ReleaseMode::BranchScan => {
            ctx.log(&format!("release.repo = {}", cfg.repo));
            let pattern = BranchPattern::new(&cfg.branch_prefix, &cfg.branch_suffix)?;
            let listing = ls_remote_heads(ctx, &cfg.git, &cfg.repo)?;
            let refs = parse_ls_remote(&listing);
            let (branch, ordinal) = select_latest_branch(&refs, &pattern).ok_or_else(|| {
                Error::msg(format!(
                    "no branch of {} matches '{}<N>...{}' ({} refs listed)",
                    cfg.repo,
                    cfg.branch_prefix,
                    cfg.branch_suffix,
                    refs.len()
                ))
            })?;
            ctx.log(&format!("latest release branch: {branch} (R{ordinal})"));
            Ok(ReleaseDescriptor {
                version: branch.clone(),
                source_url: Some(cfg.source_url_template.replace("{branch}", &branch)),
                branch_name: Some(branch),
            })
        }
        ReleaseMode::None => Err(Error::msg(
            "release.mode = \"none\" has no release to resolve",
        )),
    }
}

/// Build a descriptor from a releases document such as kernel.org's `releases.json`.
pub fn from_metadata(doc: &serde_json::Value, cfg: &ReleaseConfig) -> Result<ReleaseDescriptor> {
    let version = string_field(doc, &cfg.version_field)?;
    let source_url = cfg
        .source_field
        .as_deref()
        .map(|field| string_field(doc, field))
        .transpose()?;
    Ok(ReleaseDescriptor {
        version: format!("{}{}", cfg.tag_prefix, version),
        source_url,
        branch_name: None,
    })
}

/// Look up a dotted path (`releases.1.version`); numeric segments index arrays.
pub fn json_field<'a>(doc: &'a serde_json::Value, dotted: &str) -> Option<&'a serde_json::Value> {
    let pointer: String = dotted
        .split('.')
        .filter(|seg| !seg.is_empty())
        .map(|seg| format!("/{}", seg.replace('~', "~0").replace('/', "~1")))
        .collect();
    doc.pointer(&pointer)
}

fn string_field(doc: &serde_json::Value, dotted: &str) -> Result<String> {
    json_field(doc, dotted)
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| Error::msg(format!("release metadata has no string field '{dotted}'")))
}

fn ls_remote_heads(ctx: &ExecCtx, git: &str, repo: &str) -> Result<String> {
    let mut cmd = Command::new(git);
    cmd.arg("ls-remote").arg(repo).arg("refs/heads/*");
    ctx.run_cmd_output(cmd)
}

/// Ref names from `git ls-remote` output (`<sha>\t<ref>` per line).
pub fn parse_ls_remote(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_once('\t'))
        .map(|(_, name)| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Release branch naming convention: `<prefix><ordinal>...<suffix>`.
#[derive(Debug, Clone)]
pub struct BranchPattern {
    re: Regex,
}

impl BranchPattern {
    pub fn new(prefix: &str, suffix: &str) -> Result<Self> {
        let re = Regex::new(&format!(
            r"^{}(?P<ordinal>\d+).*{}$",
            regex::escape(prefix),
            regex::escape(suffix)
        ))
        .map_err(|e| Error::msg(format!("invalid branch pattern: {e}")))?;
        Ok(Self { re })
    }

    /// The release ordinal for a matching ref, `None` for anything else.
    pub fn ordinal(&self, ref_name: &str) -> Option<u64> {
        self.re
            .captures(ref_name)?
            .name("ordinal")?
            .as_str()
            .parse()
            .ok()
    }
}

/// Highest-ordinal matching branch, without the `refs/heads/` prefix.
/// Equal ordinals are broken by the lexicographically greatest name so the
/// result never depends on listing order.
pub fn select_latest_branch(refs: &[String], pattern: &BranchPattern) -> Option<(String, u64)> {
    refs.iter()
        .filter_map(|r| pattern.ordinal(r).map(|n| (n, r)))
        .max_by(|(na, ra), (nb, rb)| na.cmp(nb).then_with(|| ra.cmp(rb)))
        .map(|(n, r)| {
            let name = r.strip_prefix("refs/heads/").unwrap_or(r);
            (name.to_string(), n)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn releases_json() -> serde_json::Value {
        serde_json::json!({
            "latest_stable": { "version": "6.7.4" },
            "releases": [
                { "moniker": "mainline", "version": "6.8-rc3", "source": null },
                { "moniker": "stable", "version": "6.7.4",
                  "source": "https://cdn.kernel.org/pub/linux/kernel/v6.x/linux-6.7.4.tar.xz" }
            ]
        })
    }

    #[test]
    fn metadata_version_gets_tag_prefix() {
        let cfg = ReleaseConfig::default();
        let d = from_metadata(&releases_json(), &cfg).expect("descriptor");
        assert_eq!(d.version, "v6.7.4");
        assert_eq!(d.bare_version(&cfg.tag_prefix), "6.7.4");
        assert_eq!(d.source_url, None);
        assert_eq!(d.branch_name, None);
    }

    #[test]
    fn metadata_reads_indexed_fields() {
        let cfg = ReleaseConfig {
            version_field: "releases.1.version".into(),
            source_field: Some("releases.1.source".into()),
            ..ReleaseConfig::default()
        };
        let d = from_metadata(&releases_json(), &cfg).expect("descriptor");
        assert_eq!(d.version, "v6.7.4");
        assert_eq!(
            d.source_url.as_deref(),
            Some("https://cdn.kernel.org/pub/linux/kernel/v6.x/linux-6.7.4.tar.xz")
        );
    }

    #[test]
    fn metadata_missing_or_null_field_is_an_error() {
        let cfg = ReleaseConfig {
            version_field: "latest_mainline.version".into(),
            ..ReleaseConfig::default()
        };
        assert!(from_metadata(&releases_json(), &cfg).is_err());

        let cfg = ReleaseConfig {
            source_field: Some("releases.0.source".into()),
            ..ReleaseConfig::default()
        };
        let err = from_metadata(&releases_json(), &cfg).unwrap_err().to_string();
        assert!(err.contains("releases.0.source"), "{err}");
    }

    #[test]
    fn parses_ls_remote_listing() {
        let out = "abc123\trefs/heads/main\ndef456\trefs/heads/release-R96-14268.B-chromeos-5.10\n\nbogus line\n";
        assert_eq!(
            parse_ls_remote(out),
            vec![
                "refs/heads/main".to_string(),
                "refs/heads/release-R96-14268.B-chromeos-5.10".to_string()
            ]
        );
    }

    fn chromeos_pattern() -> BranchPattern {
        let cfg = ReleaseConfig::default();
        BranchPattern::new(&cfg.branch_prefix, &cfg.branch_suffix).expect("pattern")
    }

    #[test]
    fn branch_pattern_filters_prefix_and_suffix() {
        let p = chromeos_pattern();
        assert_eq!(p.ordinal("refs/heads/release-R96-14268.B-chromeos-5.10"), Some(96));
        assert_eq!(p.ordinal("refs/heads/release-R96-14268.B-chromeos-5.15"), None);
        assert_eq!(p.ordinal("refs/heads/stabilize-R96-14268.B-chromeos-5.10"), None);
        assert_eq!(p.ordinal("refs/heads/release-Rxx.B-chromeos-5.10"), None);
        // Regex metacharacters in the suffix are literal.
        assert_eq!(p.ordinal("refs/heads/release-R96-1.BXchromeos-5x10"), None);
    }

    #[test]
    fn selects_highest_ordinal_with_deterministic_tie_break() {
        let p = chromeos_pattern();
        let refs: Vec<String> = [
            "refs/heads/release-R12-1.B-chromeos-5.10",
            "refs/heads/release-R45-200.B-chromeos-5.10",
            "refs/heads/release-R7-3.B-chromeos-5.10",
            "refs/heads/release-R45-100.B-chromeos-5.10",
            "refs/heads/main",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let (name, n) = select_latest_branch(&refs, &p).expect("selected");
        assert_eq!(n, 45);
        assert_eq!(name, "release-R45-200.B-chromeos-5.10");

        let mut reversed = refs.clone();
        reversed.reverse();
        assert_eq!(select_latest_branch(&reversed, &p).map(|(b, _)| b), Some(name));
    }

    #[test]
    fn ordinals_compare_numerically() {
        let p = chromeos_pattern();
        let refs = vec![
            "refs/heads/release-R99-1.B-chromeos-5.10".to_string(),
            "refs/heads/release-R100-1.B-chromeos-5.10".to_string(),
        ];
        assert_eq!(select_latest_branch(&refs, &p).map(|(_, n)| n), Some(100));
    }

    #[test]
    fn no_matching_branch_selects_nothing() {
        let p = chromeos_pattern();
        assert!(select_latest_branch(&["refs/heads/main".to_string()], &p).is_none());
        assert!(select_latest_branch(&[], &p).is_none());
    }

    #[cfg(unix)]
    fn stub_git(dir: &std::path::Path, listing: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("git");
        let log = dir.join("git.log");
        std::fs::write(
            &path,
            format!(
                "#!/bin/sh\necho \"$@\" >> '{}'\nprintf '{}'\n",
                log.display(),
                listing
            ),
        )
        .expect("write stub");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        path.display().to_string()
    }

    #[cfg(unix)]
    #[test]
    fn branch_scan_lists_remote_heads_and_picks_newest() {
        use crate::executor::ChannelSink;
        use std::sync::{Arc, mpsc};

        let tmp = tempfile::tempdir().expect("tempdir");
        let listing = "a1\\trefs/heads/main\\n\
            b2\\trefs/heads/release-R96-14268.B-chromeos-5.10\\n\
            c3\\trefs/heads/release-R120-15662.B-chromeos-5.10\\n\
            d4\\trefs/heads/release-R121-15699.B-chromeos-5.15\\n";
        let cfg = ReleaseConfig {
            mode: ReleaseMode::BranchScan,
            repo: "https://git.test/kernel".into(),
            git: stub_git(tmp.path(), listing),
            ..ReleaseConfig::default()
        };
        struct NoNetwork;
        impl Fetcher for NoNetwork {
            fn get_text(&self, url: &str) -> Result<String> {
                Err(Error::msg(format!("unexpected GET {url}")))
            }
        }
        let (tx, _rx) = mpsc::channel();
        let ctx = ExecCtx::new(false, Arc::new(ChannelSink::new(tx)));

        let d = resolve(&cfg, &NoNetwork, &ctx).expect("resolve");
        assert_eq!(d.version, "release-R120-15662.B-chromeos-5.10");
        assert_eq!(d.branch_name.as_deref(), Some("release-R120-15662.B-chromeos-5.10"));
        assert_eq!(
            d.source_url.as_deref(),
            Some("https://chromium.googlesource.com/chromiumos/third_party/kernel.git/+archive/refs/heads/release-R120-15662.B-chromeos-5.10.tar.gz")
        );

        let calls = std::fs::read_to_string(tmp.path().join("git.log")).expect("git log");
        assert_eq!(calls, "ls-remote https://git.test/kernel refs/heads/*\n");
    }
}
