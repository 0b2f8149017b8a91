use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p)
        .map_err(|e| Error::msg(format!("failed to create dir {}: {e}", p.display())))
}

pub fn read_text(p: &Path) -> Result<String> {
    fs::read_to_string(p).map_err(|e| Error::msg(format!("failed to read {}: {e}", p.display())))
}

pub fn write_text(p: &Path, s: &str) -> Result<()> {
    if let Some(parent) = p.parent() {
        ensure_dir(parent)?;
    }
    fs::write(p, s).map_err(|e| Error::msg(format!("failed to write {}: {e}", p.display())))
}

pub fn write_json_pretty(p: &Path, v: &serde_json::Value) -> Result<()> {
    let s = serde_json::to_string_pretty(v)
        .map_err(|e| Error::msg(format!("json encode error: {e}")))?;
    write_text(p, &s)
}

pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder regex"));

/// Substitute `{name}` placeholders in one pass. An unknown name, or a known one
/// with no value, is an error so a half-rendered line never reaches disk.
pub fn render_template(raw: &str, vars: &BTreeMap<&str, Option<String>>) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(raw) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = match vars.get(name.as_str()) {
            Some(Some(v)) => v,
            Some(None) => {
                return Err(Error::msg(format!(
                    "template '{raw}' uses {} but no value is available for this variant",
                    whole.as_str()
                )));
            }
            None => {
                let known: Vec<_> = vars.keys().copied().collect();
                return Err(Error::msg(format!(
                    "template '{raw}' uses unknown placeholder {} (known: {})",
                    whole.as_str(),
                    known.join(", ")
                )));
            }
        };
        out.push_str(&raw[last..whole.start()]);
        out.push_str(value);
        last = whole.end();
    }
    out.push_str(&raw[last..]);
    Ok(out)
}
