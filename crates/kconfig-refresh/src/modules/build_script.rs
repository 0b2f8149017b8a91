use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

static ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<lead>[ \t]*(?:export[ \t]+)?)(?P<key>[A-Za-z_][A-Za-z0-9_]*)=(?P<value>[^\r\n]*)(?P<eol>\r?\n?)$")
        .expect("assignment regex")
});

/// A shell script viewed as lines, some of which are `KEY=value` assignments.
/// Only assignment values are ever rewritten; every other byte is kept.
#[derive(Debug, Clone)]
pub struct BuildScript {
    lines: Vec<String>,
}

impl BuildScript {
    pub fn parse(text: &str) -> Self {
        Self {
            lines: text.split_inclusive('\n').map(str::to_owned).collect(),
        }
    }

    /// Current value of every assignment; later assignments of a key win, as in sh.
    pub fn assignments(&self) -> BTreeMap<String, String> {
        self.lines
            .iter()
            .filter_map(|line| ASSIGNMENT.captures(line))
            .map(|c| (c["key"].to_string(), c["value"].to_string()))
            .collect()
    }

    /// Replace the value of every assignment to `key`. Returns how many lines changed.
    pub fn set(&mut self, key: &str, value: &str) -> Result<usize> {
        if value.contains(['\n', '\r']) {
            return Err(Error::msg(format!(
                "value for {key} spans multiple lines"
            )));
        }
        let mut hits = 0usize;
        for line in &mut self.lines {
            let Some(c) = ASSIGNMENT.captures(line) else {
                continue;
            };
            if &c["key"] != key {
                continue;
            }
            let patched = format!("{}{}={}{}", &c["lead"], key, value, &c["eol"]);
            *line = patched;
            hits += 1;
        }
        if hits == 0 {
            return Err(Error::msg(format!(
                "build script has no assignment to {key}"
            )));
        }
        Ok(hits)
    }

    pub fn render(&self) -> String {
        self.lines.concat()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = "#!/bin/bash\n\
        # kernel versions\n\
        MAINLINE_KERNEL_VERSION=6.6.1\n\
        MAINLINE_KERNEL_SOURCE_URL=https://example.invalid/old.tar.xz\n\
        CHROMEOS_KERNEL_VERSION=5.10.100\n\
        CHROMEOS_KERNEL_SOURCE_URL=https://example.invalid/chromeos.tar.gz\n\
        \n\
        echo \"MAINLINE_KERNEL_VERSION=$MAINLINE_KERNEL_VERSION\"\n";

    #[test]
    fn set_changes_only_the_named_assignment() {
        let mut script = BuildScript::parse(SCRIPT);
        assert_eq!(script.set("MAINLINE_KERNEL_VERSION", "6.7.4").expect("set"), 1);
        let out = script.render();

        let before: Vec<&str> = SCRIPT.split_inclusive('\n').collect();
        let after: Vec<&str> = out.split_inclusive('\n').collect();
        assert_eq!(before.len(), after.len());
        for (i, (b, a)) in before.iter().zip(&after).enumerate() {
            if i == 2 {
                assert_eq!(*a, "MAINLINE_KERNEL_VERSION=6.7.4\n");
            } else {
                assert_eq!(a, b, "line {i} changed");
            }
        }
    }

    #[test]
    fn survives_inserted_lines() {
        let shifted = format!("# new header line\nset -e\n{SCRIPT}");
        let mut script = BuildScript::parse(&shifted);
        script
            .set("CHROMEOS_KERNEL_SOURCE_URL", "https://example.invalid/new.tar.gz")
            .expect("set");
        let vars = script.assignments();
        assert_eq!(
            vars.get("CHROMEOS_KERNEL_SOURCE_URL").map(String::as_str),
            Some("https://example.invalid/new.tar.gz")
        );
        assert_eq!(vars.get("CHROMEOS_KERNEL_VERSION").map(String::as_str), Some("5.10.100"));
        assert!(script.render().starts_with("# new header line\nset -e\n#!/bin/bash\n"));
    }

    #[test]
    fn keeps_export_prefix_indent_and_crlf() {
        let mut script = BuildScript::parse("  export KVER=1\r\nOTHER=x");
        script.set("KVER", "2").expect("set");
        script.set("OTHER", "y").expect("set");
        assert_eq!(script.render(), "  export KVER=2\r\nOTHER=y");
    }

    #[test]
    fn missing_key_is_an_error_and_leaves_script_untouched() {
        let mut script = BuildScript::parse(SCRIPT);
        let err = script.set("NOINITRAMFS_KERNEL_VERSION", "1").unwrap_err().to_string();
        assert!(err.contains("NOINITRAMFS_KERNEL_VERSION"), "{err}");
        assert_eq!(script.render(), SCRIPT);
    }

    #[test]
    fn does_not_touch_lines_that_merely_mention_the_key() {
        let mut script = BuildScript::parse(SCRIPT);
        script.set("MAINLINE_KERNEL_VERSION", "6.7.4").expect("set");
        assert!(script
            .render()
            .contains("echo \"MAINLINE_KERNEL_VERSION=$MAINLINE_KERNEL_VERSION\"\n"));
    }

    #[test]
    fn rejects_multiline_values() {
        let mut script = BuildScript::parse(SCRIPT);
        assert!(script.set("MAINLINE_KERNEL_VERSION", "6.7\nrm -rf /").is_err());
    }
}
