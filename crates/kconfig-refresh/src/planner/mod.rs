use crate::config::ConfigDoc;
use crate::error::Result;
use crate::modules::Variant;
use crate::modules::release::ReleaseMode;

/// The four pipeline stages, in the only order they ever run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Resolve,
    Assemble,
    Normalize,
    Write,
}

impl Stage {
    pub fn id(&self) -> &'static str {
        match self {
            Stage::Resolve => "release.resolve",
            Stage::Assemble => "config.assemble",
            Stage::Normalize => "kernel.normalize",
            Stage::Write => "artifacts.write",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Stage::Resolve => "Resolve upstream release",
            Stage::Assemble => "Assemble baseline + overlays",
            Stage::Normalize => "Normalize in kernel tree",
            Stage::Write => "Write configs and build script",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Plan {
    variant: String,
    stages: Vec<Stage>,
}

impl Plan {
    pub fn variant(&self) -> &str {
        &self.variant
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }
}

pub fn plan_variant(variant: &Variant) -> Plan {
    let mut stages = Vec::with_capacity(4);
    if variant.release.mode != ReleaseMode::None {
        stages.push(Stage::Resolve);
    }
    stages.extend([Stage::Assemble, Stage::Normalize, Stage::Write]);
    Plan {
        variant: variant.name.clone(),
        stages,
    }
}

/// Validate a loaded variant and lay out its stages.
pub fn plan(doc: &ConfigDoc) -> Result<(Variant, Plan)> {
    let variant = Variant::from_doc(doc)?;
    let plan = plan_variant(&variant);
    Ok((variant, plan))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "[baseline]\npath = \"b.conf\"\n[artifacts]\ndestinations = [\"o.conf\"]\n";

    fn ids(toml: &str) -> Vec<&'static str> {
        let doc = ConfigDoc::parse("chromeos.toml", toml).expect("parse");
        let (_, plan) = plan(&doc).expect("plan");
        assert_eq!(plan.variant(), "chromeos");
        plan.stages().iter().map(Stage::id).collect()
    }

    #[test]
    fn default_plan_runs_all_four_stages_in_order() {
        assert_eq!(
            ids(BASE),
            vec![
                "release.resolve",
                "config.assemble",
                "kernel.normalize",
                "artifacts.write"
            ]
        );
    }

    #[test]
    fn release_mode_none_skips_resolve() {
        let toml = format!("{BASE}[release]\nmode = \"none\"\n[kernel]\ncheckout = \"existing\"\n");
        assert_eq!(
            ids(&toml),
            vec!["config.assemble", "kernel.normalize", "artifacts.write"]
        );
    }

    #[test]
    fn invalid_variant_has_no_plan() {
        let doc = ConfigDoc::parse("x.toml", "[baseline]\npath = \"b\"\n").expect("parse");
        assert!(plan(&doc).is_err());
    }
}
