use std::path::PathBuf;

use kconfig_refresh::modules::kernel::CheckoutMode;
use kconfig_refresh::modules::release::ReleaseMode;

fn variant_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../configs/variants")
        .join(format!("{name}.toml"))
}

fn plan_ids(name: &str) -> Vec<&'static str> {
    let doc = kconfig_refresh::config::load(&variant_path(name)).expect("load variant");
    let (_, plan) = kconfig_refresh::planner::plan(&doc).expect("plan");
    assert_eq!(plan.variant(), name);
    plan.stages().iter().map(|s| s.id()).collect()
}

#[test]
fn every_shipped_variant_plans() {
    for name in ["mainline", "chromeos", "stable", "testing"] {
        assert_eq!(
            plan_ids(name),
            vec![
                "release.resolve",
                "config.assemble",
                "kernel.normalize",
                "artifacts.write"
            ],
            "{name}"
        );
    }
    assert_eq!(
        plan_ids("noinitramfs"),
        vec!["config.assemble", "kernel.normalize", "artifacts.write"]
    );
}

#[test]
fn variants_inherit_common_settings() {
    let doc = kconfig_refresh::config::load(&variant_path("chromeos")).expect("load");
    let (variant, _) = kconfig_refresh::planner::plan(&doc).expect("plan");

    assert_eq!(variant.http.timeout_secs, 60);
    assert_eq!(variant.kernel.target, "olddefconfig");
    assert_eq!(
        variant.workspace.paths.get("configs").map(String::as_str),
        Some("kernel-configs")
    );
    assert_eq!(variant.release.mode, ReleaseMode::BranchScan);
    assert_eq!(variant.kernel.checkout, CheckoutMode::Pull);
    let script = variant.build_script.expect("build_script");
    assert_eq!(
        script.assignments.get("CHROMEOS_KERNEL_VERSION").map(String::as_str),
        Some("{kernel_version}")
    );
}

#[test]
fn mainline_reads_source_from_second_release() {
    let doc = kconfig_refresh::config::load(&variant_path("mainline")).expect("load");
    let (variant, _) = kconfig_refresh::planner::plan(&doc).expect("plan");

    let releases = serde_json::json!({
        "latest_stable": { "version": "6.7.4" },
        "releases": [
            { "version": "6.8-rc3", "source": "https://cdn.test/linux-6.8-rc3.tar.gz" },
            { "version": "6.7.4", "source": "https://cdn.test/linux-6.7.4.tar.xz" }
        ]
    });
    let d = kconfig_refresh::modules::release::from_metadata(&releases, &variant.release)
        .expect("descriptor");
    assert_eq!(d.version, "v6.7.4");
    assert_eq!(d.bare_version(&variant.release.tag_prefix), "6.7.4");
    assert_eq!(
        d.source_url.as_deref(),
        Some("https://cdn.test/linux-6.7.4.tar.xz")
    );
}
