//! The bundled YAML specs parse and compile to scripts

use std::path::PathBuf;

use biomage_e2e::playwright::{PlaywrightConfig, PlaywrightHandle};
use biomage_e2e::TestSpec;

fn specs_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("specs")
}

#[test]
fn test_bundled_specs_load_sorted() {
    let specs = TestSpec::load_all(&specs_dir()).unwrap();
    let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["create-and-delete-project", "data-management-loads", "landing-page"]
    );

    let smoke = TestSpec::filter_by_tag(&specs, "smoke");
    assert_eq!(smoke.len(), 2);
    assert!(!specs[2].authenticated);
}

#[test]
fn test_bundled_specs_compile() {
    let handle = PlaywrightHandle::unchecked(PlaywrightConfig::default());
    for spec in TestSpec::load_all(&specs_dir()).unwrap() {
        let script = handle.build_script(&spec.steps).unwrap();
        assert!(script.contains("report('DONE'"), "{}", spec.name);
    }
}
