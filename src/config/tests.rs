use std::path::Path;

use super::*;

#[test]
fn test_defaults() {
    let config = CompilerConfig::default();
    assert_eq!(config.hardware.clusters, 8);
    assert_eq!(config.hardware.units, 8);
    assert_eq!(config.hardware.lanes, 2);
    assert_eq!(config.hardware.rf_size, 1024);
    assert_eq!(config.hardware.max_transfer_elements, 8192);
    assert_eq!(config.hardware.cluster_mask(), 0xff);
    assert!(config.pipeline.merge && config.pipeline.loops && config.pipeline.balance);
    assert!(!config.pipeline.balance_loads);
    assert_eq!(config.pipeline.min_loop_len, 5);
    assert_eq!(config.pipeline.block_split, 65535);
}

#[test]
fn test_full_mask_at_word_width() {
    let hw = HardwareConfig {
        units: 32,
        ..HardwareConfig::default()
    };
    assert_eq!(hw.unit_mask(), u32::MAX);
}

#[test]
fn test_parse_overrides() {
    let text = r#"
# accelerator with 4 clusters
[hardware]
clusters = 4
units = 2   # two units each

[pipeline]
loops = false
balance_loads = true
min_loop_len = 3
"#;
    let config = CompilerConfig::parse_toml(text, Path::new("vstream.toml")).unwrap();
    assert_eq!(config.hardware.clusters, 4);
    assert_eq!(config.hardware.units, 2);
    assert_eq!(config.hardware.lanes, 2);
    assert!(!config.pipeline.loops);
    assert!(config.pipeline.balance_loads);
    assert_eq!(config.pipeline.min_loop_len, 3);
}

#[test]
fn test_unknown_key_points_at_line() {
    let text = "[pipeline]\n  frobnicate = true\n";
    let err = CompilerConfig::parse_toml(text, Path::new("c.toml")).unwrap_err();
    assert!(err.message.contains("unknown key 'frobnicate'"));
    assert_eq!(&text[err.span.range()], "frobnicate = true");
}

#[test]
fn test_bad_boolean() {
    let text = "[pipeline]\nloops = maybe\n";
    let err = CompilerConfig::parse_toml(text, Path::new("c.toml")).unwrap_err();
    assert!(err.message.contains("invalid pipeline.loops"));
    assert_eq!(err.help.as_deref(), Some("expected true or false"));
}

#[test]
fn test_bad_number() {
    let text = "[hardware]\nclusters = -1\n";
    let err = CompilerConfig::parse_toml(text, Path::new("c.toml")).unwrap_err();
    assert!(err.message.contains("invalid hardware.clusters"));
    assert_eq!(err.notes.len(), 1);
}

#[test]
fn test_unknown_section_and_orphan_key() {
    assert!(CompilerConfig::parse_toml("[gpu]\n", Path::new("c.toml")).is_err());
    let err = CompilerConfig::parse_toml("loops = true\n", Path::new("c.toml")).unwrap_err();
    assert!(err.message.contains("outside of a section"));
}

#[test]
fn test_validation() {
    let err = CompilerConfig::parse_toml("[hardware]\nclusters = 33\n", Path::new("c.toml")).unwrap_err();
    assert!(err.message.contains("hardware.clusters"));
    assert!(CompilerConfig::parse_toml("[pipeline]\nmin_loop_len = 1\n", Path::new("c.toml")).is_err());
}

#[test]
fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vstream.toml");
    std::fs::write(&path, "[pipeline]\nsplit_stores = false\n").unwrap();
    let config = CompilerConfig::load(&path).unwrap();
    assert!(!config.pipeline.split_stores);
    assert_eq!(config.hardware, HardwareConfig::default());
}

#[test]
fn test_load_missing_file() {
    let err = CompilerConfig::load(Path::new("/nonexistent/vstream.toml")).unwrap_err();
    assert!(err.message.contains("cannot read config"));
    assert!(err.span.is_dummy());
}
