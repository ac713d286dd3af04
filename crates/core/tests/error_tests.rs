//! Tests for error types

use relay_core::{BuildConfig, BuildLabel, Error};
use std::path::Path;

#[test]
fn test_configuration_error() {
    let error = Error::configuration("config is invalid");
    assert_eq!(error.to_string(), "Configuration error: config is invalid");

    let error = Error::configuration(String::from("another config error"));
    assert_eq!(
        error.to_string(),
        "Configuration error: another config error"
    );
}

#[test]
fn test_invalid_label_error() {
    let error = Error::invalid_label("pkg:name", "must start with //");
    assert_eq!(
        error.to_string(),
        "Invalid build label 'pkg:name': must start with //"
    );
}

#[test]
fn test_label_parse_errors() {
    for bad in ["pkg:name", "//pkg", "//pkg:a/b", "///pkg:a"] {
        let err = bad.parse::<BuildLabel>().unwrap_err();
        assert!(matches!(err, Error::InvalidLabel { .. }), "{bad}: {err}");
    }
}

#[test]
fn test_missing_dependency_error() {
    let error = Error::missing_dependency(
        &BuildLabel::new("package", "a"),
        &BuildLabel::new("other", "b"),
    );
    assert_eq!(
        error.to_string(),
        "Target //package:a depends on //other:b, which is not in the build graph"
    );
}

#[test]
fn test_io_error() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
    let error = Error::io(io, Path::new("/repo/relay.json"), "read");
    assert_eq!(error.to_string(), "I/O read failed: /repo/relay.json");
}

#[test]
fn test_config_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.json");
    std::fs::write(&path, r#"{"repo_root": "/repo", "os": "freebsd"}"#).unwrap();

    let config = BuildConfig::load(&path).unwrap();
    assert_eq!(config.repo_root, Path::new("/repo"));
    assert_eq!(config.os, "freebsd");
    assert!(!config.path.is_empty());

    let err = BuildConfig::load(dir.path().join("missing.json")).unwrap_err();
    assert!(matches!(err, Error::Io { .. }));

    std::fs::write(&path, "not json").unwrap();
    let err = BuildConfig::load(&path).unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
}
