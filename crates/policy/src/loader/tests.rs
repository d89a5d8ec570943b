//! Tests for the policy loader module.

use std::fs;

use tempfile::TempDir;
use tollgate_core::config::LoaderLimits;

use super::*;
use crate::error::{LoadError, PolicyError};

const VALID_POLICY_YAML: &str = r#"
name: egress
version: 1.0.0
rules:
  - name: allow-all
    actions:
      - type: allow
"#;

fn policy_yaml(name: &str) -> String {
    VALID_POLICY_YAML.replace("egress", name)
}

fn temp_loader() -> (TempDir, PolicyLoader) {
    let dir = TempDir::new().expect("create tempdir");
    (dir, PolicyLoader::yaml(LoaderLimits::default()))
}

#[test]
fn load_policy_from_file() {
    let (dir, loader) = temp_loader();
    let path = dir.path().join("egress.yaml");
    fs::write(&path, VALID_POLICY_YAML).unwrap();

    let policy = loader.load_file(&path).unwrap();
    assert_eq!(policy.name, "egress");
    assert_eq!(policy.rule_count(), 1);
    assert_eq!(
        policy.source(),
        Some(fs::canonicalize(&path).unwrap().as_path())
    );
}

#[test]
fn missing_file_is_not_found() {
    let (dir, loader) = temp_loader();
    let err = loader.load_file(&dir.path().join("nope.yaml")).unwrap_err();
    assert!(matches!(err, PolicyError::Load(LoadError::NotFound(_))));
}

#[test]
fn oversized_file_is_rejected_before_parsing() {
    let dir = TempDir::new().unwrap();
    let limits = LoaderLimits {
        max_file_size: 16,
        ..LoaderLimits::default()
    };
    let loader = PolicyLoader::yaml(limits);
    let path = dir.path().join("big.yaml");
    fs::write(&path, VALID_POLICY_YAML).unwrap();

    let err = loader.load_file(&path).unwrap_err();
    match err {
        PolicyError::Load(LoadError::TooLarge { size, max, .. }) => {
            assert_eq!(max, 16);
            assert!(size > 16);
        }
        other => panic!("expected TooLarge, got {other:?}"),
    }
}

#[test]
fn wrong_extension_is_rejected() {
    let (dir, loader) = temp_loader();
    let path = dir.path().join("egress.json");
    fs::write(&path, VALID_POLICY_YAML).unwrap();

    let err = loader.load_file(&path).unwrap_err();
    assert!(matches!(
        err,
        PolicyError::Load(LoadError::UnsupportedExtension(_))
    ));
}

#[test]
fn non_utf8_is_an_encoding_error() {
    let (dir, loader) = temp_loader();
    let path = dir.path().join("bin.yaml");
    fs::write(&path, [0x6e, 0x61, 0x6d, 0x65, 0x3a, 0xff, 0xfe]).unwrap();

    let err = loader.load_file(&path).unwrap_err();
    assert!(matches!(
        err,
        PolicyError::Load(LoadError::InvalidEncoding(_))
    ));
}

#[cfg(unix)]
#[test]
fn symlinks_rejected_when_disabled() {
    let dir = TempDir::new().unwrap();
    let real = dir.path().join("real.yaml");
    let link = dir.path().join("link.yaml");
    fs::write(&real, VALID_POLICY_YAML).unwrap();
    std::os::unix::fs::symlink(&real, &link).unwrap();

    let strict = PolicyLoader::yaml(LoaderLimits {
        follow_symlinks: false,
        ..LoaderLimits::default()
    });
    let err = strict.load_file(&link).unwrap_err();
    assert!(matches!(
        err,
        PolicyError::Load(LoadError::SymlinkRejected(_))
    ));

    // Followed by default, and the source is the resolved target.
    let policy = PolicyLoader::yaml(LoaderLimits::default())
        .load_file(&link)
        .unwrap();
    assert_eq!(
        policy.source(),
        Some(fs::canonicalize(&real).unwrap().as_path())
    );
}

#[test]
fn discover_skips_hidden_and_foreign_files() {
    let (dir, loader) = temp_loader();
    fs::write(dir.path().join("b.yaml"), policy_yaml("b")).unwrap();
    fs::write(dir.path().join("a.yml"), policy_yaml("a")).unwrap();
    fs::write(dir.path().join(".hidden.yaml"), policy_yaml("h")).unwrap();
    fs::write(dir.path().join("readme.txt"), "not a policy").unwrap();
    fs::create_dir(dir.path().join(".git")).unwrap();
    fs::write(dir.path().join(".git").join("c.yaml"), policy_yaml("c")).unwrap();
    fs::create_dir(dir.path().join("team")).unwrap();
    fs::write(dir.path().join("team").join("d.yaml"), policy_yaml("d")).unwrap();

    let found = loader.discover(dir.path()).unwrap();
    let names: Vec<_> = found
        .iter()
        .map(|p| p.strip_prefix(dir.path()).unwrap().to_path_buf())
        .collect();
    assert_eq!(
        names,
        vec![
            std::path::PathBuf::from("a.yml"),
            "b.yaml".into(),
            std::path::Path::new("team").join("d.yaml"),
        ]
    );
}

#[test]
fn load_directory_is_all_or_nothing() {
    let (dir, loader) = temp_loader();
    fs::write(dir.path().join("a.yaml"), policy_yaml("a")).unwrap();
    fs::write(dir.path().join("b.yaml"), "name: [broken").unwrap();
    fs::write(dir.path().join("c.yaml"), "name: c\nversion: 1.0.0\nbogus: 1\n").unwrap();

    let err = loader.load_directory(dir.path()).unwrap_err();
    let PolicyError::Multiple(multi) = err else {
        panic!("expected both failures to be reported");
    };
    assert_eq!(multi.len(), 2);
    let text = multi.to_string();
    assert!(text.contains("b.yaml"));
    assert!(text.contains("c.yaml"));
}

#[test]
fn load_directory_returns_every_policy() {
    let (dir, loader) = temp_loader();
    fs::write(dir.path().join("a.yaml"), policy_yaml("a")).unwrap();
    fs::write(dir.path().join("b.yaml"), policy_yaml("b")).unwrap();

    let policies = loader.load_directory(dir.path()).unwrap();
    let names: Vec<_> = policies.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b"]);
}

#[test]
fn empty_directory_has_no_policies() {
    let (dir, loader) = temp_loader();
    fs::write(dir.path().join("notes.md"), "nothing here").unwrap();

    let err = loader.load_directory(dir.path()).unwrap_err();
    assert!(matches!(err, PolicyError::Load(LoadError::NoPolicies(_))));
}

#[test]
fn load_path_handles_files_and_directories() {
    let (dir, loader) = temp_loader();
    let file = dir.path().join("a.yaml");
    fs::write(&file, policy_yaml("a")).unwrap();

    assert_eq!(loader.load_path(&file).unwrap().len(), 1);
    assert_eq!(loader.load_path(dir.path()).unwrap().len(), 1);
}
