//! Merge scripts from several named sources into one destination
//!
//! Copied scripts are renumbered after the destination's current maximum
//! version and tagged with their originating scope, both in the file name
//! and in a provenance comment at the top of the file.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, warn};

use crate::config::Numbering;
use crate::error::{Result, ScriptError};
use crate::identity::{validate_scope, IdentityParser};
use crate::registry::{Registry, ScriptDescriptor};

static ENCODING_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:#|--).*\b(?:en)?coding:\s*\S+").expect("valid encoding regex"));

/// Callbacks fired while copying
pub trait CopyObserver {
    /// `script` was not copied because the destination already has a script
    /// with that name coming from a different scope
    fn on_skip(&mut self, _scope: &str, _script: &ScriptDescriptor) {}

    /// `script` now lives at its new path; `old_path` is where it came from
    fn on_copy(&mut self, _scope: &str, _script: &ScriptDescriptor, _old_path: &Path) {}
}

impl CopyObserver for () {}

/// Comment prefix for a script extension
pub fn comment_prefix(extension: &str) -> &'static str {
    match extension {
        "rb" | "py" | "sh" | "toml" | "yml" | "yaml" => "#",
        _ => "--",
    }
}

/// Insert the provenance line into script content, keeping a leading
/// encoding declaration on the first line
pub fn with_provenance(content: &[u8], scope: &str, original_version: u64, extension: &str) -> Vec<u8> {
    let comment = format!(
        "{} This script comes from {} (originally {})\n",
        comment_prefix(extension),
        scope,
        original_version
    );

    let first_line_end = content.iter().position(|&b| b == b'\n');
    let first_line = String::from_utf8_lossy(&content[..first_line_end.unwrap_or(content.len())]);

    let mut out = Vec::with_capacity(content.len() + comment.len() + 1);
    if ENCODING_LINE.is_match(&first_line) {
        match first_line_end {
            Some(end) => {
                out.extend_from_slice(&content[..=end]);
                out.extend_from_slice(comment.as_bytes());
                out.extend_from_slice(&content[end + 1..]);
            }
            None => {
                out.extend_from_slice(content);
                out.push(b'\n');
                out.extend_from_slice(comment.as_bytes());
            }
        }
    } else {
        out.extend_from_slice(comment.as_bytes());
        out.extend_from_slice(content);
    }
    out
}

/// Copy every script from `sources` (in order) into `destination`.
///
/// Scripts whose canonical name already exists in the destination are
/// skipped; the observer hears about it when the existing script came from
/// another scope. Returns the newly copied descriptors.
pub fn copy(
    destination: &Path,
    sources: &[(String, PathBuf)],
    parser: &IdentityParser,
    numbering: Numbering,
    observer: &mut dyn CopyObserver,
) -> Result<Vec<ScriptDescriptor>> {
    for (scope, _) in sources {
        validate_scope(scope)?;
    }

    std::fs::create_dir_all(destination)
        .map_err(|e| ScriptError::io(format!("create {}", destination.display()), e))?;

    let mut existing = Registry::build(&[destination.to_path_buf()], parser)?;
    let mut last = existing.last().version;
    let mut copied = Vec::new();

    for (scope, path) in sources {
        let source_scripts = Registry::build(&[path.clone()], parser)?;

        for script in source_scripts.iter() {
            if let Some(duplicate) = existing.find_by_name(&script.name) {
                if duplicate.scope.as_deref() != Some(scope.as_str()) {
                    warn!(
                        name = %script.name,
                        scope = %scope,
                        existing_scope = ?duplicate.scope,
                        "skipping script, name already present"
                    );
                    observer.on_skip(scope, script);
                }
                continue;
            }

            let raw = std::fs::read(&script.path)
                .map_err(|e| ScriptError::io(format!("read {}", script.path.display()), e))?;
            let content = with_provenance(&raw, scope, script.version, parser.extension());

            let version = numbering.next_version(last)?;
            let new_path = destination.join(parser.file_name(version, &script.slug, Some(scope)));
            std::fs::write(&new_path, content)
                .map_err(|e| ScriptError::io(format!("write {}", new_path.display()), e))?;

            let renumbered = ScriptDescriptor {
                version,
                name: script.name.clone(),
                slug: script.slug.clone(),
                scope: Some(scope.clone()),
                path: new_path,
            };
            info!(
                "Copied {} from {} ({} -> {})",
                renumbered.name, scope, script.version, renumbered.version
            );

            last = version;
            observer.on_copy(scope, &renumbered, &script.path);
            existing.push(renumbered.clone());
            copied.push(renumbered);
        }
    }

    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        skipped: Vec<(String, String)>,
        copied: Vec<(String, u64, PathBuf)>,
    }

    impl CopyObserver for Recorder {
        fn on_skip(&mut self, scope: &str, script: &ScriptDescriptor) {
            self.skipped.push((scope.to_string(), script.name.clone()));
        }

        fn on_copy(&mut self, scope: &str, script: &ScriptDescriptor, old_path: &Path) {
            self.copied.push((scope.to_string(), script.version, old_path.to_path_buf()));
        }
    }

    #[test]
    fn provenance_goes_first_or_after_encoding_line() {
        let plain = with_provenance(b"UPDATE t SET x = 1;\n", "core", 3, "sql");
        assert_eq!(
            String::from_utf8(plain).unwrap(),
            "-- This script comes from core (originally 3)\nUPDATE t SET x = 1;\n"
        );

        let magic = with_provenance(b"# encoding: utf-8\nputs 1\n", "core", 3, "rb");
        assert_eq!(
            String::from_utf8(magic).unwrap(),
            "# encoding: utf-8\n# This script comes from core (originally 3)\nputs 1\n"
        );

        let single = with_provenance(b"-- coding: utf-8", "core", 3, "sql");
        assert_eq!(
            String::from_utf8(single).unwrap(),
            "-- coding: utf-8\n-- This script comes from core (originally 3)\n"
        );
    }

    #[test]
    fn copies_renumber_after_destination_and_skip_duplicates() {
        let dest = TempDir::new().unwrap();
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();

        std::fs::write(dest.path().join("5_existing.sql"), "SELECT 1;\n").unwrap();
        std::fs::write(first.path().join("20240101_add_users.sql"), "CREATE TABLE users (id INTEGER);\n").unwrap();
        std::fs::write(first.path().join("20240102_add_posts.sql"), "CREATE TABLE posts (id INTEGER);\n").unwrap();
        std::fs::write(second.path().join("1_add_users.sql"), "CREATE TABLE other (id INTEGER);\n").unwrap();

        let parser = IdentityParser::new("sql");
        let mut recorder = Recorder::default();
        let copied = copy(
            dest.path(),
            &[
                ("alpha".to_string(), first.path().to_path_buf()),
                ("beta".to_string(), second.path().to_path_buf()),
            ],
            &parser,
            Numbering::Sequential,
            &mut recorder,
        )
        .unwrap();

        let summary: Vec<(u64, &str)> = copied.iter().map(|s| (s.version, s.name.as_str())).collect();
        assert_eq!(summary, vec![(6, "AddUsers"), (7, "AddPosts")]);
        assert_eq!(recorder.skipped, vec![("beta".to_string(), "AddUsers".to_string())]);
        assert_eq!(recorder.copied.len(), 2);
        assert!(recorder.copied[0].2.ends_with("20240101_add_users.sql"));

        let merged = Registry::build(&[dest.path().to_path_buf()], &parser).unwrap();
        merged.validate().unwrap();
        let users = merged.find_by_name("AddUsers").unwrap();
        assert!(users.path.ends_with("6_add_users.alpha.sql"));
        assert_eq!(users.scope.as_deref(), Some("alpha"));
        let text = std::fs::read_to_string(&users.path).unwrap();
        assert!(text.starts_with("-- This script comes from alpha (originally 20240101)\n"));
        assert!(text.contains("CREATE TABLE users"));
    }

    #[test]
    fn same_scope_duplicates_are_silent() {
        let dest = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        std::fs::write(source.path().join("1_add_users.sql"), "SELECT 1;\n").unwrap();

        let parser = IdentityParser::new("sql");
        let sources = [("alpha".to_string(), source.path().to_path_buf())];
        let first = copy(dest.path(), &sources, &parser, Numbering::Sequential, &mut ()).unwrap();
        assert_eq!(first.len(), 1);

        let mut recorder = Recorder::default();
        let again = copy(dest.path(), &sources, &parser, Numbering::Sequential, &mut recorder).unwrap();
        assert!(again.is_empty());
        assert!(recorder.skipped.is_empty());
    }

    #[test]
    fn merge_after_max_version_fails_without_writing() {
        let dest = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        std::fs::write(dest.path().join(format!("{}_last.sql", u64::MAX)), "").unwrap();
        std::fs::write(source.path().join("1_add_users.sql"), "SELECT 1;\n").unwrap();

        let err = copy(
            dest.path(),
            &[("core".to_string(), source.path().to_path_buf())],
            &IdentityParser::new("sql"),
            Numbering::Sequential,
            &mut (),
        )
        .unwrap_err();
        assert!(matches!(err, ScriptError::VersionOverflow(u64::MAX)));
        assert!(!dest.path().join("0_add_users.core.sql").exists());
    }

    #[test]
    fn creates_missing_destination_and_rejects_bad_scopes() {
        let root = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        std::fs::write(source.path().join("1_a.sql"), "").unwrap();
        let dest = root.path().join("nested/dest");
        let parser = IdentityParser::new("sql");

        let copied = copy(
            &dest,
            &[("core".to_string(), source.path().to_path_buf())],
            &parser,
            Numbering::Sequential,
            &mut (),
        )
        .unwrap();
        assert_eq!(copied[0].version, 1);
        assert!(dest.join("1_a.core.sql").is_file());

        let err = copy(
            &dest,
            &[("Core".to_string(), source.path().to_path_buf())],
            &parser,
            Numbering::Sequential,
            &mut (),
        )
        .unwrap_err();
        assert!(matches!(err, ScriptError::IllegalScope(_)));
    }
}
