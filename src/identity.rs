//! Script identity parsing
//!
//! A script file is named `<version>_<name>[.<scope>].<ext>`, for example
//! `20240101_add_users.sql` or `3_backfill_totals.billing.sql`. The version
//! is a run of digits, the name and scope use lower case letters, digits and
//! `_` only.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

use crate::error::{Result, ScriptError};

static SCOPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9_]+$").expect("valid scope regex"));

/// Identity extracted from a script file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptIdentity {
    pub version: u64,
    /// Canonical upper-camel-case name, compared for duplicates
    pub name: String,
    /// Name part exactly as it appears in the file name
    pub slug: String,
    pub scope: Option<String>,
}

/// Matches script file names for one extension
#[derive(Debug, Clone)]
pub struct IdentityParser {
    extension: String,
    pattern: Regex,
}

impl IdentityParser {
    pub fn new(extension: &str) -> Self {
        let extension = extension.trim_start_matches('.').to_string();
        let pattern = Regex::new(&format!(
            r"^([0-9]+)_([a-z0-9_]*)\.?([a-z0-9_]*)?\.{}$",
            regex::escape(&extension)
        ))
        .expect("escaped extension always forms a valid regex");

        Self { extension, pattern }
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Whether a file looks like a script and must therefore parse.
    ///
    /// Mirrors the `[0-9]*_*.<ext>` scan filter: anything passing it that
    /// then fails [`IdentityParser::parse`] is a fatal naming error.
    pub fn is_candidate(&self, file_name: &str) -> bool {
        file_name.starts_with(|c: char| c.is_ascii_digit())
            && file_name.contains('_')
            && file_name
                .strip_suffix(self.extension.as_str())
                .is_some_and(|stem| stem.ends_with('.'))
    }

    /// Parse a file name (or a path, whose base name is used)
    pub fn parse(&self, identifier: &str) -> Result<ScriptIdentity> {
        let file_name = Path::new(identifier)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(identifier);

        let captures = self
            .pattern
            .captures(file_name)
            .ok_or_else(|| ScriptError::IllegalName(identifier.to_string()))?;

        let version = captures[1]
            .parse::<u64>()
            .map_err(|_| ScriptError::IllegalName(identifier.to_string()))?;
        let slug = captures[2].to_string();
        let scope = captures
            .get(3)
            .map(|m| m.as_str())
            .filter(|scope| !scope.is_empty())
            .map(str::to_string);

        Ok(ScriptIdentity {
            version,
            name: camelize(&slug),
            slug,
            scope,
        })
    }

    /// File name for a script identity
    pub fn file_name(&self, version: u64, slug: &str, scope: Option<&str>) -> String {
        match scope {
            Some(scope) => format!("{}_{}.{}.{}", version, slug, scope, self.extension),
            None => format!("{}_{}.{}", version, slug, self.extension),
        }
    }
}

/// Check a provenance scope tag
pub fn validate_scope(scope: &str) -> Result<()> {
    if SCOPE.is_match(scope) {
        Ok(())
    } else {
        Err(ScriptError::IllegalScope(scope.to_string()))
    }
}

/// `add_users` -> `AddUsers`
pub fn camelize(snake: &str) -> String {
    snake
        .split('_')
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect()
}

/// `AddUsers` -> `add_users`, `HTMLExport` -> `html_export`
pub fn underscore(camel: &str) -> String {
    let chars: Vec<char> = camel.chars().collect();
    let mut out = String::with_capacity(camel.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c == '-' || c == ' ' {
            out.push('_');
            continue;
        }
        if c.is_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_is_lower) {
                out.push('_');
            }
        }
        out.extend(c.to_lowercase());
    }

    out
}
