//! Error taxonomy and operator-facing error reports
//!
//! Every failure the sequencer can raise is a [`ScriptError`]. The CLI wraps
//! them in an [`EnhancedError`] that adds context lines and remedial
//! suggestions before printing the full error chain.

use std::path::PathBuf;
use std::time::Duration;

use crate::script::RunDirection;

/// Result alias used throughout the library
pub type Result<T, E = ScriptError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("Illegal name for script file: {0}\n\t(only lower case letters, numbers, and '_' allowed)")]
    IllegalName(String),

    #[error("Illegal scope `{0}` (only lower case letters, numbers, and '_' allowed)")]
    IllegalScope(String),

    #[error("Multiple scripts have the name {0}")]
    DuplicateName(String),

    #[error("Multiple scripts have the version number {0}")]
    DuplicateVersion(u64),

    #[error("No script with version number {0}")]
    UnknownVersion(u64),

    #[error("No version number follows {0}; give the highest script a smaller version")]
    VersionOverflow(u64),

    #[error(
        "`{operation}` looks like a schema change.\n\
         Schema changes should be performed inside a sequenced script, not issued ad hoc."
    )]
    ExplicitChangeNotPermitted { operation: String },

    #[error("Post deploy scripts are pending. To resolve this issue, run:\n\n\tdeploy-scripts migrate")]
    PendingScripts,

    #[error("operation `{0}` is not supported by this execution target")]
    UnsupportedOperation(String),

    #[error("operation `{operation}` expects {expected} argument(s), got {got}")]
    InvalidArguments {
        operation: String,
        expected: String,
        got: usize,
    },

    #[error("invalid script {}: {reason}", .path.display())]
    InvalidScript { path: PathBuf, reason: String },

    #[error("no script body is registered for {name} ({version})")]
    MissingScript { name: String, version: u64 },

    #[error(
        "{name} ({version}) failed to {direction} after {:.4}s{}",
        .elapsed.as_secs_f64(),
        rollback_note(.rolled_back)
    )]
    Execution {
        version: u64,
        name: String,
        direction: RunDirection,
        elapsed: Duration,
        rolled_back: bool,
        #[source]
        source: Box<ScriptError>,
    },

    #[error(
        "An error has occurred{}, {name} ({version}) did not complete",
        cancel_note(.rolled_back, ", this script was canceled")
    )]
    ScriptFailed {
        version: u64,
        name: String,
        rolled_back: bool,
        #[source]
        source: Box<ScriptError>,
    },

    #[error(
        "An error has occurred, {}all later scripts canceled (failed at {name} ({version}), skipped {skipped:?})",
        cancel_note(.rolled_back, "this and ")
    )]
    BatchHalted {
        version: u64,
        name: String,
        rolled_back: bool,
        skipped: Vec<u64>,
        #[source]
        source: Box<ScriptError>,
    },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn rollback_note(rolled_back: &bool) -> &'static str {
    cancel_note(rolled_back, " (changes rolled back)")
}

fn cancel_note(rolled_back: &bool, note: &'static str) -> &'static str {
    if *rolled_back {
        note
    } else {
        ""
    }
}

impl ScriptError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether the failing script's transaction was rolled back
    pub fn rolled_back(&self) -> bool {
        match self {
            Self::Execution { rolled_back, .. }
            | Self::ScriptFailed { rolled_back, .. }
            | Self::BatchHalted { rolled_back, .. } => *rolled_back,
            _ => false,
        }
    }

    /// Versions that were never attempted because an earlier script failed
    pub fn skipped_versions(&self) -> &[u64] {
        match self {
            Self::BatchHalted { skipped, .. } => skipped,
            _ => &[],
        }
    }

    /// The innermost error, past every execution wrapper
    pub fn root(&self) -> &ScriptError {
        match self {
            Self::Execution { source, .. }
            | Self::ScriptFailed { source, .. }
            | Self::BatchHalted { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Categorized error types for better handling
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed names, duplicates, unknown versions (not retryable)
    Validation,

    /// Unapplied scripts detected by the pending guard
    Pending,

    /// A script broke the explicit change discipline
    Discipline,

    /// A lifecycle hook failed (retryable by re-running)
    Execution,

    /// File system errors
    FileSystem,

    /// Tracking store errors
    Database,

    /// Configuration errors (not retryable)
    Configuration,

    /// Unknown errors
    Unknown,
}

impl ErrorCategory {
    /// Check if re-invoking the same command may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Execution | ErrorCategory::FileSystem | ErrorCategory::Database
        )
    }
}

/// Categorize an error
pub fn categorize_error(error: &anyhow::Error) -> ErrorCategory {
    let Some(script_error) = error.downcast_ref::<ScriptError>() else {
        return ErrorCategory::Unknown;
    };

    match script_error {
        ScriptError::IllegalName(_)
        | ScriptError::IllegalScope(_)
        | ScriptError::DuplicateName(_)
        | ScriptError::DuplicateVersion(_)
        | ScriptError::UnknownVersion(_)
        | ScriptError::VersionOverflow(_)
        | ScriptError::InvalidScript { .. }
        | ScriptError::MissingScript { .. }
        | ScriptError::InvalidArguments { .. } => ErrorCategory::Validation,
        ScriptError::PendingScripts => ErrorCategory::Pending,
        ScriptError::ExplicitChangeNotPermitted { .. } | ScriptError::UnsupportedOperation(_) => {
            ErrorCategory::Discipline
        }
        ScriptError::Execution { .. }
        | ScriptError::ScriptFailed { .. }
        | ScriptError::BatchHalted { .. } => ErrorCategory::Execution,
        ScriptError::Io { .. } => ErrorCategory::FileSystem,
        ScriptError::Database(_) => ErrorCategory::Database,
        ScriptError::Config(_) => ErrorCategory::Configuration,
        ScriptError::Other(_) => ErrorCategory::Unknown,
    }
}

/// Enhanced error with context and suggestions
#[derive(Debug)]
pub struct EnhancedError {
    pub error: anyhow::Error,
    pub category: ErrorCategory,
    pub context: Vec<String>,
    pub suggestions: Vec<String>,
}

impl EnhancedError {
    /// Create an enhanced error
    pub fn new(error: anyhow::Error) -> Self {
        let category = categorize_error(&error);
        let (context, suggestions) = generate_context_and_suggestions(&category, &error);

        Self {
            error,
            category,
            context,
            suggestions,
        }
    }

    /// Display the error, its cause chain, context and suggestions
    pub fn display(&self) -> String {
        let mut output = format!("❌ Error: {}\n", self.error);

        for cause in self.error.chain().skip(1) {
            output.push_str(&format!("   caused by: {}\n", cause));
        }

        if !self.context.is_empty() {
            output.push_str("\n📋 Context:\n");
            for ctx in &self.context {
                output.push_str(&format!("   • {}\n", ctx));
            }
        }

        if !self.suggestions.is_empty() {
            output.push_str("\n💡 Suggestions:\n");
            for suggestion in &self.suggestions {
                output.push_str(&format!("   • {}\n", suggestion));
            }
        }

        output
    }
}

/// Generate helpful context and suggestions based on error category
fn generate_context_and_suggestions(
    category: &ErrorCategory,
    error: &anyhow::Error,
) -> (Vec<String>, Vec<String>) {
    let mut context = Vec::new();
    let mut suggestions = Vec::new();
    let script_error = error.downcast_ref::<ScriptError>();

    match category {
        ErrorCategory::Validation => {
            context.push("The script set failed validation".to_string());
            match script_error {
                Some(ScriptError::DuplicateVersion(_)) => {
                    suggestions.push("Give every script a unique version number".to_string());
                }
                Some(ScriptError::DuplicateName(_)) => {
                    suggestions.push("Rename one of the scripts so every name is unique".to_string());
                }
                Some(ScriptError::UnknownVersion(_)) => {
                    suggestions.push("Run 'deploy-scripts status' to list known versions".to_string());
                }
                Some(ScriptError::IllegalName(_)) | Some(ScriptError::IllegalScope(_)) => {
                    suggestions.push(
                        "Name scripts <version>_<name>[.<scope>].<ext> using lower case letters, numbers and '_'"
                            .to_string(),
                    );
                }
                _ => suggestions.push("Review the offending script".to_string()),
            }
        }
        ErrorCategory::Pending => {
            context.push("Unapplied scripts were found".to_string());
            suggestions.push("Run 'deploy-scripts migrate' to resolve pending scripts".to_string());
        }
        ErrorCategory::Discipline => {
            context.push("A change operation was refused".to_string());
            suggestions.push("Move structural changes into a sequenced script".to_string());
        }
        ErrorCategory::Execution => {
            if let Some(err) = script_error {
                if err.rolled_back() {
                    context.push("The failing script's transaction was rolled back".to_string());
                } else {
                    context.push("The failing script ran without a transaction; check for partial changes".to_string());
                }
                let skipped = err.skipped_versions();
                if !skipped.is_empty() {
                    context.push(format!("Skipped versions: {:?}", skipped));
                }
            }
            suggestions.push("Fix the script and run 'deploy-scripts migrate' again".to_string());
            suggestions.push("Already applied scripts will not be re-run".to_string());
        }
        ErrorCategory::FileSystem => {
            context.push("File system operation failed".to_string());
            suggestions.push("Check file permissions".to_string());
            suggestions.push("Verify the script directories exist".to_string());
        }
        ErrorCategory::Database => {
            context.push("Tracking store operation failed".to_string());
            suggestions.push("Verify the database path in deploy-scripts.toml".to_string());
        }
        ErrorCategory::Configuration => {
            context.push("Configuration error detected".to_string());
            suggestions.push("Review deploy-scripts.toml".to_string());
            suggestions.push("Check the DEPLOY_SCRIPTS_DATABASE environment variable".to_string());
        }
        ErrorCategory::Unknown => {
            context.push(format!("Unexpected error: {}", error));
            suggestions.push("Run with RUST_LOG=debug for more details".to_string());
        }
    }

    (context, suggestions)
}
