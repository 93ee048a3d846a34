//! Generate a new, empty script with the next free version

use tracing::info;

use crate::config::Config;
use crate::copy::comment_prefix;
use crate::error::{Result, ScriptError};
use crate::identity::underscore;
use crate::registry::{Registry, ScriptDescriptor};

fn template(extension: &str) -> String {
    let c = comment_prefix(extension);
    format!(
        "{c} up\n{c} Statements applied by this script.\n\n\
         {c} down\n{c} Statements that revert it. Leave empty if it cannot be reverted.\n"
    )
}

/// Write `<next version>_<name>.<ext>` into the first configured source.
///
/// `name` may be snake case or camel case; it must be unique among the
/// existing scripts.
pub fn new_script(config: &Config, name: &str) -> Result<ScriptDescriptor> {
    let parser = config.parser();
    let slug = underscore(name.trim());
    if slug.is_empty() {
        return Err(ScriptError::IllegalName(name.to_string()));
    }

    let registry = Registry::build(&config.sources, &parser)?;
    let version = config.numbering.next_version(registry.last().version)?;
    let file_name = parser.file_name(version, &slug, None);
    let identity = parser
        .parse(&file_name)
        .map_err(|_| ScriptError::IllegalName(name.to_string()))?;

    if registry.find_by_name(&identity.name).is_some() {
        return Err(ScriptError::DuplicateName(identity.name));
    }

    let dir = config.primary_source()?;
    std::fs::create_dir_all(dir).map_err(|e| ScriptError::io(format!("create {}", dir.display()), e))?;
    let path = dir.join(&file_name);
    std::fs::write(&path, template(parser.extension()))
        .map_err(|e| ScriptError::io(format!("write {}", path.display()), e))?;

    info!("created {}", path.display());
    Ok(ScriptDescriptor::new(identity, path))
}
