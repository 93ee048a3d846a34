pub mod applied;
pub mod db;

use crate::config::Config;
use crate::error::Result;

pub use applied::AppliedStore;
pub use db::Database;

/// Default name of the tracking table
pub const DEFAULT_TABLE: &str = "post_deploy_scripts";

/// Open the database named by the configuration, creating its directory
pub fn open(config: &Config) -> Result<Database> {
    Database::new(&config.database)
}
