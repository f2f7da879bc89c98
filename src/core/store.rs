//! Store handle: the root directory, its configuration, the database broker
//! and the clock every plugin operation reads "now" from.

use crate::core::broker::DbBroker;
use crate::core::config::{self, Config};
use crate::core::db;
use crate::core::error::ColdchainError;
use crate::core::time::{Clock, SystemClock};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A coldchain workspace rooted at a directory holding `coldchain.db` and an
/// optional `coldchain.toml`.
///
/// `Store` is `Send + Sync`; share it across worker threads with `Arc`.
pub struct Store {
    /// Absolute path to the store root directory
    pub root: PathBuf,
    pub config: Config,
    broker: DbBroker,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("root", &self.root)
            .field("config", &self.config)
            .field("db", &self.broker.db_path())
            .finish()
    }
}

impl Store {
    /// Open (and initialize if needed) the store at `root` using the config
    /// file found there and the system clock.
    pub fn open(root: &Path) -> Result<Self, ColdchainError> {
        let config = config::load_config(root)?;
        Self::open_with(root, config, Arc::new(SystemClock))
    }

    pub fn open_with(
        root: &Path,
        config: Config,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ColdchainError> {
        config.validate()?;
        let db_path = db::initialize_db(root, clock.now_secs())?;
        Ok(Self {
            root: root.to_path_buf(),
            config,
            broker: DbBroker::new(&db_path),
            clock,
        })
    }

    pub fn broker(&self) -> &DbBroker {
        &self.broker
    }

    pub fn now(&self) -> i64 {
        self.clock.now_secs()
    }

    pub fn node_id(&self) -> &str {
        &self.config.audit.node_id
    }
}
