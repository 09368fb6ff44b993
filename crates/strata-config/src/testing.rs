//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - A temporary store root
//! - A project directory with its own `.strata/config.toml`
//!
//! # Usage
//!
//! ```ignore
//! use strata_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     // env.store_root and env.project_root are isolated per test
//! }
//! ```

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::{Config, ENV_ROOT, PROJECT_CONFIG};

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Isolated store root directory (not created; the store creates it)
    pub store_root: PathBuf,
    /// Project root for the test
    pub project_root: PathBuf,
    /// Stand-in home directory
    pub home: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> io::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let project_root = root.join("project");
        let home = root.join("home");
        std::fs::create_dir_all(&project_root)?;
        std::fs::create_dir_all(&home)?;

        Ok(Self {
            store_root: root.join(format!("store-{}", test_id)),
            _temp_dir: temp_dir,
            project_root,
            home,
            test_id,
        })
    }

    /// Config pointing at this environment's store root
    pub fn config(&self) -> Config {
        let mut cfg = Config::default();
        cfg.storage.root = self.store_root.clone();
        cfg
    }

    /// Path of the project-local config file
    pub fn project_config_path(&self) -> PathBuf {
        self.project_root.join(PROJECT_CONFIG)
    }

    /// Write raw TOML as the project-local config
    pub fn write_project_config(&self, contents: &str) -> io::Result<PathBuf> {
        let path = self.project_config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    /// Create a test file with content
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> io::Result<PathBuf> {
        let path = self.project_root.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Environment variables for spawning the CLI against this environment.
    ///
    /// `HOME` points at an empty directory so a developer's global config
    /// can't leak into tests.
    pub fn cli_env(&self) -> Vec<(String, String)> {
        vec![
            (
                ENV_ROOT.to_string(),
                self.store_root.to_string_lossy().into_owned(),
            ),
            ("HOME".to_string(), self.home.to_string_lossy().into_owned()),
        ]
    }
}
