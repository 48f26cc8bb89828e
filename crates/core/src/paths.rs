//! On-disk layout under the user data directory.
//!
//! ```text
//! <user_data>/config.json   persisted configuration
//! <user_data>/data/         vector-store files (owned by the backend)
//! <user_data>/models/       downloaded model artifacts
//! <user_data>/logs/         rolling logs
//! ```

use std::path::{Path, PathBuf};

/// Resolved user-data directory layout.
#[derive(Debug, Clone)]
pub struct UserDataDirs {
  root: PathBuf,
}

impl UserDataDirs {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  /// Resolve the default user-data root.
  ///
  /// Precedence: `LODESTONE_DATA_DIR`, then `XDG_DATA_HOME`, then the
  /// platform data directory.
  pub fn resolve() -> Self {
    if let Ok(dir) = std::env::var("LODESTONE_DATA_DIR") {
      return Self::new(dir);
    }

    if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
      return Self::new(PathBuf::from(xdg_data).join("lodestone"));
    }

    Self::new(
      dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lodestone"),
    )
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn config_path(&self) -> PathBuf {
    self.root.join("config.json")
  }

  pub fn data_dir(&self) -> PathBuf {
    self.root.join("data")
  }

  pub fn models_dir(&self) -> PathBuf {
    self.root.join("models")
  }

  pub fn logs_dir(&self) -> PathBuf {
    self.root.join("logs")
  }

  pub fn socket_path(&self) -> PathBuf {
    self.root.join("lodestone.sock")
  }

  /// Create every directory in the layout.
  pub fn ensure(&self) -> std::io::Result<()> {
    std::fs::create_dir_all(&self.root)?;
    std::fs::create_dir_all(self.data_dir())?;
    std::fs::create_dir_all(self.models_dir())?;
    std::fs::create_dir_all(self.logs_dir())?;
    Ok(())
  }
}
