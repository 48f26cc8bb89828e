pub mod config;
pub mod document;
pub mod paths;
pub mod status;

pub use config::{Config, ConfigError, EmbedderConfig, IndexingConfig, Settings, WatchedFolder};
pub use document::{CHARS_PER_TOKEN, ChunkMeta, chunk_id, estimate_tokens, file_fingerprint};
pub use paths::UserDataDirs;
pub use status::{FileStatus, FileStatusRow};
