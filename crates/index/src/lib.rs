//! Indexing pipeline: chunking, scanning, watching and re-index policy.

pub mod chunker;
pub mod pipeline;
pub mod reindex;
pub mod scanner;
pub mod watcher;

pub use chunker::{ChunkerConfig, TextChunk, chunk_text};
pub use pipeline::{FileJob, FilePipeline, PipelineConfig, PipelineCounters, PipelineHandle, title_for_path};
pub use reindex::{ReindexService, should_reindex};
pub use scanner::{ScanFilter, ScannedFile, Scanner, default_excludes};
pub use watcher::{WatcherConfig, WatcherTask};
