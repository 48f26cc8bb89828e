//! The vector store: `chunks` and `file_status` tables over LanceDB, a
//! single-writer queue in front of them, and forward-only schema migrations.

mod chunks;
mod error;
mod migrations;
mod schema;
mod status;
mod store;
mod writer;

pub use chunks::{ChunkRow, ScoredChunk};
pub use error::DbError;
pub use migrations::CURRENT_SCHEMA_VERSION;
pub use store::VectorStore;
pub use writer::{WriteQueue, WriteTask};

pub type Result<T> = std::result::Result<T, DbError>;
