//! Chunked upload to UPOS object storage.

pub mod api;
pub mod chunk;
pub mod engine;
pub mod events;
pub mod negotiate;
pub mod session;

pub use api::{HttpUposApi, UploadTarget, UposApi};
pub use chunk::{ByteRange, ChunkArena, ChunkStatus, ChunkTask, split_into_chunks};
pub use engine::{UploadEngine, UploadResult};
pub use events::UploadEvent;
pub use negotiate::{NegotiateRequest, Negotiator, SessionDescriptor};
pub use session::{SessionStatus, TransferSession};
