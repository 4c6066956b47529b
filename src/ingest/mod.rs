pub mod walker;
pub mod metadata;
pub mod schema;
pub mod record;
pub mod parser;

pub use walker::{FileMetadata, FilePattern, discover_files};
pub use metadata::{FileStamp, compute_file_hash, hash_bytes};
pub use schema::{ColumnSpec, ColumnType, CompiledSchema, Value, canonical_name};
pub use record::{IngestionBatch, NormalizedRecord, Provenance, idempotency_key};
pub use parser::{ParsedFile, check_size, parse, parse_bytes, read_bounded};
