//! MD: the typed, append-mostly snapshot store.
//!
//! An [`MdDocument`] is a list of named sections. Each section has a schema
//! of typed fields and holds uniquely named entries; indexed sections also
//! number their entries through an implicit `_index_` column. Repeated
//! fields are [`SparseField`]s keyed by integer index.
//!
//! Documents are persisted whole with [`snapshot`]: JSON for readable
//! snapshots, fixint bincode for compact ones.

pub mod document;
pub mod snapshot;
pub mod sparse;

pub use document::{
    FieldDecl, FieldType, FieldValue, MdDocument, MdEntry, Scalar, Section, SectionSchema,
    INDEX_FIELD,
};
pub use snapshot::{read_document, write_document, SnapshotFormat};
pub use sparse::SparseField;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MdError {
    #[error("section '{0}' declared twice")]
    DuplicateSection(String),

    #[error("unknown section '{0}'")]
    UnknownSection(String),

    #[error("field name '{0}' is reserved")]
    ReservedField(String),

    #[error("{section}: no field named '{field}'")]
    UnknownField { section: String, field: String },

    #[error("{section}: entry '{entry}' already exists")]
    DuplicateEntry { section: String, entry: String },

    #[error("{section}: no entry named '{entry}'")]
    UnknownEntry { section: String, entry: String },

    #[error("{section}.{field}: expected {expected}")]
    TypeMismatch {
        section: String,
        field: String,
        expected: String,
    },

    #[error("{section}.{field}: arity mismatch (field repeated = {repeated})")]
    Arity {
        section: String,
        field: String,
        repeated: bool,
    },

    #[error("link to missing entry '{entry}' in section '{section}'")]
    DanglingLink { section: String, entry: String },

    #[error("{section}.{entry}: required field '{field}' is unset")]
    MissingField {
        section: String,
        entry: String,
        field: String,
    },

    #[error("snapshot i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("snapshot binary: {0}")]
    Binary(#[from] bincode::Error),
}
