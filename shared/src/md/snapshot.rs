//! Whole-document snapshot files.
//!
//! The format follows the file extension: `.mdb` is fixint bincode,
//! anything else is JSON. Files are read fully into memory, decoded, then
//! validated before the caller sees them.

use crate::md::{MdDocument, MdError};
use bincode::Options;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFormat {
    Json,
    Binary,
}

impl SnapshotFormat {
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("mdb") => SnapshotFormat::Binary,
            _ => SnapshotFormat::Json,
        }
    }
}

/// Fixed-width integers so lengths and enum tags decode identically across builds.
fn snapshot_bincode() -> impl bincode::Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

pub fn encode(doc: &MdDocument, format: SnapshotFormat) -> Result<Vec<u8>, MdError> {
    Ok(match format {
        SnapshotFormat::Json => serde_json::to_vec_pretty(doc)?,
        SnapshotFormat::Binary => snapshot_bincode().serialize(doc)?,
    })
}

pub fn decode(bytes: &[u8], format: SnapshotFormat) -> Result<MdDocument, MdError> {
    let mut doc: MdDocument = match format {
        SnapshotFormat::Json => serde_json::from_slice(bytes)?,
        SnapshotFormat::Binary => snapshot_bincode().deserialize(bytes)?,
    };
    doc.rebuild_lookups()?;
    doc.validate()?;
    Ok(doc)
}

pub fn write_document(doc: &MdDocument, path: &Path) -> Result<(), MdError> {
    let format = SnapshotFormat::for_path(path);
    let bytes = encode(doc, format)?;
    std::fs::write(path, &bytes)?;
    debug!("wrote {:?} snapshot {} ({} bytes)", format, path.display(), bytes.len());
    Ok(())
}

pub fn read_document(path: &Path) -> Result<MdDocument, MdError> {
    let bytes = std::fs::read(path)?;
    debug!("read snapshot {} ({} bytes)", path.display(), bytes.len());
    decode(&bytes, SnapshotFormat::for_path(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::md::{FieldDecl, FieldType, Scalar, SectionSchema};

    fn sample() -> MdDocument {
        let mut doc = MdDocument::new();
        doc.declare_section(SectionSchema::new("files")).unwrap();
        doc.declare_section(
            SectionSchema::new("functions")
                .indexed()
                .field(FieldDecl::new("file", FieldType::Link("files".into())).required())
                .field(FieldDecl::new("time", FieldType::Double).repeated()),
        )
        .unwrap();
        doc.insert_entry("files", "a.c").unwrap();
        doc.insert_entry("functions", "main").unwrap();
        doc.set("functions", "main", "file", Scalar::Link("a.c".into()))
            .unwrap();
        doc.set_at("functions", "main", "time", 2, Scalar::Double(0.25))
            .unwrap();
        doc
    }

    #[test]
    fn test_both_formats_restore_lookups() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["snap.json", "snap.mdb"] {
            let path = dir.path().join(name);
            let doc = sample();
            write_document(&doc, &path).unwrap();
            let back = read_document(&path).unwrap();
            assert_eq!(back, doc);
            assert_eq!(back.section("functions").unwrap().index_of("main"), Some(0));
        }
    }

    #[test]
    fn test_invalid_document_rejected_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        let mut doc = MdDocument::new();
        doc.declare_section(SectionSchema::new("files")).unwrap();
        doc.declare_section(
            SectionSchema::new("functions")
                .field(FieldDecl::new("file", FieldType::Link("files".into())).required()),
        )
        .unwrap();
        doc.insert_entry("functions", "orphan").unwrap();
        write_document(&doc, &path).unwrap();

        assert!(matches!(
            read_document(&path),
            Err(MdError::MissingField { .. })
        ));
    }

    #[test]
    fn test_format_by_extension() {
        assert_eq!(SnapshotFormat::for_path(Path::new("x.mdb")), SnapshotFormat::Binary);
        assert_eq!(SnapshotFormat::for_path(Path::new("x.json")), SnapshotFormat::Json);
        assert_eq!(SnapshotFormat::for_path(Path::new("x")), SnapshotFormat::Json);
    }
}
