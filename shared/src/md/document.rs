//! Typed sections of named entries.

use crate::md::sparse::SparseField;
use crate::md::MdError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Name of the implicit auto-increment column of indexed sections.
pub const INDEX_FIELD: &str = "_index_";

/// Column type. Links name an entry of another (or the same) section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Int,
    Double,
    String,
    Link(String),
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Int => f.write_str("int"),
            FieldType::Double => f.write_str("double"),
            FieldType::String => f.write_str("string"),
            FieldType::Link(section) => write!(f, "link({})", section),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDecl {
    pub name: String,
    pub ty: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub repeated: bool,
}

impl FieldDecl {
    pub fn new(name: &str, ty: FieldType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            required: false,
            repeated: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn repeated(mut self) -> Self {
        self.repeated = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionSchema {
    pub name: String,
    #[serde(default)]
    pub indexed: bool,
    pub fields: Vec<FieldDecl>,
}

impl SectionSchema {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            indexed: false,
            fields: Vec::new(),
        }
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn field(mut self, decl: FieldDecl) -> Self {
        self.fields.push(decl);
        self
    }

    pub fn decl(&self, name: &str) -> Option<&FieldDecl> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// One stored value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scalar {
    Int(i32),
    Double(f64),
    Str(String),
    Link(String),
}

impl Scalar {
    fn matches(&self, ty: &FieldType) -> bool {
        matches!(
            (self, ty),
            (Scalar::Int(_), FieldType::Int)
                | (Scalar::Double(_), FieldType::Double)
                | (Scalar::Str(_), FieldType::String)
                | (Scalar::Link(_), FieldType::Link(_))
        )
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Scalar::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Scalar::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Str(s) | Scalar::Link(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Single(Scalar),
    Repeated(SparseField<Scalar>),
}

/// A uniquely named row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MdEntry {
    pub name: String,
    /// Auto-assigned position for indexed sections.
    #[serde(default)]
    pub index: Option<i32>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl MdEntry {
    pub fn get(&self, field: &str) -> Option<&Scalar> {
        match self.fields.get(field)? {
            FieldValue::Single(v) => Some(v),
            FieldValue::Repeated(_) => None,
        }
    }

    pub fn get_at(&self, field: &str, index: usize) -> Option<&Scalar> {
        match self.fields.get(field)? {
            FieldValue::Repeated(values) => values.get(index),
            FieldValue::Single(_) => None,
        }
    }

    pub fn repeated(&self, field: &str) -> Option<&SparseField<Scalar>> {
        match self.fields.get(field)? {
            FieldValue::Repeated(values) => Some(values),
            FieldValue::Single(_) => None,
        }
    }

    pub fn get_int(&self, field: &str) -> Option<i32> {
        self.get(field).and_then(Scalar::as_int)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Scalar::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub schema: SectionSchema,
    entries: Vec<MdEntry>,
    #[serde(skip)]
    by_name: HashMap<String, usize>,
    #[serde(skip)]
    by_index: HashMap<i32, usize>,
}

impl Section {
    fn new(schema: SectionSchema) -> Self {
        Self {
            schema,
            entries: Vec::new(),
            by_name: HashMap::new(),
            by_index: HashMap::new(),
        }
    }

    fn rebuild_lookups(&mut self) -> Result<(), MdError> {
        self.by_name.clear();
        self.by_index.clear();
        for (pos, entry) in self.entries.iter().enumerate() {
            if self.by_name.insert(entry.name.clone(), pos).is_some() {
                return Err(MdError::DuplicateEntry {
                    section: self.schema.name.clone(),
                    entry: entry.name.clone(),
                });
            }
            if let Some(i) = entry.index {
                self.by_index.insert(i, pos);
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order.
    pub fn entries(&self) -> &[MdEntry] {
        &self.entries
    }

    pub fn entry(&self, name: &str) -> Option<&MdEntry> {
        self.by_name.get(name).map(|&pos| &self.entries[pos])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Name to `_index_` lookup.
    pub fn index_of(&self, name: &str) -> Option<i32> {
        self.entry(name).and_then(|e| e.index)
    }

    /// `_index_` to entry lookup.
    pub fn by_index(&self, index: i32) -> Option<&MdEntry> {
        self.by_index.get(&index).map(|&pos| &self.entries[pos])
    }
}

/// A set of sections forming one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MdDocument {
    sections: Vec<Section>,
    #[serde(skip)]
    by_name: HashMap<String, usize>,
}

impl MdDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore name lookups after deserialization.
    pub(crate) fn rebuild_lookups(&mut self) -> Result<(), MdError> {
        self.by_name.clear();
        for (pos, section) in self.sections.iter_mut().enumerate() {
            section.rebuild_lookups()?;
            self.by_name.insert(section.schema.name.clone(), pos);
        }
        Ok(())
    }

    /// Declare a section. Link targets must already exist or be the section itself.
    pub fn declare_section(&mut self, schema: SectionSchema) -> Result<(), MdError> {
        if self.by_name.contains_key(&schema.name) {
            return Err(MdError::DuplicateSection(schema.name));
        }
        for decl in &schema.fields {
            if decl.name == INDEX_FIELD {
                return Err(MdError::ReservedField(decl.name.clone()));
            }
            if let FieldType::Link(target) = &decl.ty {
                if target != &schema.name && !self.by_name.contains_key(target) {
                    return Err(MdError::UnknownSection(target.clone()));
                }
            }
        }
        self.by_name.insert(schema.name.clone(), self.sections.len());
        self.sections.push(Section::new(schema));
        Ok(())
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.by_name.get(name).map(|&pos| &self.sections[pos])
    }

    fn section_mut(&mut self, name: &str) -> Result<&mut Section, MdError> {
        let pos = *self
            .by_name
            .get(name)
            .ok_or_else(|| MdError::UnknownSection(name.to_string()))?;
        Ok(&mut self.sections[pos])
    }

    pub fn entry(&self, section: &str, name: &str) -> Option<&MdEntry> {
        self.section(section)?.entry(name)
    }

    /// Add a new row. Indexed sections assign the next `_index_`.
    pub fn insert_entry(&mut self, section: &str, name: &str) -> Result<Option<i32>, MdError> {
        let sec = self.section_mut(section)?;
        if sec.by_name.contains_key(name) {
            return Err(MdError::DuplicateEntry {
                section: section.to_string(),
                entry: name.to_string(),
            });
        }
        let index = if sec.schema.indexed {
            Some(sec.by_index.len() as i32)
        } else {
            None
        };
        let pos = sec.entries.len();
        sec.entries.push(MdEntry {
            name: name.to_string(),
            index,
            fields: BTreeMap::new(),
        });
        sec.by_name.insert(name.to_string(), pos);
        if let Some(i) = index {
            sec.by_index.insert(i, pos);
        }
        Ok(index)
    }

    fn check_value(
        &self,
        section: &str,
        field: &str,
        value: &Scalar,
        want_repeated: bool,
    ) -> Result<(), MdError> {
        let sec = self
            .section(section)
            .ok_or_else(|| MdError::UnknownSection(section.to_string()))?;
        let decl = sec.schema.decl(field).ok_or_else(|| MdError::UnknownField {
            section: section.to_string(),
            field: field.to_string(),
        })?;
        if decl.repeated != want_repeated {
            return Err(MdError::Arity {
                section: section.to_string(),
                field: field.to_string(),
                repeated: decl.repeated,
            });
        }
        if !value.matches(&decl.ty) {
            return Err(MdError::TypeMismatch {
                section: section.to_string(),
                field: field.to_string(),
                expected: decl.ty.to_string(),
            });
        }
        if let (Scalar::Link(target_entry), FieldType::Link(target)) = (value, &decl.ty) {
            let exists = self
                .section(target)
                .map(|s| s.contains(target_entry))
                .unwrap_or(false);
            if !exists {
                return Err(MdError::DanglingLink {
                    section: target.clone(),
                    entry: target_entry.clone(),
                });
            }
        }
        Ok(())
    }

    fn entry_mut(&mut self, section: &str, name: &str) -> Result<&mut MdEntry, MdError> {
        let sec = self.section_mut(section)?;
        let pos = *sec
            .by_name
            .get(name)
            .ok_or_else(|| MdError::UnknownEntry {
                section: section.to_string(),
                entry: name.to_string(),
            })?;
        Ok(&mut sec.entries[pos])
    }

    /// Write a singular field.
    pub fn set(
        &mut self,
        section: &str,
        entry: &str,
        field: &str,
        value: Scalar,
    ) -> Result<(), MdError> {
        self.check_value(section, field, &value, false)?;
        let row = self.entry_mut(section, entry)?;
        row.fields
            .insert(field.to_string(), FieldValue::Single(value));
        Ok(())
    }

    /// Write one element of a repeated field.
    pub fn set_at(
        &mut self,
        section: &str,
        entry: &str,
        field: &str,
        index: usize,
        value: Scalar,
    ) -> Result<(), MdError> {
        self.check_value(section, field, &value, true)?;
        let row = self.entry_mut(section, entry)?;
        let slot = row
            .fields
            .entry(field.to_string())
            .or_insert_with(|| FieldValue::Repeated(SparseField::new()));
        if let FieldValue::Repeated(values) = slot {
            values.set(index, value);
        }
        Ok(())
    }

    /// Pre-size a repeated field to `len` unset slots.
    pub fn reserve(
        &mut self,
        section: &str,
        entry: &str,
        field: &str,
        len: usize,
    ) -> Result<(), MdError> {
        let row = self.entry_mut(section, entry)?;
        let slot = row
            .fields
            .entry(field.to_string())
            .or_insert_with(|| FieldValue::Repeated(SparseField::new()));
        if let FieldValue::Repeated(values) = slot {
            values.reserve(len);
        }
        Ok(())
    }

    /// Check required fields and that every link resolves.
    pub fn validate(&self) -> Result<(), MdError> {
        for sec in &self.sections {
            for entry in &sec.entries {
                for decl in &sec.schema.fields {
                    let present = entry.fields.contains_key(&decl.name);
                    if decl.required && !present {
                        return Err(MdError::MissingField {
                            section: sec.schema.name.clone(),
                            entry: entry.name.clone(),
                            field: decl.name.clone(),
                        });
                    }
                    let FieldType::Link(target) = &decl.ty else {
                        continue;
                    };
                    let values: Vec<&Scalar> = match entry.fields.get(&decl.name) {
                        Some(FieldValue::Single(v)) => vec![v],
                        Some(FieldValue::Repeated(vs)) => vs.iter().map(|(_, v)| v).collect(),
                        None => continue,
                    };
                    for v in values {
                        let name = v.as_str().unwrap_or_default();
                        if !self.section(target).is_some_and(|s| s.contains(name)) {
                            return Err(MdError::DanglingLink {
                                section: target.clone(),
                                entry: name.to_string(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> MdDocument {
        let mut doc = MdDocument::new();
        doc.declare_section(
            SectionSchema::new("files").field(FieldDecl::new("path", FieldType::String)),
        )
        .unwrap();
        doc.declare_section(
            SectionSchema::new("functions")
                .indexed()
                .field(FieldDecl::new("file", FieldType::Link("files".into())).required())
                .field(FieldDecl::new("start", FieldType::Int))
                .field(FieldDecl::new("calls", FieldType::Int).repeated()),
        )
        .unwrap();
        doc
    }

    #[test]
    fn test_indexed_section_assigns_stable_indices() {
        let mut doc = doc();
        assert_eq!(doc.insert_entry("functions", "main").unwrap(), Some(0));
        assert_eq!(doc.insert_entry("functions", "foo").unwrap(), Some(1));
        assert_eq!(doc.insert_entry("files", "a.c").unwrap(), None);

        let funcs = doc.section("functions").unwrap();
        assert_eq!(funcs.index_of("foo"), Some(1));
        assert_eq!(funcs.by_index(0).unwrap().name, "main");
        assert!(matches!(
            doc.insert_entry("functions", "main"),
            Err(MdError::DuplicateEntry { .. })
        ));
    }

    #[test]
    fn test_links_validated_on_write() {
        let mut doc = doc();
        doc.insert_entry("functions", "main").unwrap();
        let err = doc
            .set("functions", "main", "file", Scalar::Link("a.c".into()))
            .unwrap_err();
        assert!(matches!(err, MdError::DanglingLink { .. }));

        doc.insert_entry("files", "a.c").unwrap();
        doc.set("functions", "main", "file", Scalar::Link("a.c".into()))
            .unwrap();
        assert_eq!(doc.entry("functions", "main").unwrap().get_str("file"), Some("a.c"));
    }

    #[test]
    fn test_type_and_arity_checks() {
        let mut doc = doc();
        doc.insert_entry("functions", "main").unwrap();
        assert!(matches!(
            doc.set("functions", "main", "start", Scalar::Double(1.0)),
            Err(MdError::TypeMismatch { .. })
        ));
        assert!(matches!(
            doc.set("functions", "main", "calls", Scalar::Int(1)),
            Err(MdError::Arity { repeated: true, .. })
        ));
        doc.set_at("functions", "main", "calls", 4, Scalar::Int(7))
            .unwrap();
        let row = doc.entry("functions", "main").unwrap();
        assert_eq!(row.get_at("calls", 4), Some(&Scalar::Int(7)));
        assert_eq!(row.get_at("calls", 3), None);
        assert_eq!(row.get_at("calls", 100), None);
    }

    #[test]
    fn test_validate_requires_fields() {
        let mut doc = doc();
        doc.insert_entry("functions", "main").unwrap();
        assert!(matches!(doc.validate(), Err(MdError::MissingField { .. })));
        doc.insert_entry("files", "a.c").unwrap();
        doc.set("functions", "main", "file", Scalar::Link("a.c".into()))
            .unwrap();
        doc.validate().unwrap();
    }

    #[test]
    fn test_section_declaration_rules() {
        let mut doc = doc();
        assert!(matches!(
            doc.declare_section(SectionSchema::new("files")),
            Err(MdError::DuplicateSection(_))
        ));
        assert!(matches!(
            doc.declare_section(
                SectionSchema::new("x").field(FieldDecl::new("y", FieldType::Link("nope".into())))
            ),
            Err(MdError::UnknownSection(_))
        ));
        assert!(matches!(
            doc.declare_section(
                SectionSchema::new("z").field(FieldDecl::new(INDEX_FIELD, FieldType::Int))
            ),
            Err(MdError::ReservedField(_))
        ));
    }
}
