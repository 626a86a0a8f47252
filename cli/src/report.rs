//! Roll-up tables built from a program database

use anyhow::Result;
use serde::Serialize;
use toolgear_client::ProgramDatabase;
use toolgear_shared::types::program::StatKind;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    pub name: String,
    pub value: f64,
}

/// One attribute's statistics at every roll-up level.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub attr: String,
    pub description: String,
    pub per_entry: StatKind,
    pub rollup: StatKind,
    pub total: Option<f64>,
    pub files: Vec<Row>,
    pub functions: Vec<Row>,
}

fn sorted(mut rows: Vec<Row>) -> Vec<Row> {
    rows.sort_by(|a, b| b.value.total_cmp(&a.value).then_with(|| a.name.cmp(&b.name)));
    rows
}

/// Summarize `attr`, defaulting to the statistics it suggests.
pub fn summarize(
    db: &mut ProgramDatabase,
    attr: &str,
    per_entry: Option<StatKind>,
    rollup: Option<StatKind>,
) -> Result<Summary> {
    let Some(decl) = db.data_attr(attr) else {
        anyhow::bail!("Unknown data attribute: {}", attr);
    };
    let description = decl.description.clone();
    let per_entry = per_entry.unwrap_or(decl.suggested.per_entry);
    let rollup = rollup.unwrap_or(decl.suggested.rollup);

    let functions: Vec<String> = db.functions().iter().map(|f| f.name.clone()).collect();
    let files: Vec<String> = db.files().iter().map(|f| f.name.clone()).collect();

    let mut function_rows = Vec::new();
    for name in functions {
        if let Some(value) = db.function_data_stat(&name, attr, per_entry, rollup)? {
            function_rows.push(Row { name, value });
        }
    }
    let mut file_rows = Vec::new();
    for name in files {
        if let Some(value) = db.file_data_stat(&name, attr, per_entry, rollup)? {
            file_rows.push(Row { name, value });
        }
    }

    Ok(Summary {
        attr: attr.to_string(),
        description,
        per_entry,
        rollup,
        total: db.app_data_stat(attr, per_entry, rollup)?,
        files: sorted(file_rows),
        functions: sorted(function_rows),
    })
}

/// Summaries for every declared attribute.
pub fn summarize_all(db: &mut ProgramDatabase) -> Result<Vec<Summary>> {
    let attrs: Vec<String> = db.data_attrs().iter().map(|a| a.tag.clone()).collect();
    attrs
        .iter()
        .map(|attr| summarize(db, attr, None, None))
        .collect()
}
