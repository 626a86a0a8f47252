//! TOML program manifests
//!
//! Describes a target program's modules, functions and instrumentation
//! points without a binary-analysis library:
//!
//! ```toml
//! program = "demo"
//!
//! [[module]]
//! name = "demo"
//!
//! [[module.function]]
//! name = "main"
//! file = "main.c"
//! start_line = 1
//! end_line = 30
//!
//! [[module.function.point]]
//! kind = "entry"
//! line = 1
//!
//! [[module.function.point]]
//! kind = "call"
//! callee = "work"
//! line = 12
//!
//! [[hit]]
//! point = "main:entry"
//! count = 3
//! ```
//!
//! Point tags are derived: `main:entry`, `main:exit`, `main:call:work:1`.

use super::{FunctionInfo, InstPoint, LocationLookup, Program, ProgramStructure, ScriptedHit};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use toolgear_shared::types::program::{PointKind, PointLocation};

#[derive(Debug, Deserialize)]
struct ManifestFile {
    program: String,
    #[serde(default, rename = "module")]
    modules: Vec<ModuleDecl>,
    #[serde(default, rename = "hit")]
    hits: Vec<ScriptedHit>,
}

#[derive(Debug, Deserialize)]
struct ModuleDecl {
    name: String,
    #[serde(default, rename = "function")]
    functions: Vec<FunctionDecl>,
}

#[derive(Debug, Deserialize)]
struct FunctionDecl {
    name: String,
    #[serde(default)]
    file: String,
    #[serde(default)]
    start_line: i32,
    #[serde(default)]
    end_line: i32,
    #[serde(default, rename = "point")]
    points: Vec<PointDecl>,
}

#[derive(Debug, Deserialize)]
struct PointDecl {
    kind: String,
    location: Option<String>,
    callee: Option<String>,
    #[serde(default)]
    line: i32,
}

#[derive(Debug, Clone)]
struct FunctionRecord {
    info: FunctionInfo,
    points: Vec<InstPoint>,
}

/// A program structure loaded from a manifest.
#[derive(Debug, Clone)]
pub struct StaticProgram {
    name: String,
    modules: Vec<(String, Vec<FunctionRecord>)>,
    by_tag: HashMap<String, (usize, usize, usize)>,
    script: Vec<ScriptedHit>,
}

impl StaticProgram {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        Self::from_toml_str(&text)
            .with_context(|| format!("Invalid manifest {}", path.display()))
    }

    /// A program with no instrumentable points.
    pub fn empty(name: &str) -> Self {
        StaticProgram {
            name: name.to_string(),
            modules: Vec::new(),
            by_tag: HashMap::new(),
            script: Vec::new(),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: ManifestFile = toml::from_str(text)?;
        let mut program = StaticProgram {
            name: file.program,
            modules: Vec::new(),
            by_tag: HashMap::new(),
            script: file.hits,
        };

        for module in file.modules {
            let mut functions = Vec::new();
            for func in module.functions {
                let info = FunctionInfo {
                    module: module.name.clone(),
                    name: func.name.clone(),
                    file: func.file,
                    start_line: func.start_line,
                    end_line: func.end_line,
                };
                let points = build_points(&func.name, func.points)?;
                functions.push(FunctionRecord { info, points });
            }
            program.modules.push((module.name, functions));
        }

        for (m, (_, functions)) in program.modules.iter().enumerate() {
            for (f, record) in functions.iter().enumerate() {
                for (p, point) in record.points.iter().enumerate() {
                    if program.by_tag.insert(point.tag.clone(), (m, f, p)).is_some() {
                        anyhow::bail!("Duplicate point tag: {}", point.tag);
                    }
                }
            }
        }
        Ok(program)
    }

    /// Hits the recording backend should replay.
    pub fn script(&self) -> &[ScriptedHit] {
        &self.script
    }

    pub fn point_count(&self) -> usize {
        self.by_tag.len()
    }

    fn module(&self, name: &str) -> Option<&[FunctionRecord]> {
        self.modules
            .iter()
            .find(|(m, _)| m == name)
            .map(|(_, f)| f.as_slice())
    }
}

fn build_points(function: &str, decls: Vec<PointDecl>) -> Result<Vec<InstPoint>> {
    let mut points = Vec::with_capacity(decls.len());
    let mut calls_seen = 0;
    let mut per_line: HashMap<i32, i32> = HashMap::new();

    for decl in decls {
        let kind: PointKind = decl.kind.parse()?;
        let default_location = match kind {
            PointKind::FuncExit => PointLocation::After,
            _ => PointLocation::Before,
        };
        let location = match decl.location {
            Some(loc) => loc.parse()?,
            None => default_location,
        };
        if kind == PointKind::Any || location == PointLocation::Any {
            anyhow::bail!("Point in {} must have a concrete kind and location", function);
        }

        let (tag, call_index) = match kind {
            PointKind::FuncCall => {
                let callee = decl
                    .callee
                    .as_deref()
                    .with_context(|| format!("Call point in {} has no callee", function))?;
                calls_seen += 1;
                (format!("{}:call:{}:{}", function, callee, calls_seen), calls_seen)
            }
            _ => (format!("{}:{}", function, kind), 0),
        };

        let slot = per_line.entry(decl.line).or_insert(0);
        let index_in_line = *slot;
        *slot += 1;

        points.push(InstPoint {
            tag,
            function: function.to_string(),
            kind,
            location,
            callee: decl.callee,
            line: decl.line,
            index_in_line,
            call_index,
        });
    }
    Ok(points)
}

impl ProgramStructure for StaticProgram {
    fn modules(&self) -> Vec<String> {
        self.modules.iter().map(|(m, _)| m.clone()).collect()
    }

    fn functions(&self, module: &str) -> Vec<FunctionInfo> {
        self.module(module)
            .map(|fs| fs.iter().map(|r| r.info.clone()).collect())
            .unwrap_or_default()
    }

    fn points(&self, module: &str, function: &str) -> Vec<InstPoint> {
        self.module(module)
            .and_then(|fs| fs.iter().find(|r| r.info.name == function))
            .map(|r| r.points.clone())
            .unwrap_or_default()
    }
}

impl LocationLookup for StaticProgram {
    fn locate(&self, point_tag: &str) -> Option<(FunctionInfo, InstPoint)> {
        let &(m, f, p) = self.by_tag.get(point_tag)?;
        let record = &self.modules[m].1[f];
        Some((record.info.clone(), record.points[p].clone()))
    }
}

impl Program for StaticProgram {
    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
program = "demo"

[[module]]
name = "demo"

[[module.function]]
name = "main"
file = "main.c"
start_line = 1
end_line = 30

[[module.function.point]]
kind = "entry"
line = 1

[[module.function.point]]
kind = "call"
callee = "work"
line = 12

[[module.function.point]]
kind = "call"
callee = "work"
location = "after"
line = 12

[[module.function.point]]
kind = "exit"
line = 30

[[hit]]
point = "main:entry"
count = 3
"#;

    #[test]
    fn test_manifest_structure() {
        let program = StaticProgram::from_toml_str(MANIFEST).unwrap();
        assert_eq!(program.name(), "demo");
        assert_eq!(program.modules(), vec!["demo".to_string()]);
        assert_eq!(program.functions("demo")[0].file, "main.c");

        let points = program.points("demo", "main");
        let tags: Vec<&str> = points.iter().map(|p| p.tag.as_str()).collect();
        assert_eq!(
            tags,
            vec!["main:entry", "main:call:work:1", "main:call:work:2", "main:exit"]
        );
        assert_eq!(points[2].index_in_line, 1);
        assert_eq!(points[2].location, PointLocation::After);
        assert_eq!(points[3].location, PointLocation::After);
        assert_eq!(program.script()[0].count, 3);
    }

    #[test]
    fn test_locate_by_tag() {
        let program = StaticProgram::from_toml_str(MANIFEST).unwrap();
        let (func, point) = program.locate("main:call:work:1").unwrap();
        assert_eq!(func.name, "main");
        assert_eq!(point.callee.as_deref(), Some("work"));
        assert_eq!(point.match_name(), "work");
        assert!(program.locate("nope").is_none());
    }

    #[test]
    fn test_duplicate_tags_rejected() {
        let text = r#"
program = "dup"
[[module]]
name = "m"
[[module.function]]
name = "f"
[[module.function.point]]
kind = "entry"
[[module.function.point]]
kind = "entry"
"#;
        assert!(StaticProgram::from_toml_str(text).is_err());
    }

    #[test]
    fn test_call_point_requires_callee() {
        let text = r#"
program = "bad"
[[module]]
name = "m"
[[module.function]]
name = "f"
[[module.function.point]]
kind = "call"
"#;
        assert!(StaticProgram::from_toml_str(text).is_err());
    }
}
