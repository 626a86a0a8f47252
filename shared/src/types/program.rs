//! Program-structure vocabulary shared by collectors and clients
//!
//! Instrumentation point kinds, data-attribute types and message tracebacks
//! travel over the wire as short strings; these types own the conversions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of instrumentation point. `Any` is only meaningful as a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointKind {
    FuncEntry,
    FuncExit,
    FuncCall,
    Any,
}

impl PointKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PointKind::FuncEntry => "entry",
            PointKind::FuncExit => "exit",
            PointKind::FuncCall => "call",
            PointKind::Any => "*",
        }
    }

    /// Filter semantics: `Any` matches every concrete kind.
    pub fn matches(self, actual: PointKind) -> bool {
        self == PointKind::Any || self == actual
    }
}

impl FromStr for PointKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "entry" | "funcentry" => Ok(PointKind::FuncEntry),
            "exit" | "funcexit" => Ok(PointKind::FuncExit),
            "call" | "funccall" => Ok(PointKind::FuncCall),
            "*" | "any" | "invalid" | "" => Ok(PointKind::Any),
            _ => anyhow::bail!("Invalid point kind: {}", s),
        }
    }
}

impl fmt::Display for PointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a probe fires relative to its point. `Any` is only meaningful as a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointLocation {
    Before,
    After,
    Any,
}

impl PointLocation {
    pub fn as_str(self) -> &'static str {
        match self {
            PointLocation::Before => "before",
            PointLocation::After => "after",
            PointLocation::Any => "*",
        }
    }

    pub fn matches(self, actual: PointLocation) -> bool {
        self == PointLocation::Any || self == actual
    }
}

impl FromStr for PointLocation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "before" => Ok(PointLocation::Before),
            "after" => Ok(PointLocation::After),
            "*" | "any" | "" => Ok(PointLocation::Any),
            _ => anyhow::bail!("Invalid point location: {}", s),
        }
    }
}

impl fmt::Display for PointLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared type of a data attribute column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Int,
    Double,
}

impl DataType {
    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Int => "int",
            DataType::Double => "double",
        }
    }
}

impl FromStr for DataType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "int" => Ok(DataType::Int),
            "double" => Ok(DataType::Double),
            _ => anyhow::bail!("Invalid data type: {}", s),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A statistic over a set of values.
///
/// Used both across the (task, thread) pairs of one entry and across the
/// children of a roll-up level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatKind {
    Sum,
    Mean,
    Max,
    Min,
    Count,
    StdDev,
}

impl StatKind {
    pub const ALL: [StatKind; 6] = [
        StatKind::Sum,
        StatKind::Mean,
        StatKind::Max,
        StatKind::Min,
        StatKind::Count,
        StatKind::StdDev,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StatKind::Sum => "sum",
            StatKind::Mean => "mean",
            StatKind::Max => "max",
            StatKind::Min => "min",
            StatKind::Count => "count",
            StatKind::StdDev => "stddev",
        }
    }
}

impl FromStr for StatKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sum" => Ok(StatKind::Sum),
            "mean" => Ok(StatKind::Mean),
            "max" => Ok(StatKind::Max),
            "min" => Ok(StatKind::Min),
            "count" => Ok(StatKind::Count),
            "stddev" => Ok(StatKind::StdDev),
            _ => anyhow::bail!("Invalid statistic: {}", s),
        }
    }
}

impl fmt::Display for StatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Default statistic pair suggested for a data attribute.
///
/// `per_entry` folds the (task, thread) values of one entry; `rollup` folds
/// entries into their function, file and application. Wire form is
/// `"<per_entry>/<rollup>"`, a bare `"<stat>"` meaning the same stat twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestedStat {
    pub per_entry: StatKind,
    pub rollup: StatKind,
}

impl Default for SuggestedStat {
    fn default() -> Self {
        Self {
            per_entry: StatKind::Sum,
            rollup: StatKind::Sum,
        }
    }
}

impl FromStr for SuggestedStat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((a, b)) => Ok(Self {
                per_entry: a.trim().parse()?,
                rollup: b.trim().parse()?,
            }),
            None => {
                let stat: StatKind = s.trim().parse()?;
                Ok(Self {
                    per_entry: stat,
                    rollup: stat,
                })
            }
        }
    }
}

impl fmt::Display for SuggestedStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.per_entry, self.rollup)
    }
}

/// One frame of a message traceback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracebackFrame {
    pub file: String,
    pub line: i32,
    pub function: String,
}

/// An ordered list of program locations attached to a diagnostic message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Traceback {
    pub frames: Vec<TracebackFrame>,
}

impl Traceback {
    /// Wire form: frames separated by newlines, fields by tabs.
    pub fn to_wire(&self) -> String {
        self.frames
            .iter()
            .map(|f| format!("{}\t{}\t{}", f.file, f.line, f.function))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn from_wire(s: &str) -> anyhow::Result<Self> {
        if s.is_empty() {
            return Ok(Self::default());
        }
        let mut frames = Vec::new();
        for line in s.split('\n') {
            let mut parts = line.splitn(3, '\t');
            let file = parts.next().unwrap_or_default().to_string();
            let line_no = parts
                .next()
                .ok_or_else(|| anyhow::anyhow!("traceback frame missing line: {:?}", line))?
                .parse::<i32>()?;
            let function = parts.next().unwrap_or_default().to_string();
            frames.push(TracebackFrame {
                file,
                line: line_no,
                function,
            });
        }
        Ok(Self { frames })
    }
}
