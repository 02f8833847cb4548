// OpenSCAD template rendering
// Rewrites top-level assignments of a parametric script from a structured parameter map

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template has no assignment to '{0}'")]
    MissingAssignment(String),
}

/// An OpenSCAD expression
#[derive(Debug, Clone, PartialEq)]
pub enum ScadValue {
    Int(i64),
    Number(f64),
    Bool(bool),
    Str(String),
    /// Reference to another variable
    Ident(String),
    List(Vec<ScadValue>),
    /// Function call such as `concat(a, b)`
    Call(String, Vec<ScadValue>),
}

impl ScadValue {
    pub fn numbers(values: impl IntoIterator<Item = f64>) -> Self {
        ScadValue::List(values.into_iter().map(ScadValue::Number).collect())
    }

    pub fn idents<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        ScadValue::List(names.into_iter().map(|n| ScadValue::Ident(n.into())).collect())
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, items: &[ScadValue]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

impl fmt::Display for ScadValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScadValue::Int(v) => write!(f, "{}", v),
            ScadValue::Number(v) if v.is_finite() => write!(f, "{}", v),
            ScadValue::Number(_) => write!(f, "undef"),
            ScadValue::Bool(v) => write!(f, "{}", v),
            ScadValue::Str(s) => write!(f, "\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
            ScadValue::Ident(name) => write!(f, "{}", name),
            ScadValue::List(items) => {
                write!(f, "[")?;
                write_joined(f, items)?;
                write!(f, "]")
            }
            ScadValue::Call(name, args) => {
                write!(f, "{}(", name)?;
                write_joined(f, args)?;
                write!(f, ")")
            }
        }
    }
}

/// What happens to one assignment of the template
#[derive(Debug, Clone, PartialEq)]
pub enum Substitution {
    /// Keep the name, replace the right-hand side
    Assign(ScadValue),
    /// Replace the whole statement with these assignments
    Expand(Vec<(String, ScadValue)>),
}

/// Assignments to insert right after a marker comment
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub marker: String,
    pub lines: Vec<(String, ScadValue)>,
}

/// Structured parameters for one render, applied in insertion order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScadParams {
    substitutions: Vec<(String, Substitution)>,
    sections: Vec<Section>,
    /// Directory prepended to relative `include <...>` and `use <...>` paths
    library_dir: Option<String>,
}

impl ScadParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&mut self, name: impl Into<String>, value: ScadValue) -> &mut Self {
        self.substitutions.push((name.into(), Substitution::Assign(value)));
        self
    }

    pub fn expand(&mut self, name: impl Into<String>, lines: Vec<(String, ScadValue)>) -> &mut Self {
        self.substitutions.push((name.into(), Substitution::Expand(lines)));
        self
    }

    pub fn insert_after(&mut self, marker: impl Into<String>, lines: Vec<(String, ScadValue)>) -> &mut Self {
        self.sections.push(Section {
            marker: marker.into(),
            lines,
        });
        self
    }

    pub fn library_dir(&mut self, dir: impl Into<String>) -> &mut Self {
        self.library_dir = Some(dir.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Substitution> {
        self.substitutions.iter().rev().find(|(n, _)| n == name).map(|(_, s)| s)
    }
}

/// A top-level `name = expr;` statement found on one line
#[derive(Debug, PartialEq, Eq)]
struct Assignment<'a> {
    indent: &'a str,
    name: &'a str,
    /// Everything after the terminating `;`, usually a comment
    trailer: &'a str,
}

fn parse_assignment(line: &str) -> Option<Assignment<'_>> {
    let body = line.trim_start();
    let indent = &line[..line.len() - body.len()];

    let name_len = body
        .char_indices()
        .take_while(|&(i, c)| c == '_' || c == '$' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit()))
        .count();
    if name_len == 0 {
        return None;
    }
    let name = &body[..name_len];

    let rest = body[name_len..].trim_start();
    let expr = rest.strip_prefix('=')?;
    if expr.starts_with('=') {
        return None;
    }

    let end = statement_end(expr)?;
    Some(Assignment {
        indent,
        name,
        trailer: &expr[end + 1..],
    })
}

/// An `include <path>` or `use <path>` statement
#[derive(Debug, PartialEq, Eq)]
struct LibraryImport<'a> {
    indent: &'a str,
    keyword: &'a str,
    path: &'a str,
    trailer: &'a str,
}

fn parse_import(line: &str) -> Option<LibraryImport<'_>> {
    let body = line.trim_start();
    let indent = &line[..line.len() - body.len()];

    let keyword = ["include", "use"].into_iter().find(|k| body.starts_with(k))?;
    let rest = body[keyword.len()..].trim_start().strip_prefix('<')?;
    let close = rest.find('>')?;
    Some(LibraryImport {
        indent,
        keyword,
        path: &rest[..close],
        trailer: &rest[close + 1..],
    })
}

fn is_absolute_import(path: &str) -> bool {
    path.starts_with('/') || path.starts_with('\\') || path.as_bytes().get(1) == Some(&b':')
}

fn library_path(dir: &str, path: &str) -> String {
    let dir = dir.trim_end_matches(['/', '\\']).replace('\\', "/");
    if dir.is_empty() || dir == "." || is_absolute_import(path) {
        path.to_string()
    } else {
        format!("{}/{}", dir, path)
    }
}

/// Byte index of the `;` closing the statement, skipping string literals
fn statement_end(expr: &str) -> Option<usize> {
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in expr.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            ';' if !in_string => return Some(i),
            _ => {}
        }
    }
    None
}

fn push_assignment(out: &mut String, indent: &str, name: &str, value: &ScadValue, trailer: &str) {
    out.push_str(indent);
    out.push_str(&format!("{} = {};{}", name, value, trailer));
    out.push('\n');
}

/// A parametric script whose top-level assignments can be rewritten
#[derive(Debug, Clone)]
pub struct ScadTemplate {
    source: String,
}

impl ScadTemplate {
    pub fn new(source: impl Into<String>) -> Self {
        Self { source: source.into() }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let source = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        Ok(Self::new(source))
    }

    /// Apply `params` and return the new script text.
    /// Every substituted name must be assigned somewhere in the template.
    pub fn render(&self, params: &ScadParams) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.source.len() + 256);
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut placed_sections = vec![false; params.sections.len()];

        for line in self.source.lines() {
            if let (Some(dir), Some(import)) = (&params.library_dir, parse_import(line)) {
                out.push_str(&format!(
                    "{}{} <{}>{}\n",
                    import.indent,
                    import.keyword,
                    library_path(dir, import.path),
                    import.trailer
                ));
                continue;
            }

            let parsed = parse_assignment(line);
            let substitution = parsed.as_ref().and_then(|a| params.get(a.name).map(|s| (a, s)));

            match substitution {
                Some((assignment, Substitution::Assign(value))) => {
                    seen.insert(assignment.name);
                    push_assignment(&mut out, assignment.indent, assignment.name, value, assignment.trailer);
                }
                Some((assignment, Substitution::Expand(lines))) => {
                    seen.insert(assignment.name);
                    for (name, value) in lines {
                        push_assignment(&mut out, assignment.indent, name, value, "");
                    }
                }
                None => {
                    out.push_str(line);
                    out.push('\n');
                }
            }

            for (i, section) in params.sections.iter().enumerate() {
                if line.trim() == section.marker {
                    placed_sections[i] = true;
                    for (name, value) in &section.lines {
                        push_assignment(&mut out, "", name, value, "");
                    }
                }
            }
        }

        for (name, _) in &params.substitutions {
            if !seen.contains(name.as_str()) {
                return Err(TemplateError::MissingAssignment(name.clone()));
            }
        }

        for (section, placed) in params.sections.iter().zip(placed_sections) {
            if !placed {
                warn!("template has no '{}' marker; skipped {} line(s)", section.marker, section.lines.len());
            }
        }

        debug!("rendered template with {} substitution(s)", seen.len());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = "\
include <src/core/standard.scad>
use <src/core/utility.scad> // helpers
/* [Setup Parameters] */
$fn = 64;
size = [5, 2, 6]; // [1:10]
dxf_file_path = \"examples/example.dxf\";
label = \"a;b\"; // keep
  nested = 1;
/* [Section Adjustments] */
other == 3;
module tray() { cube(size); }
";

    #[test]
    fn test_value_formatting() {
        assert_eq!(ScadValue::Int(3).to_string(), "3");
        assert_eq!(ScadValue::Number(12.5).to_string(), "12.5");
        assert_eq!(ScadValue::Number(-3.0).to_string(), "-3");
        assert_eq!(ScadValue::Number(f64::NAN).to_string(), "undef");
        assert_eq!(ScadValue::Bool(false).to_string(), "false");
        assert_eq!(ScadValue::Str("C:\\a\"b".into()).to_string(), "\"C:\\\\a\\\"b\"");
        assert_eq!(ScadValue::idents(["a", "b"]).to_string(), "[a, b]");
        assert_eq!(
            ScadValue::Call("concat".into(), vec![ScadValue::Ident("x".into()), ScadValue::numbers([1.0])]).to_string(),
            "concat(x, [1])"
        );
    }

    #[test]
    fn test_parse_assignment() {
        let a = parse_assignment("  size = [5, 2, 6]; // [1:10]").unwrap();
        assert_eq!(a.indent, "  ");
        assert_eq!(a.name, "size");
        assert_eq!(a.trailer, " // [1:10]");

        let s = parse_assignment("label = \"a;b\"; // keep").unwrap();
        assert_eq!(s.trailer, " // keep");

        assert!(parse_assignment("other == 3;").is_none());
        assert!(parse_assignment("module tray() { cube(size); }").is_none());
        assert!(parse_assignment("/* [Setup Parameters] */").is_none());
        assert!(parse_assignment("9lives = 1;").is_none());
    }

    #[test]
    fn test_assign_keeps_trailing_comment() {
        let mut params = ScadParams::new();
        params
            .assign("size", ScadValue::List(vec![ScadValue::Int(3), ScadValue::Int(2), ScadValue::Int(6)]))
            .assign("nested", ScadValue::Int(9));

        let out = ScadTemplate::new(TEMPLATE).render(&params).unwrap();
        assert!(out.contains("size = [3, 2, 6]; // [1:10]\n"));
        assert!(out.contains("  nested = 9;\n"));
        assert!(out.contains("dxf_file_path = \"examples/example.dxf\";"));
        assert!(out.contains("module tray() { cube(size); }"));
    }

    #[test]
    fn test_expand_replaces_statement() {
        let mut params = ScadParams::new();
        params.expand(
            "dxf_file_path",
            vec![
                ("dxf_file_paths".into(), ScadValue::List(vec![ScadValue::Str("a.dxf".into())])),
                ("dxf_cut_depths".into(), ScadValue::numbers([10.0])),
            ],
        );

        let out = ScadTemplate::new(TEMPLATE).render(&params).unwrap();
        assert!(!out.contains("examples/example.dxf"));
        assert!(out.contains("dxf_file_paths = [\"a.dxf\"];\ndxf_cut_depths = [10];\n"));
    }

    #[test]
    fn test_section_inserted_after_marker() {
        let mut params = ScadParams::new();
        params.insert_after(
            "/* [Section Adjustments] */",
            vec![("use_section_cut".into(), ScadValue::Bool(false))],
        );

        let out = ScadTemplate::new(TEMPLATE).render(&params).unwrap();
        assert!(out.contains("/* [Section Adjustments] */\nuse_section_cut = false;\nother == 3;"));
    }

    #[test]
    fn test_missing_assignment_is_an_error() {
        let mut params = ScadParams::new();
        params.assign("slot_width", ScadValue::Int(40));
        assert_eq!(
            ScadTemplate::new(TEMPLATE).render(&params),
            Err(TemplateError::MissingAssignment("slot_width".into()))
        );
    }

    #[test]
    fn test_missing_marker_is_skipped() {
        let mut params = ScadParams::new();
        params.insert_after("/* [Nope] */", vec![("x".into(), ScadValue::Int(1))]);
        let out = ScadTemplate::new(TEMPLATE).render(&params).unwrap();
        assert_eq!(out, TEMPLATE);
    }

    #[test]
    fn test_parse_import() {
        let i = parse_import("  use <src/core/utility.scad> // helpers").unwrap();
        assert_eq!(i.indent, "  ");
        assert_eq!(i.keyword, "use");
        assert_eq!(i.path, "src/core/utility.scad");
        assert_eq!(i.trailer, " // helpers");

        assert!(parse_import("include<a.scad>").is_some());
        assert!(parse_import("user = 1;").is_none());
        assert!(parse_import("// use <a.scad>").is_none());
    }

    #[test]
    fn test_library_dir_prefixes_relative_imports() {
        let mut params = ScadParams::new();
        params.library_dir("../");

        let out = ScadTemplate::new(TEMPLATE).render(&params).unwrap();
        assert!(out.starts_with("include <../src/core/standard.scad>\nuse <../src/core/utility.scad> // helpers\n"));
        assert!(out.contains("size = [5, 2, 6]; // [1:10]"));
    }

    #[test]
    fn test_library_paths() {
        assert_eq!(library_path("..", "src/a.scad"), "../src/a.scad");
        assert_eq!(library_path("C:\\libs\\gf\\", "src/a.scad"), "C:/libs/gf/src/a.scad");
        assert_eq!(library_path(".", "src/a.scad"), "src/a.scad");
        assert_eq!(library_path("", "src/a.scad"), "src/a.scad");
        assert_eq!(library_path("..", "/opt/gf/a.scad"), "/opt/gf/a.scad");
    }

    #[test]
    fn test_imports_untouched_without_library_dir() {
        let out = ScadTemplate::new(TEMPLATE).render(&ScadParams::new()).unwrap();
        assert!(out.starts_with("include <src/core/standard.scad>\n"));
    }
}
