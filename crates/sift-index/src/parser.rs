//! Symbol extraction using tree-sitter.
//!
//! Finds the declarations in a source file (functions, methods, types,
//! impls, classes...) together with their docs, visibility, the file's
//! imports and the calls made inside each declaration. Extraction never
//! fails: unsupported or unparsable input yields an empty list and the
//! chunker falls back to fixed-size segments.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;
use tree_sitter::{Node, Parser};

/// Languages the extractor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Rust,
    Python,
    JavaScript,
    TypeScript,
    Go,
}

impl Language {
    /// Detect language from file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "rs" => Some(Self::Rust),
            "py" => Some(Self::Python),
            "js" | "jsx" | "mjs" | "cjs" => Some(Self::JavaScript),
            "ts" | "tsx" => Some(Self::TypeScript),
            "go" => Some(Self::Go),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rust => "rust",
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Go => "go",
        }
    }

    fn grammar(&self, path: &Path) -> tree_sitter::Language {
        match self {
            Self::Rust => tree_sitter_rust::LANGUAGE.into(),
            Self::Python => tree_sitter_python::LANGUAGE.into(),
            Self::JavaScript => tree_sitter_javascript::LANGUAGE.into(),
            Self::TypeScript => {
                if path.extension().and_then(|e| e.to_str()) == Some("tsx") {
                    tree_sitter_typescript::LANGUAGE_TSX.into()
                } else {
                    tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()
                }
            }
            Self::Go => tree_sitter_go::LANGUAGE.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RustKind {
    Function,
    Method,
    Struct,
    Enum,
    Trait,
    Impl,
    Const,
    Static,
    Module,
    Macro,
    TypeAlias,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PythonKind {
    Function,
    Method,
    Class,
}

/// JavaScript and TypeScript declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JsKind {
    Function,
    Method,
    Class,
    Interface,
    TypeAlias,
    Enum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoKind {
    Function,
    Method,
    Struct,
    Interface,
    Type,
}

/// What kind of declaration a symbol is, per language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "language", content = "kind", rename_all = "lowercase")]
pub enum SymbolKind {
    Rust(RustKind),
    Python(PythonKind),
    #[serde(rename = "javascript")]
    JavaScript(JsKind),
    Go(GoKind),
    /// Recognised as a declaration but not classifiable.
    Unknown,
}

impl SymbolKind {
    /// Language-neutral name, e.g. `"function"` or `"struct"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rust(k) => match k {
                RustKind::Function => "function",
                RustKind::Method => "method",
                RustKind::Struct => "struct",
                RustKind::Enum => "enum",
                RustKind::Trait => "trait",
                RustKind::Impl => "impl",
                RustKind::Const => "const",
                RustKind::Static => "static",
                RustKind::Module => "module",
                RustKind::Macro => "macro",
                RustKind::TypeAlias => "type_alias",
            },
            Self::Python(k) => match k {
                PythonKind::Function => "function",
                PythonKind::Method => "method",
                PythonKind::Class => "class",
            },
            Self::JavaScript(k) => match k {
                JsKind::Function => "function",
                JsKind::Method => "method",
                JsKind::Class => "class",
                JsKind::Interface => "interface",
                JsKind::TypeAlias => "type_alias",
                JsKind::Enum => "enum",
            },
            Self::Go(k) => match k {
                GoKind::Function => "function",
                GoKind::Method => "method",
                GoKind::Struct => "struct",
                GoKind::Interface => "interface",
                GoKind::Type => "type",
            },
            Self::Unknown => "unknown",
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(self.as_str(), "function" | "method")
    }
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    /// `pub(crate)`, `protected` and similar.
    Restricted,
    Private,
}

/// A declaration found in a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    /// 1-indexed, inclusive.
    pub start_line: usize,
    /// 1-indexed, inclusive.
    pub end_line: usize,
    pub visibility: Option<Visibility>,
    pub docstring: Option<String>,
    /// The file's imports, shared by every symbol of the file.
    pub imports: Vec<String>,
    /// Callee names in first-call order, deduplicated.
    pub calls: Vec<String>,
    /// Enclosing impl / class / trait, if any.
    pub parent: Option<String>,
}

/// Source of symbols for the chunker.
pub trait SymbolExtractor: Send + Sync {
    /// Declarations in `content`, in file order. Empty if the language is
    /// unsupported or parsing fails.
    fn parse(&self, path: &Path, content: &str) -> Vec<Symbol>;
}

/// Extractor backed by tree-sitter grammars.
#[derive(Debug, Clone, Default)]
pub struct TreeSitterExtractor;

impl TreeSitterExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Get supported file extensions.
    pub fn supported_extensions() -> &'static [&'static str] {
        &["rs", "py", "js", "jsx", "mjs", "cjs", "ts", "tsx", "go"]
    }
}

impl SymbolExtractor for TreeSitterExtractor {
    fn parse(&self, path: &Path, content: &str) -> Vec<Symbol> {
        let Some(language) = Language::from_path(path) else {
            return Vec::new();
        };
        let mut parser = Parser::new();
        if let Err(e) = parser.set_language(&language.grammar(path)) {
            debug!("Grammar for {} unavailable: {}", language.as_str(), e);
            return Vec::new();
        }
        let Some(tree) = parser.parse(content, None) else {
            debug!("Failed to parse {:?}", path);
            return Vec::new();
        };
        if tree.root_node().has_error() {
            debug!("{:?} has syntax errors, extracting what parsed", path);
        }

        let walker = Walker {
            language,
            source: content,
        };
        walker.extract(tree.root_node())
    }
}

/// A declaration recognised at some node.
struct Found {
    kind: SymbolKind,
    name: String,
    /// Descend into the body for member declarations.
    container: bool,
}

struct Frame<'t> {
    node: Node<'t>,
    /// Node kind and name of the enclosing container.
    parent: Option<(&'static str, String)>,
    exported: bool,
}

struct Walker<'s> {
    language: Language,
    source: &'s str,
}

impl<'s> Walker<'s> {
    fn extract(&self, root: Node<'_>) -> Vec<Symbol> {
        let imports = self.imports(root);
        let mut symbols = Vec::new();
        let mut stack = vec![Frame {
            node: root,
            parent: None,
            exported: false,
        }];

        while let Some(frame) = stack.pop() {
            let node = frame.node;
            let kind = node.kind();

            if kind == "export_statement" {
                self.push_children(&mut stack, node, frame.parent.clone(), true);
                continue;
            }

            // Decorators belong to the definition they wrap.
            let target = if kind == "decorated_definition" {
                match node.child_by_field_name("definition") {
                    Some(def) => def,
                    None => continue,
                }
            } else {
                node
            };

            let container_kind = frame.parent.as_ref().map(|(k, _)| *k);
            match self.classify(target, container_kind) {
                Some(found) => {
                    let symbol = Symbol {
                        start_line: node.start_position().row + 1,
                        end_line: end_line(node),
                        visibility: self.visibility(target, &found.name, frame.exported),
                        docstring: self.docstring(target, node),
                        imports: imports.clone(),
                        calls: self.calls(target),
                        parent: frame.parent.as_ref().map(|(_, name)| name.clone()),
                        name: found.name.clone(),
                        kind: found.kind,
                    };
                    if found.container {
                        self.push_children(
                            &mut stack,
                            target,
                            Some((target.kind(), found.name)),
                            false,
                        );
                    }
                    symbols.push(symbol);
                }
                None => self.push_children(&mut stack, node, frame.parent, frame.exported),
            }
        }

        symbols.sort_by(|a, b| {
            a.start_line
                .cmp(&b.start_line)
                .then(b.end_line.cmp(&a.end_line))
        });
        symbols
    }

    fn push_children<'t>(
        &self,
        stack: &mut Vec<Frame<'t>>,
        node: Node<'t>,
        parent: Option<(&'static str, String)>,
        exported: bool,
    ) {
        let mut cursor = node.walk();
        let children: Vec<Node<'t>> = node.named_children(&mut cursor).collect();
        for child in children.into_iter().rev() {
            stack.push(Frame {
                node: child,
                parent: parent.clone(),
                exported,
            });
        }
    }

    fn classify(&self, node: Node<'_>, container: Option<&str>) -> Option<Found> {
        let kind = node.kind();
        let named = |k: SymbolKind, field: &str, container: bool| {
            let name = self.field_text(node, field)?;
            Some(Found {
                kind: k,
                name,
                container,
            })
        };

        match self.language {
            Language::Rust => match kind {
                "function_item" | "function_signature_item" => {
                    let k = if matches!(container, Some("impl_item" | "trait_item")) {
                        RustKind::Method
                    } else {
                        RustKind::Function
                    };
                    named(SymbolKind::Rust(k), "name", false)
                }
                "struct_item" => named(SymbolKind::Rust(RustKind::Struct), "name", false),
                "enum_item" => named(SymbolKind::Rust(RustKind::Enum), "name", false),
                "trait_item" => named(SymbolKind::Rust(RustKind::Trait), "name", true),
                "impl_item" => named(SymbolKind::Rust(RustKind::Impl), "type", true),
                "const_item" => named(SymbolKind::Rust(RustKind::Const), "name", false),
                "static_item" => named(SymbolKind::Rust(RustKind::Static), "name", false),
                "mod_item" => {
                    let has_body = node.child_by_field_name("body").is_some();
                    named(SymbolKind::Rust(RustKind::Module), "name", has_body)
                }
                "macro_definition" => named(SymbolKind::Rust(RustKind::Macro), "name", false),
                "type_item" => named(SymbolKind::Rust(RustKind::TypeAlias), "name", false),
                _ => None,
            },
            Language::Python => match kind {
                "function_definition" => {
                    let k = if container == Some("class_definition") {
                        PythonKind::Method
                    } else {
                        PythonKind::Function
                    };
                    named(SymbolKind::Python(k), "name", false)
                }
                "class_definition" => named(SymbolKind::Python(PythonKind::Class), "name", true),
                _ => None,
            },
            Language::JavaScript | Language::TypeScript => match kind {
                "function_declaration" | "generator_function_declaration" => {
                    named(SymbolKind::JavaScript(JsKind::Function), "name", false)
                }
                "class_declaration" | "abstract_class_declaration" | "class" => {
                    named(SymbolKind::JavaScript(JsKind::Class), "name", true)
                }
                "method_definition" => named(SymbolKind::JavaScript(JsKind::Method), "name", false),
                "interface_declaration" => {
                    named(SymbolKind::JavaScript(JsKind::Interface), "name", false)
                }
                "type_alias_declaration" => {
                    named(SymbolKind::JavaScript(JsKind::TypeAlias), "name", false)
                }
                "enum_declaration" => named(SymbolKind::JavaScript(JsKind::Enum), "name", false),
                "lexical_declaration" | "variable_declaration" => {
                    self.function_binding(node).map(|name| Found {
                        kind: SymbolKind::JavaScript(JsKind::Function),
                        name,
                        container: false,
                    })
                }
                _ => None,
            },
            Language::Go => match kind {
                "function_declaration" => named(SymbolKind::Go(GoKind::Function), "name", false),
                "method_declaration" => named(SymbolKind::Go(GoKind::Method), "name", false),
                "type_declaration" => {
                    let mut cursor = node.walk();
                    let spec = node
                        .named_children(&mut cursor)
                        .find(|c| c.kind() == "type_spec" || c.kind() == "type_alias")?;
                    let name = self.field_text(spec, "name")?;
                    let k = match spec.child_by_field_name("type").map(|t| t.kind()) {
                        Some("struct_type") => GoKind::Struct,
                        Some("interface_type") => GoKind::Interface,
                        _ => GoKind::Type,
                    };
                    Some(Found {
                        kind: SymbolKind::Go(k),
                        name,
                        container: false,
                    })
                }
                _ => None,
            },
        }
    }

    /// `const f = () => ...` and friends.
    fn function_binding(&self, node: Node<'_>) -> Option<String> {
        let mut cursor = node.walk();
        let declarators: Vec<Node<'_>> = node
            .named_children(&mut cursor)
            .filter(|c| c.kind() == "variable_declarator")
            .collect();
        declarators.into_iter().find_map(|decl| {
            let value = decl.child_by_field_name("value")?;
            match value.kind() {
                "arrow_function" | "function_expression" | "function" | "generator_function" => {
                    self.field_text(decl, "name")
                }
                _ => None,
            }
        })
    }

    fn visibility(&self, node: Node<'_>, name: &str, exported: bool) -> Option<Visibility> {
        match self.language {
            Language::Rust => {
                let mut cursor = node.walk();
                let modifier = node
                    .children(&mut cursor)
                    .find(|c| c.kind() == "visibility_modifier")
                    .map(|m| self.text(m).to_string());
                Some(match modifier.as_deref() {
                    Some("pub") => Visibility::Public,
                    Some(_) => Visibility::Restricted,
                    None => Visibility::Private,
                })
            }
            Language::Python => {
                let dunder = name.starts_with("__") && name.ends_with("__");
                Some(if name.starts_with('_') && !dunder {
                    Visibility::Private
                } else {
                    Visibility::Public
                })
            }
            Language::JavaScript | Language::TypeScript => {
                let mut cursor = node.walk();
                let accessibility = node
                    .children(&mut cursor)
                    .find(|c| c.kind() == "accessibility_modifier")
                    .map(|m| self.text(m).to_string());
                Some(match accessibility.as_deref() {
                    Some("private") => Visibility::Private,
                    Some("protected") => Visibility::Restricted,
                    Some(_) => Visibility::Public,
                    None if name.starts_with('#') => Visibility::Private,
                    None if node.kind() == "method_definition" || exported => Visibility::Public,
                    None => Visibility::Private,
                })
            }
            Language::Go => Some(
                if name.chars().next().map(char::is_uppercase).unwrap_or(false) {
                    Visibility::Public
                } else {
                    Visibility::Private
                },
            ),
        }
    }

    /// Python docstrings come from the body; everything else from the
    /// comments directly above `outer`.
    fn docstring(&self, node: Node<'_>, outer: Node<'_>) -> Option<String> {
        if self.language == Language::Python {
            let body = node.child_by_field_name("body")?;
            let first = body.named_child(0)?;
            if first.kind() != "expression_statement" {
                return None;
            }
            let string = first.named_child(0).filter(|s| s.kind() == "string")?;
            let doc = self
                .text(string)
                .trim_start_matches(['r', 'b', 'u', 'f', 'R', 'B', 'U', 'F'])
                .trim_matches('"')
                .trim_matches('\'')
                .trim();
            return (!doc.is_empty()).then(|| doc.to_string());
        }

        // Comments sit before an `export` wrapper, not the declaration.
        let anchor = match outer.parent() {
            Some(p) if p.kind() == "export_statement" => p,
            _ => outer,
        };

        let mut lines = Vec::new();
        let mut expected_row = anchor.start_position().row;
        let mut sibling = anchor.prev_sibling();
        while let Some(prev) = sibling {
            if prev.kind() == "attribute_item" {
                expected_row = prev.start_position().row;
                sibling = prev.prev_sibling();
                continue;
            }
            if !prev.kind().contains("comment") || prev.end_position().row + 1 < expected_row {
                break;
            }
            let text = self.text(prev);
            let is_doc = match self.language {
                Language::Rust => text.starts_with("///") || text.starts_with("/**"),
                Language::JavaScript | Language::TypeScript => text.starts_with("/**"),
                _ => true,
            };
            if !is_doc {
                break;
            }
            lines.push(strip_comment(text));
            expected_row = prev.start_position().row;
            sibling = prev.prev_sibling();
        }

        if lines.is_empty() {
            return None;
        }
        lines.reverse();
        let doc = lines.join("\n").trim().to_string();
        (!doc.is_empty()).then_some(doc)
    }

    /// Top-level imports of the file.
    fn imports(&self, root: Node<'_>) -> Vec<String> {
        let mut imports = Vec::new();
        let mut cursor = root.walk();
        for child in root.named_children(&mut cursor) {
            match (self.language, child.kind()) {
                (Language::Rust, "use_declaration") => {
                    if let Some(arg) = self.field_text(child, "argument") {
                        imports.push(collapse_whitespace(&arg));
                    }
                }
                (Language::Python, "import_statement" | "import_from_statement") => {
                    imports.push(collapse_whitespace(self.text(child)));
                }
                (Language::JavaScript | Language::TypeScript, "import_statement") => {
                    if let Some(source) = self.field_text(child, "source") {
                        imports.push(unquote(&source));
                    }
                }
                (Language::Go, "import_declaration") => {
                    let mut stack = vec![child];
                    while let Some(node) = stack.pop() {
                        if node.kind() == "import_spec" {
                            if let Some(path) = self.field_text(node, "path") {
                                imports.push(unquote(&path));
                            }
                            continue;
                        }
                        let mut c = node.walk();
                        let children: Vec<_> = node.named_children(&mut c).collect();
                        stack.extend(children.into_iter().rev());
                    }
                }
                _ => {}
            }
        }
        imports
    }

    /// Names called anywhere inside `node`, first occurrence first.
    fn calls(&self, node: Node<'_>) -> Vec<String> {
        let mut calls: Vec<String> = Vec::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            let callee = match current.kind() {
                "call_expression" | "call" => current
                    .child_by_field_name("function")
                    .and_then(|f| last_identifier(self.text(f))),
                "macro_invocation" => current
                    .child_by_field_name("macro")
                    .and_then(|m| last_identifier(self.text(m)))
                    .map(|m| format!("{m}!")),
                _ => None,
            };
            if let Some(name) = callee {
                if !calls.contains(&name) {
                    calls.push(name);
                }
            }
            let mut cursor = current.walk();
            let children: Vec<_> = current.named_children(&mut cursor).collect();
            stack.extend(children.into_iter().rev());
        }
        calls
    }

    fn field_text(&self, node: Node<'_>, field: &str) -> Option<String> {
        node.child_by_field_name(field)
            .map(|n| self.text(n).to_string())
            .filter(|s| !s.is_empty())
    }

    fn text(&self, node: Node<'_>) -> &'s str {
        self.source.get(node.byte_range()).unwrap_or("")
    }
}

/// Last line covered by `node`, not counting a trailing newline.
fn end_line(node: Node<'_>) -> usize {
    let start = node.start_position().row;
    let end = node.end_position();
    if end.column == 0 && end.row > start {
        end.row
    } else {
        end.row + 1
    }
}

fn strip_comment(text: &str) -> String {
    text.lines()
        .map(|line| {
            let line = line.trim();
            let line = line
                .strip_prefix("///")
                .or_else(|| line.strip_prefix("//!"))
                .or_else(|| line.strip_prefix("//"))
                .or_else(|| line.strip_prefix("/**"))
                .or_else(|| line.strip_prefix("/*"))
                .or_else(|| line.strip_prefix('#'))
                .unwrap_or(line);
            let line = line.strip_suffix("*/").unwrap_or(line);
            let line = line.trim_start().strip_prefix('*').unwrap_or(line);
            line.trim().to_string()
        })
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn last_identifier(text: &str) -> Option<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|s| !s.is_empty())
        .last()
        .map(str::to_string)
}

fn unquote(text: &str) -> String {
    text.trim_matches(|c| c == '"' || c == '\'' || c == '`').to_string()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(file: &str, source: &str) -> Vec<Symbol> {
        TreeSitterExtractor::new().parse(Path::new(file), source)
    }

    fn find<'a>(symbols: &'a [Symbol], name: &str) -> &'a Symbol {
        symbols
            .iter()
            .find(|s| s.name == name)
            .unwrap_or_else(|| panic!("no symbol {name} in {symbols:?}"))
    }

    #[test]
    fn test_detect_language() {
        assert_eq!(Language::from_path(Path::new("foo.rs")), Some(Language::Rust));
        assert_eq!(Language::from_path(Path::new("bar.py")), Some(Language::Python));
        assert_eq!(
            Language::from_path(Path::new("component.jsx")),
            Some(Language::JavaScript)
        );
        assert_eq!(
            Language::from_path(Path::new("component.tsx")),
            Some(Language::TypeScript)
        );
        assert_eq!(Language::from_path(Path::new("main.go")), Some(Language::Go));
        assert_eq!(Language::from_path(Path::new("unknown.xyz")), None);
    }

    #[test]
    fn test_rust_symbols() {
        let source = r#"use std::collections::HashMap;
use crate::store::Store;

/// A point in space.
#[derive(Debug)]
pub struct Point {
    x: f64,
}

impl Point {
    pub fn new(x: f64) -> Self {
        Self { x }
    }

    fn norm(&self) -> f64 {
        self.x.abs()
    }
}

pub(crate) fn helper() -> usize {
    let p = Point::new(1.0);
    let n = p.norm();
    println!("{}", n);
    compute(2)
}
"#;
        let symbols = parse("lib.rs", source);

        let point = find(&symbols, "Point");
        assert_eq!(point.kind, SymbolKind::Rust(RustKind::Struct));
        assert_eq!(point.docstring.as_deref(), Some("A point in space."));
        assert_eq!(point.visibility, Some(Visibility::Public));
        assert_eq!(point.start_line, 6);
        assert_eq!(point.end_line, 8);
        assert_eq!(
            point.imports,
            vec!["std::collections::HashMap", "crate::store::Store"]
        );

        let new = find(&symbols, "new");
        assert_eq!(new.kind, SymbolKind::Rust(RustKind::Method));
        assert_eq!(new.parent.as_deref(), Some("Point"));

        let norm = find(&symbols, "norm");
        assert_eq!(norm.visibility, Some(Visibility::Private));

        let helper = find(&symbols, "helper");
        assert_eq!(helper.kind, SymbolKind::Rust(RustKind::Function));
        assert_eq!(helper.visibility, Some(Visibility::Restricted));
        assert_eq!(helper.calls, vec!["new", "norm", "println!", "compute"]);

        let imp = symbols
            .iter()
            .find(|s| s.kind == SymbolKind::Rust(RustKind::Impl))
            .unwrap();
        assert_eq!(imp.name, "Point");
    }

    #[test]
    fn test_symbols_sorted_container_first() {
        let source = "impl Foo {\n    fn a() {}\n    fn b() {}\n}\n";
        let symbols = parse("x.rs", source);
        let names: Vec<&str> = symbols.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Foo", "a", "b"]);
        assert_eq!((symbols[0].start_line, symbols[0].end_line), (1, 4));
    }

    #[test]
    fn test_python_symbols() {
        let source = r#"import os
from typing import List

class Calculator:
    """Adds things up."""

    def __init__(self, value=0):
        self.value = value

    def _reset(self):
        self.value = 0

@cache
def standalone(x):
    return os.path.join(x)
"#;
        let symbols = parse("calc.py", source);

        let class = find(&symbols, "Calculator");
        assert_eq!(class.kind, SymbolKind::Python(PythonKind::Class));
        assert_eq!(class.docstring.as_deref(), Some("Adds things up."));
        assert_eq!(class.imports, vec!["import os", "from typing import List"]);

        let init = find(&symbols, "__init__");
        assert_eq!(init.kind, SymbolKind::Python(PythonKind::Method));
        assert_eq!(init.visibility, Some(Visibility::Public));
        assert_eq!(find(&symbols, "_reset").visibility, Some(Visibility::Private));

        let standalone = find(&symbols, "standalone");
        assert_eq!(standalone.kind, SymbolKind::Python(PythonKind::Function));
        // Span includes the decorator.
        assert_eq!(standalone.start_line, 13);
        assert_eq!(standalone.calls, vec!["join"]);
    }

    #[test]
    fn test_typescript_symbols() {
        let source = r#"import { api } from "./api";

/** A user record. */
export interface User {
    id: number;
}

export function greet(user: User): string {
    return format(user.id);
}

const shout = (s: string) => s.toUpperCase();

class Greeter {
    private secret(): void {}
    hello() { greet(this.user); }
}
"#;
        let symbols = parse("app.ts", source);

        let user = find(&symbols, "User");
        assert_eq!(user.kind, SymbolKind::JavaScript(JsKind::Interface));
        assert_eq!(user.docstring.as_deref(), Some("A user record."));
        assert_eq!(user.visibility, Some(Visibility::Public));
        assert_eq!(user.imports, vec!["./api"]);

        assert_eq!(find(&symbols, "greet").calls, vec!["format"]);
        assert_eq!(
            find(&symbols, "shout").kind,
            SymbolKind::JavaScript(JsKind::Function)
        );
        assert_eq!(find(&symbols, "shout").visibility, Some(Visibility::Private));
        assert_eq!(find(&symbols, "secret").visibility, Some(Visibility::Private));
        assert_eq!(
            find(&symbols, "hello").kind,
            SymbolKind::JavaScript(JsKind::Method)
        );
    }

    #[test]
    fn test_go_symbols() {
        let source = r#"package main

import (
    "fmt"
    "math"
)

// Point is a 2D point.
type Point struct {
    X float64
}

type Shape interface {
    Area() float64
}

func (p *Point) Distance(o *Point) float64 {
    return math.Sqrt(p.X - o.X)
}

func helper() {
    fmt.Println("hi")
}
"#;
        let symbols = parse("main.go", source);

        let point = find(&symbols, "Point");
        assert_eq!(point.kind, SymbolKind::Go(GoKind::Struct));
        assert_eq!(point.docstring.as_deref(), Some("Point is a 2D point."));
        assert_eq!(point.imports, vec!["fmt", "math"]);

        assert_eq!(find(&symbols, "Shape").kind, SymbolKind::Go(GoKind::Interface));
        let distance = find(&symbols, "Distance");
        assert_eq!(distance.kind, SymbolKind::Go(GoKind::Method));
        assert_eq!(distance.calls, vec!["Sqrt"]);
        assert_eq!(find(&symbols, "helper").visibility, Some(Visibility::Private));
    }

    #[test]
    fn test_unsupported_and_empty_input() {
        assert!(parse("main.c", "int main() { return 0; }").is_empty());
        assert!(parse("empty.rs", "").is_empty());
        assert!(parse("comment.py", "# nothing here\n").is_empty());
    }

    #[test]
    fn test_kind_names_and_serde() {
        assert_eq!(SymbolKind::Rust(RustKind::Impl).as_str(), "impl");
        assert_eq!(SymbolKind::Go(GoKind::Method).to_string(), "method");
        assert!(SymbolKind::Python(PythonKind::Method).is_callable());
        assert!(!SymbolKind::Unknown.is_callable());

        let json = serde_json::to_string(&SymbolKind::JavaScript(JsKind::TypeAlias)).unwrap();
        assert_eq!(json, r#"{"language":"javascript","kind":"type_alias"}"#);
        let back: SymbolKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SymbolKind::JavaScript(JsKind::TypeAlias));
    }
}
