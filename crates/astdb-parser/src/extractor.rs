//! Table-driven metadata extraction: modifiers, docstrings, imports and
//! exports, annotations, and language-specific attributes.
//!
//! Imports and exports are parsed once per file into a `FileContext`; a
//! node's metadata then joins against that context. One ill-formed import
//! never discards the well-formed ones in the same file — failures are
//! collected as warnings on the context.

use crate::classifier::{is_comment_kind, Classified};
use astdb_core::{ExportInfo, ImportInfo, Language, NodeKind, NodeMetadata};
use std::collections::{BTreeMap, BTreeSet};
use tree_sitter::{Node, Tree};

const MAX_DOCSTRING_LEN: usize = 2048;

/// Per-file import/export tables plus the warnings gathered while building
/// them.
#[derive(Debug, Default)]
pub struct FileContext {
    pub imports: BTreeMap<String, ImportInfo>,
    pub exports: BTreeMap<String, ExportInfo>,
    pub warnings: Vec<String>,
}

pub struct MetadataExtractor {
    language: Language,
    max_docstring_len: usize,
}

impl MetadataExtractor {
    pub fn new(language: Language) -> Self {
        Self {
            language,
            max_docstring_len: MAX_DOCSTRING_LEN,
        }
    }

    pub fn with_max_docstring_len(mut self, len: usize) -> Self {
        self.max_docstring_len = len;
        self
    }

    /// Build the per-file context in one pass over the tree.
    pub fn file_context(&self, tree: &Tree, source: &str) -> FileContext {
        let mut ctx = FileContext::default();
        let root = tree.root_node();
        let mut cursor = root.walk();
        for child in root.children(&mut cursor) {
            self.collect_imports(child, source, &mut ctx);
            self.collect_exports(child, source, &mut ctx);
        }
        ctx
    }

    /// Assemble metadata for one classified node against the file context.
    pub fn extract(
        &self,
        classified: &Classified<'_>,
        source: &str,
        ctx: &FileContext,
    ) -> NodeMetadata {
        let node = classified.ts_node;
        let mut metadata = NodeMetadata {
            language: Some(self.language.clone()),
            scope: classified.scope.clone(),
            ..Default::default()
        };

        metadata.modifiers = self.modifiers(node, source, classified.name.as_deref());
        metadata.docstring = self.docstring(node, source);
        metadata.annotations = self.annotations(node, source);
        metadata.language_specific = self.language_specific(node, source);

        // The subset of file imports whose local name appears inside this
        // node's text.
        if let Ok(text) = node.utf8_text(source.as_bytes()) {
            for local in ctx.imports.keys() {
                if contains_identifier(text, local) {
                    metadata.imports.insert(local.clone());
                }
            }
        }

        if let Some(name) = &classified.name {
            if let Some(export) = ctx.exports.get(name) {
                metadata.exports.insert(if export.is_default {
                    "default".to_string()
                } else {
                    name.clone()
                });
            }
        }

        metadata
    }

    // ---- modifiers ----

    fn modifiers(&self, node: Node<'_>, source: &str, name: Option<&str>) -> BTreeSet<String> {
        let mut modifiers = BTreeSet::new();

        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            if let Some(modifier) = syntactic_modifier(&self.language, child, source) {
                modifiers.insert(modifier);
            }
            // Accessibility keywords frequently sit inside a dedicated
            // modifiers child.
            if matches!(child.kind(), "modifiers" | "accessibility_modifier") {
                let mut inner = child.walk();
                for token in child.children(&mut inner) {
                    if let Some(modifier) = keyword_modifier(token.kind()) {
                        modifiers.insert(modifier);
                    }
                }
                if let Some(modifier) = keyword_modifier(child.kind()) {
                    modifiers.insert(modifier);
                }
                if child.kind() == "accessibility_modifier" {
                    if let Ok(text) = child.utf8_text(source.as_bytes()) {
                        modifiers.insert(text.to_string());
                    }
                }
            }
        }

        // Naming conventions augment syntax.
        if let Some(name) = name {
            if name.starts_with("__") && name.ends_with("__") && name.len() > 4 {
                modifiers.insert("magic".to_string());
            } else if name.starts_with('_') {
                modifiers.insert("private".to_string());
            }
        }

        modifiers
    }

    // ---- docstrings ----

    /// Nearest contiguous comment block immediately preceding the node,
    /// joined with single spaces. Python also checks the leading string
    /// expression of a definition body.
    fn docstring(&self, node: Node<'_>, source: &str) -> Option<String> {
        if self.language == Language::Python {
            if let Some(doc) = python_body_docstring(node, source) {
                return Some(self.truncate(doc));
            }
        }

        let mut parts: Vec<String> = Vec::new();
        let mut expected_end_line = node.start_position().row;
        let mut prev = node.prev_sibling();
        // Decorators sit between a definition and its comment block.
        while let Some(p) = prev {
            if is_annotation_kind(&self.language, p.kind()) {
                expected_end_line = p.start_position().row;
                prev = p.prev_sibling();
            } else {
                break;
            }
        }
        while let Some(p) = prev {
            if !is_comment_kind(p.kind()) {
                break;
            }
            // Contiguity: the comment must end on the line directly above
            // whatever follows it.
            if p.end_position().row + 1 < expected_end_line {
                break;
            }
            parts.push(clean_comment_text(
                p.utf8_text(source.as_bytes()).unwrap_or(""),
            ));
            expected_end_line = p.start_position().row;
            prev = p.prev_sibling();
        }

        if parts.is_empty() {
            return None;
        }
        parts.reverse();
        Some(self.truncate(parts.join(" ")))
    }

    fn truncate(&self, text: String) -> String {
        if text.chars().count() > self.max_docstring_len {
            let truncated: String = text.chars().take(self.max_docstring_len).collect();
            format!("{}…", truncated)
        } else {
            text
        }
    }

    // ---- annotations ----

    fn annotations(&self, node: Node<'_>, source: &str) -> BTreeSet<String> {
        let mut annotations = BTreeSet::new();

        // Child decoration nodes (Java modifiers hold annotations; Rust
        // attributes are children of the item in some grammar versions).
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            collect_annotation(&self.language, child, source, &mut annotations);
            if child.kind() == "modifiers" {
                let mut inner = child.walk();
                for token in child.children(&mut inner) {
                    collect_annotation(&self.language, token, source, &mut annotations);
                }
            }
        }

        // Sibling decoration: Python decorated_definition wraps the node,
        // TS/Rust decorations precede it.
        if let Some(parent) = node.parent() {
            if parent.kind() == "decorated_definition" {
                let mut cursor = parent.walk();
                for child in parent.children(&mut cursor) {
                    collect_annotation(&self.language, child, source, &mut annotations);
                }
            }
        }
        let mut prev = node.prev_sibling();
        while let Some(p) = prev {
            if is_annotation_kind(&self.language, p.kind()) {
                if let Ok(text) = p.utf8_text(source.as_bytes()) {
                    annotations.insert(text.trim().to_string());
                }
                prev = p.prev_sibling();
            } else {
                break;
            }
        }

        annotations
    }

    // ---- language-specific extras ----

    fn language_specific(&self, node: Node<'_>, source: &str) -> BTreeMap<String, String> {
        let mut extra = BTreeMap::new();

        if let Some(return_type) = node
            .child_by_field_name("return_type")
            .or_else(|| node.child_by_field_name("type"))
        {
            if let Ok(text) = return_type.utf8_text(source.as_bytes()) {
                extra.insert("type".to_string(), text.trim().to_string());
            }
        }

        if let Some(type_params) = node.child_by_field_name("type_parameters") {
            if let Ok(text) = type_params.utf8_text(source.as_bytes()) {
                extra.insert("generics".to_string(), text.trim().to_string());
            }
        }

        if let Some(supers) = node
            .child_by_field_name("superclass")
            .or_else(|| node.child_by_field_name("superclasses"))
        {
            if let Ok(text) = supers.utf8_text(source.as_bytes()) {
                extra.insert(
                    "bases".to_string(),
                    text.trim_start_matches(['(', ':', ' '])
                        .trim_end_matches([')', ' '])
                        .trim()
                        .to_string(),
                );
            }
        }

        if let Some(interfaces) = node.child_by_field_name("interfaces") {
            if let Ok(text) = interfaces.utf8_text(source.as_bytes()) {
                extra.insert(
                    "interfaces".to_string(),
                    text.trim_start_matches("implements").trim().to_string(),
                );
            }
        }

        extra
    }

    // ---- imports ----

    fn collect_imports(&self, node: Node<'_>, source: &str, ctx: &mut FileContext) {
        match (&self.language, node.kind()) {
            (Language::Rust, "use_declaration") => {
                if let Some(arg) = node.child_by_field_name("argument") {
                    self.collect_rust_use(arg, source, String::new(), ctx);
                } else {
                    ctx.warnings
                        .push(format!("use declaration without argument at byte {}", node.start_byte()));
                }
            }
            (Language::Python, "import_statement") => {
                let mut cursor = node.walk();
                for child in node.named_children(&mut cursor) {
                    match child.kind() {
                        "dotted_name" => {
                            let text = text_of(child, source);
                            let local = text.split('.').next().unwrap_or(&text).to_string();
                            insert_import(ctx, local, text.clone(), None, false);
                        }
                        "aliased_import" => {
                            let name = child.child_by_field_name("name").map(|n| text_of(n, source));
                            let alias = child.child_by_field_name("alias").map(|n| text_of(n, source));
                            match (name, alias) {
                                (Some(name), Some(alias)) => {
                                    insert_import(ctx, alias, name.clone(), Some(name), false)
                                }
                                _ => ctx.warnings.push(format!(
                                    "malformed aliased import at byte {}",
                                    child.start_byte()
                                )),
                            }
                        }
                        _ => {}
                    }
                }
            }
            (Language::Python, "import_from_statement") => {
                let module = node
                    .child_by_field_name("module_name")
                    .map(|n| text_of(n, source))
                    .unwrap_or_default();
                let import_kw_end = node
                    .children(&mut node.walk())
                    .find(|c| c.kind() == "import")
                    .map(|c| c.end_byte())
                    .unwrap_or(0);
                let mut cursor = node.walk();
                for child in node.named_children(&mut cursor) {
                    if child.start_byte() < import_kw_end {
                        continue;
                    }
                    match child.kind() {
                        "dotted_name" => {
                            let name = text_of(child, source);
                            insert_import(ctx, name.clone(), module.clone(), Some(name), false);
                        }
                        "aliased_import" => {
                            let name = child.child_by_field_name("name").map(|n| text_of(n, source));
                            let alias = child.child_by_field_name("alias").map(|n| text_of(n, source));
                            match (name, alias) {
                                (Some(name), Some(alias)) => {
                                    insert_import(ctx, alias, module.clone(), Some(name), false)
                                }
                                _ => ctx.warnings.push(format!(
                                    "malformed aliased import at byte {}",
                                    child.start_byte()
                                )),
                            }
                        }
                        "wildcard_import" => ctx
                            .warnings
                            .push(format!("wildcard import from {} has no local names", module)),
                        _ => {}
                    }
                }
            }
            (Language::TypeScript | Language::JavaScript, "import_statement") => {
                let module = node
                    .child_by_field_name("source")
                    .map(|n| text_of(n, source).trim_matches(['\'', '"']).to_string())
                    .unwrap_or_default();
                let Some(clause) = node
                    .named_children(&mut node.walk())
                    .find(|c| c.kind() == "import_clause")
                else {
                    // Bare side-effect import: no local bindings.
                    return;
                };
                let mut cursor = clause.walk();
                for child in clause.named_children(&mut cursor) {
                    match child.kind() {
                        "identifier" => {
                            let local = text_of(child, source);
                            insert_import(ctx, local, module.clone(), None, true);
                        }
                        "named_imports" => {
                            let mut inner = child.walk();
                            for spec in child.named_children(&mut inner) {
                                if spec.kind() != "import_specifier" {
                                    continue;
                                }
                                let name = spec.child_by_field_name("name").map(|n| text_of(n, source));
                                let alias = spec.child_by_field_name("alias").map(|n| text_of(n, source));
                                match name {
                                    Some(name) => {
                                        let local = alias.unwrap_or_else(|| name.clone());
                                        insert_import(ctx, local, module.clone(), Some(name), false);
                                    }
                                    None => ctx.warnings.push(format!(
                                        "import specifier without name at byte {}",
                                        spec.start_byte()
                                    )),
                                }
                            }
                        }
                        "namespace_import" => {
                            let mut inner = child.walk();
                            let ident_found = child
                                .named_children(&mut inner)
                                .find(|c| c.kind() == "identifier");
                            if let Some(ident) = ident_found {
                                let local = text_of(ident, source);
                                insert_import(ctx, local, module.clone(), Some("*".into()), false);
                            }
                        }
                        _ => {}
                    }
                }
            }
            (Language::Go, "import_declaration") => {
                let mut stack = vec![node];
                while let Some(current) = stack.pop() {
                    let mut cursor = current.walk();
                    for child in current.named_children(&mut cursor) {
                        match child.kind() {
                            "import_spec_list" => stack.push(child),
                            "import_spec" => {
                                let path = child
                                    .child_by_field_name("path")
                                    .map(|n| text_of(n, source).trim_matches('"').to_string());
                                match path {
                                    Some(path) => {
                                        let local = child
                                            .child_by_field_name("name")
                                            .map(|n| text_of(n, source))
                                            .unwrap_or_else(|| {
                                                path.rsplit('/').next().unwrap_or(&path).to_string()
                                            });
                                        insert_import(ctx, local, path, None, false);
                                    }
                                    None => ctx.warnings.push(format!(
                                        "import spec without path at byte {}",
                                        child.start_byte()
                                    )),
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }
            (Language::Java, "import_declaration") => {
                let mut cursor = node.walk();
                let scoped_found = node
                    .named_children(&mut cursor)
                    .find(|c| matches!(c.kind(), "scoped_identifier" | "identifier"));
                if let Some(scoped) = scoped_found {
                    let text = text_of(scoped, source);
                    let local = text.rsplit('.').next().unwrap_or(&text).to_string();
                    insert_import(ctx, local, text, None, false);
                }
            }
            _ => {}
        }
    }

    fn collect_rust_use(
        &self,
        node: Node<'_>,
        source: &str,
        prefix: String,
        ctx: &mut FileContext,
    ) {
        match node.kind() {
            "identifier" | "type_identifier" | "crate" | "self" | "super" => {
                let name = text_of(node, source);
                insert_import(ctx, name, prefix, None, false);
            }
            "scoped_identifier" => {
                let path = node
                    .child_by_field_name("path")
                    .map(|n| text_of(n, source))
                    .unwrap_or_default();
                match node.child_by_field_name("name") {
                    Some(name) => {
                        let local = text_of(name, source);
                        insert_import(ctx, local, path, None, false);
                    }
                    None => ctx
                        .warnings
                        .push(format!("scoped use without leaf at byte {}", node.start_byte())),
                }
            }
            "use_as_clause" => {
                let original = node.child_by_field_name("path").map(|n| text_of(n, source));
                let alias = node.child_by_field_name("alias").map(|n| text_of(n, source));
                match (original, alias) {
                    (Some(original), Some(alias)) => {
                        insert_import(ctx, alias, prefix, Some(original), false)
                    }
                    _ => ctx
                        .warnings
                        .push(format!("malformed use-as clause at byte {}", node.start_byte())),
                }
            }
            "use_list" => {
                let mut cursor = node.walk();
                for child in node.named_children(&mut cursor) {
                    self.collect_rust_use(child, source, prefix.clone(), ctx);
                }
            }
            "scoped_use_list" => {
                let path = node
                    .child_by_field_name("path")
                    .map(|n| text_of(n, source))
                    .unwrap_or_default();
                if let Some(list) = node.child_by_field_name("list") {
                    self.collect_rust_use(list, source, path, ctx);
                }
            }
            "use_wildcard" => {
                ctx.warnings
                    .push(format!("wildcard use at byte {} has no local names", node.start_byte()));
            }
            other => {
                ctx.warnings
                    .push(format!("unhandled use shape {} at byte {}", other, node.start_byte()));
            }
        }
    }

    // ---- exports ----

    fn collect_exports(&self, node: Node<'_>, source: &str, ctx: &mut FileContext) {
        match (&self.language, node.kind()) {
            (Language::TypeScript | Language::JavaScript, "export_statement") => {
                let is_default = node
                    .children(&mut node.walk())
                    .any(|c| c.kind() == "default");
                let mut cursor = node.walk();
                for child in node.named_children(&mut cursor) {
                    if let Some(name) = crate::classifier::extract_name(child, source) {
                        insert_export(ctx, name, is_default);
                    } else if child.kind() == "export_clause" {
                        let mut inner = child.walk();
                        for spec in child.named_children(&mut inner) {
                            if let Some(name) =
                                spec.child_by_field_name("name").map(|n| text_of(n, source))
                            {
                                insert_export(ctx, name, false);
                            }
                        }
                    }
                }
            }
            (Language::Rust, _) => {
                let is_pub = node
                    .children(&mut node.walk())
                    .any(|c| c.kind() == "visibility_modifier");
                if is_pub {
                    if let Some(name) = crate::classifier::extract_name(node, source) {
                        insert_export(ctx, name, false);
                    }
                }
            }
            (Language::Python, "function_definition" | "class_definition") => {
                if let Some(name) = crate::classifier::extract_name(node, source) {
                    if !name.starts_with('_') {
                        insert_export(ctx, name, false);
                    }
                }
            }
            (Language::Python, "decorated_definition") => {
                let mut cursor = node.walk();
                for child in node.named_children(&mut cursor) {
                    self.collect_exports(child, source, ctx);
                }
            }
            (Language::Go, "function_declaration" | "method_declaration" | "type_declaration") => {
                if let Some(name) = crate::classifier::extract_name(node, source) {
                    if name.chars().next().is_some_and(|c| c.is_uppercase()) {
                        insert_export(ctx, name, false);
                    }
                }
            }
            (Language::Java, "class_declaration" | "interface_declaration" | "enum_declaration") => {
                let is_public = node
                    .children(&mut node.walk())
                    .any(|c| c.kind() == "modifiers" && text_of(c, source).contains("public"));
                if is_public {
                    if let Some(name) = crate::classifier::extract_name(node, source) {
                        insert_export(ctx, name, false);
                    }
                }
            }
            _ => {}
        }
    }
}

fn insert_import(
    ctx: &mut FileContext,
    local_name: String,
    source: String,
    imported_name: Option<String>,
    is_default: bool,
) {
    if local_name.is_empty() {
        ctx.warnings.push("import with empty local name".to_string());
        return;
    }
    ctx.imports.insert(
        local_name.clone(),
        ImportInfo {
            local_name,
            source,
            imported_name,
            is_default,
        },
    );
}

fn insert_export(ctx: &mut FileContext, name: String, is_default: bool) {
    ctx.exports.insert(name.clone(), ExportInfo { name, is_default });
}

fn text_of(node: Node<'_>, source: &str) -> String {
    node.utf8_text(source.as_bytes()).unwrap_or("").to_string()
}

fn syntactic_modifier(language: &Language, child: Node<'_>, source: &str) -> Option<String> {
    match (language, child.kind()) {
        (Language::Rust, "visibility_modifier") => Some("pub".to_string()),
        (Language::Rust, "function_modifiers") => {
            let text = text_of(child, source);
            // The first keyword wins; async/unsafe/const rarely stack.
            text.split_whitespace().next().map(String::from)
        }
        (Language::Rust, "mutable_specifier") => Some("mut".to_string()),
        (_, kind) => keyword_modifier(kind),
    }
}

fn keyword_modifier(kind: &str) -> Option<String> {
    match kind {
        "public" | "private" | "protected" | "static" | "abstract" | "final" | "async"
        | "readonly" | "const" | "override" | "export" | "default" => Some(kind.to_string()),
        _ => None,
    }
}

fn is_annotation_kind(language: &Language, kind: &str) -> bool {
    match language {
        Language::Rust => kind == "attribute_item",
        Language::Python => kind == "decorator",
        Language::TypeScript | Language::JavaScript => kind == "decorator",
        Language::Java => matches!(kind, "annotation" | "marker_annotation"),
        _ => false,
    }
}

fn collect_annotation(
    language: &Language,
    node: Node<'_>,
    source: &str,
    out: &mut BTreeSet<String>,
) {
    if is_annotation_kind(language, node.kind()) {
        if let Ok(text) = node.utf8_text(source.as_bytes()) {
            out.insert(text.trim().to_string());
        }
    }
}

fn python_body_docstring(node: Node<'_>, source: &str) -> Option<String> {
    if !matches!(node.kind(), "function_definition" | "class_definition") {
        return None;
    }
    let body = node.child_by_field_name("body")?;
    let first = body.named_child(0)?;
    if first.kind() != "expression_statement" {
        return None;
    }
    let string = first.named_child(0)?;
    if string.kind() != "string" {
        return None;
    }
    let raw = string.utf8_text(source.as_bytes()).ok()?;
    let cleaned = raw
        .trim_start_matches(['r', 'b', 'f', 'u', 'R', 'B', 'F', 'U'])
        .trim_matches(|c| c == '"' || c == '\'')
        .trim();
    let joined = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

fn clean_comment_text(raw: &str) -> String {
    let trimmed = raw.trim();
    let body = if let Some(rest) = trimmed.strip_prefix("///") {
        rest
    } else if let Some(rest) = trimmed.strip_prefix("//!") {
        rest
    } else if let Some(rest) = trimmed.strip_prefix("//") {
        rest
    } else if let Some(rest) = trimmed.strip_prefix('#') {
        rest
    } else if trimmed.starts_with("/*") {
        trimmed
            .trim_start_matches("/**")
            .trim_start_matches("/*")
            .trim_end_matches("*/")
    } else {
        trimmed
    };
    body.lines()
        .map(|line| line.trim().trim_start_matches('*').trim())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Word-boundary containment check so `db` does not match `database`.
fn contains_identifier(text: &str, identifier: &str) -> bool {
    let bytes = text.as_bytes();
    let mut search_from = 0;
    while let Some(pos) = text[search_from..].find(identifier) {
        let start = search_from + pos;
        let end = start + identifier.len();
        let before_ok = start == 0 || !is_ident_byte(bytes[start - 1]);
        let after_ok = end == bytes.len() || !is_ident_byte(bytes[end]);
        if before_ok && after_ok {
            return true;
        }
        // Advance past the match; `end` is always a char boundary.
        search_from = end;
    }
    false
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}
