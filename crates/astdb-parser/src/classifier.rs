//! Maps raw tree-sitter nodes to canonical node kinds and computes scope
//! chains during a single pre-order walk.

use astdb_core::{Language, NodeKind, Position};
use tree_sitter::{Node, Tree};

/// One classified syntax node. Borrows the tree it came from; never
/// persisted (the coordinator turns these into `astdb_core::Node`s).
pub struct Classified<'t> {
    pub ts_node: Node<'t>,
    pub kind: NodeKind,
    pub name: Option<String>,
    pub scope: Vec<String>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

impl<'t> Classified<'t> {
    pub fn start(&self) -> Position {
        let p = self.ts_node.start_position();
        Position::new(p.row as u32 + 1, p.column as u32, self.ts_node.start_byte())
    }

    pub fn end(&self) -> Position {
        let p = self.ts_node.end_position();
        Position::new(p.row as u32 + 1, p.column as u32, self.ts_node.end_byte())
    }
}

pub struct Classifier {
    language: Language,
}

impl Classifier {
    pub fn new(language: Language) -> Self {
        Self { language }
    }

    /// Walk the whole tree, producing classified nodes in pre-order. The
    /// root is always a `File` node; scope chains start at the module name
    /// derived from the file path.
    pub fn classify_tree<'t>(
        &self,
        tree: &'t Tree,
        source: &str,
        file_path: &str,
    ) -> Vec<Classified<'t>> {
        let module_name = module_name_of(file_path);
        let mut out: Vec<Classified<'t>> = Vec::new();

        let root = tree.root_node();
        out.push(Classified {
            ts_node: root,
            kind: NodeKind::File,
            name: Some(module_name.clone()),
            scope: vec![module_name.clone()],
            parent: None,
            children: Vec::new(),
        });

        let mut scope_stack = vec![module_name];
        self.walk(root, source, 0, &mut scope_stack, &mut out);
        out
    }

    fn walk<'t>(
        &self,
        node: Node<'t>,
        source: &str,
        parent_index: usize,
        scope_stack: &mut Vec<String>,
        out: &mut Vec<Classified<'t>>,
    ) {
        let mut cursor = node.walk();
        let children: Vec<Node<'t>> = node.children(&mut cursor).collect();
        for child in children {
            let classified_index = match self.classify(child, source, scope_stack, out, parent_index)
            {
                Some(index) => index,
                None => parent_index,
            };

            let pushed = if classified_index != parent_index {
                let entry = &out[classified_index];
                if is_scope_container(entry.kind) {
                    let element = entry
                        .name
                        .clone()
                        .unwrap_or_else(|| entry.kind.to_string());
                    scope_stack.push(element);
                    true
                } else {
                    false
                }
            } else {
                false
            };

            self.walk(child, source, classified_index, scope_stack, out);

            if pushed {
                scope_stack.pop();
            }
        }
    }

    fn classify<'t>(
        &self,
        node: Node<'t>,
        source: &str,
        scope_stack: &[String],
        out: &mut Vec<Classified<'t>>,
        parent_index: usize,
    ) -> Option<usize> {
        let name = extract_name(node, source);
        let in_type_body = matches!(
            out[parent_index].kind,
            NodeKind::Class | NodeKind::Interface | NodeKind::Enum
        );
        let kind = map_kind(&self.language, node.kind(), in_type_body, name.as_deref())?;

        let own = name
            .clone()
            .unwrap_or_else(|| kind.to_string());
        let mut scope = scope_stack.to_vec();
        scope.push(own);

        let index = out.len();
        out.push(Classified {
            ts_node: node,
            kind,
            name,
            scope,
            parent: Some(parent_index),
            children: Vec::new(),
        });
        out[parent_index].children.push(index);
        Some(index)
    }
}

fn is_scope_container(kind: NodeKind) -> bool {
    matches!(
        kind,
        NodeKind::Module
            | NodeKind::Class
            | NodeKind::Interface
            | NodeKind::Enum
            | NodeKind::Function
            | NodeKind::Method
            | NodeKind::Constructor
    )
}

fn module_name_of(file_path: &str) -> String {
    std::path::Path::new(file_path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("<module>")
        .to_string()
}

/// Extract the node name: a child flagged `name`, then the first
/// `identifier`-shaped child; anonymous nodes return `None` and display as
/// `kind@offset`.
pub fn extract_name(node: Node<'_>, source: &str) -> Option<String> {
    if let Some(named) = node.child_by_field_name("name") {
        return named.utf8_text(source.as_bytes()).ok().map(String::from);
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if matches!(
            child.kind(),
            "identifier" | "type_identifier" | "field_identifier" | "property_identifier"
        ) {
            return child.utf8_text(source.as_bytes()).ok().map(String::from);
        }
    }
    None
}

/// The node kind followed by its named child kinds in order; whitespace and
/// comments are excluded. This is the `normalized_shape` input to the node
/// fingerprint.
pub fn normalized_shape(node: Node<'_>) -> String {
    let mut cursor = node.walk();
    let child_kinds: Vec<&str> = node
        .named_children(&mut cursor)
        .filter(|c| !is_comment_kind(c.kind()))
        .map(|c| c.kind())
        .collect();
    format!("{}({})", node.kind(), child_kinds.join(","))
}

pub fn is_comment_kind(kind: &str) -> bool {
    matches!(
        kind,
        "comment" | "line_comment" | "block_comment" | "doc_comment"
    )
}

/// Canonical kind for a raw syntax kind. `in_type_body` tells function-like
/// nodes apart from methods; `name` distinguishes constructors in languages
/// that spell them as ordinary methods.
pub fn map_kind(
    language: &Language,
    ts_kind: &str,
    in_type_body: bool,
    name: Option<&str>,
) -> Option<NodeKind> {
    match language {
        Language::Rust => match ts_kind {
            "function_item" | "function_signature_item" => {
                if in_type_body {
                    Some(NodeKind::Method)
                } else {
                    Some(NodeKind::Function)
                }
            }
            "struct_item" => Some(NodeKind::Class),
            "trait_item" => Some(NodeKind::Interface),
            "impl_item" => Some(NodeKind::Class),
            "enum_item" => Some(NodeKind::Enum),
            "mod_item" => Some(NodeKind::Module),
            "use_declaration" => Some(NodeKind::Import),
            "type_item" => Some(NodeKind::TypeAlias),
            "let_declaration" | "const_item" | "static_item" => Some(NodeKind::Variable),
            "field_declaration" => Some(NodeKind::Property),
            "parameter" | "self_parameter" => Some(NodeKind::Parameter),
            "if_expression" | "if_let_expression" => Some(NodeKind::IfStatement),
            "string_literal" | "raw_string_literal" => Some(NodeKind::StringLiteral),
            "line_comment" | "block_comment" => Some(NodeKind::Comment),
            _ => None,
        },
        Language::Python => match ts_kind {
            "function_definition" => {
                if name == Some("__init__") {
                    Some(NodeKind::Constructor)
                } else if in_type_body {
                    Some(NodeKind::Method)
                } else {
                    Some(NodeKind::Function)
                }
            }
            "class_definition" => Some(NodeKind::Class),
            "import_statement" | "import_from_statement" => Some(NodeKind::Import),
            "assignment" => Some(NodeKind::Variable),
            "typed_parameter" | "default_parameter" | "typed_default_parameter" => {
                Some(NodeKind::Parameter)
            }
            "if_statement" => Some(NodeKind::IfStatement),
            "string" => Some(NodeKind::StringLiteral),
            "comment" => Some(NodeKind::Comment),
            _ => None,
        },
        Language::TypeScript | Language::JavaScript => match ts_kind {
            "function_declaration" | "generator_function_declaration" | "arrow_function" => {
                Some(NodeKind::Function)
            }
            "method_definition" => {
                if name == Some("constructor") {
                    Some(NodeKind::Constructor)
                } else {
                    Some(NodeKind::Method)
                }
            }
            "class_declaration" | "class" => Some(NodeKind::Class),
            "interface_declaration" => Some(NodeKind::Interface),
            "enum_declaration" => Some(NodeKind::Enum),
            "type_alias_declaration" => Some(NodeKind::TypeAlias),
            "import_statement" => Some(NodeKind::Import),
            "module" | "internal_module" | "namespace_declaration" => Some(NodeKind::Module),
            "lexical_declaration" | "variable_declaration" => Some(NodeKind::Variable),
            "public_field_definition" | "property_signature" => Some(NodeKind::Property),
            "required_parameter" | "optional_parameter" | "formal_parameter" => {
                Some(NodeKind::Parameter)
            }
            "if_statement" => Some(NodeKind::IfStatement),
            "string" | "template_string" => Some(NodeKind::StringLiteral),
            "comment" => Some(NodeKind::Comment),
            _ => None,
        },
        Language::Go => match ts_kind {
            "function_declaration" => Some(NodeKind::Function),
            "method_declaration" => Some(NodeKind::Method),
            "type_declaration" => Some(NodeKind::TypeAlias),
            "type_spec" => None,
            "import_declaration" => Some(NodeKind::Import),
            "var_declaration" | "const_declaration" | "short_var_declaration" => {
                Some(NodeKind::Variable)
            }
            "field_declaration" => Some(NodeKind::Property),
            "parameter_declaration" => Some(NodeKind::Parameter),
            "if_statement" => Some(NodeKind::IfStatement),
            "interpreted_string_literal" | "raw_string_literal" => Some(NodeKind::StringLiteral),
            "comment" => Some(NodeKind::Comment),
            _ => None,
        },
        Language::Java => match ts_kind {
            "class_declaration" => Some(NodeKind::Class),
            "interface_declaration" => Some(NodeKind::Interface),
            "enum_declaration" => Some(NodeKind::Enum),
            "method_declaration" => Some(NodeKind::Method),
            "constructor_declaration" => Some(NodeKind::Constructor),
            "import_declaration" => Some(NodeKind::Import),
            "field_declaration" => Some(NodeKind::Property),
            "local_variable_declaration" => Some(NodeKind::Variable),
            "formal_parameter" => Some(NodeKind::Parameter),
            "if_statement" => Some(NodeKind::IfStatement),
            "string_literal" => Some(NodeKind::StringLiteral),
            "line_comment" | "block_comment" => Some(NodeKind::Comment),
            _ => None,
        },
        Language::Other(_) => None,
    }
}
