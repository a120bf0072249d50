//! Cyclomatic complexity from tree-sitter subtrees, counted in a single
//! pass during traversal.

use tree_sitter::Node;

/// `1 + count(decision points)` over the subtree. Decision points are
/// branches, loops, match/switch arms' parents, ternaries, and exception
/// handlers across the supported grammars.
pub fn cyclomatic_complexity(node: &Node, source: &str) -> u32 {
    1 + count_decision_points(node, source)
}

fn count_decision_points(node: &Node, source: &str) -> u32 {
    let kind = node.kind();
    let mut count = if is_decision_point(kind) { 1 } else { 0 };

    // Short-circuit operators add paths without their own statement kinds.
    if matches!(kind, "binary_expression" | "boolean_operator") {
        let mut cursor = node.walk();
        if cursor.goto_first_child() {
            loop {
                if matches!(cursor.node().kind(), "&&" | "||" | "and" | "or") {
                    count += 1;
                }
                if !cursor.goto_next_sibling() {
                    break;
                }
            }
        }
    }

    let mut cursor = node.walk();
    if cursor.goto_first_child() {
        loop {
            count += count_decision_points(&cursor.node(), source);
            if !cursor.goto_next_sibling() {
                break;
            }
        }
    }

    count
}

fn is_decision_point(kind: &str) -> bool {
    matches!(
        kind,
        "if_expression"
            | "if_statement"
            | "if_let_expression"
            | "elif_clause"
            | "else_if_clause"
            | "while_expression"
            | "while_statement"
            | "do_statement"
            | "for_expression"
            | "for_statement"
            | "for_in_statement"
            | "for_of_statement"
            | "enhanced_for_statement"
            | "loop_expression"
            | "match_expression"
            | "match_statement"
            | "switch_statement"
            | "switch_expression"
            | "select_statement"
            | "conditional_expression"
            | "catch_clause"
            | "except_clause"
    )
}
