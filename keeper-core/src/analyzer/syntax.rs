//! Helpers over the tree-sitter Python grammar.

use tree_sitter::Node;

/// 1-based line of a node.
pub fn line_of(node: Node<'_>) -> usize {
    node.start_position().row + 1
}

pub fn text<'s>(source: &'s str, node: Node<'_>) -> &'s str {
    node.utf8_text(source.as_bytes()).unwrap_or_default()
}

pub fn named_children<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor).collect()
}

/// Line of the first syntax error below `node`, if any. Walks the tree
/// with an explicit stack so deeply nested sources cannot exhaust the
/// thread's stack.
pub fn first_error_line(node: Node<'_>) -> Option<usize> {
    let mut pending = vec![node];
    while let Some(node) = pending.pop() {
        if node.is_error() || node.is_missing() {
            return Some(line_of(node));
        }
        if !node.has_error() {
            continue;
        }
        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
        pending.extend(children.into_iter().rev());
    }
    None
}

/// The docstring of a module or a `block` body: a string literal as the
/// first statement.
pub fn docstring<'t>(body: Node<'t>) -> Option<Node<'t>> {
    let first = named_children(body)
        .into_iter()
        .find(|child| child.kind() != "comment")?;
    if first.kind() != "expression_statement" {
        return None;
    }
    let expression = first.named_child(0)?;
    (expression.kind() == "string").then_some(expression)
}

/// A function parameter with the parts the analyzer cares about.
#[derive(Debug, Clone, Copy)]
pub struct Parameter<'t> {
    pub name: Node<'t>,
    pub annotated: bool,
}

/// Parameters of a `function_definition`, skipping the bare `*` and `/`
/// separators.
pub fn parameters<'t>(function: Node<'t>) -> Vec<Parameter<'t>> {
    let Some(list) = function.child_by_field_name("parameters") else {
        return Vec::new();
    };
    named_children(list)
        .into_iter()
        .filter_map(|param| {
            let annotated = matches!(param.kind(), "typed_parameter" | "typed_default_parameter");
            parameter_name(param).map(|name| Parameter { name, annotated })
        })
        .collect()
}

fn parameter_name(param: Node<'_>) -> Option<Node<'_>> {
    match param.kind() {
        "identifier" => Some(param),
        "list_splat_pattern" | "dictionary_splat_pattern" | "typed_parameter" => {
            param.named_child(0).and_then(parameter_name)
        }
        "default_parameter" | "typed_default_parameter" => param
            .child_by_field_name("name")
            .filter(|name| name.kind() == "identifier"),
        _ => None,
    }
}

/// Names written by an assignment or `for` target, in source order:
/// identifiers plus `attribute` nodes such as `self.total`. Subscript
/// targets bind nothing.
pub fn binding_targets<'t>(target: Node<'t>) -> Vec<Node<'t>> {
    let mut found = Vec::new();
    let mut pending = vec![target];
    while let Some(node) = pending.pop() {
        match node.kind() {
            "identifier" | "attribute" => found.push(node),
            "pattern_list" | "tuple_pattern" | "list_pattern" | "tuple" | "list"
            | "expression_list" | "list_splat_pattern" | "parenthesized_expression" => {
                pending.extend(named_children(node).into_iter().rev());
            }
            _ => {}
        }
    }
    found
}

/// Identifiers newly bound by an assignment or `for` target. Attribute and
/// subscript targets bind nothing new.
pub fn bound_identifiers<'t>(target: Node<'t>) -> Vec<Node<'t>> {
    binding_targets(target)
        .into_iter()
        .filter(|node| node.kind() == "identifier")
        .collect()
}

/// A plain (non-bytes) string literal.
pub fn is_text_literal(source: &str, node: Node<'_>) -> bool {
    if node.kind() != "string" {
        return false;
    }
    let literal = text(source, node);
    let prefix = literal
        .split(|c: char| c == '\'' || c == '"')
        .next()
        .unwrap_or_default();
    !prefix.contains(['b', 'B'])
}

/// `"...".format(...)` or `"..." % values`.
pub fn is_legacy_formatting(source: &str, node: Node<'_>) -> bool {
    match node.kind() {
        "call" => node
            .child_by_field_name("function")
            .filter(|function| function.kind() == "attribute")
            .is_some_and(|function| {
                let is_format = function
                    .child_by_field_name("attribute")
                    .is_some_and(|attribute| text(source, attribute) == "format");
                let on_literal = function
                    .child_by_field_name("object")
                    .is_some_and(|object| is_text_literal(source, object));
                is_format && on_literal
            }),
        "binary_operator" => {
            let is_modulo = node
                .child_by_field_name("operator")
                .is_some_and(|operator| operator.kind() == "%");
            let on_literal = node
                .child_by_field_name("left")
                .is_some_and(|left| is_text_literal(source, left));
            is_modulo && on_literal
        }
        _ => false,
    }
}

/// Final name segment of a call's callee: `assertEqual` for
/// `self.assertEqual(...)`.
pub fn callee_name<'s>(source: &'s str, call: Node<'_>) -> Option<&'s str> {
    let function = call.child_by_field_name("function")?;
    match function.kind() {
        "identifier" => Some(text(source, function)),
        "attribute" => function
            .child_by_field_name("attribute")
            .map(|attribute| text(source, attribute)),
        _ => None,
    }
}

/// Top-level package names imported by an `import` or `from ... import`
/// statement.
pub fn imported_packages<'s>(source: &'s str, statement: Node<'_>) -> Vec<&'s str> {
    let modules: Vec<Node<'_>> = match statement.kind() {
        "import_statement" => named_children(statement)
            .into_iter()
            .filter_map(|child| match child.kind() {
                "dotted_name" => Some(child),
                "aliased_import" => child.child_by_field_name("name"),
                _ => None,
            })
            .collect(),
        "import_from_statement" => statement
            .child_by_field_name("module_name")
            .filter(|module| module.kind() == "dotted_name")
            .into_iter()
            .collect(),
        _ => Vec::new(),
    };
    modules
        .into_iter()
        .filter_map(|module| text(source, module).split('.').next())
        .collect()
}
