//! Static analysis of submitted Python sources.
//!
//! Each file is parsed with tree-sitter and walked once. The walk records
//! whether the file tests itself, whether its public functions are fully
//! annotated, and whether its names say what they mean. The result depends
//! on nothing but the path and the contents.

mod syntax;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tree_sitter::{Node, Parser};

use crate::settings::Settings;
use crate::snapshot::{FileChange, FileStatus};

use syntax::{line_of, text};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub path: String,
    pub has_test: bool,
    pub fully_typed: bool,
    pub has_descriptive_names: bool,
    /// Ordered by line.
    pub violations: Vec<Violation>,
    /// Requests for a doctest on each function that lacks one. Only filled
    /// when the file has no test, and only shown when the pull request adds
    /// no test file either.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub doctest_requests: Vec<Violation>,
}

impl AnalysisResult {
    /// A file that could not be analyzed contributes no passing signal.
    pub fn failed(path: impl Into<String>, line: usize, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            has_test: false,
            fully_typed: false,
            has_descriptive_names: false,
            violations: vec![Violation {
                line,
                message: message.into(),
            }],
            doctest_requests: Vec::new(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("could not parse the file (line {line}): {message}")]
    Parse { line: usize, message: String },
    #[error("failed to load the Python grammar: {0}")]
    Language(String),
}

impl AnalysisError {
    /// Record the error against the file instead of aborting the pass.
    pub fn into_result(self, path: &str) -> AnalysisResult {
        let line = match &self {
            AnalysisError::Parse { line, .. } => *line,
            AnalysisError::Language(_) => 1,
        };
        AnalysisResult::failed(path, line, self.to_string())
    }
}

/// Which changed files a pass should analyze.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisScope {
    /// Only files the pull request adds.
    AddedOnly,
    /// Every changed file.
    All,
}

/// Whether `file` should be fetched and handed to [`analyze`].
pub fn is_analyzable(file: &FileChange, scope: AnalysisScope, settings: &Settings) -> bool {
    if file.status == FileStatus::Removed || settings.is_excluded(&file.path) {
        return false;
    }
    if scope == AnalysisScope::AddedOnly && file.status != FileStatus::Added {
        return false;
    }
    let Some(extension) = file.extension.as_deref() else {
        return false;
    };
    if !settings
        .analyzed_extensions
        .iter()
        .any(|analyzed| analyzed == extension)
    {
        return false;
    }
    let name = file.file_name();
    let is_dunder = name.starts_with("__");
    !is_dunder && !settings.test_patterns.is_test_file(name)
}

pub fn analyze(path: &str, source: &str, settings: &Settings) -> Result<AnalysisResult, AnalysisError> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| AnalysisError::Language(e.to_string()))?;
    let tree = parser.parse(source, None).ok_or_else(|| AnalysisError::Parse {
        line: 1,
        message: "parser returned no tree".to_string(),
    })?;

    let root = tree.root_node();
    if root.has_error() {
        return Err(AnalysisError::Parse {
            line: syntax::first_error_line(root).unwrap_or(1),
            message: "invalid syntax".to_string(),
        });
    }

    let mut visitor = Visitor::new(source, settings);
    visitor.visit_module(root);
    Ok(visitor.finish(path))
}

const CAMEL_CASE_MESSAGE: &str = "Class names should follow the \
    [`CamelCase`](https://en.wikipedia.org/wiki/Camel_case) naming convention. \
    Please update the following name accordingly:";

const SNAKE_CASE_MESSAGE: &str = "Variable and function names should follow the \
    [`snake_case`](https://en.wikipedia.org/wiki/Snake_case) naming convention. \
    Please update the following name accordingly:";

const LEGACY_FORMATTING_MESSAGE: &str = "Please do not use printf style formatting or \
    `str.format()`. Use [f-string](https://realpython.com/python-f-strings/) instead to be \
    more readable and efficient.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Convention {
    CamelCase,
    SnakeCase,
}

impl Convention {
    fn accepts(self, name: &str) -> bool {
        match self {
            Convention::CamelCase => {
                let name = name.trim_matches('_');
                !name.starts_with(|c: char| c.is_lowercase()) && !name.contains('_')
            }
            Convention::SnakeCase => name.to_lowercase() == name || name.to_uppercase() == name,
        }
    }

    fn message(self, name: &str) -> String {
        let text = match self {
            Convention::CamelCase => CAMEL_CASE_MESSAGE,
            Convention::SnakeCase => SNAKE_CASE_MESSAGE,
        };
        format!("{text} `{name}`")
    }
}

#[derive(Debug, Clone, Copy)]
struct Scope {
    /// Inside the body of a function whose name is public.
    in_public_function: bool,
    /// Directly in the module body.
    at_module_level: bool,
    /// Inside a class whose docstring already carries a doctest.
    documented_class: bool,
}

impl Scope {
    const MODULE: Scope = Scope {
        in_public_function: false,
        at_module_level: true,
        documented_class: false,
    };

    fn nested(self) -> Scope {
        Scope {
            at_module_level: false,
            ..self
        }
    }
}

struct Visitor<'s> {
    source: &'s str,
    settings: &'s Settings,
    has_test: bool,
    fully_typed: bool,
    has_descriptive_names: bool,
    violations: Vec<Violation>,
    /// Line and name of each function without a doctest.
    undocumented: Vec<(usize, String)>,
}

impl<'s> Visitor<'s> {
    fn new(source: &'s str, settings: &'s Settings) -> Self {
        Self {
            source,
            settings,
            has_test: false,
            fully_typed: true,
            has_descriptive_names: true,
            violations: Vec::new(),
            undocumented: Vec::new(),
        }
    }

    fn finish(mut self, path: &str) -> AnalysisResult {
        self.violations.sort_by_key(|violation| violation.line);
        let doctest_requests = if self.has_test {
            Vec::new()
        } else {
            self.undocumented
                .into_iter()
                .map(|(line, name)| Violation {
                    line,
                    message: format!(
                        "As there is no test file in this pull request nor any test function \
                         or class in the file `{path}`, please provide doctest for the \
                         function `{name}`"
                    ),
                })
                .collect()
        };
        AnalysisResult {
            path: path.to_string(),
            has_test: self.has_test,
            fully_typed: self.fully_typed,
            has_descriptive_names: self.has_descriptive_names,
            violations: self.violations,
            doctest_requests,
        }
    }

    fn report(&mut self, line: usize, message: String) {
        self.violations.push(Violation { line, message });
    }

    /// Walk the whole tree in source order. The walk keeps its own stack so
    /// nesting depth in the source never turns into native recursion.
    fn visit_module<'t>(&mut self, root: Node<'t>) {
        self.has_doctest(root);
        let mut pending: Vec<(Node<'t>, Scope)> = syntax::named_children(root)
            .into_iter()
            .rev()
            .map(|child| (child, Scope::MODULE))
            .collect();
        while let Some((node, scope)) = pending.pop() {
            if let Some((container, inner)) = self.visit(node, scope) {
                pending.extend(
                    syntax::named_children(container)
                        .into_iter()
                        .rev()
                        .map(|child| (child, inner)),
                );
            }
        }
    }

    /// Check one node and return the node whose children the walk should
    /// descend into next, with their scope.
    fn visit<'t>(&mut self, node: Node<'t>, scope: Scope) -> Option<(Node<'t>, Scope)> {
        match node.kind() {
            "function_definition" => self.visit_function(node, scope),
            "class_definition" => self.visit_class(node, scope),
            "import_statement" | "import_from_statement" => {
                self.check_testing_import(node);
                None
            }
            "call" => {
                self.check_assertion_call(node);
                self.check_formatting(node);
                Some((node, scope.nested()))
            }
            "binary_operator" => {
                self.check_formatting(node);
                Some((node, scope.nested()))
            }
            "assignment" => {
                if let Some(target) = node.child_by_field_name("left") {
                    let is_declaration = node.child_by_field_name("right").is_none();
                    if !is_declaration && !self.is_type_alias(node, scope) {
                        self.check_binding_conventions(target);
                    }
                    if scope.in_public_function {
                        self.check_bindings(target);
                    }
                }
                Some((node, scope.nested()))
            }
            "for_statement" => {
                if let Some(target) = node.child_by_field_name("left") {
                    self.check_binding_conventions(target);
                    if scope.in_public_function {
                        self.check_bindings(target);
                    }
                }
                Some((node, scope.nested()))
            }
            "named_expression" => {
                if let Some(target) = node.child_by_field_name("name") {
                    self.check_binding_conventions(target);
                    if scope.in_public_function {
                        self.check_bindings(target);
                    }
                }
                Some((node, scope.nested()))
            }
            "expression_statement" => Some((node, scope)),
            _ => Some((node, scope.nested())),
        }
    }

    fn visit_function<'t>(&mut self, node: Node<'t>, scope: Scope) -> Option<(Node<'t>, Scope)> {
        let name_node = node.child_by_field_name("name")?;
        let name = text(self.source, name_node);
        let line = line_of(name_node);
        let is_public = !name.starts_with('_');

        if self
            .settings
            .test_patterns
            .function_prefixes
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()))
        {
            self.has_test = true;
        }

        self.check_convention(name, line, Convention::SnakeCase);
        for parameter in syntax::parameters(node) {
            let param_name = text(self.source, parameter.name);
            self.check_convention(param_name, line_of(parameter.name), Convention::SnakeCase);
        }
        if is_public {
            self.check_name(name, line, "function");
            self.check_signature(node, name);
        }

        let body = node.child_by_field_name("body")?;
        let is_dunder = name.len() > 4 && name.starts_with("__") && name.ends_with("__");
        if !self.has_doctest(body) && !is_dunder && !scope.documented_class {
            self.undocumented.push((line, name.to_string()));
        }
        Some((
            body,
            Scope {
                in_public_function: is_public,
                at_module_level: false,
                documented_class: scope.documented_class,
            },
        ))
    }

    fn check_signature(&mut self, function: Node<'_>, name: &str) {
        for parameter in syntax::parameters(function) {
            let param_name = text(self.source, parameter.name);
            if param_name == "self" || param_name == "cls" {
                continue;
            }
            let line = line_of(parameter.name);
            if !parameter.annotated {
                self.fully_typed = false;
                self.report(
                    line,
                    format!("Please provide type hint for the parameter: `{param_name}`"),
                );
            }
            self.check_name(param_name, line, "parameter");
        }

        if function.child_by_field_name("return_type").is_none() {
            self.fully_typed = false;
            self.report(
                line_of(function),
                format!(
                    "Please provide return type hint for the function: `{name}`. \
                     If the function does not return a value, annotate it with `-> None`."
                ),
            );
        }
    }

    fn visit_class<'t>(&mut self, node: Node<'t>, scope: Scope) -> Option<(Node<'t>, Scope)> {
        if let Some(name_node) = node.child_by_field_name("name") {
            let name = text(self.source, name_node);
            let line = line_of(name_node);
            if self
                .settings
                .test_patterns
                .class_prefixes
                .iter()
                .any(|prefix| name.starts_with(prefix.as_str()))
            {
                self.has_test = true;
            }
            self.check_convention(name, line, Convention::CamelCase);
            if !name.starts_with('_') {
                self.check_name(name, line, "class");
            }
        }
        let body = node.child_by_field_name("body")?;
        let documented = self.has_doctest(body);
        Some((
            body,
            Scope {
                in_public_function: false,
                at_module_level: false,
                documented_class: scope.documented_class || documented,
            },
        ))
    }

    /// A module-level `Name = Something[...]` or `Name = factory(...)` with a
    /// CamelCase name declares a type alias or a class, not a variable.
    fn is_type_alias(&self, assignment: Node<'_>, scope: Scope) -> bool {
        if !scope.at_module_level {
            return false;
        }
        let Some(target) = assignment.child_by_field_name("left") else {
            return false;
        };
        let is_camel = target.kind() == "identifier"
            && Convention::CamelCase.accepts(text(self.source, target));
        let declares_type = assignment
            .child_by_field_name("right")
            .is_some_and(|value| matches!(value.kind(), "subscript" | "call" | "attribute"));
        is_camel && declares_type
    }

    fn check_bindings(&mut self, target: Node<'_>) {
        for identifier in syntax::bound_identifiers(target) {
            let name = text(self.source, identifier);
            self.check_name(name, line_of(identifier), "variable");
        }
    }

    fn check_binding_conventions(&mut self, target: Node<'_>) {
        for bound in syntax::binding_targets(target) {
            let name_node = match bound.kind() {
                "attribute" => {
                    let on_self = bound
                        .child_by_field_name("object")
                        .is_some_and(|object| text(self.source, object) == "self");
                    if !on_self {
                        continue;
                    }
                    match bound.child_by_field_name("attribute") {
                        Some(attribute) => attribute,
                        None => continue,
                    }
                }
                _ => bound,
            };
            let name = text(self.source, name_node);
            self.check_convention(name, line_of(name_node), Convention::SnakeCase);
        }
    }

    fn check_convention(&mut self, name: &str, line: usize, convention: Convention) {
        if !convention.accepts(name) {
            self.report(line, convention.message(name));
        }
    }

    fn check_name(&mut self, name: &str, line: usize, kind: &str) {
        if name == "_" {
            return;
        }
        let too_short = name.chars().count() < self.settings.min_identifier_length;
        if too_short || self.settings.is_placeholder(name) {
            self.has_descriptive_names = false;
            self.report(
                line,
                format!("Please provide descriptive name for the {kind}: `{name}`"),
            );
        }
    }

    fn check_formatting(&mut self, node: Node<'_>) {
        if syntax::is_legacy_formatting(self.source, node) {
            self.report(line_of(node), LEGACY_FORMATTING_MESSAGE.to_string());
        }
    }

    /// Whether the docstring of `body` carries a doctest. A doctest anywhere
    /// marks the file as tested.
    fn has_doctest(&mut self, body: Node<'_>) -> bool {
        let Some(docstring) = syntax::docstring(body) else {
            return false;
        };
        let prompt = self.settings.test_patterns.doctest_prompt.trim_end();
        if prompt.is_empty() {
            return false;
        }
        let found = text(self.source, docstring)
            .lines()
            .any(|line| line.trim_start().starts_with(prompt));
        if found {
            self.has_test = true;
        }
        found
    }

    fn check_testing_import(&mut self, statement: Node<'_>) {
        let modules = &self.settings.test_patterns.testing_modules;
        if syntax::imported_packages(self.source, statement)
            .into_iter()
            .any(|package| modules.iter().any(|module| module == package))
        {
            self.has_test = true;
        }
    }

    fn check_assertion_call(&mut self, call: Node<'_>) {
        let Some(callee) = syntax::callee_name(self.source, call) else {
            return;
        };
        if self
            .settings
            .test_patterns
            .assertion_prefixes
            .iter()
            .any(|prefix| callee.starts_with(prefix.as_str()))
        {
            self.has_test = true;
        }
    }
}
