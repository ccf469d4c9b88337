//! Structural feature extraction for Python source.
//!
//! The source is parsed with tree-sitter-python and walked exactly once. Every
//! node kind that matters for risk scoring updates a [`CodeFeatures`] value;
//! nothing is executed and no I/O happens.

use crate::errors::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tree_sitter::{Node, Parser, Tree};

/// A classified call site: the dotted call name and a snapshot of its positional arguments.
pub type CallRecord = (String, Vec<String>);

/// Security-relevant fingerprint of a piece of Python source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeFeatures {
    /// Top-level package of every imported module
    pub imports: BTreeSet<String>,
    pub file_operations: Vec<CallRecord>,
    pub network_calls: Vec<CallRecord>,
    pub system_calls: Vec<CallRecord>,
    pub exec_eval_usage: Vec<CallRecord>,
    /// Dangerous builtins referenced by name, called or not
    pub dangerous_builtins: BTreeSet<String>,
    pub attribute_accesses: BTreeSet<String>,
    pub function_calls: BTreeSet<String>,
    pub has_global_statements: bool,
    pub has_nonlocal_statements: bool,
    pub class_definitions: BTreeSet<String>,
    pub async_operations: bool,
}

/// Builtins that enable dynamic execution, introspection or I/O.
pub const DANGEROUS_BUILTINS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "__import__",
    "open",
    "input",
    "breakpoint",
    "memoryview",
    "vars",
    "dir",
    "globals",
    "locals",
    "getattr",
    "setattr",
    "delattr",
    "hasattr",
];

/// Method names treated as file operations when called as `x.<name>(...)`.
pub const FILE_OPERATIONS: &[&str] = &[
    "open",
    "read",
    "write",
    "close",
    "seek",
    "tell",
    "readline",
    "readlines",
    "writelines",
    "flush",
    "truncate",
];

pub const NETWORK_MODULES: &[&str] = &[
    "socket",
    "urllib",
    "http",
    "requests",
    "httpx",
    "aiohttp",
    "ftplib",
    "smtplib",
    "poplib",
    "imaplib",
    "telnetlib",
    "ssl",
    "websocket",
    "websockets",
];

pub const SYSTEM_CALL_PATTERNS: &[&str] = &[
    "os.system",
    "os.popen",
    "os.spawn",
    "os.spawnl",
    "os.spawnle",
    "os.spawnlp",
    "os.spawnlpe",
    "os.spawnv",
    "os.spawnve",
    "os.spawnvp",
    "os.spawnvpe",
    "os.exec",
    "os.execl",
    "os.execle",
    "os.execlp",
    "os.execlpe",
    "os.execv",
    "os.execve",
    "os.execvp",
    "os.execvpe",
    "os.fork",
    "os.forkpty",
    "os.kill",
    "os.killpg",
    "subprocess.run",
    "subprocess.call",
    "subprocess.check_call",
    "subprocess.check_output",
    "subprocess.Popen",
    "subprocess.getoutput",
    "subprocess.getstatusoutput",
    "pty.spawn",
    "pty.fork",
];

const MAX_DUMP_DEPTH: usize = 48;

/// Parse `source` as Python and extract its feature fingerprint.
///
/// Returns [`SandboxError::SyntaxError`] when the source is not valid Python 3.
pub fn extract_features(source: &str) -> Result<CodeFeatures> {
    let tree = parse_python(source)?;
    let mut extractor = FeatureExtractor::new(source);
    extractor.walk(tree.root_node());
    Ok(extractor.features)
}

/// Parse Python source, rejecting trees that CPython would not accept.
pub fn parse_python(source: &str) -> Result<Tree> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| SandboxError::InternalError(format!("failed to load Python grammar: {}", e)))?;

    let tree = parser
        .parse(source, None)
        .ok_or_else(|| SandboxError::InternalError("Python parser produced no tree".to_string()))?;

    if let Some(message) = find_syntax_error(tree.root_node(), source) {
        return Err(SandboxError::SyntaxError(message));
    }
    Ok(tree)
}

/// First error, missing token, Python 2 statement or grammar violation in document order.
fn find_syntax_error(root: Node<'_>, source: &str) -> Option<String> {
    let mut cursor = root.walk();
    loop {
        let node = cursor.node();
        let pos = node.start_position();
        let (line, column) = (pos.row + 1, pos.column + 1);

        if node.is_missing() {
            return Some(format!(
                "expected '{}' (line {}, column {})",
                node.kind(),
                line,
                column
            ));
        }
        if node.is_error() {
            let snippet: String = text(node, source).chars().take(20).collect();
            return Some(if snippet.trim().is_empty() {
                format!("invalid syntax (line {}, column {})", line, column)
            } else {
                format!(
                    "invalid syntax near '{}' (line {}, column {})",
                    snippet.trim(),
                    line,
                    column
                )
            });
        }
        match node.kind() {
            "print_statement" => {
                return Some(format!(
                    "Missing parentheses in call to 'print' (line {}, column {})",
                    line, column
                ))
            }
            "exec_statement" => {
                return Some(format!(
                    "Missing parentheses in call to 'exec' (line {}, column {})",
                    line, column
                ))
            }
            _ => {
                if let Some(message) = grammar_violation(node, source) {
                    return Some(format!("{} (line {}, column {})", message, line, column));
                }
            }
        }

        if cursor.goto_first_child() {
            continue;
        }
        loop {
            if cursor.goto_next_sibling() {
                break;
            }
            if !cursor.goto_parent() {
                return None;
            }
        }
    }
}

/// Rules the CPython parser enforces on trees the grammar itself accepts.
fn grammar_violation(node: Node<'_>, source: &str) -> Option<&'static str> {
    match node.kind() {
        "argument_list" => argument_order_violation(node),
        "for_in_clause" => comprehension_iterable_violation(node),
        "parameters" | "lambda_parameters" => parameter_order_violation(node),
        "delete_statement" => {
            let mut cursor = node.walk();
            let targets: Vec<Node<'_>> = node.named_children(&mut cursor).collect();
            targets.into_iter().find_map(delete_target_violation)
        }
        "integer" => integer_literal_violation(text(node, source)),
        "concatenated_string" => mixed_bytes_violation(node, source),
        _ => None,
    }
}

fn argument_order_violation(arguments: Node<'_>) -> Option<&'static str> {
    let mut cursor = arguments.walk();
    let mut seen_keyword = false;
    let mut seen_mapping_unpack = false;
    for argument in arguments.named_children(&mut cursor) {
        if argument.is_extra() {
            continue;
        }
        match argument.kind() {
            "keyword_argument" => seen_keyword = true,
            "dictionary_splat" => seen_mapping_unpack = true,
            "list_splat" if seen_mapping_unpack => {
                return Some("iterable argument unpacking follows keyword argument unpacking")
            }
            "list_splat" => {}
            _ if seen_mapping_unpack => {
                return Some("positional argument follows keyword argument unpacking")
            }
            _ if seen_keyword => return Some("positional argument follows keyword argument"),
            _ => {}
        }
    }
    None
}

/// `for x in a, b` is only legal as a statement, never inside a comprehension.
fn comprehension_iterable_violation(clause: Node<'_>) -> Option<&'static str> {
    let mut cursor = clause.walk();
    let has_comma = clause.children(&mut cursor).any(|child| child.kind() == ",");
    if !has_comma {
        return None;
    }
    let call_argument = clause
        .parent()
        .filter(|generator| generator.kind() == "generator_expression")
        .and_then(|generator| generator.parent())
        .is_some_and(|parent| parent.kind() == "call");
    Some(if call_argument {
        "Generator expression must be parenthesized"
    } else {
        "invalid syntax"
    })
}

fn parameter_order_violation(parameters: Node<'_>) -> Option<&'static str> {
    const MESSAGE: &str = "parameter without a default follows parameter with a default";

    let mut cursor = parameters.walk();
    let mut seen_default = false;
    for parameter in parameters.named_children(&mut cursor) {
        match parameter.kind() {
            "default_parameter" | "typed_default_parameter" => seen_default = true,
            "identifier" | "keyword_identifier" if seen_default => return Some(MESSAGE),
            "typed_parameter" => {
                let starred = parameter.named_child(0).is_some_and(|inner| {
                    matches!(inner.kind(), "list_splat_pattern" | "dictionary_splat_pattern")
                });
                if starred {
                    break;
                }
                if seen_default {
                    return Some(MESSAGE);
                }
            }
            "tuple_pattern" => return Some("sublist parameters are not supported"),
            // everything after `*` is keyword-only
            "list_splat_pattern" | "keyword_separator" | "dictionary_splat_pattern" => break,
            _ => {}
        }
    }
    None
}

fn delete_target_violation(target: Node<'_>) -> Option<&'static str> {
    let target = unparenthesize(target);
    match target.kind() {
        "identifier" | "keyword_identifier" | "attribute" | "subscript" | "comment" => None,
        "tuple" | "list" | "expression_list" | "parenthesized_expression" => {
            let mut cursor = target.walk();
            let elements: Vec<Node<'_>> = target.named_children(&mut cursor).collect();
            elements.into_iter().find_map(delete_target_violation)
        }
        "call" => Some("cannot delete function call"),
        "string" | "concatenated_string" | "integer" | "float" | "true" | "false" | "none"
        | "ellipsis" => Some("cannot delete literal"),
        _ => Some("cannot delete expression"),
    }
}

fn integer_literal_violation(literal: &str) -> Option<&'static str> {
    let digits: String = literal
        .chars()
        .filter(|c| *c != '_')
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if digits.ends_with('l') {
        return Some("invalid integer literal");
    }
    if digits.ends_with('j') || ["0x", "0o", "0b"].iter().any(|p| digits.starts_with(p)) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') && digits.chars().any(|c| c != '0') {
        return Some(
            "leading zeros in decimal integer literals are not permitted; \
             use an 0o prefix for octal integers",
        );
    }
    None
}

fn mixed_bytes_violation(concatenated: Node<'_>, source: &str) -> Option<&'static str> {
    let mut cursor = concatenated.walk();
    let bytes: Vec<bool> = concatenated
        .named_children(&mut cursor)
        .filter(|part| part.kind() == "string")
        .map(|part| is_bytes_literal(part, source))
        .collect();
    let mixed = bytes.iter().any(|b| *b) && bytes.iter().any(|b| !*b);
    mixed.then_some("cannot mix bytes and nonbytes literals")
}

fn is_bytes_literal(string: Node<'_>, source: &str) -> bool {
    string
        .child(0)
        .filter(|start| start.kind() == "string_start")
        .is_some_and(|start| {
            text(start, source)
                .chars()
                .take_while(|c| c.is_ascii_alphabetic())
                .any(|c| c.eq_ignore_ascii_case(&'b'))
        })
}

struct FeatureExtractor<'s> {
    source: &'s str,
    features: CodeFeatures,
}

impl<'s> FeatureExtractor<'s> {
    fn new(source: &'s str) -> Self {
        Self {
            source,
            features: CodeFeatures::default(),
        }
    }

    fn walk(&mut self, root: Node<'_>) {
        let mut cursor = root.walk();
        loop {
            self.visit(cursor.node());

            if cursor.goto_first_child() {
                continue;
            }
            loop {
                if cursor.goto_next_sibling() {
                    break;
                }
                if !cursor.goto_parent() {
                    return;
                }
            }
        }
    }

    fn visit(&mut self, node: Node<'_>) {
        match node.kind() {
            "import_statement" => self.visit_import(node),
            "import_from_statement" => self.visit_import_from(node),
            "future_import_statement" => {
                self.features.imports.insert("__future__".to_string());
            }
            "call" => self.visit_call(node),
            "attribute" => {
                if let Some(chain) = attribute_chain(node, self.source) {
                    self.features.attribute_accesses.insert(chain);
                }
            }
            "identifier" => {
                let name = text(node, self.source);
                if DANGEROUS_BUILTINS.contains(&name) && is_name_reference(node) {
                    self.features.dangerous_builtins.insert(name.to_string());
                }
            }
            "global_statement" => self.features.has_global_statements = true,
            "nonlocal_statement" => self.features.has_nonlocal_statements = true,
            "class_definition" => {
                if let Some(name) = node.child_by_field_name("name") {
                    self.features
                        .class_definitions
                        .insert(text(name, self.source).to_string());
                }
            }
            "function_definition" | "for_statement" | "with_statement" => {
                if has_async_keyword(node) {
                    self.features.async_operations = true;
                }
            }
            "await" => self.features.async_operations = true,
            _ => {}
        }
    }

    fn visit_import(&mut self, node: Node<'_>) {
        let mut cursor = node.walk();
        for name in node.children_by_field_name("name", &mut cursor) {
            let dotted = match name.kind() {
                "aliased_import" => name.child_by_field_name("name"),
                _ => Some(name),
            };
            if let Some(dotted) = dotted {
                self.record_import(dotted);
            }
        }
    }

    fn visit_import_from(&mut self, node: Node<'_>) {
        let Some(module) = node.child_by_field_name("module_name") else {
            return;
        };
        match module.kind() {
            "dotted_name" => self.record_import(module),
            // `from .pkg import x` names `pkg`; `from . import x` names nothing
            "relative_import" => {
                let mut cursor = module.walk();
                let dotted = module
                    .named_children(&mut cursor)
                    .find(|child| child.kind() == "dotted_name");
                if let Some(dotted) = dotted {
                    self.record_import(dotted);
                }
            }
            _ => {}
        }
    }

    fn record_import(&mut self, dotted: Node<'_>) {
        if let Some(root) = dotted_name(dotted, self.source)
            .split('.')
            .next()
            .filter(|s| !s.is_empty())
        {
            self.features.imports.insert(root.to_string());
        }
    }

    fn visit_call(&mut self, node: Node<'_>) {
        let Some(function) = node.child_by_field_name("function") else {
            return;
        };
        let Some(call_name) = call_name(function, self.source) else {
            return;
        };

        self.features.function_calls.insert(call_name.clone());
        let args = call_arguments(node, self.source);

        if matches!(call_name.as_str(), "exec" | "eval" | "compile") {
            self.features
                .exec_eval_usage
                .push((call_name.clone(), args.clone()));
        }

        if is_file_operation(&call_name) {
            self.features
                .file_operations
                .push((call_name.clone(), args.clone()));
        }

        if is_system_call(&call_name) {
            self.features
                .system_calls
                .push((call_name.clone(), args.clone()));
        }

        if let Some((module, _)) = call_name.split_once('.') {
            if NETWORK_MODULES.contains(&module) {
                self.features.network_calls.push((call_name, args));
            }
        }
    }
}

fn is_file_operation(call_name: &str) -> bool {
    if call_name == "open" {
        return true;
    }
    match call_name.rsplit_once('.') {
        Some((_, method)) => FILE_OPERATIONS.contains(&method),
        None => false,
    }
}

/// Exact table match, or a segment-aligned overlap: same leading module and
/// same trailing function as some pattern (`os.posix.system` matches `os.system`).
fn is_system_call(call_name: &str) -> bool {
    if SYSTEM_CALL_PATTERNS.contains(&call_name) {
        return true;
    }
    let (Some((head, _)), Some((_, tail))) = (call_name.split_once('.'), call_name.rsplit_once('.'))
    else {
        return false;
    };
    SYSTEM_CALL_PATTERNS.iter().any(|pattern| {
        pattern
            .split_once('.')
            .map(|(module, function)| module == head && function == tail)
            .unwrap_or(false)
    })
}

fn text<'s>(node: Node<'_>, source: &'s str) -> &'s str {
    node.utf8_text(source.as_bytes()).unwrap_or_default()
}

/// `import a . b` is legal, so rebuild the name from its identifiers.
fn dotted_name(node: Node<'_>, source: &str) -> String {
    if node.kind() != "dotted_name" {
        return text(node, source).to_string();
    }
    let mut cursor = node.walk();
    node.named_children(&mut cursor)
        .filter(|child| child.kind() == "identifier")
        .map(|child| text(child, source))
        .collect::<Vec<_>>()
        .join(".")
}

/// Parentheses are transparent in the Python AST.
fn unparenthesize(mut node: Node<'_>) -> Node<'_> {
    while node.kind() == "parenthesized_expression" {
        let mut cursor = node.walk();
        let inner: Vec<Node<'_>> = node
            .named_children(&mut cursor)
            .filter(|child| !child.is_extra())
            .collect();
        match inner.as_slice() {
            [only] => node = *only,
            _ => break,
        }
    }
    node
}

fn call_name(function: Node<'_>, source: &str) -> Option<String> {
    let function = unparenthesize(function);
    match function.kind() {
        "identifier" => Some(text(function, source).to_string()),
        "attribute" => attribute_chain(function, source),
        _ => None,
    }
}

/// Dotted path of an attribute chain, or `None` when the receiver is not a plain name.
fn attribute_chain(node: Node<'_>, source: &str) -> Option<String> {
    let mut parts = Vec::new();
    let mut current = node;
    loop {
        match current.kind() {
            "attribute" => {
                let attr = current.child_by_field_name("attribute")?;
                parts.push(text(attr, source));
                current = unparenthesize(current.child_by_field_name("object")?);
            }
            "identifier" => {
                parts.push(text(current, source));
                break;
            }
            _ => return None,
        }
    }
    parts.reverse();
    Some(parts.join("."))
}

/// Positional arguments of a call, as literal strings or structural dumps.
fn call_arguments(call: Node<'_>, source: &str) -> Vec<String> {
    let Some(arguments) = call.child_by_field_name("arguments") else {
        return Vec::new();
    };
    if arguments.kind() == "generator_expression" {
        return vec![dump_node(arguments, source)];
    }

    let mut cursor = arguments.walk();
    arguments
        .named_children(&mut cursor)
        .filter(|arg| !arg.is_extra())
        .filter(|arg| !matches!(arg.kind(), "keyword_argument" | "dictionary_splat"))
        .map(|arg| literal_string(arg, source).unwrap_or_else(|| dump_node(arg, source)))
        .collect()
}

/// Value of a plain (non-bytes, non-f) string literal expression.
fn literal_string(node: Node<'_>, source: &str) -> Option<String> {
    let node = unparenthesize(node);
    match node.kind() {
        "string" => plain_string_value(node, source),
        "concatenated_string" => {
            let mut cursor = node.walk();
            let mut value = String::new();
            for part in node.named_children(&mut cursor).filter(|c| !c.is_extra()) {
                value.push_str(&plain_string_value(part, source)?);
            }
            Some(value)
        }
        _ => None,
    }
}

fn plain_string_value(node: Node<'_>, source: &str) -> Option<String> {
    if node.kind() != "string" {
        return None;
    }
    let count = node.child_count();
    let start = node.child(0)?;
    let end = node.child(count.checked_sub(1)?)?;
    if start.kind() != "string_start" || end.kind() != "string_end" {
        return None;
    }

    let mut cursor = node.walk();
    if node
        .children(&mut cursor)
        .any(|child| child.kind() == "interpolation")
    {
        return None;
    }

    let prefix: String = text(start, source)
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if prefix.contains('b') || prefix.contains('f') || prefix.contains('t') {
        return None;
    }

    let raw = source.get(start.end_byte()..end.start_byte())?;
    Some(if prefix.contains('r') {
        raw.to_string()
    } else {
        unescape(raw)
    })
}

/// Decode Python string escapes. Unknown escapes keep their backslash, as CPython does.
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some(next) = chars.next() else {
            out.push('\\');
            break;
        };
        match next {
            '\n' => {}
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            'a' => out.push('\u{07}'),
            'b' => out.push('\u{08}'),
            'f' => out.push('\u{0c}'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'v' => out.push('\u{0b}'),
            '0'..='7' => {
                let mut value = next.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match chars.peek().and_then(|d| d.to_digit(8)) {
                        Some(d) => {
                            value = value * 8 + d;
                            chars.next();
                        }
                        None => break,
                    }
                }
                out.extend(char::from_u32(value));
            }
            'x' | 'u' | 'U' => {
                let width = match next {
                    'x' => 2,
                    'u' => 4,
                    _ => 8,
                };
                let digits: String = (0..width)
                    .filter_map(|_| chars.next_if(|d| d.is_ascii_hexdigit()))
                    .collect();
                match u32::from_str_radix(&digits, 16).ok().and_then(char::from_u32) {
                    Some(decoded) if digits.len() == width => out.push(decoded),
                    _ => {
                        out.push('\\');
                        out.push(next);
                        out.push_str(&digits);
                    }
                }
            }
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    out
}

/// Compact structural rendering of an expression for audit logs,
/// e.g. `list(string('ls'))` or `call(function=identifier(f), arguments=argument_list())`.
pub(crate) fn dump_node(node: Node<'_>, source: &str) -> String {
    let mut out = String::new();
    write_dump(node, source, &mut out, 0);
    out
}

fn write_dump(node: Node<'_>, source: &str, out: &mut String, depth: usize) {
    out.push_str(node.kind());
    if matches!(node.kind(), "string" | "concatenated_string") || node.named_child_count() == 0 {
        out.push('(');
        out.push_str(text(node, source));
        out.push(')');
        return;
    }
    if depth >= MAX_DUMP_DEPTH {
        out.push_str("(...)");
        return;
    }

    out.push('(');
    let mut cursor = node.walk();
    let mut first = true;
    if cursor.goto_first_child() {
        loop {
            let child = cursor.node();
            if child.is_named() && !child.is_extra() {
                if !first {
                    out.push_str(", ");
                }
                first = false;
                if let Some(field) = cursor.field_name() {
                    out.push_str(field);
                    out.push('=');
                }
                write_dump(child, source, out, depth + 1);
            }
            if !cursor.goto_next_sibling() {
                break;
            }
        }
    }
    out.push(')');
}

fn has_async_keyword(node: Node<'_>) -> bool {
    let mut cursor = node.walk();
    let found = node
        .children(&mut cursor)
        .any(|child| !child.is_named() && child.kind() == "async");
    found
}

/// Whether an identifier sits where the Python AST would produce a `Name` node.
fn is_name_reference(node: Node<'_>) -> bool {
    let Some(parent) = node.parent() else {
        return true;
    };
    let is_field = |field: &str| parent.child_by_field_name(field) == Some(node);

    match parent.kind() {
        "attribute" => !is_field("attribute"),
        "function_definition" | "class_definition" | "keyword_argument" => !is_field("name"),
        "default_parameter" | "typed_default_parameter" => !is_field("name"),
        "dotted_name" | "aliased_import" | "global_statement" | "nonlocal_statement"
        | "parameters" | "lambda_parameters" | "typed_parameter" | "keyword_pattern" => false,
        "list_splat_pattern" | "dictionary_splat_pattern" => !matches!(
            parent.parent().map(|p| p.kind()),
            Some("parameters" | "lambda_parameters" | "typed_parameter")
        ),
        // `except E as name` binds a plain string, not a Name
        "as_pattern_target" => !matches!(
            parent.parent().and_then(|p| p.parent()).map(|p| p.kind()),
            Some("except_clause" | "except_group_clause")
        ),
        "except_clause" | "except_group_clause" => !is_field("alias"),
        // match captures
        "as_pattern" => parent.parent().map(|p| p.kind()) != Some("case_pattern"),
        "splat_pattern" => false,
        _ => true,
    }
}
