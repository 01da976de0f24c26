//! Lightweight structural checks on construct source.
//!
//! This is not a parser: it only verifies that brackets balance and that
//! strings, template literals, regex literals, JSX elements and comments are
//! terminated, so malformed payloads fail fast before screening. A `/` or `<`
//! starts a regex literal or JSX element only where an expression is
//! expected. It also lists the names a module exports, which the isolation
//! backends use to resolve entry points.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::SandboxError;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Frame {
    Paren,
    Bracket,
    Brace,
    /// Inside a template literal's text.
    Template,
    /// Inside a `${ ... }` substitution of a template literal.
    Substitution,
    /// Between `<` and `>` of a JSX opening tag.
    JsxTag,
    /// Text and children of an open JSX element.
    JsxChildren,
}

impl Frame {
    fn closer(&self) -> char {
        match self {
            Frame::Paren => ')',
            Frame::Bracket => ']',
            Frame::Brace | Frame::Substitution => '}',
            Frame::Template => '`',
            Frame::JsxTag | Frame::JsxChildren => '>',
        }
    }
}

struct Position {
    line: usize,
    column: usize,
}

fn syntax_error(message: impl Into<String>, at: &Position) -> SandboxError {
    SandboxError::Syntax {
        message: message.into(),
        line: at.line,
        column: at.column,
    }
}

/// Keywords after which an expression starts.
const EXPRESSION_KEYWORDS: &[&str] = &[
    "return", "yield", "await", "default", "case", "typeof", "void", "delete", "in", "of",
    "instanceof", "else", "do", "throw",
];

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Last significant token seen in code, used to tell a regex literal from a
/// division and a JSX element from a comparison.
struct Previous {
    last: Option<char>,
    word: String,
}

impl Previous {
    fn new() -> Self {
        Self {
            last: None,
            word: String::new(),
        }
    }

    fn push(&mut self, c: char) {
        if is_ident_char(c) {
            if !self.last.is_some_and(is_ident_char) {
                self.word.clear();
            }
            self.word.push(c);
        }
        self.last = Some(c);
    }

    /// Marks the end of a literal or element, which acts as a value.
    fn value(&mut self) {
        self.last = Some(')');
    }

    fn expects_expression(&self) -> bool {
        match self.last {
            None => true,
            Some(c) if is_ident_char(c) => EXPRESSION_KEYWORDS.contains(&self.word.as_str()),
            Some(c) => "(,=:[{?&|!;>+-*%~^<".contains(c),
        }
    }
}

/// Checks that the source is structurally well formed.
pub fn check_syntax(source: &str) -> Result<(), SandboxError> {
    let mut stack: Vec<(Frame, Position)> = Vec::new();
    let mut chars = source.chars().peekable();
    let mut pos = Position { line: 1, column: 0 };
    let mut previous = Previous::new();

    macro_rules! advance {
        ($c:expr) => {
            if $c == '\n' {
                pos.line += 1;
                pos.column = 0;
            } else {
                pos.column += 1;
            }
        };
    }

    while let Some(c) = chars.next() {
        advance!(c);
        let here = Position {
            line: pos.line,
            column: pos.column,
        };

        match stack.last().map(|(frame, _)| *frame) {
            Some(Frame::Template) => {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            advance!(escaped);
                        }
                    }
                    '`' => {
                        stack.pop();
                        previous.value();
                    }
                    '$' if chars.peek() == Some(&'{') => {
                        chars.next();
                        advance!('{');
                        stack.push((Frame::Substitution, here));
                        previous.push('{');
                    }
                    _ => {}
                }
                continue;
            }
            Some(Frame::JsxTag) => {
                match c {
                    '"' | '\'' => {
                        let mut closed = false;
                        for s in chars.by_ref() {
                            advance!(s);
                            if s == c {
                                closed = true;
                                break;
                            }
                        }
                        if !closed {
                            return Err(syntax_error("unterminated attribute string", &here));
                        }
                    }
                    '{' => {
                        stack.push((Frame::Brace, here));
                        previous.push('{');
                    }
                    '/' if chars.peek() == Some(&'>') => {
                        chars.next();
                        advance!('>');
                        stack.pop();
                        previous.value();
                    }
                    '>' => {
                        if let Some(top) = stack.last_mut() {
                            top.0 = Frame::JsxChildren;
                        }
                    }
                    _ => {}
                }
                continue;
            }
            Some(Frame::JsxChildren) => {
                match c {
                    '{' => {
                        stack.push((Frame::Brace, here));
                        previous.push('{');
                    }
                    '<' if chars.peek() == Some(&'/') => {
                        let mut closed = false;
                        for s in chars.by_ref() {
                            advance!(s);
                            if s == '>' {
                                closed = true;
                                break;
                            }
                        }
                        if !closed {
                            return Err(syntax_error("unterminated closing tag", &here));
                        }
                        stack.pop();
                        previous.value();
                    }
                    '<' => stack.push((Frame::JsxTag, here)),
                    _ => {}
                }
                continue;
            }
            _ => {}
        }

        if c.is_whitespace() {
            continue;
        }

        match c {
            '/' if chars.peek() == Some(&'/') => {
                for skipped in chars.by_ref() {
                    advance!(skipped);
                    if skipped == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                advance!('*');
                let mut closed = false;
                let mut prev = '\0';
                for skipped in chars.by_ref() {
                    advance!(skipped);
                    if prev == '*' && skipped == '/' {
                        closed = true;
                        break;
                    }
                    prev = skipped;
                }
                if !closed {
                    return Err(syntax_error("unterminated block comment", &here));
                }
            }
            '/' if previous.expects_expression() => {
                let mut closed = false;
                let mut in_class = false;
                while let Some(r) = chars.next() {
                    advance!(r);
                    match r {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                advance!(escaped);
                            }
                        }
                        '\n' => break,
                        '[' => in_class = true,
                        ']' => in_class = false,
                        '/' if !in_class => {
                            closed = true;
                            break;
                        }
                        _ => {}
                    }
                }
                if !closed {
                    return Err(syntax_error("unterminated regular expression", &here));
                }
                previous.value();
            }
            '<' if previous.expects_expression()
                && chars.peek().is_some_and(|n| n.is_alphabetic() || *n == '>') =>
            {
                stack.push((Frame::JsxTag, here));
            }
            '"' | '\'' => {
                let mut closed = false;
                while let Some(s) = chars.next() {
                    advance!(s);
                    match s {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                advance!(escaped);
                            }
                        }
                        '\n' => break,
                        s if s == c => {
                            closed = true;
                            break;
                        }
                        _ => {}
                    }
                }
                if !closed {
                    return Err(syntax_error("unterminated string literal", &here));
                }
                previous.value();
            }
            '`' => stack.push((Frame::Template, here)),
            '(' | '[' | '{' => {
                let frame = match c {
                    '(' => Frame::Paren,
                    '[' => Frame::Bracket,
                    _ => Frame::Brace,
                };
                stack.push((frame, here));
                previous.push(c);
            }
            ')' | ']' | '}' => {
                match stack.pop() {
                    Some((frame, _)) if frame.closer() == c => {}
                    Some((frame, _)) => {
                        return Err(syntax_error(
                            format!("expected '{}' but found '{c}'", frame.closer()),
                            &here,
                        ));
                    }
                    None => return Err(syntax_error(format!("unexpected '{c}'"), &here)),
                }
                previous.push(c);
            }
            _ => previous.push(c),
        }
    }

    match stack.pop() {
        None => Ok(()),
        Some((Frame::Template, opened)) => {
            Err(syntax_error("unterminated template literal", &opened))
        }
        Some((Frame::JsxTag | Frame::JsxChildren, opened)) => {
            Err(syntax_error("unclosed JSX element", &opened))
        }
        Some((frame, opened)) => Err(syntax_error(
            format!("unclosed delimiter, expected '{}'", frame.closer()),
            &opened,
        )),
    }
}

static DECLARED_EXPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\bexport\s+(?:default\s+)?(?:async\s+)?(?:const|let|var|class|function\s*\*?)\s*([A-Za-z_$][\w$]*)",
    )
    .unwrap()
});

static EXPORT_LIST: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bexport\s*\{([^}]*)\}").unwrap());

static DEFAULT_EXPORT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bexport\s+default\b").unwrap());

/// Names the module exports. `export default` contributes `"default"`.
pub fn exported_names(source: &str) -> BTreeSet<String> {
    let mut names: BTreeSet<String> = DECLARED_EXPORT
        .captures_iter(source)
        .map(|caps| caps[1].to_string())
        .collect();

    for caps in EXPORT_LIST.captures_iter(source) {
        for item in caps[1].split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            // `local as exported` exports the right-hand name
            let exported = item.rsplit(" as ").next().unwrap_or(item).trim();
            names.insert(exported.to_string());
        }
    }

    if DEFAULT_EXPORT.is_match(source) {
        names.insert("default".to_string());
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_message(source: &str) -> String {
        match check_syntax(source) {
            Err(SandboxError::Syntax { message, .. }) => message,
            other => panic!("expected a syntax error, got {other:?}"),
        }
    }

    #[test]
    fn test_balanced_component_is_valid() {
        let source = r#"
            // a card
            export const Card = ({ title, items }) => {
                /* render */
                const label = `Items: ${items.map((i) => `${i}`).join(", ")}`;
                return h("div", { title: 'it\'s {fine}' }, [label]);
            };
        "#;
        assert!(check_syntax(source).is_ok());
    }

    #[test]
    fn test_brackets_inside_strings_and_comments_are_ignored() {
        assert!(check_syntax("const s = '(('; // ))\n/* ]] */ const t = \"{\";").is_ok());
    }

    #[test]
    fn test_unclosed_brace() {
        assert!(error_message("export const C = () => {").contains("unclosed"));
    }

    #[test]
    fn test_unexpected_closer() {
        assert!(error_message("const a = 1);").contains("unexpected ')'"));
    }

    #[test]
    fn test_mismatched_closer_reports_position() {
        match check_syntax("const a = [1, 2);") {
            Err(SandboxError::Syntax { message, line, column }) => {
                assert!(message.contains("expected ']'"));
                assert_eq!(line, 1);
                assert_eq!(column, 16);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unterminated_string() {
        assert!(error_message("const a = 'abc\nconst b = 1;").contains("string"));
    }

    #[test]
    fn test_unterminated_template() {
        assert!(error_message("const a = `abc ${x}").contains("template"));
    }

    #[test]
    fn test_unterminated_block_comment() {
        assert!(error_message("/* never closed").contains("comment"));
    }

    #[test]
    fn test_error_line_numbers() {
        match check_syntax("const a = 1;\nconst b = 2;\n}") {
            Err(SandboxError::Syntax { line, .. }) => assert_eq!(line, 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_jsx_text_apostrophe_is_valid() {
        assert!(check_syntax("export const Card = () => <p>Don't panic</p>;").is_ok());
    }

    #[test]
    fn test_nested_jsx_is_valid() {
        let source = r#"
            export const List = ({ items }) => (
                <>
                    <h1 className="title">It's "quoted" (maybe</h1>
                    <ul>{items.map((i) => <li key={i}>{i > 1 ? 'big' : "small"}</li>)}</ul>
                    <br />
                </>
            );
        "#;
        assert!(check_syntax(source).is_ok());
    }

    #[test]
    fn test_comparisons_are_not_jsx() {
        assert!(check_syntax("const ok = a < b && c > d;
for (let i = 0; i<n; i++) {}").is_ok());
    }

    #[test]
    fn test_unclosed_jsx_element() {
        assert!(error_message("export const C = () => <div><p>hi</div>;").contains("JSX"));
    }

    #[test]
    fn test_regex_literals_are_valid() {
        let source = r#"
            const re = /\)/;
            const t = s.replace(/[)\]}]/g, "");
            const half = total / 2;
            const ok = (v) => /^[a-z]+$/.test(v);
        "#;
        assert!(check_syntax(source).is_ok());
    }

    #[test]
    fn test_unterminated_regex() {
        assert!(error_message("const re = /abc;\nconst b = 1;").contains("regular expression"));
    }

    #[test]
    fn test_exported_names_declarations() {
        let source = r#"
            export const Card = () => null;
            export function Header() {}
            export async function load() {}
            export class Widget {}
            export default function Page() {}
        "#;
        let names = exported_names(source);
        for name in ["Card", "Header", "load", "Widget", "Page", "default"] {
            assert!(names.contains(name), "missing {name}");
        }
    }

    #[test]
    fn test_exported_names_from_list() {
        let names = exported_names("const A = 1; const B = 2;\nexport { A, B as Banner };");
        assert!(names.contains("A"));
        assert!(names.contains("Banner"));
        assert!(!names.contains("B"));
    }

    #[test]
    fn test_unexported_component_is_absent() {
        let names = exported_names("const Hidden = () => null;");
        assert!(names.is_empty());
    }
}
