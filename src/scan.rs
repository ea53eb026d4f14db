//! Structural scanner: recovers class and method boundaries from a token
//! stream with a small nesting-depth state machine.
//!
//! This is not a parser. It recognizes just enough grammar to locate method
//! bodies - class headers, visibility modifiers, brace nesting - and treats
//! everything inside a body as an opaque token run. Ranges are inclusive token
//! index pairs, the unit of addressing for the compositor.

use crate::lex::{Token, TokenKind};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Private,
    Protected,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
            Visibility::Protected => "protected",
        }
    }

    fn from_keyword(text: &str) -> Option<Self> {
        if text.eq_ignore_ascii_case("public") {
            Some(Visibility::Public)
        } else if text.eq_ignore_ascii_case("private") {
            Some(Visibility::Private)
        } else if text.eq_ignore_ascii_case("protected") {
            Some(Visibility::Protected)
        } else {
            None
        }
    }
}

/// One method, spanning the inclusive token range `[start, end]` from its
/// header (including a preceding visibility modifier, when present) through
/// its closing brace.
#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub name: String,
    pub visibility: Visibility,
    pub start: usize,
    pub end: usize,
    pub owner: String,
}

/// One top-level class and its methods, keyed by method name.
#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub name: String,
    pub start: usize,
    pub end: usize,
    pub methods: BTreeMap<String, MethodInfo>,
}

impl ClassInfo {
    /// Methods ordered by their position in the token stream.
    pub fn methods_by_position(&self) -> Vec<&MethodInfo> {
        let mut methods: Vec<&MethodInfo> = self.methods.values().collect();
        methods.sort_by_key(|m| m.start);
        methods
    }
}

/// Tokens plus every class found at the top nesting level.
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub tokens: Vec<Token>,
    pub classes: BTreeMap<String, ClassInfo>,
}

impl ScanResult {
    /// Classes ordered by their position in the token stream.
    pub fn classes_by_position(&self) -> Vec<&ClassInfo> {
        let mut classes: Vec<&ClassInfo> = self.classes.values().collect();
        classes.sort_by_key(|c| c.start);
        classes
    }

    /// Source text of the inclusive token range `[start, end]`.
    pub fn text_of(&self, start: usize, end: usize) -> String {
        self.tokens[start..=end]
            .iter()
            .map(|t| t.text.as_str())
            .collect()
    }
}

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("class `{class}` (line {line}) is never closed")]
    UnterminatedClass { class: String, line: u32 },

    #[error("method `{class}::{method}` (line {line}) is never closed")]
    UnterminatedMethod {
        class: String,
        method: String,
        line: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Outside,
    InClass,
    InClassBody,
    InMethodHeader,
    InMethodBody,
}

struct ClassBuilder {
    name: String,
    entry_depth: i32,
    start: usize,
    line: u32,
    methods: BTreeMap<String, MethodInfo>,
}

struct MethodBuilder {
    name: String,
    visibility: Visibility,
    entry_depth: i32,
    start: usize,
    line: u32,
}

/// Scan a token stream for class and method ranges.
///
/// Total over well-lexed input; a class or method whose body never closes
/// before end of stream is a [`ScanError`], surfaced to the caller rather
/// than silently dropped.
pub fn scan(tokens: Vec<Token>) -> Result<ScanResult, ScanError> {
    let mut classes: BTreeMap<String, ClassInfo> = BTreeMap::new();
    let mut state = State::Outside;
    let mut nesting: i32 = 0;
    let mut pending_modifier: Option<(Visibility, usize)> = None;
    let mut class: Option<ClassBuilder> = None;
    let mut method: Option<MethodBuilder> = None;
    // One-shot: a `{$` interpolation opener makes the next `}` close the
    // interpolation instead of a block.
    let mut curly_open = false;

    for (index, token) in tokens.iter().enumerate() {
        match state {
            State::Outside => {
                if token.is_keyword("class") {
                    class = Some(ClassBuilder {
                        name: String::new(),
                        entry_depth: 0,
                        start: 0,
                        line: token.line,
                        methods: BTreeMap::new(),
                    });
                    state = State::InClass;
                }
            }
            State::InClass => {
                if token.kind == TokenKind::Identifier {
                    let builder = class.as_mut().expect("InClass state always has a builder");
                    builder.name = token.text.clone();
                    builder.entry_depth = nesting + 1;
                    builder.start = index;
                    pending_modifier = None;
                    state = State::InClassBody;
                }
            }
            State::InClassBody => {
                if token.is_punct('{') {
                    nesting += 1;
                } else if token.is_punct('}') {
                    nesting -= 1;
                    let builder = class.as_ref().expect("InClassBody state always has a builder");
                    if nesting < builder.entry_depth {
                        let builder = class.take().expect("checked above");
                        classes.insert(
                            builder.name.clone(),
                            ClassInfo {
                                name: builder.name,
                                start: builder.start,
                                end: index,
                                methods: builder.methods,
                            },
                        );
                        state = State::Outside;
                    }
                } else if token.kind == TokenKind::Keyword {
                    if let Some(visibility) = Visibility::from_keyword(&token.text) {
                        pending_modifier = Some((visibility, index));
                    } else if token.is_keyword("function") {
                        let (visibility, start) = pending_modifier
                            .take()
                            .map_or((Visibility::Public, index), |(v, at)| (v, at));
                        method = Some(MethodBuilder {
                            name: String::new(),
                            visibility,
                            entry_depth: nesting + 1,
                            start,
                            line: token.line,
                        });
                        curly_open = false;
                        state = State::InMethodHeader;
                    }
                } else if token.kind == TokenKind::Variable {
                    // A field declaration consumes the pending modifier.
                    pending_modifier = None;
                }
            }
            State::InMethodHeader => {
                if token.kind == TokenKind::Identifier {
                    method
                        .as_mut()
                        .expect("InMethodHeader state always has a builder")
                        .name = token.text.clone();
                    state = State::InMethodBody;
                }
            }
            State::InMethodBody => {
                if token.kind == TokenKind::CurlyOpen {
                    curly_open = true;
                } else if token.is_punct('{') {
                    nesting += 1;
                } else if token.is_punct('}') {
                    if curly_open {
                        curly_open = false;
                    } else {
                        nesting -= 1;
                        let builder = method
                            .as_ref()
                            .expect("InMethodBody state always has a builder");
                        if nesting < builder.entry_depth {
                            let builder = method.take().expect("checked above");
                            let owner = class
                                .as_mut()
                                .expect("methods are only scanned inside a class");
                            owner.methods.insert(
                                builder.name.clone(),
                                MethodInfo {
                                    name: builder.name,
                                    visibility: builder.visibility,
                                    start: builder.start,
                                    end: index,
                                    owner: owner.name.clone(),
                                },
                            );
                            state = State::InClassBody;
                        }
                    }
                }
            }
        }
    }

    match state {
        State::Outside => Ok(ScanResult { tokens, classes }),
        State::InMethodHeader | State::InMethodBody => {
            let builder = method.expect("method states always have a builder");
            let owner = class.map_or_else(String::new, |c| c.name);
            Err(ScanError::UnterminatedMethod {
                class: owner,
                method: if builder.name.is_empty() {
                    "<unnamed>".to_string()
                } else {
                    builder.name
                },
                line: builder.line,
            })
        }
        State::InClass | State::InClassBody => {
            let builder = class.expect("class states always have a builder");
            Err(ScanError::UnterminatedClass {
                class: if builder.name.is_empty() {
                    "<unnamed>".to_string()
                } else {
                    builder.name
                },
                line: builder.line,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lex::lex;

    fn scan_src(src: &str) -> ScanResult {
        scan(lex(src)).unwrap()
    }

    #[test]
    fn finds_class_and_method_ranges() {
        let src = "<?php\nclass Foo\n{\n    public function bar()\n    {\n        return 1;\n    }\n}\n";
        let result = scan_src(src);
        let class = &result.classes["Foo"];
        assert_eq!(result.tokens[class.start].text, "Foo");
        assert_eq!(result.tokens[class.end].text, "}");

        let method = &class.methods["bar"];
        assert_eq!(method.owner, "Foo");
        assert_eq!(method.visibility, Visibility::Public);
        // Range starts at the modifier and ends at the closing brace.
        assert_eq!(result.tokens[method.start].text, "public");
        assert_eq!(result.tokens[method.end].text, "}");
        assert_eq!(
            result.text_of(method.start, method.end),
            "public function bar()\n    {\n        return 1;\n    }"
        );
    }

    #[test]
    fn default_visibility_is_public() {
        let result = scan_src("<?php class A { function f() { } }");
        let method = &result.classes["A"].methods["f"];
        assert_eq!(method.visibility, Visibility::Public);
        assert_eq!(result.tokens[method.start].text, "function");
    }

    #[test]
    fn field_declaration_clears_pending_modifier() {
        let src = "<?php class A { private $field; function f() { } }";
        let result = scan_src(src);
        let method = &result.classes["A"].methods["f"];
        assert_eq!(method.visibility, Visibility::Public);
        assert_eq!(result.tokens[method.start].text, "function");
    }

    #[test]
    fn modifier_is_consumed_by_one_method() {
        let src = "<?php class A { protected function f() { } function g() { } }";
        let result = scan_src(src);
        assert_eq!(
            result.classes["A"].methods["f"].visibility,
            Visibility::Protected
        );
        assert_eq!(
            result.classes["A"].methods["g"].visibility,
            Visibility::Public
        );
    }

    #[test]
    fn nested_braces_stay_inside_method() {
        let src = "<?php class A { function f($x) { if ($x) { while ($x) { $x--; } } return $x; } function g() { } }";
        let result = scan_src(src);
        let class = &result.classes["A"];
        assert_eq!(class.methods.len(), 2);
        let f = &class.methods["f"];
        assert!(result.text_of(f.start, f.end).ends_with("return $x; }"));
    }

    #[test]
    fn interpolated_brace_does_not_close_method() {
        let src = r#"<?php class A { function f() { return "x={$this->x}"; } }"#;
        let result = scan_src(src);
        let f = &result.classes["A"].methods["f"];
        let text = result.text_of(f.start, f.end);
        assert!(text.ends_with('}'));
        assert!(text.contains("{$this->x}"));
        // The class itself closed properly after the method.
        assert_eq!(
            result.tokens[result.classes["A"].end].text,
            "}"
        );
    }

    #[test]
    fn multiple_classes_at_top_level() {
        let src = "<?php class A { function f() { } } class B { function g() { } }";
        let result = scan_src(src);
        assert_eq!(result.classes.len(), 2);
        let by_pos = result.classes_by_position();
        assert_eq!(by_pos[0].name, "A");
        assert_eq!(by_pos[1].name, "B");
        assert!(by_pos[0].end < by_pos[1].start);
    }

    #[test]
    fn method_ranges_never_overlap() {
        let src = "<?php class A { public function a() { return 1; } private function b() { return 2; } protected function c() { return 3; } }";
        let result = scan_src(src);
        let class = &result.classes["A"];
        let methods = class.methods_by_position();
        for pair in methods.windows(2) {
            assert!(pair[0].end < pair[1].start, "ranges overlap");
        }
        for m in &methods {
            assert!(class.start < m.start && m.end < class.end);
        }
    }

    #[test]
    fn unterminated_class_is_an_error() {
        let err = scan(lex("<?php class A { function f() { }")).unwrap_err();
        assert!(matches!(err, ScanError::UnterminatedClass { .. }));
    }

    #[test]
    fn unterminated_method_is_an_error() {
        let err = scan(lex("<?php class A { function f() { return 1;")).unwrap_err();
        match err {
            ScanError::UnterminatedMethod { class, method, .. } => {
                assert_eq!(class, "A");
                assert_eq!(method, "f");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn code_outside_classes_is_ignored() {
        let src = "<?php function free() { } $x = 1; class A { function f() { } }";
        let result = scan_src(src);
        assert_eq!(result.classes.len(), 1);
        assert_eq!(result.classes["A"].methods.len(), 1);
    }
}
