//! Patch compositor: splices method-level token ranges from a patch stream
//! into a copy of the source stream.
//!
//! All splices are performed from the highest token index downward, so every
//! edit leaves the index ranges of still-unprocessed (lower) methods intact.
//! Methods the patch does not mention are copied verbatim; the merged output
//! for them is byte-identical to the source.
//!
//! Line metadata on tokens is not recomputed after splicing, so lines in the
//! merged stream are approximate. Merged output is loaded, not debugged.

use crate::lex::{Token, TokenKind};
use crate::scan::ScanResult;
use std::collections::BTreeMap;
use thiserror::Error;

/// Result of composing one source/patch file pair.
#[derive(Debug, Clone)]
#[must_use = "a merge that is not serialized or inspected did nothing"]
pub struct MergeOutput {
    /// The merged token stream.
    pub tokens: Vec<Token>,
    /// The merged stream rendered to text by plain token concatenation.
    pub text: String,
    /// Original (pre-rename) source text of every overridden method, keyed by
    /// method name. Used downstream to diff against upstream changes.
    pub replaced_functions: BTreeMap<String, String>,
}

#[derive(Error, Debug)]
pub enum ComposeError {
    #[error("patch declares class `{0}` that does not exist in the source file")]
    UnknownClass(String),
}

/// The shadow name an overridden method's original body remains callable under.
pub fn shadow_name(class: &str, method: &str) -> String {
    format!("old_{class}_{method}_mp")
}

/// Merge `patch` into `source`.
///
/// For every class present in both scans: methods that exist only in the
/// patch are appended ahead of the class's closing brace (in patch
/// declaration order); methods present in both are replaced by the patch
/// body followed by the original body renamed to its shadow name. Classes
/// and methods the patch does not mention come through untouched.
pub fn compose(source: &ScanResult, patch: &ScanResult) -> Result<MergeOutput, ComposeError> {
    for name in patch.classes.keys() {
        if !source.classes.contains_key(name) {
            return Err(ComposeError::UnknownClass(name.clone()));
        }
    }

    let mut merged = source.tokens.clone();
    let mut replaced_functions = BTreeMap::new();

    for src_class in source.classes_by_position().into_iter().rev() {
        let Some(patch_class) = patch.classes.get(&src_class.name) else {
            continue;
        };

        // New methods first: every insertion lands at the class's closing
        // brace, above all replacement ranges. Reverse order of position in
        // the patch, so the final appended order matches the patch file.
        for method in patch_class.methods_by_position().into_iter().rev() {
            if src_class.methods.contains_key(&method.name) {
                continue;
            }
            let body = patch.tokens[method.start..=method.end].to_vec();
            splice_range(&mut merged, body, src_class.end, src_class.end - 1);
        }

        // Overridden methods, highest source index first.
        for src_method in src_class.methods_by_position().into_iter().rev() {
            let Some(patch_method) = patch_class.methods.get(&src_method.name) else {
                continue;
            };

            let original_text = source.text_of(src_method.start, src_method.end);

            let mut block = patch.tokens[patch_method.start..=patch_method.end].to_vec();
            let newline_line = block.last().map_or(0, |t| t.line);
            block.push(Token {
                kind: TokenKind::Whitespace,
                text: "\n".to_string(),
                line: newline_line,
            });
            for token in &source.tokens[src_method.start..=src_method.end] {
                let mut token = token.clone();
                if token.kind == TokenKind::Identifier && token.text == src_method.name {
                    token.text = shadow_name(&src_class.name, &src_method.name);
                }
                block.push(token);
            }

            replaced_functions.insert(src_method.name.clone(), original_text);
            splice_range(&mut merged, block, src_method.start, src_method.end);
        }
    }

    let text: String = merged.iter().map(|t| t.text.as_str()).collect();
    Ok(MergeOutput {
        tokens: merged,
        text,
        replaced_functions,
    })
}

/// Replace the inclusive token range `[dest_from, dest_to]` of `dest` with
/// `replacement`. `dest_to == dest_from - 1` inserts ahead of `dest_from`
/// without removing anything.
///
/// Bounds are a caller contract, guaranteed by the scanner's non-overlap
/// invariant; violations are a bug and panic.
pub fn splice_range(
    dest: &mut Vec<Token>,
    replacement: Vec<Token>,
    dest_from: usize,
    dest_to: usize,
) {
    assert!(
        dest_to + 1 >= dest_from,
        "splice range [{dest_from}, {dest_to}] is inverted"
    );
    assert!(
        dest_from <= dest.len() && dest_to + 1 <= dest.len(),
        "splice range [{dest_from}, {dest_to}] is out of bounds for {} tokens",
        dest.len()
    );
    dest.splice(dest_from..dest_to + 1, replacement);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lex::lex;
    use crate::scan::scan;

    fn scan_src(src: &str) -> ScanResult {
        scan(lex(src)).unwrap()
    }

    const SOURCE: &str = "<?php\nclass A\n{\n    function x(){return 1;}\n    function y(){return 2;}\n}\n";
    const PATCH: &str = "<?php\nclass A\n{\n    function y(){return 20;}\n    function z(){return 3;}\n}\n";

    #[test]
    fn override_and_append() {
        let merged = compose(&scan_src(SOURCE), &scan_src(PATCH)).unwrap();

        // x untouched, y overridden with the shadow copy kept, z appended.
        assert!(merged.text.contains("function x(){return 1;}"));
        assert!(merged.text.contains("function y(){return 20;}"));
        assert!(merged.text.contains("function old_A_y_mp(){return 2;}"));
        assert!(merged.text.contains("function z(){return 3;}"));
        assert!(!merged.text.contains("function y(){return 2;}"));

        assert_eq!(merged.replaced_functions.len(), 1);
        assert_eq!(
            merged.replaced_functions["y"],
            "function y(){return 2;}"
        );
    }

    #[test]
    fn patch_body_precedes_shadow_copy() {
        let merged = compose(&scan_src(SOURCE), &scan_src(PATCH)).unwrap();
        let patched = merged.text.find("function y(){return 20;}").unwrap();
        let shadow = merged.text.find("function old_A_y_mp()").unwrap();
        assert!(patched < shadow);
    }

    #[test]
    fn new_method_lands_before_class_closing_brace() {
        let merged = compose(&scan_src(SOURCE), &scan_src(PATCH)).unwrap();
        let z = merged.text.find("function z()").unwrap();
        let close = merged.text.rfind('}').unwrap();
        assert!(z < close);
        // Appended after the last original method.
        let y_shadow = merged.text.find("old_A_y_mp").unwrap();
        assert!(y_shadow < z);
    }

    #[test]
    fn new_methods_keep_patch_declaration_order() {
        let patch = "<?php\nclass A\n{\n    function p(){return 10;}\n    function q(){return 11;}\n}\n";
        let merged = compose(&scan_src(SOURCE), &scan_src(patch)).unwrap();
        let p = merged.text.find("function p()").unwrap();
        let q = merged.text.find("function q()").unwrap();
        assert!(p < q);
        assert!(merged.replaced_functions.is_empty());
    }

    #[test]
    fn untouched_prefix_is_byte_identical() {
        let source = scan_src(SOURCE);
        let merged = compose(&source, &scan_src(PATCH)).unwrap();
        // Everything before the first replaced method is conserved verbatim.
        let y = &source.classes["A"].methods["y"];
        let prefix: String = source.tokens[..y.start].iter().map(|t| t.text.as_str()).collect();
        assert!(merged.text.starts_with(&prefix));
    }

    #[test]
    fn compose_is_idempotent_over_inputs() {
        let source = scan_src(SOURCE);
        let patch = scan_src(PATCH);
        let first = compose(&source, &patch).unwrap();
        let second = compose(&source, &patch).unwrap();
        assert_eq!(first.text, second.text);
        assert_eq!(first.replaced_functions, second.replaced_functions);
    }

    #[test]
    fn self_calls_in_shadow_copy_are_renamed() {
        let source = "<?php class A { function f($n){ if ($n) { return $this->f($n - 1); } return 0; } }";
        let patch = "<?php class A { function f($n){ return $this->old_A_f_mp($n) + 1; } }";
        let merged = compose(&scan_src(source), &scan_src(patch)).unwrap();
        // The shadow copy calls itself under the shadow name.
        assert!(merged
            .text
            .contains("function old_A_f_mp($n){ if ($n) { return $this->old_A_f_mp($n - 1); } return 0; }"));
        // Exactly one renamed definition.
        assert_eq!(merged.text.matches("function old_A_f_mp").count(), 1);
    }

    #[test]
    fn string_literals_are_not_renamed() {
        let source = "<?php class A { function f(){ return 'f'; } }";
        let patch = "<?php class A { function f(){ return 'patched f'; } }";
        let merged = compose(&scan_src(source), &scan_src(patch)).unwrap();
        assert!(merged.text.contains("return 'f';"));
    }

    #[test]
    fn classes_not_in_patch_are_conserved() {
        let source = "<?php class A { function f(){return 1;} } class B { function g(){return 2;} }";
        let patch = "<?php class B { function g(){return 20;} }";
        let merged = compose(&scan_src(source), &scan_src(patch)).unwrap();
        assert!(merged.text.starts_with("<?php class A { function f(){return 1;} }"));
        assert!(merged.text.contains("function g(){return 20;}"));
        assert!(merged.text.contains("old_B_g_mp"));
    }

    #[test]
    fn patch_class_missing_from_source_is_an_error() {
        let source = "<?php class A { function f(){} }";
        let patch = "<?php class C { function f(){} }";
        let err = compose(&scan_src(source), &scan_src(patch)).unwrap_err();
        assert!(matches!(err, ComposeError::UnknownClass(name) if name == "C"));
    }

    #[test]
    fn splice_range_replaces_inclusive_bounds() {
        let mut dest = lex("<?php $a $b $c");
        let replacement = vec![Token {
            kind: TokenKind::Other,
            text: "X".to_string(),
            line: 1,
        }];
        // Replace the `$b` token (index 3: tag, ws, $a, ws, $b...).
        let b = dest.iter().position(|t| t.text == "$b").unwrap();
        splice_range(&mut dest, replacement, b, b);
        let text: String = dest.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(text, "<?php $a X $c");
    }

    #[test]
    fn splice_range_inserts_when_range_is_empty() {
        let mut dest = lex("<?php $a $c");
        let a = dest.iter().position(|t| t.text == "$a").unwrap();
        let replacement = vec![Token {
            kind: TokenKind::Other,
            text: "X".to_string(),
            line: 1,
        }];
        splice_range(&mut dest, replacement, a + 1, a);
        let text: String = dest.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(text, "<?php $aX $c");
    }

    #[test]
    #[should_panic(expected = "inverted")]
    fn splice_range_rejects_inverted_bounds() {
        let mut dest = lex("<?php $a");
        splice_range(&mut dest, Vec::new(), 3, 1);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn splice_range_rejects_out_of_bounds() {
        let mut dest = lex("<?php");
        let len = dest.len();
        splice_range(&mut dest, Vec::new(), len + 1, len + 1);
    }
}
