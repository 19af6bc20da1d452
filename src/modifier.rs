//! Payload modifiers compiled from declarative override rules. Each
//! modifier reacts to one opcode (only Text in practice) and either
//! rewrites the frame payload or passes the frame through untouched.

use crate::config::{PayloadMatchKind, PayloadRuleConfig};
use crate::error::ProxyError;
use crate::frame::{Frame, Opcode};
use regex::Regex;

#[derive(Debug, Clone)]
enum ModifierKind {
    Exact { pattern: Vec<u8>, value: Vec<u8> },
    Pattern { regex: Regex, value: String },
}

#[derive(Debug, Clone)]
pub struct Modifier {
    pub on: Opcode,
    kind: ModifierKind,
}

impl Modifier {
    /// Replaces the whole payload when it equals `pattern` byte-for-byte.
    pub fn exact(on: Opcode, pattern: &str, value: &str) -> Modifier {
        Modifier {
            on,
            kind: ModifierKind::Exact {
                pattern: pattern.as_bytes().to_vec(),
                value: value.as_bytes().to_vec(),
            },
        }
    }

    /// Replace-all over the payload interpreted as UTF-8. Pattern errors
    /// fail the whole program build at startup.
    pub fn pattern(on: Opcode, pattern: &str, value: &str) -> Result<Modifier, ProxyError> {
        Ok(Modifier {
            on,
            kind: ModifierKind::Pattern {
                regex: Regex::new(pattern)?,
                value: value.to_string(),
            },
        })
    }

    pub fn apply(&self, mut frame: Frame) -> Result<Frame, ProxyError> {
        match &self.kind {
            ModifierKind::Exact { pattern, value } => {
                if frame.payload == *pattern {
                    frame.set_payload(value.clone());
                }
                Ok(frame)
            }
            ModifierKind::Pattern { regex, value } => {
                let text = std::str::from_utf8(&frame.payload)
                    .map_err(|e| ProxyError::Modifier(format!("payload is not valid UTF-8: {e}")))?;
                let replaced = regex.replace_all(text, value.as_str()).into_owned();
                frame.set_payload(replaced.into_bytes());
                Ok(frame)
            }
        }
    }
}

/// Compiles the declarative payload rules of one upstream into an
/// ordered modifier program, all registered against the Text opcode.
pub fn compile_program(rules: &[PayloadRuleConfig]) -> Result<Vec<Modifier>, ProxyError> {
    rules
        .iter()
        .map(|rule| match rule.kind {
            PayloadMatchKind::Exact => Ok(Modifier::exact(Opcode::Text, &rule.pattern, &rule.value)),
            PayloadMatchKind::Regex => Modifier::pattern(Opcode::Text, &rule.pattern, &rule.value),
        })
        .collect()
}

/// Folds a frame through the program in declared order.
pub fn apply_program(mut frame: Frame, modifiers: &[Modifier]) -> Result<Frame, ProxyError> {
    for modifier in modifiers {
        frame = modifier.apply(frame)?;
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_rewrites_matching_payload() {
        let modifier = Modifier::exact(Opcode::Text, "hello", "world");
        let out = modifier.apply(Frame::text(b"hello".to_vec())).unwrap();
        assert_eq!(out.payload, b"world");
        assert_eq!(out.length, 5);
    }

    #[test]
    fn exact_leaves_other_payloads_untouched() {
        let modifier = Modifier::exact(Opcode::Text, "hello", "world");
        let input = Frame::text(b"hellox".to_vec());
        let out = modifier.apply(input.clone()).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn regex_replaces_all_occurrences() {
        let modifier = Modifier::pattern(Opcode::Text, "v[0-9]+", "vX").unwrap();
        let out = modifier.apply(Frame::text(b"api-v12-then-v3".to_vec())).unwrap();
        assert_eq!(out.payload, b"api-vX-then-vX");
        assert_eq!(out.length, out.payload.len() as u64);
    }

    #[test]
    fn regex_rejects_non_utf8_payload() {
        let modifier = Modifier::pattern(Opcode::Text, "x", "y").unwrap();
        let mut frame = Frame::text(Vec::new());
        frame.set_payload(vec![0xFF, 0xFE]);
        assert!(matches!(
            modifier.apply(frame),
            Err(ProxyError::Modifier(_))
        ));
    }

    #[test]
    fn bad_pattern_fails_program_build() {
        let rules = [PayloadRuleConfig {
            kind: PayloadMatchKind::Regex,
            pattern: "[".to_string(),
            value: String::new(),
        }];
        assert!(matches!(compile_program(&rules), Err(ProxyError::Regex(_))));
    }

    #[test]
    fn program_composes_in_declared_order() {
        let program = vec![
            Modifier::exact(Opcode::Text, "a", "b"),
            Modifier::exact(Opcode::Text, "b", "c"),
        ];
        let out = apply_program(Frame::text(b"a".to_vec()), &program).unwrap();
        assert_eq!(out.payload, b"c");

        // Reversed order never reaches the second rule.
        let program: Vec<Modifier> = program.into_iter().rev().collect();
        let out = apply_program(Frame::text(b"a".to_vec()), &program).unwrap();
        assert_eq!(out.payload, b"b");
    }

    #[test]
    fn empty_program_is_identity() {
        let input = Frame::text(b"unchanged".to_vec());
        let out = apply_program(input.clone(), &[]).unwrap();
        assert_eq!(out, input);
    }
}
