//! Tolerant parsing of model responses.
//!
//! Models wrap their answer in prose, mix quote styles and sometimes ignore
//! the requested format entirely. Every parser here returns an empty result
//! rather than an error when nothing usable is found.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;

lazy_static! {
    static ref QUOTED_ITEM: Regex = Regex::new(r#""([^"\n]+)"|'([^'\n]+)'"#).unwrap();
    static ref QUOTED_PAIR: Regex = Regex::new(
        r#"(?s)(?:"((?:[^"\\]|\\.)*)"|'((?:[^'\\]|\\.)*)')\s*:\s*(?:"((?:[^"\\]|\\.)*)"|'((?:[^'\\]|\\.)*)'|(None|null))"#
    ).unwrap();
    // A `term: definition` line counts only behind a bullet, a number or a
    // bold term.
    static ref DEFINITION_LINE: Regex = Regex::new(
        r"^\s*(?:(?:[-*•]|\d+[.)])\s+\**([^:*\n]{1,100}?)\**|\*\*([^:*\n]{1,100}?)\*\*)\s*(?::|\s-\s)\s*(.+?)\s*$"
    ).unwrap();
    static ref BULLET: Regex = Regex::new(r"^\s*(?:[-*•]|\d+[.)])\s*").unwrap();
}

/// Keywords over this many words are prose, not terms.
const MAX_KEYWORD_WORDS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDefinition {
    pub term: String,
    pub definition: String,
}

// ── Keywords ────────────────────────────────────────────────────────────────

/// Candidate terms from a keyword-pass response.
///
/// Tries each `[...]` block in turn for a list of quoted items, then a JSON
/// document, then bulleted lines or a single comma-separated line. Prose and
/// refusals yield nothing.
pub fn parse_keywords(response: &str) -> Vec<String> {
    let from_list = bracket_blocks(response)
        .map(|inner| {
            QUOTED_ITEM
                .captures_iter(inner)
                .filter_map(|c| c.get(1).or_else(|| c.get(2)))
                .map(|m| m.as_str().trim().to_string())
                .filter(|item| is_keyword(item))
                .collect::<Vec<_>>()
        })
        .find(|items| !items.is_empty());
    if let Some(items) = from_list {
        return dedup_keywords(items);
    }

    if let Some(items) = json_keywords(response) {
        let items: Vec<String> = items.into_iter().filter(|item| is_keyword(item)).collect();
        if !items.is_empty() {
            return dedup_keywords(items);
        }
    }

    dedup_keywords(delimited_keywords(response))
}

/// Inner text of every non-nested `[...]` block, in order.
fn bracket_blocks(s: &str) -> impl Iterator<Item = &str> {
    let mut rest = s;
    std::iter::from_fn(move || {
        let start = rest.find('[')?;
        let end = rest[start..].find(']')? + start;
        let inner = &rest[start + 1..end];
        rest = &rest[end + 1..];
        Some(inner)
    })
}

fn json_keywords(response: &str) -> Option<Vec<String>> {
    let value: Value = serde_json::from_str(strip_code_fence(response)).ok()?;
    let list = match &value {
        Value::Array(items) => items,
        Value::Object(map) => map.get("keywords").or_else(|| map.get("terms"))?.as_array()?,
        _ => return None,
    };
    Some(list.iter().filter_map(|v| v.as_str().map(|s| s.trim().to_string())).collect())
}

/// A short noun phrase: no brackets, no trailing sentence punctuation.
fn is_keyword(item: &str) -> bool {
    !item.is_empty()
        && !item.contains(['[', ']', '{', '}'])
        && !item.ends_with(['.', '!', '?'])
        && item.split_whitespace().count() <= MAX_KEYWORD_WORDS
}

fn clean_item(item: &str) -> String {
    item.trim().trim_matches(['"', '\'', '*', ' ']).to_string()
}

/// Bulleted or numbered lines; failing that, the first line that splits into
/// two or more comma-separated keywords.
fn delimited_keywords(response: &str) -> Vec<String> {
    let body = strip_code_fence(response);
    let bullets: Vec<String> = body
        .lines()
        .filter(|l| BULLET.is_match(l))
        .map(|l| clean_item(&BULLET.replace(l, "")))
        .filter(|item| is_keyword(item))
        .collect();
    if !bullets.is_empty() {
        return bullets;
    }

    body.lines()
        .find_map(|line| {
            let line = line.rsplit_once(':').map_or(line, |(_, list)| list);
            let parts: Vec<String> = line.split(',').map(clean_item).filter(|p| !p.is_empty()).collect();
            (parts.len() > 1 && parts.iter().all(|p| is_keyword(p))).then_some(parts)
        })
        .unwrap_or_default()
}

fn dedup_keywords(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && seen.insert(s.to_lowercase()))
        .collect()
}

// ── Definitions ─────────────────────────────────────────────────────────────

/// Term/definition pairs from a definition-pass response.
///
/// Tries the first balanced `{...}` block as JSON, then as loosely quoted
/// `key: value` pairs (Python dict style included), then `term: definition`
/// or `term - definition` lines.
pub fn parse_definitions(response: &str) -> Vec<ParsedDefinition> {
    let mut pairs = Vec::new();
    if let Some(block) = first_balanced_block(response) {
        pairs = json_pairs(block).unwrap_or_else(|| quoted_pairs(block));
    }
    if pairs.is_empty() {
        pairs = line_pairs(response);
    }

    let mut seen = HashSet::new();
    pairs
        .into_iter()
        .filter_map(|(term, definition)| {
            let term = term.trim().to_string();
            let definition = definition.trim().to_string();
            if term.is_empty() || is_missing_definition(&definition) {
                return None;
            }
            seen.insert(term.to_lowercase()).then_some(ParsedDefinition { term, definition })
        })
        .collect()
}

fn is_missing_definition(def: &str) -> bool {
    def.is_empty() || ["none", "null", "n/a"].contains(&def.to_ascii_lowercase().as_str())
}

/// The first `{...}` with balanced braces, ignoring braces inside
/// double-quoted strings.
fn first_balanced_block(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in s[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..=start + i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn json_pairs(block: &str) -> Option<Vec<(String, String)>> {
    let Value::Object(map) = serde_json::from_str::<Value>(block).ok()? else {
        return None;
    };
    Some(
        map.into_iter()
            .filter_map(|(k, v)| match v {
                Value::String(s) => Some((k, s)),
                _ => None,
            })
            .collect(),
    )
}

fn quoted_pairs(block: &str) -> Vec<(String, String)> {
    QUOTED_PAIR
        .captures_iter(block)
        .filter_map(|c| {
            let key = c.get(1).or_else(|| c.get(2))?;
            // A bare None/null value is dropped.
            let value = c.get(3).or_else(|| c.get(4))?;
            Some((unescape(key.as_str()), unescape(value.as_str())))
        })
        .collect()
}

fn line_pairs(response: &str) -> Vec<(String, String)> {
    response
        .lines()
        .filter_map(|line| {
            let c = DEFINITION_LINE.captures(line)?;
            let term = c.get(1).or_else(|| c.get(2))?.as_str().trim_matches(['"', '\'', ' ']);
            let def = c.get(3)?.as_str().trim_matches(['"', '\'', ' ', ',']);
            (term.split_whitespace().count() <= MAX_KEYWORD_WORDS).then(|| (term.to_string(), def.to_string()))
        })
        .collect()
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push(' '),
            Some('t') => out.push(' '),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn strip_code_fence(s: &str) -> &str {
    let t = s.trim();
    let Some(rest) = t.strip_prefix("```") else {
        return t;
    };
    let rest = rest.find('\n').map_or(rest, |i| &rest[i + 1..]);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terms(defs: &[ParsedDefinition]) -> Vec<&str> {
        defs.iter().map(|d| d.term.as_str()).collect()
    }

    #[test]
    fn test_keywords_from_python_list_in_prose() {
        let resp = "Sure! Here are the keywords:\n['transformer', \"attention head\", 'LoRA']\nHope this helps.";
        assert_eq!(parse_keywords(resp), vec!["transformer", "attention head", "LoRA"]);
    }

    #[test]
    fn test_keywords_from_json_object() {
        let resp = "```json\n{\"keywords\": [\"diffusion model\", \"score matching\"]}\n```";
        assert_eq!(parse_keywords(resp), vec!["diffusion model", "score matching"]);
    }

    #[test]
    fn test_keywords_from_bullets_and_commas() {
        let bullets = "Keywords:\n- contrastive learning\n2. SimCLR\n* projection head";
        assert_eq!(parse_keywords(bullets), vec!["contrastive learning", "SimCLR", "projection head"]);
        assert_eq!(parse_keywords("RLHF, PPO, reward model, rlhf"), vec!["RLHF", "PPO", "reward model"]);
    }

    #[test]
    fn test_keywords_empty_on_garbage() {
        assert!(parse_keywords("").is_empty());
        assert!(parse_keywords("[]").is_empty());
    }

    #[test]
    fn test_keywords_reject_prose_and_refusals() {
        assert!(parse_keywords("I could not find any keywords.").is_empty());
        assert!(parse_keywords("Unfortunately, the abstract does not mention any technical terms.").is_empty());
        assert!(parse_keywords("- I was unable to identify keywords.").is_empty());
    }

    #[test]
    fn test_keywords_skip_prose_brackets() {
        let resp = "Keywords [from abstract]:\n['diffusion model', 'score matching']";
        assert_eq!(parse_keywords(resp), vec!["diffusion model", "score matching"]);
        assert_eq!(parse_keywords("Terms: beam search, top-k sampling"), vec!["beam search", "top-k sampling"]);
    }

    #[test]
    fn test_definitions_json_block() {
        let resp = r#"Here you go: {"gradient descent": "An iterative optimisation method.", "epoch": "One full pass over the data."} Done."#;
        let defs = parse_definitions(resp);
        assert_eq!(defs.len(), 2);
        assert!(terms(&defs).contains(&"epoch"));
    }

    #[test]
    fn test_definitions_python_dict_with_none() {
        let resp = "{'ReLU': 'A piecewise linear activation.', 'dropout': None, \"Bayes' rule\": \"Relates conditional probabilities.\", 'x': 'N/A'}";
        let defs = parse_definitions(resp);
        assert_eq!(terms(&defs), vec!["ReLU", "Bayes' rule"]);
        assert_eq!(defs[0].definition, "A piecewise linear activation.");
    }

    #[test]
    fn test_definitions_from_lines() {
        let resp = "1. **KV cache**: Stored keys and values reused across decoding steps.\n- beam search - A heuristic search keeping the best k hypotheses.\nThat's all.";
        let defs = parse_definitions(resp);
        assert_eq!(terms(&defs), vec!["KV cache", "beam search"]);
    }

    #[test]
    fn test_definition_lines_need_a_marker() {
        assert!(parse_definitions("Note: the paper does not define these terms.").is_empty());
        assert!(parse_definitions("Sorry - I cannot help with that.").is_empty());
        let defs = parse_definitions("**Perplexity**: Exponentiated average negative log-likelihood.");
        assert_eq!(terms(&defs), vec!["Perplexity"]);
    }

    #[test]
    fn test_definitions_discard_empty_and_duplicates() {
        let resp = r#"{"a": "", "b": "null", "c": "real", "c ": "dup"}"#;
        assert_eq!(terms(&parse_definitions(resp)), vec!["c"]);
    }

    #[test]
    fn test_balanced_block_ignores_braces_in_strings() {
        let resp = r#"{"set notation": "Written as {x | P(x)}."} trailing }"#;
        assert_eq!(first_balanced_block(resp), Some(r#"{"set notation": "Written as {x | P(x)}."}"#));
    }
}
