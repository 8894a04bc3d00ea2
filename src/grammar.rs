//! Grammars: bounded random expansion for JSON and IP-address inputs
//!
//! A grammar maps non-terminals to ordered productions. Productions mix
//! literal text with angle-bracket references (`<value>`). Expansion is
//! depth-bounded: once the depth limit is reached, symbols marked recursive
//! avoid productions that would recurse further.

use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{HashMap, HashSet};

/// A context-free grammar with a designated start symbol and a set of
/// symbols that may recurse (directly or mutually).
#[derive(Debug, Clone)]
pub struct Grammar {
    start: &'static str,
    rules: HashMap<&'static str, Vec<&'static str>>,
    recursive: HashSet<&'static str>,
    max_depth: usize,
}

impl Grammar {
    /// JSON values: objects, arrays, strings, numbers, literals.
    pub fn json() -> Self {
        let mut rules = HashMap::new();
        rules.insert("<json>", vec!["<value>"]);
        rules.insert(
            "<value>",
            vec!["<object>", "<array>", "<string>", "<number>", "true", "false", "null"],
        );
        rules.insert("<object>", vec!["{}", "{<members>}"]);
        rules.insert("<members>", vec!["<pair>", "<pair>,<members>"]);
        rules.insert("<pair>", vec!["<string>:<value>"]);
        rules.insert("<array>", vec!["[]", "[<elements>]"]);
        rules.insert("<elements>", vec!["<value>", "<value>,<elements>"]);
        rules.insert(
            "<string>",
            vec![r#""a""#, r#""b""#, r#""json""#, r#""ip""#, r#""\u0030""#, r#""x y""#, r#""long_key_123""#],
        );
        rules.insert(
            "<number>",
            vec!["0", "-1", "1", "42", "3.14", "-0.001", "1e10", "-2E-2"],
        );
        Self {
            start: "<json>",
            rules,
            recursive: ["<object>", "<array>", "<members>", "<elements>", "<value>"]
                .into_iter()
                .collect(),
            max_depth: 6,
        }
    }

    /// Dotted quads, optionally with a `/prefix` suffix.
    pub fn ipv4() -> Self {
        let mut rules = HashMap::new();
        Self::insert_ipv4_rules(&mut rules);
        Self {
            start: "<ipv4_input>",
            rules,
            recursive: HashSet::new(),
            max_depth: 2,
        }
    }

    /// IPv6 addresses including `::` abbreviations, optionally prefixed.
    pub fn ipv6() -> Self {
        let mut rules = HashMap::new();
        Self::insert_ipv6_rules(&mut rules);
        Self {
            start: "<ipv6_input>",
            rules,
            recursive: HashSet::new(),
            max_depth: 2,
        }
    }

    /// Composite grammar choosing between IPv4 and IPv6 forms.
    pub fn ip() -> Self {
        let mut rules = HashMap::new();
        rules.insert("<ip>", vec!["<ipv4_input>", "<ipv6_input>"]);
        Self::insert_ipv4_rules(&mut rules);
        Self::insert_ipv6_rules(&mut rules);
        Self {
            start: "<ip>",
            rules,
            recursive: HashSet::new(),
            max_depth: 3,
        }
    }

    fn insert_ipv4_rules(rules: &mut HashMap<&'static str, Vec<&'static str>>) {
        rules.insert("<ipv4_input>", vec!["<ipv4>", "<ipv4>/<prefix4>"]);
        rules.insert("<ipv4>", vec!["<octet>.<octet>.<octet>.<octet>"]);
        rules.insert(
            "<octet>",
            vec!["0", "1", "10", "127", "192", "223", "254", "255"],
        );
        rules.insert("<prefix4>", vec!["0", "8", "16", "24", "30", "32"]);
    }

    fn insert_ipv6_rules(rules: &mut HashMap<&'static str, Vec<&'static str>>) {
        rules.insert("<ipv6_input>", vec!["<ipv6>", "<ipv6>/<prefix6>"]);
        rules.insert(
            "<ipv6>",
            vec![
                "<h>:<h>:<h>:<h>:<h>:<h>:<h>:<h>",
                "<h>::<h>",
                "::1",
                "::",
                "fe80::<h>",
                "2001:db8::<h>:<h>",
            ],
        );
        rules.insert("<h>", vec!["0", "1", "a", "f", "10", "ff", "0abc", "ffff"]);
        rules.insert("<prefix6>", vec!["0", "32", "48", "64", "96", "128"]);
    }

    pub fn start(&self) -> &str {
        self.start
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Generate one sample by expanding the start symbol.
    pub fn generate<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        self.expand(self.start, 0, rng)
    }

    fn expand<R: Rng + ?Sized>(&self, symbol: &str, depth: usize, rng: &mut R) -> String {
        let Some(productions) = self.rules.get(symbol) else {
            // Unknown symbols are treated as literal text.
            return symbol.to_string();
        };

        let production = self.pick_production(symbol, productions, depth, rng);
        let mut out = String::new();
        let mut rest = production;
        while let Some((literal, nonterminal, tail)) = split_first_nonterminal(rest) {
            out.push_str(literal);
            out.push_str(&self.expand(nonterminal, depth + 1, rng));
            rest = tail;
        }
        out.push_str(rest);
        out
    }

    fn pick_production<R: Rng + ?Sized>(
        &self,
        symbol: &str,
        productions: &[&'static str],
        depth: usize,
        rng: &mut R,
    ) -> &'static str {
        if depth < self.max_depth || !self.recursive.contains(symbol) {
            return productions.choose(rng).copied().unwrap_or("");
        }

        // Past the depth limit, prefer productions that cannot recurse.
        let safe: Vec<&'static str> = productions
            .iter()
            .copied()
            .filter(|production| {
                !nonterminals(production).any(|symbol| self.recursive.contains(symbol))
            })
            .collect();
        if safe.is_empty() {
            productions.choose(rng).copied().unwrap_or("")
        } else {
            safe.choose(rng).copied().unwrap_or("")
        }
    }
}

/// Split `text` at its first `<nonterminal>` reference, returning the
/// leading literal, the reference (brackets included), and the tail.
fn split_first_nonterminal(text: &str) -> Option<(&str, &str, &str)> {
    let mut search_from = 0;
    while let Some(open_rel) = text[search_from..].find('<') {
        let open = search_from + open_rel;
        match text[open + 1..].find(|c| c == '<' || c == '>') {
            Some(rel) => {
                let pos = open + 1 + rel;
                if text.as_bytes()[pos] == b'>' && pos > open + 1 {
                    return Some((&text[..open], &text[open..=pos], &text[pos + 1..]));
                }
                // Nested '<' or empty brackets: keep scanning from there.
                search_from = pos;
            }
            None => return None,
        }
    }
    None
}

/// Iterate the `<nonterminal>` references inside a production.
fn nonterminals(production: &str) -> impl Iterator<Item = &str> {
    let mut rest = production;
    std::iter::from_fn(move || {
        let (_, symbol, tail) = split_first_nonterminal(rest)?;
        rest = tail;
        Some(symbol)
    })
}
