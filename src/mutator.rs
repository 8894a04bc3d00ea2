//! Mutator: grammar-driven text mutation plus byte-level edit primitives
//!
//! Text mutation either regenerates a full sample from the grammar or
//! splices a fresh grammar fragment into the original via insert, replace,
//! or delete. Byte mutators operate on copies and never modify in place.

use crate::grammar::Grammar;
use rand::seq::SliceRandom;
use rand::Rng;

/// Byte values that historically shake out parser edge cases.
const INTERESTING_BYTE_VALUES: [u8; 9] = [0x00, 0x01, 0x0A, 0x0D, 0x20, 0x7F, 0x80, 0xFE, 0xFF];

const DEFAULT_REGENERATE_PROBABILITY: f64 = 0.35;

/// Which grammar drives the text mutator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutatorKind {
    Json,
    Ip,
    Auto,
}

impl std::fmt::Display for MutatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutatorKind::Json => write!(f, "json"),
            MutatorKind::Ip => write!(f, "ip"),
            MutatorKind::Auto => write!(f, "auto"),
        }
    }
}

impl std::str::FromStr for MutatorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(MutatorKind::Json),
            "ip" => Ok(MutatorKind::Ip),
            "auto" => Ok(MutatorKind::Auto),
            _ => Err(format!("unknown mutator kind: {}", s)),
        }
    }
}

impl MutatorKind {
    /// Resolve `auto` against the target name.
    pub fn resolve(self, target: &str) -> MutatorKind {
        if self != MutatorKind::Auto {
            return self;
        }
        let target = target.to_lowercase();
        if target.contains("json") {
            MutatorKind::Json
        } else if target.contains("ipv4") || target.contains("ipv6") || target.contains("cidr") {
            MutatorKind::Ip
        } else {
            MutatorKind::Json
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EditStrategy {
    Insert,
    Replace,
    Delete,
}

/// Grammar-backed text mutator.
#[derive(Debug, Clone)]
pub struct TextMutator {
    grammar: Grammar,
    regenerate_probability: f64,
}

impl TextMutator {
    pub fn new(kind: MutatorKind, target: &str) -> Self {
        let grammar = match kind.resolve(target) {
            MutatorKind::Ip => Grammar::ip(),
            _ => Grammar::json(),
        };
        Self {
            grammar,
            regenerate_probability: DEFAULT_REGENERATE_PROBABILITY,
        }
    }

    pub fn with_grammar(grammar: Grammar) -> Self {
        Self {
            grammar,
            regenerate_probability: DEFAULT_REGENERATE_PROBABILITY,
        }
    }

    pub fn regenerate_probability(mut self, probability: f64) -> Self {
        self.regenerate_probability = probability.clamp(0.0, 1.0);
        self
    }

    pub fn grammar(&self) -> &Grammar {
        &self.grammar
    }

    /// Generate a fresh sample, ignoring the original text.
    pub fn generate<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        self.grammar.generate(rng)
    }

    /// Mutate `original` with a grammar fragment, or regenerate wholesale.
    pub fn mutate<R: Rng + ?Sized>(&self, original: &str, rng: &mut R) -> String {
        if original.is_empty() || rng.gen::<f64>() < self.regenerate_probability {
            return self.grammar.generate(rng);
        }

        let strategy = *[EditStrategy::Insert, EditStrategy::Replace, EditStrategy::Delete]
            .choose(rng)
            .expect("non-empty strategy set");
        let fragment = self.grammar.generate(rng);

        // Splice on character positions so multi-byte input stays valid UTF-8.
        let chars: Vec<char> = original.chars().collect();
        let start = rng.gen_range(0..chars.len());
        let end = rng.gen_range(start..chars.len());

        match strategy {
            EditStrategy::Insert => {
                let mut out: String = chars[..start].iter().collect();
                out.push_str(&fragment);
                out.extend(&chars[start..]);
                out
            }
            EditStrategy::Replace => {
                let mut out: String = chars[..start].iter().collect();
                out.push_str(&fragment);
                out.extend(&chars[end..]);
                out
            }
            EditStrategy::Delete => {
                if chars.len() == 1 {
                    return String::new();
                }
                let mut out: String = chars[..start].iter().collect();
                out.extend(&chars[end..]);
                out
            }
        }
    }
}

/// Flip one random bit.
pub fn bit_flip<R: Rng + ?Sized>(data: &[u8], rng: &mut R) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }
    let mut mutated = data.to_vec();
    let index = rng.gen_range(0..mutated.len());
    let bit = rng.gen_range(0..8);
    mutated[index] ^= 1 << bit;
    mutated
}

/// Add a small signed delta to one random byte, wrapping.
pub fn arithmetic<R: Rng + ?Sized>(data: &[u8], rng: &mut R) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }
    let mut mutated = data.to_vec();
    let index = rng.gen_range(0..mutated.len());
    let delta = *[-35i16, -1, 1, 35].choose(rng).expect("non-empty deltas");
    mutated[index] = (mutated[index] as i16).wrapping_add(delta) as u8;
    mutated
}

/// Overwrite one random byte with a known-interesting value.
pub fn interesting_value<R: Rng + ?Sized>(data: &[u8], rng: &mut R) -> Vec<u8> {
    let value = *INTERESTING_BYTE_VALUES.choose(rng).expect("non-empty set");
    if data.is_empty() {
        return vec![value];
    }
    let mut mutated = data.to_vec();
    let index = rng.gen_range(0..mutated.len());
    mutated[index] = value;
    mutated
}

/// Remove a random block; inputs shorter than two bytes are returned as-is.
pub fn delete_block<R: Rng + ?Sized>(data: &[u8], rng: &mut R) -> Vec<u8> {
    if data.len() < 2 {
        return data.to_vec();
    }
    let mut mutated = data.to_vec();
    let start = rng.gen_range(0..mutated.len() - 1);
    let block_len = rng.gen_range(1..=mutated.len() - start);
    mutated.drain(start..start + block_len);
    mutated
}

/// Copy a random block and re-insert it at a random position.
pub fn clone_block<R: Rng + ?Sized>(data: &[u8], rng: &mut R) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }
    let mut mutated = data.to_vec();
    let start = rng.gen_range(0..mutated.len());
    let block_len = rng.gen_range(1..=mutated.len() - start);
    let block: Vec<u8> = mutated[start..start + block_len].to_vec();
    let insert_at = rng.gen_range(0..=mutated.len());
    mutated.splice(insert_at..insert_at, block);
    mutated
}
