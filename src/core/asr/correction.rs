//! Phonetic correction pass applied to final transcripts.
//!
//! Two deterministic layers run over the segmented transcript: an exact
//! word-replacement table, then a pinyin fuzzy match against a candidate
//! list. Fuzzy matching compares each syllable's initial and final against a
//! fixed confusion table of sounds Mandarin ASR commonly swaps (s/sh, l/n,
//! an/ang and so on). A word is replaced only when every syllable matches;
//! one mismatch leaves the word untouched.

use jieba_rs::Jieba;
use once_cell::sync::Lazy;
use pinyin::ToPinyin;
use std::collections::HashMap;

use crate::config::CorrectorConfig;

// The segmenter dictionary costs tens of megabytes; every corrector shares
// one instance.
static SEGMENTER: Lazy<Jieba> = Lazy::new(Jieba::new);

// Syllable initials, two-letter ones first so `zh` is never read as `z`.
const INITIALS: &[&str] = &[
    "zh", "ch", "sh", "b", "p", "m", "f", "d", "t", "n", "l", "g", "k", "h", "j", "q", "x", "r",
    "z", "c", "s", "y", "w",
];

// Commonly confused sound pairs, both directions where symmetric.
const CONFUSED_SOUNDS: &[(&str, &str)] = &[
    ("s", "sh"),
    ("c", "ch"),
    ("z", "zh"),
    ("l", "n"),
    ("f", "h"),
    ("r", "l"),
    ("an", "ang"),
    ("en", "eng"),
    ("in", "ing"),
    ("ian", "iang"),
    ("uan", "uang"),
];

/// Deterministic transcript corrector.
#[derive(Debug, Clone, Default)]
pub struct Corrector {
    replace_words: HashMap<String, String>,
    fuzzy_words: Vec<String>,
}

impl Corrector {
    pub fn new(replace_words: HashMap<String, String>, fuzzy_words: Vec<String>) -> Self {
        Self {
            replace_words,
            fuzzy_words,
        }
    }

    pub fn from_config(config: &CorrectorConfig) -> Self {
        Self::new(config.replace_words.clone(), config.fuzzy_words.clone())
    }

    /// True when no rule is configured and `correct` is the identity.
    pub fn is_empty(&self) -> bool {
        self.replace_words.is_empty() && self.fuzzy_words.is_empty()
    }

    /// Applies both correction layers to one transcript.
    pub fn correct(&self, text: &str) -> String {
        if self.is_empty() {
            return text.to_string();
        }

        let words = SEGMENTER.cut(text, true);
        let mut out = String::with_capacity(text.len());
        for word in words {
            if let Some(replacement) = self.replace_words.get(word) {
                out.push_str(replacement);
                continue;
            }
            match self
                .fuzzy_words
                .iter()
                .find(|candidate| candidate.len() == word.len() && is_similar(word, candidate))
            {
                Some(candidate) => out.push_str(candidate),
                None => out.push_str(word),
            }
        }
        out
    }
}

/// True when both words have the same number of pinyin syllables and every
/// syllable pair matches exactly or through the confusion table.
fn is_similar(a: &str, b: &str) -> bool {
    let syllables_a = to_syllables(a);
    let syllables_b = to_syllables(b);
    if syllables_a.is_empty() || syllables_a.len() != syllables_b.len() {
        return false;
    }
    syllables_a
        .iter()
        .zip(&syllables_b)
        .all(|(sa, sb)| syllables_match(sa, sb))
}

/// Plain pinyin for every Han character of `s`. Characters without a pinyin
/// reading are skipped.
fn to_syllables(s: &str) -> Vec<&'static str> {
    s.to_pinyin().flatten().map(|p| p.plain()).collect()
}

fn syllables_match(a: &str, b: &str) -> bool {
    let (initial_a, final_a) = split_syllable(a);
    let (initial_b, final_b) = split_syllable(b);
    sounds_match(initial_a, initial_b) && sounds_match(final_a, final_b)
}

/// Splits a plain pinyin syllable into initial and final,
/// e.g. `long` into (`l`, `ong`) and `ai` into (``, `ai`).
fn split_syllable(syllable: &str) -> (&str, &str) {
    for initial in INITIALS {
        if let Some(rest) = syllable.strip_prefix(initial) {
            return (initial, rest);
        }
    }
    ("", syllable)
}

fn sounds_match(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    CONFUSED_SOUNDS
        .iter()
        .any(|(x, y)| (a == *x && b == *y) || (a == *y && b == *x))
}
