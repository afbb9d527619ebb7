//! Account-scoped description normalization

use regex::{NoExpand, Regex, RegexBuilder};
use tracing::warn;

use crate::types::*;

struct CompiledAlias {
    matcher: Regex,
    replacement: String,
}

/// Applies alias rules, then canonicalizes the text
///
/// Rules are applied longest pattern first (ties by pattern text, then id) so
/// that a short rule never rewrites part of a longer one before it gets a
/// chance to match.
pub struct AliasNormalizer {
    rules: Vec<CompiledAlias>,
}

impl AliasNormalizer {
    /// Build a normalizer from rules of a single account
    pub fn new(rules: &[AliasRule]) -> Self {
        let mut ordered: Vec<&AliasRule> = rules.iter().collect();
        ordered.sort_by(|a, b| {
            let a_pattern = collapse_whitespace(&a.pattern);
            let b_pattern = collapse_whitespace(&b.pattern);
            b_pattern
                .chars()
                .count()
                .cmp(&a_pattern.chars().count())
                .then_with(|| a_pattern.cmp(&b_pattern))
                .then_with(|| a.id.cmp(&b.id))
        });

        let rules = ordered
            .into_iter()
            .filter_map(|rule| match compile_pattern(&rule.pattern) {
                Some(matcher) => Some(CompiledAlias {
                    matcher,
                    replacement: collapse_whitespace(&rule.replacement),
                }),
                None => {
                    warn!(alias_id = %rule.id, pattern = %rule.pattern, "Skipping unusable alias pattern");
                    None
                }
            })
            .collect();

        Self { rules }
    }

    /// Build a normalizer from the rules that belong to `account_id`
    pub fn for_account(account_id: AccountId, rules: &[AliasRule]) -> Self {
        let scoped: Vec<AliasRule> = rules
            .iter()
            .filter(|rule| rule.account_id == account_id)
            .cloned()
            .collect();
        Self::new(&scoped)
    }

    /// Normalizer with no rules
    pub fn identity() -> Self {
        Self { rules: Vec::new() }
    }

    /// Rewrite a raw description into its canonical form
    pub fn normalize(&self, raw: &str) -> String {
        let mut text = collapse_whitespace(raw);
        for rule in &self.rules {
            text = rule
                .matcher
                .replace_all(&text, NoExpand(&rule.replacement))
                .into_owned();
        }
        canonicalize(&text)
    }
}

/// Normalize `raw` with the rules of `account_id`
///
/// An account without rules gets identity normalization.
pub fn normalize(account_id: AccountId, raw: &str, rules: &[AliasRule]) -> String {
    AliasNormalizer::for_account(account_id, rules).normalize(raw)
}

/// Lower-case, strip diacritics and punctuation, collapse whitespace
pub fn canonicalize(text: &str) -> String {
    let folded: String = text
        .chars()
        .flat_map(char::to_lowercase)
        .map(fold_diacritic)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    collapse_whitespace(&folded)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// Literal match on token boundaries, case-insensitive, any run of whitespace
// between the pattern's words.
fn compile_pattern(pattern: &str) -> Option<Regex> {
    let words: Vec<&str> = pattern.split_whitespace().collect();
    let first = words.first()?.chars().next()?;
    let last = words.last()?.chars().last()?;

    let body = words
        .iter()
        .map(|word| regex::escape(word))
        .collect::<Vec<_>>()
        .join(r"\s+");
    let prefix = if first.is_alphanumeric() { r"\b" } else { "" };
    let suffix = if last.is_alphanumeric() { r"\b" } else { "" };

    RegexBuilder::new(&format!("{}{}{}", prefix, body, suffix))
        .case_insensitive(true)
        .build()
        .ok()
}

/// Base letter of a lower-case Latin letter with diacritics
///
/// Covers the Latin-1 and Latin Extended-A letters used by European banks.
/// Anything else, including ligatures such as 'æ' and 'ß', is returned
/// unchanged.
fn fold_diacritic(c: char) -> char {
    match c {
        'á' | 'à' | 'â' | 'ä' | 'ã' | 'å' | 'ā' | 'ă' | 'ą' => 'a',
        'ç' | 'ć' | 'ĉ' | 'ċ' | 'č' => 'c',
        'ď' | 'đ' => 'd',
        'é' | 'è' | 'ê' | 'ë' | 'ē' | 'ĕ' | 'ė' | 'ę' | 'ě' => 'e',
        'ĝ' | 'ğ' | 'ġ' | 'ģ' => 'g',
        'ĥ' | 'ħ' => 'h',
        'í' | 'ì' | 'î' | 'ï' | 'ĩ' | 'ī' | 'ĭ' | 'į' | 'ı' => 'i',
        'ĵ' => 'j',
        'ķ' => 'k',
        'ĺ' | 'ļ' | 'ľ' | 'ŀ' | 'ł' => 'l',
        'ñ' | 'ń' | 'ņ' | 'ň' => 'n',
        'ó' | 'ò' | 'ô' | 'ö' | 'õ' | 'ø' | 'ō' | 'ŏ' | 'ő' => 'o',
        'ŕ' | 'ŗ' | 'ř' => 'r',
        'ś' | 'ŝ' | 'ş' | 'š' | 'ș' => 's',
        'ţ' | 'ť' | 'ŧ' | 'ț' => 't',
        'ú' | 'ù' | 'û' | 'ü' | 'ũ' | 'ū' | 'ŭ' | 'ů' | 'ű' | 'ų' => 'u',
        'ŵ' => 'w',
        'ý' | 'ÿ' | 'ŷ' => 'y',
        'ź' | 'ż' | 'ž' => 'z',
        other => other,
    }
}
