use serde::{Deserialize, Serialize};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::config::ConfigViolation;
use crate::PreferenceTag;

/// Words at most this long are never plural-folded ("riz", "lot", "bus").
const PLURAL_FOLD_MIN_CHARS: usize = 4;

/// Normalize an item label or keyword for matching.
///
/// Accents are stripped through NFD decomposition, the result is lowercased,
/// split on anything that is not alphanumeric and each word loses a trailing
/// plural `s` or `x`. Words are re-joined with single spaces.
#[must_use]
pub fn normalize_label(label: &str) -> String {
    let stripped = label
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect::<String>();

    stripped
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(fold_plural)
        .collect::<Vec<_>>()
        .join(" ")
}

fn fold_plural(word: &str) -> &str {
    if word.chars().count() >= PLURAL_FOLD_MIN_CHARS {
        if let Some(stem) = word.strip_suffix('s').or_else(|| word.strip_suffix('x')) {
            return stem;
        }
    }
    word
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ClassificationRule {
    pub tag: PreferenceTag,
    pub keywords: Vec<String>,
}

impl ClassificationRule {
    fn new(tag: PreferenceTag, keywords: &[&str]) -> Self {
        Self { tag, keywords: keywords.iter().map(|keyword| (*keyword).to_string()).collect() }
    }
}

/// Ordered keyword table. The first rule with a matching keyword wins, so an
/// item belongs to at most one tag.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ClassificationTable {
    pub rules: Vec<ClassificationRule>,
}

impl Default for ClassificationTable {
    fn default() -> Self {
        Self {
            rules: vec![
                ClassificationRule::new(
                    PreferenceTag::Baby,
                    &[
                        "bébé",
                        "baby",
                        "couche",
                        "diaper",
                        "nappy",
                        "lait infantile",
                        "infant formula",
                        "petit pot",
                    ],
                ),
                ClassificationRule::new(
                    PreferenceTag::Vegetarian,
                    &["végétarien", "vegetarian", "vegan", "tofu", "lentille", "lentil", "pois chiche"],
                ),
                ClassificationRule::new(PreferenceTag::Halal, &["halal"]),
            ],
        }
    }
}

impl ClassificationTable {
    #[must_use]
    pub fn compile(&self) -> Classifier {
        let rules = self
            .rules
            .iter()
            .map(|rule| {
                let keywords = rule
                    .keywords
                    .iter()
                    .map(|keyword| normalize_label(keyword))
                    .filter(|keyword| !keyword.is_empty())
                    .collect::<Vec<_>>();
                (rule.tag, keywords)
            })
            .collect();
        Classifier { rules }
    }

    /// Convenience wrapper compiling the table for a single lookup.
    #[must_use]
    pub fn classify(&self, item_name: &str) -> Option<PreferenceTag> {
        self.compile().classify(item_name)
    }

    pub(crate) fn violations(&self) -> Vec<ConfigViolation> {
        let mut violations = Vec::new();
        let mut seen = Vec::new();
        for (index, rule) in self.rules.iter().enumerate() {
            if seen.contains(&rule.tag) {
                violations.push(ConfigViolation::new(
                    format!("classification.rules[{index}].tag"),
                    format!("tag {} is listed more than once", rule.tag.as_str()),
                ));
            }
            seen.push(rule.tag);

            if rule.keywords.is_empty() {
                violations.push(ConfigViolation::new(
                    format!("classification.rules[{index}].keywords"),
                    "MUST contain at least one keyword",
                ));
            }
            for keyword in &rule.keywords {
                if normalize_label(keyword).is_empty() {
                    violations.push(ConfigViolation::new(
                        format!("classification.rules[{index}].keywords"),
                        format!("keyword {keyword:?} is empty after normalization"),
                    ));
                }
            }
        }
        violations
    }
}

/// Table with keywords normalized once, reused for every item of a run.
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<(PreferenceTag, Vec<String>)>,
}

impl Classifier {
    #[must_use]
    pub fn classify(&self, item_name: &str) -> Option<PreferenceTag> {
        let name = normalize_label(item_name);
        if name.is_empty() {
            return None;
        }
        self.rules
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|keyword| name.contains(keyword.as_str())))
            .map(|(tag, _)| *tag)
    }
}
