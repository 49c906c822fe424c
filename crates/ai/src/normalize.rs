use serde::{Deserialize, Serialize};

use crmflow_core::WorkerGroup;

use crate::result::{StageError, StageOutput};
use crate::stage::{StageInput, StageProcessor};

/// Dominant script of a message.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Ru,
    En,
    /// No letters, or an even split between scripts.
    Und,
}

/// Normalized message text (derived record of the `normalize` stage).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedText {
    pub text: String,
    pub language: Language,
    pub token_count: usize,
}

/// Cleans raw messenger content.
///
/// Rules:
/// - Zero-width characters and BOMs are dropped.
/// - Control characters other than whitespace are dropped.
/// - Runs of whitespace (including newlines) collapse to a single space.
/// - Leading/trailing whitespace is trimmed.
///
/// Case is preserved; matching stages lowercase via [`tokenize`].
#[derive(Debug, Copy, Clone, Default)]
pub struct TextNormalizer;

impl TextNormalizer {
    pub fn normalize(&self, raw: &str) -> Result<NormalizedText, StageError> {
        let mut text = String::with_capacity(raw.len());
        let mut pending_space = false;

        for c in raw.chars() {
            if is_invisible(c) {
                continue;
            }
            if c.is_whitespace() {
                pending_space = !text.is_empty();
                continue;
            }
            if c.is_control() {
                continue;
            }
            if pending_space {
                text.push(' ');
                pending_space = false;
            }
            text.push(c);
        }

        if text.is_empty() {
            return Err(StageError::InvalidInput(
                "message has no textual content".to_string(),
            ));
        }

        let token_count = text.split(' ').count();
        let language = detect_language(&text);

        Ok(NormalizedText {
            text,
            language,
            token_count,
        })
    }
}

impl StageProcessor for TextNormalizer {
    fn group(&self) -> WorkerGroup {
        WorkerGroup::Normalize
    }

    fn process(&self, input: &StageInput) -> Result<StageOutput, StageError> {
        let raw = input
            .content
            .as_deref()
            .ok_or_else(|| StageError::InvalidInput("message has no content".to_string()))?;

        self.normalize(raw).map(StageOutput::Normalized)
    }
}

/// Lowercased alphanumeric tokens of a text.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn is_invisible(c: char) -> bool {
    matches!(c, '\u{200B}'..='\u{200D}' | '\u{2060}' | '\u{FEFF}' | '\u{00AD}')
}

fn detect_language(text: &str) -> Language {
    let mut cyrillic = 0usize;
    let mut latin = 0usize;

    for c in text.chars().filter(|c| c.is_alphabetic()) {
        match c {
            '\u{0400}'..='\u{04FF}' => cyrillic += 1,
            c if c.is_ascii_alphabetic() => latin += 1,
            _ => {}
        }
    }

    match cyrillic.cmp(&latin) {
        std::cmp::Ordering::Greater => Language::Ru,
        std::cmp::Ordering::Less => Language::En,
        std::cmp::Ordering::Equal => Language::Und,
    }
}
