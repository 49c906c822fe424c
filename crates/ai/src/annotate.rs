use serde::{Deserialize, Serialize};

use crmflow_core::WorkerGroup;

use crate::normalize::tokenize;
use crate::result::{StageError, StageOutput};
use crate::stage::{StageInput, StageProcessor};

/// Intent labels a message can carry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentLabel {
    Payment,
    Schedule,
    Enrollment,
    Complaint,
    Cancellation,
    Greeting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelScore {
    pub label: IntentLabel,
    /// Number of tokens that matched one of the label's keywords.
    pub hits: usize,
}

/// Intent annotation (derived record of the `annotate` stage).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    /// Labels ordered by hits (descending), ties by label order.
    pub labels: Vec<LabelScore>,
    pub primary: Option<IntentLabel>,
}

/// Keywords are matched as token prefixes so Russian inflections
/// ("оплата", "оплатить", "оплачу") share one stem. Stems shorter than
/// four characters only match whole tokens.
const RULES: &[(IntentLabel, &[&str])] = &[
    (
        IntentLabel::Payment,
        &["оплат", "оплач", "платеж", "платёж", "счет", "счёт", "деньг", "стоимост", "цен", "pay", "invoice", "price", "cost", "fee"],
    ),
    (
        IntentLabel::Schedule,
        &["расписан", "занят", "урок", "перенес", "перенос", "врем", "schedule", "lesson", "class", "reschedul", "time"],
    ),
    (
        IntentLabel::Enrollment,
        &["запис", "пробн", "поступ", "зачисл", "enrol", "signup", "trial", "register", "join"],
    ),
    (
        IntentLabel::Complaint,
        &["жалоб", "недовол", "плох", "ужасн", "претензи", "complain", "unhappy", "bad", "terrible", "awful"],
    ),
    (
        IntentLabel::Cancellation,
        &["отмен", "отказ", "расторг", "cancel", "unsubscrib", "quit"],
    ),
    (
        IntentLabel::Greeting,
        &["привет", "здравствуй", "добрый", "hello", "hi", "hey"],
    ),
];

fn keyword_matches(token: &str, keyword: &str) -> bool {
    if keyword.chars().count() < 4 {
        token == keyword
    } else {
        token.starts_with(keyword)
    }
}

/// Rule-based intent annotator over normalized text.
#[derive(Debug, Copy, Clone, Default)]
pub struct KeywordAnnotator;

impl KeywordAnnotator {
    pub fn annotate(&self, text: &str) -> Annotation {
        let tokens = tokenize(text);

        let mut labels: Vec<LabelScore> = RULES
            .iter()
            .filter_map(|(label, keywords)| {
                let hits = tokens
                    .iter()
                    .filter(|t| keywords.iter().any(|k| keyword_matches(t, k)))
                    .count();
                (hits > 0).then_some(LabelScore { label: *label, hits })
            })
            .collect();

        labels.sort_by(|a, b| b.hits.cmp(&a.hits).then(a.label.cmp(&b.label)));
        let primary = labels.first().map(|s| s.label);

        Annotation { labels, primary }
    }
}

impl StageProcessor for KeywordAnnotator {
    fn group(&self) -> WorkerGroup {
        WorkerGroup::Annotate
    }

    fn process(&self, input: &StageInput) -> Result<StageOutput, StageError> {
        let text = input.require_normalized()?;
        Ok(StageOutput::Annotation(self.annotate(text)))
    }
}
