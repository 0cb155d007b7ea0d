//! Multinomial naive Bayes with Laplace smoothing over the storage-backed
//! token tables. Models are per-chat, with a global fallback used until a
//! chat has enough trained messages on both sides.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use govorun_core::config::SpamConfig;
use govorun_storage::{StorageError, StorageRouter};

use crate::tokenizer;

#[derive(Debug, Error)]
pub enum SpamError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, SpamError>;

pub struct SpamClassifier {
    router: Arc<StorageRouter>,
    config: SpamConfig,
}

impl SpamClassifier {
    pub fn new(router: Arc<StorageRouter>, config: SpamConfig) -> Self {
        Self { router, config }
    }

    /// Train one message into the model of `chat_id` (None = global).
    /// Token and class counters move in a single transaction.
    pub fn learn(
        &self,
        text: &str,
        is_spam: bool,
        chat_id: Option<i64>,
        locale: &str,
    ) -> Result<()> {
        let tokens = tokenizer::tokenize(text, self.config.min_token_len, locale);
        if tokens.is_empty() {
            return Ok(());
        }
        self.router.bayes_apply(chat_id, is_spam, &tokens, 1, None)?;
        Ok(())
    }

    /// Symmetric decrement of a previously learned message; counters floor
    /// at zero inside the storage layer.
    pub fn unlearn(
        &self,
        text: &str,
        is_spam: bool,
        chat_id: Option<i64>,
        locale: &str,
    ) -> Result<()> {
        let tokens = tokenizer::tokenize(text, self.config.min_token_len, locale);
        if tokens.is_empty() {
            return Ok(());
        }
        self.router.bayes_apply(chat_id, is_spam, &tokens, -1, None)?;
        Ok(())
    }

    /// Spam probability for `text` in [0,1].
    ///
    /// Uses the per-chat model when it has at least
    /// `min_messages_per_class` trained messages on each side, otherwise the
    /// global model. An untrained model scores everything 0.
    pub fn score(&self, text: &str, chat_id: Option<i64>, locale: &str) -> Result<f64> {
        let model = self.resolve_model(chat_id)?;
        let tokens = tokenizer::token_list(text, self.config.min_token_len, locale);
        if tokens.is_empty() {
            return Ok(0.0);
        }

        let (spam, ham) = self.router.bayes_class_counts(model, None)?;
        if spam.message_count == 0 || ham.message_count == 0 {
            // One-sided or empty training data gives no usable likelihoods.
            return Ok(if spam.message_count > 0 { 0.5 } else { 0.0 });
        }
        let vocabulary = self.router.bayes_vocabulary_size(model, None)? as f64;
        if vocabulary == 0.0 {
            return Ok(0.0);
        }

        let alpha = self.config.alpha;
        let mut unique: Vec<String> = tokens.clone();
        unique.sort();
        unique.dedup();
        let counts = self.router.bayes_token_counts(model, &unique, None)?;

        let spam_total = spam.token_count as f64;
        let ham_total = ham.token_count as f64;
        let mut log_odds = ((spam.message_count as f64 + alpha)
            / (ham.message_count as f64 + alpha))
            .ln();
        for token in &tokens {
            let token_counts = counts.get(token).copied().unwrap_or_default();
            log_odds += (token_counts.spam_count as f64 + alpha).ln()
                - (token_counts.ham_count as f64 + alpha).ln()
                - (spam_total + alpha * vocabulary).ln()
                + (ham_total + alpha * vocabulary).ln();
        }

        let probability = 1.0 / (1.0 + (-log_odds).exp());
        debug!(
            chat = ?model,
            tokens = tokens.len(),
            log_odds,
            probability,
            "bayes score"
        );
        Ok(probability)
    }

    /// Per-chat model if trained enough, else global.
    fn resolve_model(&self, chat_id: Option<i64>) -> Result<Option<i64>> {
        let Some(chat_id) = chat_id else {
            return Ok(None);
        };
        let (spam, ham) = self.router.bayes_class_counts(Some(chat_id), None)?;
        let minimum = self.config.min_messages_per_class as i64;
        if spam.message_count >= minimum && ham.message_count >= minimum {
            Ok(Some(chat_id))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use govorun_core::config::DatabaseConfig;

    fn classifier() -> (tempfile::TempDir, Arc<StorageRouter>, SpamClassifier) {
        let dir = tempfile::tempdir().unwrap();
        let mut db = DatabaseConfig::default();
        db.sources.get_mut("main").unwrap().path =
            dir.path().join("spam.db").to_string_lossy().into_owned();
        let router = Arc::new(StorageRouter::open(&db).unwrap());
        let config = SpamConfig {
            alpha: 1.0,
            min_messages_per_class: 2,
            min_token_len: 3,
        };
        let c = SpamClassifier::new(Arc::clone(&router), config);
        (dir, router, c)
    }

    fn train_global(c: &SpamClassifier) {
        for text in [
            "BUY NOW cheap pills http://evil.example",
            "FREE money casino win now",
            "cheap viagra buy casino",
        ] {
            c.learn(text, true, None, "").unwrap();
        }
        for text in [
            "see you at the meeting tomorrow",
            "the weather is nice today",
            "can you review my patch please",
        ] {
            c.learn(text, false, None, "").unwrap();
        }
    }

    #[test]
    fn spammy_text_scores_higher_than_ham() {
        let (_dir, _router, c) = classifier();
        train_global(&c);
        let spam_score = c.score("BUY NOW cheap casino http://evil.example", None, "").unwrap();
        let ham_score = c.score("see you tomorrow at the meeting", None, "").unwrap();
        assert!(spam_score > 0.8, "spam score {spam_score}");
        assert!(ham_score < 0.5, "ham score {ham_score}");
    }

    #[test]
    fn untrained_model_scores_zero() {
        let (_dir, _router, c) = classifier();
        assert_eq!(c.score("anything at all", None, "").unwrap(), 0.0);
    }

    #[test]
    fn empty_text_scores_zero() {
        let (_dir, _router, c) = classifier();
        train_global(&c);
        assert_eq!(c.score("", None, "").unwrap(), 0.0);
    }

    #[test]
    fn learn_unlearn_restores_counters_exactly() {
        let (_dir, router, c) = classifier();
        train_global(&c);
        let (before_spam, before_ham) = router.bayes_class_counts(None, None).unwrap();
        let before_sum = router.bayes_token_sum(None, true, None).unwrap();

        let text = "limited offer buy gold now";
        c.learn(text, true, None, "").unwrap();
        c.unlearn(text, true, None, "").unwrap();

        let (after_spam, after_ham) = router.bayes_class_counts(None, None).unwrap();
        assert_eq!(before_spam.message_count, after_spam.message_count);
        assert_eq!(before_spam.token_count, after_spam.token_count);
        assert_eq!(before_ham.token_count, after_ham.token_count);
        assert_eq!(before_sum, router.bayes_token_sum(None, true, None).unwrap());
    }

    #[test]
    fn class_aggregates_match_token_sums_after_training() {
        let (_dir, router, c) = classifier();
        train_global(&c);
        c.unlearn("FREE money casino win now", true, None, "").unwrap();

        let (spam, ham) = router.bayes_class_counts(None, None).unwrap();
        assert_eq!(
            spam.token_count,
            router.bayes_token_sum(None, true, None).unwrap()
        );
        assert_eq!(
            ham.token_count,
            router.bayes_token_sum(None, false, None).unwrap()
        );
    }

    #[test]
    fn per_chat_model_needs_minimum_training() {
        let (_dir, _router, c) = classifier();
        train_global(&c);

        // One spam message in chat -100 is below min_messages_per_class=2,
        // so scoring still uses the global model.
        c.learn("chat specific junk words", true, Some(-100), "").unwrap();
        let fallback = c.score("BUY NOW cheap casino", Some(-100), "").unwrap();
        assert!(fallback > 0.8, "global fallback should flag known spam: {fallback}");

        // Train the per-chat model past the threshold on both sides; now the
        // chat's own (tiny) model takes over and global-only tokens lose weight.
        c.learn("chat junk again words", true, Some(-100), "").unwrap();
        c.learn("normal local talk here", false, Some(-100), "").unwrap();
        c.learn("more normal local talk", false, Some(-100), "").unwrap();
        let local = c.score("chat junk words", Some(-100), "").unwrap();
        assert!(local > 0.5, "per-chat model should flag its own spam: {local}");
    }

    #[test]
    fn long_unicode_message_scores_without_panic() {
        let (_dir, _router, c) = classifier();
        train_global(&c);
        let text = "покупай сейчас дешево ".repeat(3000);
        let score = c.score(&text, None, "ru").unwrap();
        assert!((0.0..=1.0).contains(&score));
    }
}
