use anyhow::{anyhow, Result};
use chrono::Utc;
use rand::prelude::*;
use ring::hmac;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    path::Path,
    sync::{Arc, Mutex},
};

use crate::engine::{AttemptError, AttemptSnapshot, QuizAttempt};
use crate::models::{Quiz, SubmissionReceipt, SubmissionRecord, UserId, UserSnapshot};

/// The whole client-held state travels inside this signed token, so the
/// server keeps no per-attempt session.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AttemptToken {
    pub user: UserSnapshot,
    pub attempt: AttemptSnapshot,
}

#[derive(Clone, Debug)]
pub struct PlatformController {
    secret_key: Arc<hmac::Key>,
    quizzes: Arc<BTreeMap<String, Quiz>>,
    pass_threshold: u8,
    ledger: Arc<tokio::sync::Mutex<SubmissionLedger>>,
    writer: SubmissionWriter,
}

/// Process-lifetime cache over the CSV log, which is the durable record.
/// Grows by one receipt per submitted attempt; bounded by the log itself.
#[derive(Debug, Default)]
struct SubmissionLedger {
    best_scores: BTreeMap<(String, String), u8>,
    receipts: BTreeMap<String, SubmissionReceipt>,
}

impl PlatformController {
    pub fn new<'a>(
        secret_key: hmac::Key,
        quizzes: impl Iterator<Item = &'a Quiz>,
        pass_threshold: u8,
        writer: SubmissionWriter,
    ) -> PlatformController {
        let quizzes = quizzes.map(|quiz| (quiz.id.clone(), quiz.clone())).collect();

        PlatformController {
            secret_key: Arc::new(secret_key),
            quizzes: Arc::new(quizzes),
            pass_threshold,
            ledger: Arc::new(tokio::sync::Mutex::new(SubmissionLedger::default())),
            writer,
        }
    }

    /// Quiz data source. `None` maps to the NotFound reply at the route
    /// boundary.
    pub fn quiz(&self, quiz_id: &str) -> Option<&Quiz> {
        self.quizzes.get(quiz_id)
    }

    pub fn create_guest(&self) -> UserSnapshot {
        let mut id = [0u8; 16];
        rand::rngs::OsRng.fill(&mut id);
        let username = format!("player-{}", hex::encode(&id[..4]));

        UserSnapshot {
            id: UserId(id),
            username,
            level: 1,
            experience: 0,
        }
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<String> {
        let payload = bincode::serialize(value)?;
        let signature = hmac::sign(&self.secret_key, &payload);

        Ok(format!(
            "{}:{}",
            base64::encode_config(payload, base64::URL_SAFE_NO_PAD),
            base64::encode_config(signature, base64::URL_SAFE_NO_PAD),
        ))
    }

    fn decode<T: DeserializeOwned>(&self, token: &str) -> Result<T> {
        let mut parts = token.splitn(2, ':');
        let payload = parts.next().ok_or_else(|| anyhow!("bad token"))?;
        let payload = base64::decode_config(payload, base64::URL_SAFE_NO_PAD)?;

        let signature = parts.next().ok_or_else(|| anyhow!("bad token"))?;
        let signature = base64::decode_config(signature, base64::URL_SAFE_NO_PAD)?;

        hmac::verify(&self.secret_key, &payload, &signature)
            .map_err(|_err| anyhow!("invalid signature"))?;

        Ok(bincode::deserialize(&payload)?)
    }

    pub fn encode_user(&self, user: &UserSnapshot) -> Result<String> {
        self.encode(user)
    }

    pub fn decode_user(&self, token: &str) -> Result<UserSnapshot> {
        self.decode(token)
    }

    pub fn encode_attempt(&self, token: &AttemptToken) -> Result<String> {
        self.encode(token)
    }

    pub fn decode_attempt(&self, token: &str) -> Result<AttemptToken> {
        self.decode(token)
    }

    /// Builds and starts a fresh attempt. `None` when the quiz id does not
    /// resolve.
    pub fn open_attempt(&self, quiz_id: &str) -> Option<Result<QuizAttempt, AttemptError>> {
        let quiz = self.quizzes.get(quiz_id)?.clone();

        Some(QuizAttempt::new(quiz, self.pass_threshold).and_then(|mut attempt| {
            attempt.start()?;
            Ok(attempt)
        }))
    }

    pub fn resume_attempt(&self, token: &AttemptToken) -> Option<Result<QuizAttempt, AttemptError>> {
        let quiz = self.quizzes.get(&token.attempt.quiz_id)?.clone();

        Some(
            QuizAttempt::resume(quiz, token.attempt.clone())
                .map(|attempt| attempt.with_pass_threshold(self.pass_threshold)),
        )
    }

    /// Persists a completed attempt and hands back the reward receipt.
    /// Replays of an already-recorded attempt return the stored receipt
    /// without awarding anything twice.
    pub async fn record_submission(
        &self,
        user: &UserSnapshot,
        attempt: &QuizAttempt,
    ) -> Result<SubmissionReceipt> {
        let summary = attempt
            .summary()
            .ok_or_else(|| anyhow!("attempt has no score yet"))?;
        let attempt_id = attempt.attempt_id().to_string();

        // The lock is held across the write, so a concurrent retry of the
        // same attempt waits here and finds the receipt instead of
        // appending a second row.
        let mut ledger = self.ledger.lock().await;
        if let Some(receipt) = ledger.receipts.get(&attempt_id) {
            return Ok(*receipt);
        }

        let quiz = attempt.quiz();
        let user_id = hex::encode(user.id.0);
        let best_key = (user_id.clone(), quiz.id.clone());
        let best_score = summary.score > ledger.best_scores.get(&best_key).copied().unwrap_or(0);

        let (xp, coins) = if summary.passed {
            (quiz.xp_reward, quiz.coin_reward)
        } else {
            (0, 0)
        };
        let receipt = SubmissionReceipt {
            best_score,
            xp,
            coins,
        };

        let answers = attempt
            .answers()
            .iter()
            .map(|answer| format!("{}={}", answer.question_id, answer.selected_option_id))
            .collect::<Vec<_>>()
            .join(";");

        let record = SubmissionRecord {
            attempt: attempt_id.clone(),
            user: user_id,
            quiz: quiz.id.clone(),
            score: summary.score,
            passed: summary.passed,
            correct: summary.correct,
            total: quiz.questions.len(),
            time_taken_secs: attempt.time_taken_secs().unwrap_or(0),
            answers,
            time: Utc::now(),
        };

        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || writer.write(record)).await??;

        // Marked seen only once the row is durable; a failed write stays
        // retryable.
        if best_score {
            ledger.best_scores.insert(best_key, summary.score);
        }
        ledger.receipts.insert(attempt_id, receipt);

        Ok(receipt)
    }
}

#[derive(Clone, Debug)]
pub struct SubmissionWriter {
    writer: Arc<Mutex<csv::Writer<File>>>,
}

impl SubmissionWriter {
    pub fn new(path: impl AsRef<Path>) -> Result<SubmissionWriter> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        Ok(SubmissionWriter {
            writer: Arc::new(Mutex::new(writer)),
        })
    }

    pub fn write(&self, record: SubmissionRecord) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_err| anyhow!("couldn't lock writer"))?;
        writer.serialize(record)?;
        writer.flush()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DEFAULT_PASS_THRESHOLD;
    use crate::models::{Difficulty, Question, QuestionOption};

    fn sample_quiz() -> Quiz {
        let options = vec![
            QuestionOption {
                id: "a".into(),
                text: "alpha".into(),
                code: None,
            },
            QuestionOption {
                id: "b".into(),
                text: "beta".into(),
                code: None,
            },
        ];

        Quiz {
            id: "intro-to-loops".into(),
            title: "Intro to Loops".into(),
            description: "for and while".into(),
            difficulty: Difficulty::Easy,
            category: "basics".into(),
            time_limit: None,
            xp_reward: 50,
            coin_reward: 10,
            questions: vec![
                Question {
                    id: "q1".into(),
                    text: "first".into(),
                    options: options.clone(),
                    correct_option: "a".into(),
                    hint: None,
                    explanation: None,
                    code_snippet: None,
                    difficulty: None,
                },
                Question {
                    id: "q2".into(),
                    text: "second".into(),
                    options,
                    correct_option: "b".into(),
                    hint: None,
                    explanation: None,
                    code_snippet: None,
                    difficulty: None,
                },
            ],
        }
    }

    fn controller() -> PlatformController {
        controller_with_log().0
    }

    fn controller_with_log() -> (PlatformController, std::path::PathBuf) {
        let secret_key = hmac::Key::new(hmac::HMAC_SHA256, &[0u8; 32]);
        let mut suffix = [0u8; 8];
        rand::rngs::OsRng.fill(&mut suffix);
        let path = std::env::temp_dir().join(format!("codequest-test-{}.csv", hex::encode(suffix)));
        let writer = SubmissionWriter::new(&path).unwrap();
        let quizzes = vec![sample_quiz()];

        let controller =
            PlatformController::new(secret_key, quizzes.iter(), DEFAULT_PASS_THRESHOLD, writer);
        (controller, path)
    }

    fn finished_attempt(controller: &PlatformController, answers: &[(&str, &str)]) -> QuizAttempt {
        let mut attempt = controller.open_attempt("intro-to-loops").unwrap().unwrap();
        for (question_id, option_id) in answers {
            attempt.select_answer(question_id, option_id).unwrap();
            attempt.advance().unwrap();
        }
        attempt
    }

    #[test]
    fn user_token_round_trips() {
        let controller = controller();
        let user = controller.create_guest();

        let token = controller.encode_user(&user).unwrap();
        let decoded = controller.decode_user(&token).unwrap();

        assert_eq!(decoded.id.0, user.id.0);
        assert_eq!(decoded.username, user.username);
    }

    #[test]
    fn tampered_token_is_rejected() {
        let controller = controller();
        let user = controller.create_guest();

        let token = controller.encode_user(&user).unwrap();
        let tampered = format!("{}AA", token);

        assert!(controller.decode_user(&tampered).is_err());
        assert!(controller.decode_user("not-a-token").is_err());
    }

    #[test]
    fn attempt_token_round_trips() {
        let controller = controller();
        let user = controller.create_guest();
        let attempt = controller.open_attempt("intro-to-loops").unwrap().unwrap();

        let token = AttemptToken {
            user,
            attempt: attempt.snapshot(),
        };
        let encoded = controller.encode_attempt(&token).unwrap();
        let decoded = controller.decode_attempt(&encoded).unwrap();

        let resumed = controller.resume_attempt(&decoded).unwrap().unwrap();
        assert_eq!(resumed.attempt_id(), attempt.attempt_id());
        assert_eq!(resumed.current_index(), 0);
    }

    #[test]
    fn unknown_quiz_is_not_found() {
        let controller = controller();

        assert!(controller.quiz("missing").is_none());
        assert!(controller.open_attempt("missing").is_none());
    }

    #[tokio::test]
    async fn submission_is_idempotent_per_attempt() {
        let controller = controller();
        let user = controller.create_guest();
        let attempt = finished_attempt(&controller, &[("q1", "a"), ("q2", "b")]);

        let first = controller.record_submission(&user, &attempt).await.unwrap();
        let replay = controller.record_submission(&user, &attempt).await.unwrap();

        assert_eq!(first, replay);
        assert!(first.best_score);
        assert_eq!(first.xp, 50);
        assert_eq!(first.coins, 10);
    }

    #[tokio::test]
    async fn best_score_flag_tracks_improvement() {
        let controller = controller();
        let user = controller.create_guest();

        let half = finished_attempt(&controller, &[("q1", "a"), ("q2", "a")]);
        let receipt = controller.record_submission(&user, &half).await.unwrap();
        assert!(receipt.best_score);
        // 50% is below the pass mark, so no reward.
        assert_eq!(receipt.xp, 0);

        let mut again = half.clone();
        again.retry().unwrap();
        again.select_answer("q1", "a").unwrap();
        again.advance().unwrap();
        again.select_answer("q2", "a").unwrap();
        again.advance().unwrap();
        let receipt = controller.record_submission(&user, &again).await.unwrap();
        assert!(!receipt.best_score);

        let mut full = again.clone();
        full.retry().unwrap();
        full.select_answer("q1", "a").unwrap();
        full.advance().unwrap();
        full.select_answer("q2", "b").unwrap();
        full.advance().unwrap();
        let receipt = controller.record_submission(&user, &full).await.unwrap();
        assert!(receipt.best_score);
        assert_eq!(receipt.xp, 50);
    }

    #[tokio::test]
    async fn concurrent_submissions_of_one_attempt_append_one_row() {
        let (controller, path) = controller_with_log();
        let user = controller.create_guest();
        let attempt = finished_attempt(&controller, &[("q1", "a"), ("q2", "b")]);

        let (first, second) = tokio::join!(
            controller.record_submission(&user, &attempt),
            controller.record_submission(&user, &attempt),
        );
        assert_eq!(first.unwrap(), second.unwrap());

        let log = std::fs::read_to_string(path).unwrap();
        assert_eq!(log.lines().count(), 1);
    }

    #[tokio::test]
    async fn unfinished_attempt_cannot_be_recorded() {
        let controller = controller();
        let user = controller.create_guest();
        let attempt = controller.open_attempt("intro-to-loops").unwrap().unwrap();

        assert!(controller.record_submission(&user, &attempt).await.is_err());
    }
}
