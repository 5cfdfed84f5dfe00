use chrono::{DateTime, Utc};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::{Answer, Question, Quiz, SubmissionReceipt};
use crate::timer::{QuestionTimer, Tick, TimerToken};

/// Uniform pass mark, injected rather than re-derived per screen.
pub const DEFAULT_PASS_THRESHOLD: u8 = 70;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuizPhase {
    Intro,
    InProgress,
    Completed,
    Review,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error, Deserialize, Serialize)]
pub enum AttemptError {
    #[error("quiz has no questions")]
    EmptyQuiz,
    #[error("snapshot does not belong to this quiz")]
    QuizMismatch,
    #[error("operation not allowed in the current phase")]
    WrongPhase,
    #[error("unknown question")]
    UnknownQuestion,
    #[error("question is not the active question")]
    NotActiveQuestion,
    #[error("unknown option")]
    UnknownOption,
    #[error("active question has no answer yet")]
    NotAnswered,
    #[error("not all questions have been answered")]
    NotAllAnswered,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ScoreSummary {
    pub score: u8,
    pub correct: usize,
    pub incorrect: usize,
    pub unanswered: usize,
    pub passed: bool,
}

/// Reward attached to a passing attempt. Stays unconfirmed until the
/// submission sink acknowledges persistence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Reward {
    pub xp: u32,
    pub coins: u32,
    pub confirmed: bool,
    pub best_score: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdvanceOutcome {
    Moved(usize),
    Submitted(ScoreSummary),
    /// Walked past the last question in review mode, back to results.
    ReviewFinished,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExpiryOutcome {
    /// The callback outlived its question. Nothing changed.
    Stale,
    Advanced(usize),
    Submitted(ScoreSummary),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    Running { remaining: u32 },
    Expired(ExpiryOutcome),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptionVerdict {
    /// Rendered as the correct option, whatever the user picked.
    Correct,
    /// The user's pick, and it was wrong.
    IncorrectSelected,
    Neutral,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuestionVerdict {
    Correct,
    Incorrect,
    Unanswered,
}

/// Serializable attempt state, round-tripped through the signed attempt
/// token so the server holds no session.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AttemptSnapshot {
    pub attempt_id: String,
    pub quiz_id: String,
    pub phase: QuizPhase,
    pub current: usize,
    pub answers: BTreeMap<String, String>,
    pub is_submitting: bool,
    pub summary: Option<ScoreSummary>,
    pub reward: Option<Reward>,
    pub started_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub timer: QuestionTimer,
}

/// One attempt at one quiz: the intro → in-progress → completed → review
/// state machine, the collected answers, and the countdown slot.
#[derive(Clone, Debug)]
pub struct QuizAttempt {
    quiz: Quiz,
    pass_threshold: u8,
    attempt_id: String,
    phase: QuizPhase,
    current: usize,
    answers: BTreeMap<String, String>,
    is_submitting: bool,
    summary: Option<ScoreSummary>,
    reward: Option<Reward>,
    started_at: Option<DateTime<Utc>>,
    submitted_at: Option<DateTime<Utc>>,
    timer: QuestionTimer,
}

fn fresh_id() -> String {
    let mut id = [0u8; 16];
    rand::rngs::OsRng.fill(&mut id);
    hex::encode(id)
}

impl QuizAttempt {
    pub fn new(quiz: Quiz, pass_threshold: u8) -> Result<QuizAttempt, AttemptError> {
        if quiz.questions.is_empty() {
            return Err(AttemptError::EmptyQuiz);
        }

        Ok(QuizAttempt {
            quiz,
            pass_threshold,
            attempt_id: fresh_id(),
            phase: QuizPhase::Intro,
            current: 0,
            answers: BTreeMap::new(),
            is_submitting: false,
            summary: None,
            reward: None,
            started_at: None,
            submitted_at: None,
            timer: QuestionTimer::default(),
        })
    }

    /// Rebuilds an attempt from a decoded snapshot. A corrupt index is
    /// clamped rather than trusted.
    pub fn resume(quiz: Quiz, snapshot: AttemptSnapshot) -> Result<QuizAttempt, AttemptError> {
        if quiz.questions.is_empty() {
            return Err(AttemptError::EmptyQuiz);
        }
        if quiz.id != snapshot.quiz_id {
            return Err(AttemptError::QuizMismatch);
        }

        let last = quiz.questions.len() - 1;
        let current = if snapshot.current > last {
            log::debug!(
                "clamping out-of-range question index {} for quiz {}",
                snapshot.current,
                quiz.id
            );
            last
        } else {
            snapshot.current
        };

        Ok(QuizAttempt {
            quiz,
            pass_threshold: DEFAULT_PASS_THRESHOLD,
            attempt_id: snapshot.attempt_id,
            phase: snapshot.phase,
            current,
            answers: snapshot.answers,
            is_submitting: snapshot.is_submitting,
            summary: snapshot.summary,
            reward: snapshot.reward,
            started_at: snapshot.started_at,
            submitted_at: snapshot.submitted_at,
            timer: snapshot.timer,
        })
    }

    pub fn with_pass_threshold(mut self, pass_threshold: u8) -> QuizAttempt {
        self.pass_threshold = pass_threshold;
        self
    }

    pub fn snapshot(&self) -> AttemptSnapshot {
        AttemptSnapshot {
            attempt_id: self.attempt_id.clone(),
            quiz_id: self.quiz.id.clone(),
            phase: self.phase,
            current: self.current,
            answers: self.answers.clone(),
            is_submitting: self.is_submitting,
            summary: self.summary,
            reward: self.reward,
            started_at: self.started_at,
            submitted_at: self.submitted_at,
            timer: self.timer.clone(),
        }
    }

    pub fn quiz(&self) -> &Quiz {
        &self.quiz
    }

    pub fn attempt_id(&self) -> &str {
        &self.attempt_id
    }

    pub fn phase(&self) -> QuizPhase {
        self.phase
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn active_question(&self) -> &Question {
        &self.quiz.questions[self.current]
    }

    pub fn is_submitting(&self) -> bool {
        self.is_submitting
    }

    pub fn summary(&self) -> Option<ScoreSummary> {
        self.summary
    }

    pub fn reward(&self) -> Option<Reward> {
        self.reward
    }

    pub fn remaining_secs(&self) -> Option<u32> {
        self.timer.remaining()
    }

    pub fn timer_token(&self) -> Option<TimerToken> {
        self.timer.token()
    }

    pub fn answer_for(&self, question_id: &str) -> Option<&str> {
        self.answers.get(question_id).map(String::as_str)
    }

    pub fn answers(&self) -> Vec<Answer> {
        self.answers
            .iter()
            .map(|(question_id, selected_option_id)| Answer {
                question_id: question_id.clone(),
                selected_option_id: selected_option_id.clone(),
            })
            .collect()
    }

    pub fn answered_count(&self) -> usize {
        self.answers.len()
    }

    pub fn time_taken_secs(&self) -> Option<i64> {
        match (self.started_at, self.submitted_at) {
            (Some(started), Some(submitted)) => Some((submitted - started).num_seconds()),
            _ => None,
        }
    }

    pub fn start(&mut self) -> Result<(), AttemptError> {
        if self.phase != QuizPhase::Intro {
            return Err(AttemptError::WrongPhase);
        }

        self.phase = QuizPhase::InProgress;
        self.current = 0;
        self.started_at = Some(Utc::now());
        self.arm_active_timer();
        Ok(())
    }

    pub fn select_answer(&mut self, question_id: &str, option_id: &str) -> Result<(), AttemptError> {
        if self.phase != QuizPhase::InProgress {
            return Err(AttemptError::WrongPhase);
        }

        let question = self
            .quiz
            .questions
            .iter()
            .find(|question| question.id == question_id)
            .ok_or(AttemptError::UnknownQuestion)?;

        if question.id != self.active_question().id {
            return Err(AttemptError::NotActiveQuestion);
        }
        if !question.options.iter().any(|option| option.id == option_id) {
            return Err(AttemptError::UnknownOption);
        }

        self.timer.cancel();
        self.answers
            .insert(question_id.to_string(), option_id.to_string());
        Ok(())
    }

    pub fn advance(&mut self) -> Result<AdvanceOutcome, AttemptError> {
        let last = self.quiz.questions.len() - 1;

        match self.phase {
            QuizPhase::InProgress => {
                if self.answer_for(&self.active_question().id).is_none() {
                    return Err(AttemptError::NotAnswered);
                }

                if self.current == last {
                    let summary = self.submit()?;
                    Ok(AdvanceOutcome::Submitted(summary))
                } else {
                    self.current += 1;
                    self.arm_active_timer();
                    Ok(AdvanceOutcome::Moved(self.current))
                }
            }
            QuizPhase::Review => {
                if self.current == last {
                    self.phase = QuizPhase::Completed;
                    Ok(AdvanceOutcome::ReviewFinished)
                } else {
                    self.current += 1;
                    Ok(AdvanceOutcome::Moved(self.current))
                }
            }
            _ => Err(AttemptError::WrongPhase),
        }
    }

    pub fn retreat(&mut self) -> Result<usize, AttemptError> {
        match self.phase {
            QuizPhase::InProgress => {
                self.current = self.current.saturating_sub(1);
                self.arm_active_timer();
                Ok(self.current)
            }
            QuizPhase::Review => {
                self.current = self.current.saturating_sub(1);
                Ok(self.current)
            }
            _ => Err(AttemptError::WrongPhase),
        }
    }

    pub fn submit(&mut self) -> Result<ScoreSummary, AttemptError> {
        if self.phase != QuizPhase::InProgress {
            return Err(AttemptError::WrongPhase);
        }
        let all_answered = self
            .quiz
            .questions
            .iter()
            .all(|question| self.answers.contains_key(&question.id));
        if !all_answered {
            return Err(AttemptError::NotAllAnswered);
        }

        Ok(self.complete())
    }

    /// Expiry-forced submission: unanswered questions are force-filled
    /// with empty answers before scoring.
    fn force_submit(&mut self) -> ScoreSummary {
        let unanswered: Vec<String> = self
            .quiz
            .questions
            .iter()
            .filter(|question| !self.answers.contains_key(&question.id))
            .map(|question| question.id.clone())
            .collect();
        for question_id in unanswered {
            self.answers.insert(question_id, String::new());
        }

        self.complete()
    }

    fn complete(&mut self) -> ScoreSummary {
        self.timer.cancel();

        let total = self.quiz.questions.len();
        let mut correct = 0;
        let mut incorrect = 0;
        let mut unanswered = 0;
        for question in &self.quiz.questions {
            match self.answers.get(&question.id).map(String::as_str) {
                None | Some("") => unanswered += 1,
                Some(selected) if selected == question.correct_option => correct += 1,
                Some(_) => incorrect += 1,
            }
        }

        let score = (100.0 * correct as f64 / total as f64).round() as u8;
        let summary = ScoreSummary {
            score,
            correct,
            incorrect,
            unanswered,
            passed: score >= self.pass_threshold,
        };

        self.summary = Some(summary);
        self.reward = summary.passed.then(|| Reward {
            xp: self.quiz.xp_reward,
            coins: self.quiz.coin_reward,
            confirmed: false,
            best_score: false,
        });
        self.is_submitting = true;
        self.submitted_at = Some(Utc::now());
        self.phase = QuizPhase::Completed;
        summary
    }

    /// Clears the submitting flag on both outcomes. A failed persistence
    /// leaves the reward unconfirmed.
    pub fn resolve_submission(&mut self, receipt: Option<&SubmissionReceipt>) {
        self.is_submitting = false;
        if let (Some(receipt), Some(reward)) = (receipt, self.reward.as_mut()) {
            reward.confirmed = true;
            reward.best_score = receipt.best_score;
        }
    }

    pub fn start_review(&mut self) -> Result<(), AttemptError> {
        if self.phase != QuizPhase::Completed {
            return Err(AttemptError::WrongPhase);
        }

        self.phase = QuizPhase::Review;
        self.current = 0;
        Ok(())
    }

    pub fn back_to_results(&mut self) -> Result<(), AttemptError> {
        if self.phase != QuizPhase::Review {
            return Err(AttemptError::WrongPhase);
        }

        self.phase = QuizPhase::Completed;
        Ok(())
    }

    /// Fresh attempt at the same quiz. Skips the intro screen.
    pub fn retry(&mut self) -> Result<(), AttemptError> {
        if self.phase == QuizPhase::Intro {
            return Err(AttemptError::WrongPhase);
        }

        self.attempt_id = fresh_id();
        self.answers.clear();
        self.summary = None;
        self.reward = None;
        self.is_submitting = false;
        self.submitted_at = None;
        self.current = 0;
        self.started_at = Some(Utc::now());
        self.phase = QuizPhase::InProgress;
        self.arm_active_timer();
        Ok(())
    }

    /// One second of countdown. Drives the expiry path when the active
    /// question's time runs out.
    pub fn tick(&mut self) -> TickOutcome {
        if self.phase != QuizPhase::InProgress {
            return TickOutcome::Idle;
        }

        match self.timer.tick() {
            Tick::Idle => TickOutcome::Idle,
            Tick::Running { remaining } => TickOutcome::Running { remaining },
            Tick::Expired(token) => TickOutcome::Expired(self.expire_question(token.question_index)),
        }
    }

    /// Expiry delivered by an external callback. Stale tokens (question
    /// already answered, user already moved on, attempt already submitted)
    /// change nothing.
    pub fn handle_expiry(&mut self, token: TimerToken) -> ExpiryOutcome {
        if self.phase != QuizPhase::InProgress || !self.timer.expire(token) {
            return ExpiryOutcome::Stale;
        }

        self.expire_question(token.question_index)
    }

    fn expire_question(&mut self, question_index: usize) -> ExpiryOutcome {
        if question_index != self.current {
            return ExpiryOutcome::Stale;
        }
        let question_id = self.active_question().id.clone();
        if self.answers.contains_key(&question_id) {
            return ExpiryOutcome::Stale;
        }

        self.answers.insert(question_id, String::new());

        let last = self.quiz.questions.len() - 1;
        if self.current == last {
            ExpiryOutcome::Submitted(self.force_submit())
        } else {
            self.current += 1;
            self.arm_active_timer();
            ExpiryOutcome::Advanced(self.current)
        }
    }

    /// Review-mode highlighting for one option of one question.
    pub fn option_verdict(
        &self,
        question_id: &str,
        option_id: &str,
    ) -> Result<OptionVerdict, AttemptError> {
        if self.phase != QuizPhase::Review && self.phase != QuizPhase::Completed {
            return Err(AttemptError::WrongPhase);
        }

        let question = self
            .quiz
            .questions
            .iter()
            .find(|question| question.id == question_id)
            .ok_or(AttemptError::UnknownQuestion)?;

        if option_id == question.correct_option {
            return Ok(OptionVerdict::Correct);
        }

        let selected = self.answer_for(question_id).unwrap_or("");
        if option_id == selected {
            Ok(OptionVerdict::IncorrectSelected)
        } else {
            Ok(OptionVerdict::Neutral)
        }
    }

    pub fn question_verdict(&self, question_id: &str) -> Result<QuestionVerdict, AttemptError> {
        if self.phase != QuizPhase::Review && self.phase != QuizPhase::Completed {
            return Err(AttemptError::WrongPhase);
        }

        let question = self
            .quiz
            .questions
            .iter()
            .find(|question| question.id == question_id)
            .ok_or(AttemptError::UnknownQuestion)?;

        match self.answer_for(question_id) {
            None | Some("") => Ok(QuestionVerdict::Unanswered),
            Some(selected) if selected == question.correct_option => Ok(QuestionVerdict::Correct),
            Some(_) => Ok(QuestionVerdict::Incorrect),
        }
    }

    fn arm_active_timer(&mut self) {
        let seconds = match self.quiz.time_limit {
            Some(seconds) if self.phase == QuizPhase::InProgress => seconds,
            _ => {
                self.timer.cancel();
                return;
            }
        };

        if self.answer_for(&self.active_question().id).is_none() {
            self.timer.arm(self.current, seconds);
        } else {
            self.timer.cancel();
        }
    }
}
