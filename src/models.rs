use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub quiz: Vec<Quiz>,
}

impl Config {
    /// Rejects content that would let malformed data into the attempt
    /// state machine: duplicate ids, dangling correct_option references,
    /// empty quizzes, zero-second time limits.
    pub fn validate(&self) -> Result<()> {
        let mut quiz_ids = BTreeSet::new();

        for quiz in &self.quiz {
            if quiz.id.is_empty() {
                bail!("quiz with empty id");
            }
            if !quiz_ids.insert(&quiz.id) {
                bail!("duplicate quiz id {:?}", quiz.id);
            }
            if quiz.questions.is_empty() {
                bail!("quiz {:?} has no questions", quiz.id);
            }
            if quiz.time_limit == Some(0) {
                bail!("quiz {:?} has a zero time limit", quiz.id);
            }

            let mut question_ids = BTreeSet::new();
            for question in &quiz.questions {
                if !question_ids.insert(&question.id) {
                    bail!("duplicate question id {:?} in quiz {:?}", question.id, quiz.id);
                }
                if question.options.len() < 2 {
                    bail!("question {:?} has fewer than two options", question.id);
                }

                let mut option_ids = BTreeSet::new();
                for option in &question.options {
                    if option.id.is_empty() {
                        bail!("empty option id in question {:?}", question.id);
                    }
                    if !option_ids.insert(&option.id) {
                        bail!("duplicate option id {:?} in question {:?}", option.id, question.id);
                    }
                }

                if !option_ids.contains(&question.correct_option) {
                    bail!(
                        "question {:?} marks unknown option {:?} as correct",
                        question.id,
                        question.correct_option
                    );
                }
            }
        }

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Quiz {
    pub id: String,
    pub title: String,
    pub description: String,
    pub difficulty: Difficulty,
    pub category: String,
    /// Per-question countdown in seconds. Absent means untimed.
    pub time_limit: Option<u32>,
    pub xp_reward: u32,
    pub coin_reward: u32,
    pub questions: Vec<Question>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Question {
    pub id: String,
    pub text: String,
    pub options: Vec<QuestionOption>,
    pub correct_option: String,
    pub hint: Option<String>,
    pub explanation: Option<String>,
    pub code_snippet: Option<CodeSnippet>,
    pub difficulty: Option<Difficulty>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct QuestionOption {
    pub id: String,
    pub text: String,
    pub code: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CodeSnippet {
    pub code: String,
    pub language: String,
}

/// One submitted answer. An empty selected_option_id records a question
/// whose countdown expired without interaction.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Answer {
    pub question_id: String,
    pub selected_option_id: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UserId(pub [u8; 16]);

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UserSnapshot {
    pub id: UserId,
    pub username: String,
    pub level: u32,
    pub experience: u32,
}

/// Read-only snapshot pushed into the game engine registry.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PlayerData {
    pub id: String,
    pub username: String,
    pub level: u32,
    pub experience: u32,
    pub stats: StatBlock,
}

impl PlayerData {
    pub fn for_user(user: &UserSnapshot) -> PlayerData {
        PlayerData {
            id: hex::encode(user.id.0),
            username: user.username.clone(),
            level: user.level,
            experience: user.experience,
            stats: StatBlock::for_level(user.level),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct StatBlock {
    pub max_health: u32,
    pub attack: u32,
    pub defense: u32,
    pub speed: u32,
}

impl StatBlock {
    pub fn for_level(level: u32) -> StatBlock {
        StatBlock {
            max_health: 80 + 20 * level,
            attack: 8 + 3 * level,
            defense: 5 + 2 * level,
            speed: 10 + level,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct SubmissionReceipt {
    pub best_score: bool,
    pub xp: u32,
    pub coins: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct SubmissionRecord {
    pub attempt: String,
    pub user: String,
    pub quiz: String,
    pub score: u8,
    pub passed: bool,
    pub correct: usize,
    pub total: usize,
    pub time_taken_secs: i64,
    pub answers: String,
    pub time: DateTime<Utc>,
}
