use anyhow::{Error, Result};
use rand::prelude::*;
use ring::{digest, hmac};
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, env, net::SocketAddr};
use tokio::fs;
use warp::{
    http::StatusCode,
    reply::{self, Reply},
    Filter,
};

use codequest::controllers::{AttemptToken, PlatformController, SubmissionWriter};
use codequest::engine::{
    AttemptError, OptionVerdict, QuizAttempt, QuizPhase, Reward, ScoreSummary,
    DEFAULT_PASS_THRESHOLD,
};
use codequest::filters::{self, ErrorCode, ErrorReply};
use codequest::models::{CodeSnippet, Config, PlayerData, UserSnapshot};

#[derive(Clone, Debug, Deserialize)]
struct AnswerRequest {
    question_id: String,
    selected_option_id: String,
}

#[derive(Clone, Debug, Serialize)]
struct AttemptReply {
    token: String,
    phase: QuizPhase,
    question_index: usize,
    total_questions: usize,
    answered: usize,
    remaining_secs: Option<u32>,
    is_submitting: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<ScoreSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reward: Option<Reward>,
    /// Whether the score reached the submission sink. Absent outside of
    /// the submit path; false means the local result stands but the reward
    /// is unconfirmed.
    #[serde(skip_serializing_if = "Option::is_none")]
    persisted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    question: Option<QuestionView>,
}

#[derive(Clone, Debug, Serialize)]
struct QuestionView {
    id: String,
    text: String,
    hint: Option<String>,
    code_snippet: Option<CodeSnippet>,
    options: Vec<OptionView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    correct_option: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    explanation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    selected_option: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
struct OptionView {
    id: String,
    text: String,
    code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    verdict: Option<&'static str>,
}

#[derive(Clone, Debug, Serialize)]
struct AttemptErrorReply {
    error: AttemptError,
}

#[derive(Clone, Debug, Serialize)]
struct PlayerReply {
    token: String,
    player: PlayerData,
}

#[derive(Clone, Debug, Serialize)]
struct HelloReply {
    message: &'static str,
    version: &'static str,
}

#[derive(Clone, Debug, Serialize)]
struct HealthReply {
    status: &'static str,
}

fn not_found() -> warp::reply::Response {
    reply::with_status(
        reply::json(&ErrorReply {
            error: ErrorCode::NotFound,
        }),
        StatusCode::NOT_FOUND,
    )
    .into_response()
}

fn internal_error() -> warp::reply::Response {
    reply::with_status(
        reply::json(&ErrorReply {
            error: ErrorCode::Internal,
        }),
        StatusCode::INTERNAL_SERVER_ERROR,
    )
    .into_response()
}

fn attempt_error(error: AttemptError) -> warp::reply::Response {
    reply::with_status(
        reply::json(&AttemptErrorReply { error }),
        StatusCode::CONFLICT,
    )
    .into_response()
}

fn question_view(attempt: &QuizAttempt) -> Option<QuestionView> {
    if attempt.phase() != QuizPhase::InProgress && attempt.phase() != QuizPhase::Review {
        return None;
    }

    let question = attempt.active_question();
    let in_review = attempt.phase() == QuizPhase::Review;

    let options = question
        .options
        .iter()
        .map(|option| {
            let verdict = if in_review {
                match attempt.option_verdict(&question.id, &option.id) {
                    Ok(OptionVerdict::Correct) => Some("correct"),
                    Ok(OptionVerdict::IncorrectSelected) => Some("incorrect-selected"),
                    Ok(OptionVerdict::Neutral) => Some("neutral"),
                    Err(_err) => None,
                }
            } else {
                None
            };

            OptionView {
                id: option.id.clone(),
                text: option.text.clone(),
                code: option.code.clone(),
                verdict,
            }
        })
        .collect();

    Some(QuestionView {
        id: question.id.clone(),
        text: question.text.clone(),
        hint: question.hint.clone(),
        code_snippet: question.code_snippet.clone(),
        options,
        correct_option: in_review.then(|| question.correct_option.clone()),
        explanation: if in_review {
            question.explanation.clone()
        } else {
            None
        },
        selected_option: if in_review {
            attempt.answer_for(&question.id).map(str::to_string)
        } else {
            None
        },
    })
}

fn attempt_reply(
    controller: &PlatformController,
    user: &UserSnapshot,
    attempt: &QuizAttempt,
    persisted: Option<bool>,
) -> warp::reply::Response {
    let token = AttemptToken {
        user: user.clone(),
        attempt: attempt.snapshot(),
    };
    let token = match controller.encode_attempt(&token) {
        Ok(token) => token,
        Err(err) => {
            log::error!("couldn't encode attempt token: {}", err);
            return internal_error();
        }
    };

    let reply = AttemptReply {
        token,
        phase: attempt.phase(),
        question_index: attempt.current_index(),
        total_questions: attempt.quiz().questions.len(),
        answered: attempt.answered_count(),
        remaining_secs: attempt.remaining_secs(),
        is_submitting: attempt.is_submitting(),
        summary: attempt.summary(),
        reward: attempt.reward(),
        persisted,
        question: question_view(attempt),
    };

    reply::json(&reply).into_response()
}

/// Decodes the attempt, applies one state-machine operation, runs the
/// submission sink when the operation completed the attempt, and hands the
/// re-signed state back to the client.
async fn run_attempt_op<F>(
    token: AttemptToken,
    controller: PlatformController,
    op: F,
) -> Result<warp::reply::Response, Infallible>
where
    F: FnOnce(&mut QuizAttempt) -> Result<(), AttemptError>,
{
    let mut attempt = match controller.resume_attempt(&token) {
        None => return Ok(not_found()),
        Some(Err(error)) => return Ok(attempt_error(error)),
        Some(Ok(attempt)) => attempt,
    };

    if let Err(error) = op(&mut attempt) {
        return Ok(attempt_error(error));
    }

    let mut persisted = None;
    if attempt.is_submitting() {
        match controller.record_submission(&token.user, &attempt).await {
            Ok(receipt) => {
                attempt.resolve_submission(Some(&receipt));
                persisted = Some(true);
            }
            Err(err) => {
                log::warn!(
                    "score persistence failed for attempt {}: {}",
                    attempt.attempt_id(),
                    err
                );
                attempt.resolve_submission(None);
                persisted = Some(false);
            }
        }
    }

    Ok(attempt_reply(&controller, &token.user, &attempt, persisted))
}

fn attempt_op_route<F>(
    name: &'static str,
    controller: PlatformController,
    op: F,
) -> impl Filter<Extract = (warp::reply::Response,), Error = warp::Rejection> + Clone
where
    F: Fn(&mut QuizAttempt) -> Result<(), AttemptError> + Clone + Send + Sync + 'static,
{
    warp::path!("attempts" / ..)
        .and(warp::path(name))
        .and(warp::path::end())
        .and(warp::post())
        .and(filters::attempt_token(controller.clone()))
        .and(filters::with_controller(controller))
        .and_then(move |token: AttemptToken, controller: PlatformController| {
            let op = op.clone();
            async move { run_attempt_op(token, controller, move |attempt| op(attempt)).await }
        })
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    let bind_addr = env::var("BIND").unwrap_or_else(|_err| "127.0.0.1:3030".into());
    let bind_addr: SocketAddr = bind_addr.parse()?;

    let cors_origin = env::var("CORS_ORIGIN").unwrap_or_else(|_err| "http://localhost:5173".into());

    let secret_key = env::var("SECRET_KEY")
        .map_err(Error::new)
        .and_then(|env| {
            let mut secret_key = [0u8; digest::SHA256_OUTPUT_LEN];
            hex::decode_to_slice(env, &mut secret_key)?;
            Ok(secret_key)
        })
        .or_else(|_err| -> Result<_> {
            let mut secret_key = [0u8; digest::SHA256_OUTPUT_LEN];
            rand::rngs::OsRng.fill(&mut secret_key);

            log::warn!("no secret key was specified, generated a new one");
            log::warn!("rerun with SECRET_KEY={}", hex::encode(secret_key));

            Ok(secret_key)
        })?;
    let secret_key = hmac::Key::new(hmac::HMAC_SHA256, secret_key.as_ref());

    let quiz_file = env::var("QUIZ_FILE").unwrap_or_else(|_err| "quizzes.toml".into());
    let config = fs::read_to_string(&quiz_file).await?;
    let config: Config = toml::de::from_str(&config)?;
    config.validate()?;

    let submissions_file =
        env::var("SUBMISSIONS_FILE").unwrap_or_else(|_err| "submissions.csv".into());
    let writer = SubmissionWriter::new(&submissions_file)?;

    let controller = PlatformController::new(
        secret_key,
        config.quiz.iter(),
        DEFAULT_PASS_THRESHOLD,
        writer,
    );

    log::info!(
        "serving {} quizzes from {} on {}",
        config.quiz.len(),
        quiz_file,
        bind_addr
    );

    let get_quiz = warp::path!("quizzes" / String)
        .and(warp::get())
        .and(filters::with_controller(controller.clone()))
        .map(|quiz_id: String, controller: PlatformController| {
            match controller.quiz(&quiz_id) {
                None => not_found(),
                Some(quiz) => reply::json(quiz).into_response(),
            }
        });

    let start_attempt = warp::path!("attempts" / String / "start")
        .and(warp::post())
        .and(filters::user_snapshot(controller.clone()))
        .and(filters::with_controller(controller.clone()))
        .and_then(
            |quiz_id: String, user: UserSnapshot, controller: PlatformController| async move {
                let response = match controller.open_attempt(&quiz_id) {
                    None => not_found(),
                    Some(Err(error)) => attempt_error(error),
                    Some(Ok(attempt)) => attempt_reply(&controller, &user, &attempt, None),
                };

                Ok::<_, Infallible>(response)
            },
        );

    let answer = warp::path!("attempts" / "answer")
        .and(warp::post())
        .and(warp::filters::body::json())
        .and(filters::attempt_token(controller.clone()))
        .and(filters::with_controller(controller.clone()))
        .and_then(
            |body: AnswerRequest, token: AttemptToken, controller: PlatformController| async move {
                run_attempt_op(token, controller, move |attempt| {
                    attempt.select_answer(&body.question_id, &body.selected_option_id)
                })
                .await
            },
        );

    let advance = attempt_op_route("advance", controller.clone(), |attempt| {
        attempt.advance().map(|_outcome| ())
    });
    let retreat = attempt_op_route("retreat", controller.clone(), |attempt| {
        attempt.retreat().map(|_index| ())
    });
    let submit = attempt_op_route("submit", controller.clone(), |attempt| {
        attempt.submit().map(|_summary| ())
    });
    let tick = attempt_op_route("tick", controller.clone(), |attempt| {
        attempt.tick();
        Ok(())
    });
    let review = attempt_op_route("review", controller.clone(), QuizAttempt::start_review);
    let results = attempt_op_route("results", controller.clone(), QuizAttempt::back_to_results);
    let retry = attempt_op_route("retry", controller.clone(), QuizAttempt::retry);

    let player = warp::path!("player")
        .and(warp::get())
        .and(filters::user_snapshot(controller.clone()))
        .and(filters::with_controller(controller.clone()))
        .map(|user: UserSnapshot, controller: PlatformController| {
            match controller.encode_user(&user) {
                Err(err) => {
                    log::error!("couldn't encode user token: {}", err);
                    internal_error()
                }
                Ok(token) => reply::json(&PlayerReply {
                    token,
                    player: PlayerData::for_user(&user),
                })
                .into_response(),
            }
        });

    let hello = warp::path!("api" / "hello").and(warp::get()).map(|| {
        reply::json(&HelloReply {
            message: "CodeQuest API is up",
            version: env!("CARGO_PKG_VERSION"),
        })
    });

    let health = warp::path!("health")
        .and(warp::get())
        .map(|| reply::json(&HealthReply { status: "ok" }));

    let cors = warp::cors()
        .allow_origin(cors_origin.as_str())
        .allow_methods(vec!["GET", "POST"])
        .allow_headers(vec!["Authorization", "Content-Type"]);

    let server = get_quiz
        .or(start_attempt)
        .or(answer)
        .or(advance)
        .or(retreat)
        .or(submit)
        .or(tick)
        .or(review)
        .or(results)
        .or(retry)
        .or(player)
        .or(hello)
        .or(health)
        .with(cors)
        .recover(filters::handle_rejection);

    warp::serve(server).run(bind_addr).await;

    Ok(())
}
