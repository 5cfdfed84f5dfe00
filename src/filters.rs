use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use warp::{
    http::StatusCode,
    reject::{self, Reject},
    reply::{self, Reply},
    Filter,
};

use crate::controllers::{AttemptToken, PlatformController};
use crate::models::UserSnapshot;

#[derive(Debug)]
pub struct Unauthorized;

impl Reject for Unauthorized {}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ErrorReply {
    pub error: ErrorCode,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub enum ErrorCode {
    NotFound,
    Unauthorized,
    BadRequest,
    MethodNotAllowed,
    Internal,
}

pub fn with_controller(
    controller: PlatformController,
) -> impl Filter<Extract = (PlatformController,), Error = Infallible> + Clone {
    warp::any().map(move || controller.clone())
}

fn bearer_value(auth: &str, scheme: &str) -> Result<String, warp::Rejection> {
    let mut parts = auth.splitn(2, ' ');
    let kind = parts.next().ok_or_else(|| reject::custom(Unauthorized))?;
    let value = parts.next().ok_or_else(|| reject::custom(Unauthorized))?;

    if !kind.eq_ignore_ascii_case(scheme) {
        return Err(reject::custom(Unauthorized));
    }

    Ok(value.to_string())
}

/// Authenticated-user snapshot. A request without an Authorization header
/// gets a fresh guest identity; a malformed or forged token is rejected.
pub fn user_snapshot(
    controller: PlatformController,
) -> impl Filter<Extract = (UserSnapshot,), Error = warp::Rejection> + Clone {
    warp::header::optional("authorization")
        .and(with_controller(controller))
        .and_then(
            move |auth: Option<String>, controller: PlatformController| async move {
                match auth {
                    None => Ok(controller.create_guest()),
                    Some(auth) => {
                        let token = bearer_value(&auth, "player")?;
                        controller.decode_user(&token).map_err(|err| {
                            log::debug!("rejected user token: {}", err);
                            reject::custom(Unauthorized)
                        })
                    }
                }
            },
        )
}

/// In-flight attempt state, decoded from its signed token. Required.
pub fn attempt_token(
    controller: PlatformController,
) -> impl Filter<Extract = (AttemptToken,), Error = warp::Rejection> + Clone {
    warp::header::<String>("authorization")
        .and(with_controller(controller))
        .and_then(|auth: String, controller: PlatformController| async move {
            let token = bearer_value(&auth, "attempt")?;
            controller.decode_attempt(&token).map_err(|err| {
                log::debug!("rejected attempt token: {}", err);
                reject::custom(Unauthorized)
            })
        })
}

pub async fn handle_rejection(err: warp::Rejection) -> Result<impl Reply, Infallible> {
    let (status, error) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, ErrorCode::NotFound)
    } else if err.find::<Unauthorized>().is_some()
        || err.find::<warp::reject::MissingHeader>().is_some()
    {
        (StatusCode::UNAUTHORIZED, ErrorCode::Unauthorized)
    } else if err
        .find::<warp::filters::body::BodyDeserializeError>()
        .is_some()
    {
        (StatusCode::BAD_REQUEST, ErrorCode::BadRequest)
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, ErrorCode::MethodNotAllowed)
    } else {
        log::warn!("unhandled rejection: {:?}", err);
        (StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::Internal)
    };

    Ok(reply::with_status(
        reply::json(&ErrorReply { error }),
        status,
    ))
}
