//! Error types for the quiz server actors.
//!
//! Each actor owns an error enum; [`AppError`] rolls them up for callers that
//! talk to several actors, and [`ErrorKind`] classifies any of them into the
//! recovery categories clients care about.

use shared::{Pin, QuizId, SessionId};
use thiserror::Error;

use crate::game::GameState;

/// Broad recovery category of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    UnexpectedState,
    Validation,
    Authorization,
    Infrastructure,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GameError {
    #[error("game {0} not found")]
    NotFound(Pin),
    #[error("game is in unexpected state {0}")]
    UnexpectedState(GameState),
    #[error("player is not part of this game")]
    PlayerNotInGame,
    #[error("answer {0} is out of range")]
    InvalidAnswer(usize),
    #[error("the name \"{0}\" is already taken")]
    DuplicateName(String),
    #[error("a player name is required")]
    MissingName,
    #[error("only the host can do that")]
    NotHost,
    #[error("game {0} has no quiz attached")]
    NoQuiz(Pin),
    #[error("could not generate a unique game pin")]
    PinExhausted,
    #[error("invalid game snapshot: {0}")]
    InvalidSnapshot(String),
}

impl GameError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GameError::NotFound(_) => ErrorKind::NotFound,
            GameError::UnexpectedState(_) | GameError::NoQuiz(_) => ErrorKind::UnexpectedState,
            GameError::PlayerNotInGame
            | GameError::InvalidAnswer(_)
            | GameError::DuplicateName(_)
            | GameError::MissingName
            | GameError::InvalidSnapshot(_) => ErrorKind::Validation,
            GameError::NotHost => ErrorKind::Authorization,
            GameError::PinExhausted => ErrorKind::Infrastructure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuizError {
    #[error("quiz {0} not found")]
    NotFound(QuizId),
    #[error("invalid quiz: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session \"{0}\" not found")]
    NotFound(SessionId),
    #[error("session \"{0}\" is already connected elsewhere")]
    DuplicateSession(SessionId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("topic \"{0}\" is closed")]
    Closed(&'static str),
    #[error("topic \"{0}\" already exists with a different message type")]
    TypeMismatch(&'static str),
    #[error("topic \"{0}\" already has a consumer")]
    AlreadySubscribed(&'static str),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Game(#[from] GameError),
    #[error(transparent)]
    Quiz(#[from] QuizError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("{0} actor did not reply")]
    NoReply(&'static str),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Game(err) => err.kind(),
            AppError::Quiz(QuizError::NotFound(_)) => ErrorKind::NotFound,
            AppError::Quiz(QuizError::Invalid(_)) => ErrorKind::Validation,
            AppError::Session(SessionError::NotFound(_)) => ErrorKind::NotFound,
            AppError::Session(SessionError::DuplicateSession(_)) => ErrorKind::Validation,
            AppError::Bus(_) | AppError::Persistence(_) | AppError::NoReply(_) => {
                ErrorKind::Infrastructure
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(GameError::NotFound(4).kind(), ErrorKind::NotFound);
        assert_eq!(
            GameError::UnexpectedState(GameState::ShowResults).kind(),
            ErrorKind::UnexpectedState
        );
        assert_eq!(GameError::InvalidAnswer(9).kind(), ErrorKind::Validation);
        assert_eq!(GameError::NotHost.kind(), ErrorKind::Authorization);

        let err: AppError = QuizError::NotFound(3).into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err: AppError = SessionError::DuplicateSession("x".into()).into();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err: AppError = BusError::Closed("game").into();
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
    }

    #[test]
    fn test_unexpected_state_message_names_state() {
        let err = GameError::UnexpectedState(GameState::GameEnded);
        assert_eq!(err.to_string(), "game is in unexpected state game-ended");
    }
}
