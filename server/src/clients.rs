//! Request/reply handles for the administrative surface.
//!
//! Each call posts one message carrying a single-use reply channel and waits
//! for the owning actor to answer. Handles are cheap to clone.

use shared::{Pin, Quiz, QuizId};
use tokio::sync::oneshot;

use crate::bus::Topic;
use crate::error::AppError;
use crate::game::Game;
use crate::messages::{GameMsg, QuizMsg, Reply, SessionMsg};
use crate::session::Session;

async fn request<M, T>(
    topic: &Topic<M>,
    actor: &'static str,
    make: impl FnOnce(Reply<T>) -> M,
) -> Result<T, AppError>
where
    M: Send + 'static,
{
    let (reply, rx) = oneshot::channel();
    topic.send(make(reply)).await?;
    rx.await.map_err(|_| AppError::NoReply(actor))
}

#[derive(Clone)]
pub struct QuizCatalogClient {
    topic: Topic<QuizMsg>,
}

impl QuizCatalogClient {
    pub fn new(topic: Topic<QuizMsg>) -> Self {
        Self { topic }
    }

    /// All quizzes, ids ascending
    pub async fn list(&self) -> Result<Vec<Quiz>, AppError> {
        request(&self.topic, "quiz", |reply| QuizMsg::List { reply }).await
    }

    pub async fn get(&self, id: QuizId) -> Result<Quiz, AppError> {
        Ok(request(&self.topic, "quiz", |reply| QuizMsg::Get { id, reply }).await??)
    }

    /// Stores a new quiz and returns it with its assigned id.
    pub async fn add(&self, quiz: Quiz) -> Result<Quiz, AppError> {
        Ok(request(&self.topic, "quiz", |reply| QuizMsg::Add { quiz, reply }).await??)
    }

    pub async fn update(&self, quiz: Quiz) -> Result<Quiz, AppError> {
        Ok(request(&self.topic, "quiz", |reply| QuizMsg::Update { quiz, reply }).await??)
    }

    pub async fn delete(&self, id: QuizId) -> Result<(), AppError> {
        Ok(request(&self.topic, "quiz", |reply| QuizMsg::Delete { id, reply }).await??)
    }
}

#[derive(Clone)]
pub struct GameClient {
    topic: Topic<GameMsg>,
}

impl GameClient {
    pub fn new(topic: Topic<GameMsg>) -> Self {
        Self { topic }
    }

    /// Snapshots of every live game, ordered by pin
    pub async fn list(&self) -> Result<Vec<Game>, AppError> {
        request(&self.topic, "game", |reply| GameMsg::List { reply }).await
    }

    pub async fn get(&self, pin: Pin) -> Result<Game, AppError> {
        Ok(request(&self.topic, "game", |reply| GameMsg::Get { pin, reply }).await??)
    }

    /// Replaces a live game wholesale.
    pub async fn update(&self, game: Game) -> Result<(), AppError> {
        Ok(request(&self.topic, "game", |reply| GameMsg::Update { game, reply }).await??)
    }

    pub async fn delete(&self, pin: Pin) -> Result<(), AppError> {
        Ok(request(&self.topic, "game", |reply| GameMsg::Delete { pin, reply }).await??)
    }
}

#[derive(Clone)]
pub struct SessionClient {
    topic: Topic<SessionMsg>,
}

impl SessionClient {
    pub fn new(topic: Topic<SessionMsg>) -> Self {
        Self { topic }
    }

    pub async fn list(&self) -> Result<Vec<Session>, AppError> {
        request(&self.topic, "session", |reply| SessionMsg::List { reply }).await
    }

    pub async fn get(&self, session_id: &str) -> Result<Session, AppError> {
        let session_id = session_id.to_string();
        Ok(request(&self.topic, "session", |reply| SessionMsg::Get { session_id, reply }).await??)
    }

    pub async fn extend(&self, session_id: &str) -> Result<Session, AppError> {
        let session_id = session_id.to_string();
        Ok(request(&self.topic, "session", |reply| SessionMsg::Extend {
            session_id,
            reply: Some(reply),
        })
        .await??)
    }

    pub async fn delete(&self, session_id: &str) -> Result<(), AppError> {
        let session_id = session_id.to_string();
        Ok(request(&self.topic, "session", |reply| SessionMsg::Delete {
            session_id,
            reply: Some(reply),
        })
        .await??)
    }
}
