//! Composition root: wires the actors onto one topic bus and owns their
//! lifetimes.

use std::sync::Arc;

use log::{error, info};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::TopicBus;
use crate::clients::{GameClient, QuizCatalogClient, SessionClient};
use crate::config::ServerConfig;
use crate::error::AppError;
use crate::game_actor::GameActor;
use crate::messages::{CLIENT_DELIVERY, GAME_TOPIC, QUIZ_TOPIC, SESSION_TOPIC};
use crate::persistence::Persistence;
use crate::quiz_actor::QuizActor;
use crate::session_actor::{run_reaper, SessionActor};

pub struct QuizServer {
    bus: Arc<TopicBus>,
    shutdown: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
    quizzes: QuizCatalogClient,
    games: GameClient,
    sessions: SessionClient,
}

impl QuizServer {
    /// Subscribes every actor before any of them runs, so no early message
    /// lands on a topic nobody consumes.
    pub fn start(config: &ServerConfig, persistence: Persistence) -> Result<Self, AppError> {
        let bus = Arc::new(TopicBus::new(config.topic_capacity));
        let shutdown = CancellationToken::new();

        let quiz_actor = QuizActor::new(&bus, persistence.clone(), shutdown.clone())?;
        let game_actor = GameActor::new(
            &bus,
            persistence.clone(),
            config.session_timeout,
            shutdown.clone(),
        )?;
        let session_actor = SessionActor::new(&bus, persistence, config, shutdown.clone())?;

        let quizzes = QuizCatalogClient::new(bus.topic(&QUIZ_TOPIC)?);
        let games = GameClient::new(bus.topic(&GAME_TOPIC)?);
        let sessions = SessionClient::new(bus.topic(&SESSION_TOPIC)?);

        let reaper = run_reaper(
            bus.topic(&SESSION_TOPIC)?,
            bus.topic(&GAME_TOPIC)?,
            bus.topic(&CLIENT_DELIVERY)?,
            config.reaper_interval,
            shutdown.clone(),
        );

        let handles = vec![
            ("quiz", tokio::spawn(quiz_actor.run())),
            ("game", tokio::spawn(game_actor.run())),
            ("session", tokio::spawn(session_actor.run())),
            ("reaper", tokio::spawn(reaper)),
        ];
        info!("Quiz server started");

        Ok(Self {
            bus,
            shutdown,
            handles,
            quizzes,
            games,
            sessions,
        })
    }

    pub fn bus(&self) -> Arc<TopicBus> {
        Arc::clone(&self.bus)
    }

    /// Token the transport should run under so it stops with the actors.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn quizzes(&self) -> &QuizCatalogClient {
        &self.quizzes
    }

    pub fn games(&self) -> &GameClient {
        &self.games
    }

    pub fn sessions(&self) -> &SessionClient {
        &self.sessions
    }

    /// Cancels every actor, waits for their loops to exit, then closes the bus.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                error!("{} task panicked: {}", name, e);
            }
        }
        self.bus.close();
        info!("Quiz server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use shared::{Question, Quiz};
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_test::assert_ok;

    fn sample_quiz() -> Quiz {
        Quiz::new(
            "Rust",
            20,
            vec![Question::new("Which borrow is exclusive?", &["&", "&mut"], 1)],
        )
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let server = QuizServer::start(&ServerConfig::default(), Persistence::new(store)).unwrap();

        let added = server.quizzes().add(sample_quiz()).await.unwrap();
        assert_eq!(server.quizzes().list().await.unwrap(), vec![added]);
        assert!(server.games().list().await.unwrap().is_empty());
        assert!(server.sessions().list().await.unwrap().is_empty());

        let bus = server.bus();
        assert_ok!(timeout(Duration::from_secs(2), server.shutdown()).await);
        assert_eq!(bus.topic_count(), 0);
    }
}
