//! Quiz catalog actor: sole owner of the quiz definitions.

use std::collections::BTreeMap;

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared::{ClientId, Pin, Quiz, QuizId, QuizSummary, Screen, ServerMessage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::{Topic, TopicBus};
use crate::error::{BusError, QuizError};
use crate::messages::{
    ClientDelivery, GameMsg, Origin, QuizMsg, SessionMsg, CLIENT_DELIVERY, GAME_TOPIC,
    QUIZ_TOPIC, SESSION_TOPIC,
};
use crate::persistence::{quiz_key, Persistence, QUIZ_ID_COUNTER, QUIZ_PREFIX};

pub struct QuizActor {
    quizzes: BTreeMap<QuizId, Quiz>,
    persistence: Persistence,
    rng: StdRng,
    inbox: mpsc::Receiver<QuizMsg>,
    games: Topic<GameMsg>,
    sessions: Topic<SessionMsg>,
    delivery: Topic<ClientDelivery>,
    shutdown: CancellationToken,
}

impl QuizActor {
    pub fn new(
        bus: &TopicBus,
        persistence: Persistence,
        shutdown: CancellationToken,
    ) -> Result<Self, BusError> {
        Ok(Self {
            quizzes: BTreeMap::new(),
            persistence,
            rng: StdRng::from_entropy(),
            inbox: bus.subscribe(&QUIZ_TOPIC)?,
            games: bus.topic(&GAME_TOPIC)?,
            sessions: bus.topic(&SESSION_TOPIC)?,
            delivery: bus.topic(&CLIENT_DELIVERY)?,
            shutdown,
        })
    }

    pub async fn run(mut self) {
        self.load().await;
        info!("Quiz actor started with {} quizzes", self.quizzes.len());

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                message = self.inbox.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => break,
                },
            }
        }

        info!("Quiz actor stopped");
    }

    async fn load(&mut self) {
        for quiz in self.persistence.load_all::<Quiz>(QUIZ_PREFIX).await {
            self.quizzes.insert(quiz.id, quiz);
        }
    }

    async fn handle(&mut self, message: QuizMsg) {
        match message {
            QuizMsg::SendAllQuizzes { client_id } => self.send_all_quizzes(client_id).await,
            QuizMsg::LookupForGame {
                quiz_id,
                pin,
                origin,
            } => self.lookup_for_game(quiz_id, pin, origin).await,
            QuizMsg::List { reply } => {
                let _ = reply.send(self.quizzes.values().cloned().collect());
            }
            QuizMsg::Get { id, reply } => {
                let _ = reply.send(self.quizzes.get(&id).cloned().ok_or(QuizError::NotFound(id)));
            }
            QuizMsg::Add { quiz, reply } => {
                let result = self.add(quiz).await;
                let _ = reply.send(result);
            }
            QuizMsg::Update { quiz, reply } => {
                let result = self.update(quiz).await;
                let _ = reply.send(result);
            }
            QuizMsg::Delete { id, reply } => {
                let result = self.delete(id).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn next_id(&self) -> QuizId {
        let local = self.quizzes.keys().next_back().map_or(1, |max| max + 1);
        match self.persistence.increment(QUIZ_ID_COUNTER).await {
            Some(counter) => counter.max(local),
            None => local,
        }
    }

    async fn add(&mut self, mut quiz: Quiz) -> Result<Quiz, QuizError> {
        quiz.validate().map_err(QuizError::Invalid)?;
        quiz.id = self.next_id().await;

        self.persistence.save(&quiz_key(quiz.id), &quiz, None).await;
        self.quizzes.insert(quiz.id, quiz.clone());
        info!("Added quiz {} \"{}\"", quiz.id, quiz.name);
        Ok(quiz)
    }

    async fn update(&mut self, quiz: Quiz) -> Result<Quiz, QuizError> {
        if !self.quizzes.contains_key(&quiz.id) {
            return Err(QuizError::NotFound(quiz.id));
        }
        quiz.validate().map_err(QuizError::Invalid)?;

        self.persistence.save(&quiz_key(quiz.id), &quiz, None).await;
        self.quizzes.insert(quiz.id, quiz.clone());
        info!("Updated quiz {}", quiz.id);
        Ok(quiz)
    }

    async fn delete(&mut self, id: QuizId) -> Result<(), QuizError> {
        self.quizzes.remove(&id).ok_or(QuizError::NotFound(id))?;
        self.persistence.delete(&quiz_key(id)).await;
        info!("Deleted quiz {}", id);
        Ok(())
    }

    async fn send_all_quizzes(&self, client_id: ClientId) {
        let summaries = self
            .quizzes
            .values()
            .map(|quiz| QuizSummary {
                id: quiz.id,
                name: quiz.name.clone(),
            })
            .collect();
        let delivery = ClientDelivery::Text {
            client_id,
            message: ServerMessage::AllQuizzes(summaries),
        };
        if let Err(e) = self.delivery.send(delivery).await {
            warn!("Failed to deliver quiz list to client {}: {}", client_id, e);
        }
    }

    /// Hands a snapshot of the quiz to a freshly created game and moves its
    /// host to the lobby. An unknown quiz discards the game instead.
    async fn lookup_for_game(&mut self, quiz_id: QuizId, pin: Pin, origin: Origin) {
        let Some(quiz) = self.quizzes.get(&quiz_id) else {
            debug!("Game {} asked for unknown quiz {}", pin, quiz_id);
            self.send_game(GameMsg::Discard { pin }).await;
            self.send_session(SessionMsg::Error {
                session_ids: vec![origin.session_id],
                message: QuizError::NotFound(quiz_id).to_string(),
                next_screen: Screen::HostSelectQuiz,
                clear_pin: true,
            })
            .await;
            return;
        };

        let snapshot = quiz.snapshot_for_game(&mut self.rng);
        self.send_game(GameMsg::SetQuiz {
            pin,
            quiz: snapshot,
        })
        .await;
        self.send_session(SessionMsg::MoveToScreen {
            session_id: origin.session_id,
            screen: Screen::HostGameLobby,
        })
        .await;
    }

    async fn send_game(&self, message: GameMsg) {
        if let Err(e) = self.games.send(message).await {
            warn!("Quiz actor could not reach game actor: {}", e);
        }
    }

    async fn send_session(&self, message: SessionMsg) {
        if let Err(e) = self.sessions.send(message).await {
            warn!("Quiz actor could not reach session actor: {}", e);
        }
    }
}
