//! Game actor: owns every live game and drives its state machine.
//!
//! Clients never hold a reference to a [`Game`]; they get screens and
//! serialized views pushed back through the session actor or straight to the
//! transport when the requesting connection is known.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use log::{debug, info, warn};
use rand::rngs::OsRng;
use shared::{ClientId, Pin, Screen, ServerMessage, SessionId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::{Topic, TopicBus};
use crate::error::{BusError, GameError};
use crate::game::{generate_pin, Game, GameState};
use crate::messages::{
    ClientDelivery, CloseReason, GameMsg, Origin, QuizMsg, SessionMsg, CLIENT_DELIVERY,
    GAME_TOPIC, QUIZ_TOPIC, SESSION_TOPIC,
};
use crate::persistence::{game_key, Persistence, GAME_PREFIX};
use crate::utils::get_timestamp;

/// Screen the host should be on for a game state
pub fn host_screen(state: GameState) -> Screen {
    match state {
        GameState::NotStarted => Screen::HostGameLobby,
        GameState::QuestionInProgress => Screen::HostShowQuestion,
        GameState::ShowResults => Screen::HostShowResults,
        GameState::GameEnded => Screen::HostShowGameResults,
    }
}

/// Screen a player should be on for a game state
pub fn player_screen(state: GameState, answered: bool) -> Screen {
    match state {
        GameState::NotStarted => Screen::WaitForGameStart,
        GameState::QuestionInProgress if answered => Screen::WaitForQuestionEnd,
        GameState::QuestionInProgress => Screen::AnswerQuestion,
        GameState::ShowResults | GameState::GameEnded => Screen::DisplayPlayerResults,
    }
}

pub struct GameActor {
    games: HashMap<Pin, Game>,
    persistence: Persistence,
    ttl: Duration,
    inbox: mpsc::Receiver<GameMsg>,
    sessions: Topic<SessionMsg>,
    quizzes: Topic<QuizMsg>,
    delivery: Topic<ClientDelivery>,
    shutdown: CancellationToken,
}

impl GameActor {
    /// `ttl` bounds how long an idle game snapshot survives in the store.
    pub fn new(
        bus: &TopicBus,
        persistence: Persistence,
        ttl: Duration,
        shutdown: CancellationToken,
    ) -> Result<Self, BusError> {
        Ok(Self {
            games: HashMap::new(),
            persistence,
            ttl,
            inbox: bus.subscribe(&GAME_TOPIC)?,
            sessions: bus.topic(&SESSION_TOPIC)?,
            quizzes: bus.topic(&QUIZ_TOPIC)?,
            delivery: bus.topic(&CLIENT_DELIVERY)?,
            shutdown,
        })
    }

    pub async fn run(mut self) {
        for game in self.persistence.load_all::<Game>(GAME_PREFIX).await {
            self.games.insert(game.pin, game);
        }
        info!("Game actor started with {} games", self.games.len());

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                message = self.inbox.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => break,
                },
            }
        }

        info!("Game actor stopped");
    }

    async fn handle(&mut self, message: GameMsg) {
        match message {
            GameMsg::Create { origin, quiz_id } => {
                let pin = match generate_pin(&mut OsRng, |pin| self.games.contains_key(&pin)) {
                    Ok(pin) => pin,
                    Err(e) => {
                        warn!("Could not create game for {}: {}", origin.session_id, e);
                        self.report(&origin, 0, e).await;
                        return;
                    }
                };

                let game = Game::new(pin, origin.session_id.clone());
                self.games.insert(pin, game);
                self.persist(pin).await;
                info!("Created game {} hosted by {}", pin, origin.session_id);

                self.send_session(SessionMsg::BindGamePin {
                    session_id: origin.session_id.clone(),
                    pin,
                    name: None,
                })
                .await;
                if let Err(e) = self
                    .quizzes
                    .send(QuizMsg::LookupForGame {
                        quiz_id,
                        pin,
                        origin,
                    })
                    .await
                {
                    warn!("Game actor could not reach quiz actor: {}", e);
                }
            }
            GameMsg::SetQuiz { pin, quiz } => match self.games.get_mut(&pin) {
                Some(game) => {
                    debug!("Game {} uses quiz {}", pin, quiz.id);
                    game.set_quiz(quiz);
                    self.persist(pin).await;
                }
                None => warn!("Quiz resolved for unknown game {}", pin),
            },
            GameMsg::Discard { pin } => {
                if self.games.remove(&pin).is_some() {
                    self.persistence.delete(&game_key(pin)).await;
                    info!("Discarded game {}", pin);
                }
            }
            GameMsg::Join { origin, pin, name } => self.join(origin, pin, name).await,
            GameMsg::RegisterAnswer {
                origin,
                pin,
                answer,
            } => self.register_answer(origin, pin, answer).await,
            GameMsg::Start { origin, pin } => self.start(origin, pin).await,
            GameMsg::ShowResults { origin, pin } => self.show_results(origin, pin).await,
            GameMsg::NextQuestion { origin, pin } => self.next_question(origin, pin).await,
            GameMsg::Close {
                origin,
                pin,
                reason,
            } => {
                let check = self.hosted_game(&origin, pin).map(|_| ());
                match check {
                    Ok(()) => self.close(pin, reason).await,
                    Err(e) => self.report(&origin, pin, e).await,
                }
            }
            GameMsg::QueryDisplayChoices { origin, pin } => {
                self.query_display_choices(origin, pin).await
            }
            GameMsg::QueryPlayerResults { origin, pin } => {
                let result = self
                    .games
                    .get(&pin)
                    .ok_or(GameError::NotFound(pin))
                    .and_then(|game| game.player_results(&origin.session_id));
                match result {
                    Ok(results) => {
                        self.to_client(origin.client_id, ServerMessage::PlayerResults(results))
                            .await
                    }
                    Err(e) => self.report(&origin, pin, e).await,
                }
            }
            GameMsg::QueryHostResults { origin, pin } => {
                let result = self
                    .hosted_game(&origin, pin)
                    .and_then(|game| game.question_results());
                match result {
                    Ok(results) => {
                        self.to_client(origin.client_id, ServerMessage::QuestionResults(results))
                            .await
                    }
                    Err(e) => self.report(&origin, pin, e).await,
                }
            }
            GameMsg::SendLobbyMetadata { origin, pin } => match self.games.get(&pin) {
                Some(game) => {
                    let metadata = game.lobby_metadata();
                    self.to_client(origin.client_id, ServerMessage::LobbyGameMetadata(metadata))
                        .await
                }
                None => self.report(&origin, pin, GameError::NotFound(pin)).await,
            },
            GameMsg::SendCurrentQuestion { origin, pin } => {
                self.send_current_question(origin, pin).await
            }
            GameMsg::SendWinners { origin, pin } => match self.games.get(&pin) {
                Some(game) => {
                    let winners = game.winners();
                    self.to_client(origin.client_id, ServerMessage::ShowWinners(winners))
                        .await
                }
                None => self.report(&origin, pin, GameError::NotFound(pin)).await,
            },
            GameMsg::SessionsGone { departed } => self.sessions_gone(departed).await,
            GameMsg::List { reply } => {
                let mut games: Vec<Game> = self.games.values().cloned().collect();
                games.sort_by_key(|game| game.pin);
                let _ = reply.send(games);
            }
            GameMsg::Get { pin, reply } => {
                let _ = reply.send(self.games.get(&pin).cloned().ok_or(GameError::NotFound(pin)));
            }
            GameMsg::Update { game, reply } => {
                let pin = game.pin;
                let result = if !self.games.contains_key(&pin) {
                    Err(GameError::NotFound(pin))
                } else if let Err(e) = game.validate() {
                    warn!("Rejected replacement for game {}: {}", pin, e);
                    Err(e)
                } else {
                    self.games.insert(pin, game);
                    self.persist(pin).await;
                    info!("Replaced game {}", pin);
                    Ok(())
                };
                let _ = reply.send(result);
            }
            GameMsg::Delete { pin, reply } => {
                let result = if self.games.contains_key(&pin) {
                    self.close(pin, CloseReason::Deleted).await;
                    Ok(())
                } else {
                    Err(GameError::NotFound(pin))
                };
                let _ = reply.send(result);
            }
        }
    }

    fn hosted_game(&mut self, origin: &Origin, pin: Pin) -> Result<&mut Game, GameError> {
        let game = self.games.get_mut(&pin).ok_or(GameError::NotFound(pin))?;
        if !game.is_host(&origin.session_id) {
            return Err(GameError::NotHost);
        }
        Ok(game)
    }

    async fn join(&mut self, origin: Origin, pin: Pin, name: String) {
        let Some(game) = self.games.get_mut(&pin) else {
            self.report_with(&origin, GameError::NotFound(pin), Screen::Entrance, true)
                .await;
            return;
        };

        let added = match game.add_player(&origin.session_id, &name) {
            Ok(added) => added,
            Err(e) => {
                self.report_with(&origin, e, Screen::Entrance, true).await;
                return;
            }
        };

        let screen = player_screen(game.state, game.has_answered(&origin.session_id));
        let display_name = game.player_names.get(&origin.session_id).cloned();
        let host = game.host.clone();
        let participants = game.participant_names();

        if added {
            info!("{:?} joined game {}", display_name, pin);
            self.persist(pin).await;
        }
        self.send_session(SessionMsg::BindGamePin {
            session_id: origin.session_id.clone(),
            pin,
            name: display_name,
        })
        .await;
        self.send_session(SessionMsg::MoveToScreen {
            session_id: origin.session_id,
            screen,
        })
        .await;
        if added {
            self.send_session(SessionMsg::Deliver {
                session_id: host,
                message: ServerMessage::ParticipantsList(participants),
            })
            .await;
        }
    }

    async fn register_answer(&mut self, origin: Origin, pin: Pin, answer: usize) {
        let now = get_timestamp();
        let Some(game) = self.games.get_mut(&pin) else {
            self.report(&origin, pin, GameError::NotFound(pin)).await;
            return;
        };

        let before = game.state;
        let result = game.register_answer(&origin.session_id, answer, now);
        let after = game.state;
        let progress = game.answer_progress();
        let host = game.host.clone();

        match result {
            Ok(outcome) => {
                if outcome.counted {
                    self.persist(pin).await;
                    self.send_session(SessionMsg::Deliver {
                        session_id: host,
                        message: ServerMessage::PlayersAnswered(progress),
                    })
                    .await;
                }
                if after == GameState::QuestionInProgress {
                    self.send_session(SessionMsg::MoveToScreen {
                        session_id: origin.session_id.clone(),
                        screen: Screen::WaitForQuestionEnd,
                    })
                    .await;
                }
            }
            Err(e) => {
                if before != after {
                    self.persist(pin).await;
                }
                self.report(&origin, pin, e).await;
            }
        }

        if before != after {
            self.announce(pin).await;
        }
    }

    async fn start(&mut self, origin: Origin, pin: Pin) {
        let result = self.hosted_game(&origin, pin).and_then(|game| {
            if game.state != GameState::NotStarted {
                return Err(GameError::UnexpectedState(game.state));
            }
            Ok(game.advance(get_timestamp()))
        });

        match result {
            Ok(_) => {
                self.persist(pin).await;
                self.announce(pin).await;
            }
            Err(e) => self.report(&origin, pin, e).await,
        }
    }

    async fn show_results(&mut self, origin: Origin, pin: Pin) {
        let result = self.hosted_game(&origin, pin).and_then(|game| {
            let before = game.state;
            game.show_results().map(|_| before != game.state)
        });

        match result {
            Ok(true) => {
                self.persist(pin).await;
                self.announce(pin).await;
            }
            Ok(false) => {
                self.send_session(SessionMsg::MoveToScreen {
                    session_id: origin.session_id,
                    screen: Screen::HostShowResults,
                })
                .await
            }
            Err(e) => self.report(&origin, pin, e).await,
        }
    }

    async fn next_question(&mut self, origin: Origin, pin: Pin) {
        let result = self.hosted_game(&origin, pin).and_then(|game| {
            if game.state != GameState::ShowResults {
                return Err(GameError::UnexpectedState(game.state));
            }
            Ok(game.advance(get_timestamp()))
        });

        match result {
            Ok(_) => {
                self.persist(pin).await;
                self.announce(pin).await;
            }
            Err(e) => self.report(&origin, pin, e).await,
        }
    }

    async fn query_display_choices(&mut self, origin: Origin, pin: Pin) {
        let now = get_timestamp();
        let Some(game) = self.games.get_mut(&pin) else {
            self.report(&origin, pin, GameError::NotFound(pin)).await;
            return;
        };

        let before = game.state;
        let result = game.display_choices(&origin.session_id, now);
        let answered = game.has_answered(&origin.session_id);
        let changed = before != game.state;

        match result {
            Ok(_) if answered => {
                self.send_session(SessionMsg::MoveToScreen {
                    session_id: origin.session_id,
                    screen: Screen::WaitForQuestionEnd,
                })
                .await
            }
            Ok(choices) => {
                self.to_client(origin.client_id, ServerMessage::DisplayChoices(choices))
                    .await
            }
            Err(e) => self.report(&origin, pin, e).await,
        }

        if changed {
            self.persist(pin).await;
            self.announce(pin).await;
        }
    }

    async fn send_current_question(&mut self, origin: Origin, pin: Pin) {
        let now = get_timestamp();
        let Some(game) = self.games.get_mut(&pin) else {
            self.report(&origin, pin, GameError::NotFound(pin)).await;
            return;
        };

        let before = game.state;
        let result = game.current_question(now);
        let changed = before != game.state;

        match result {
            Ok(view) => {
                self.to_client(origin.client_id, ServerMessage::HostShowQuestion(view))
                    .await
            }
            Err(_) if changed => {
                // The question closed while being asked for; everyone moves on.
                self.persist(pin).await;
                self.announce(pin).await;
            }
            Err(e) => self.report(&origin, pin, e).await,
        }
    }

    /// Forgets sessions that were deleted or reaped. Lobby players leave,
    /// finished games go with their host, and everyone a game let go of is
    /// released in a single message. Players of a started game keep their
    /// place on the scoreboard.
    async fn sessions_gone(&mut self, departed: Vec<(Pin, SessionId)>) {
        let mut lobbies = BTreeSet::new();
        let mut released = Vec::new();

        for (pin, session_id) in departed {
            let Some(game) = self.games.get_mut(&pin) else {
                released.push((pin, session_id));
                continue;
            };

            if game.is_host(&session_id) {
                if game.state == GameState::GameEnded {
                    self.games.remove(&pin);
                    self.persistence.delete(&game_key(pin)).await;
                    info!("Evicted finished game {} after its host left", pin);
                    released.push((pin, session_id));
                }
            } else if game.remove_player(&session_id) {
                debug!("Session {} left the lobby of game {}", session_id, pin);
                lobbies.insert(pin);
                released.push((pin, session_id));
            }
        }

        for pin in lobbies {
            let Some(game) = self.games.get(&pin) else {
                continue;
            };
            let host = game.host.clone();
            let participants = game.participant_names();
            self.persist(pin).await;
            self.send_session(SessionMsg::Deliver {
                session_id: host,
                message: ServerMessage::ParticipantsList(participants),
            })
            .await;
        }

        if !released.is_empty() {
            self.send_session(SessionMsg::ReleaseGame { released }).await;
        }
    }

    /// Removes a game, sending its players back to the entrance and its host
    /// back to quiz selection.
    async fn close(&mut self, pin: Pin, reason: CloseReason) {
        let Some(game) = self.games.remove(&pin) else {
            return;
        };
        self.persistence.delete(&game_key(pin)).await;
        info!("Closed game {} ({:?})", pin, reason);

        let players = game.player_sessions();
        if !players.is_empty() {
            self.send_session(SessionMsg::Error {
                session_ids: players,
                message: reason.message().to_string(),
                next_screen: Screen::Entrance,
                clear_pin: true,
            })
            .await;
        }
        self.send_session(SessionMsg::UnbindGamePin {
            session_id: game.host.clone(),
        })
        .await;
        self.send_session(SessionMsg::MoveToScreen {
            session_id: game.host,
            screen: Screen::HostSelectQuiz,
        })
        .await;
    }

    /// Moves the host and every player to the screens matching the game state.
    async fn announce(&mut self, pin: Pin) {
        let Some(game) = self.games.get(&pin) else {
            return;
        };
        let state = game.state;
        let host = game.host.clone();
        let players = game.player_sessions();
        info!("Game {} is now {}", pin, state);

        self.send_session(SessionMsg::MoveToScreen {
            session_id: host,
            screen: host_screen(state),
        })
        .await;
        if !players.is_empty() {
            self.send_session(SessionMsg::BroadcastScreen {
                session_ids: players,
                screen: player_screen(state, false),
            })
            .await;
        }
    }

    async fn persist(&self, pin: Pin) {
        if let Some(game) = self.games.get(&pin) {
            self.persistence
                .save(&game_key(pin), game, Some(self.ttl))
                .await;
        }
    }

    /// Picks the recovery screen for a failed request and pushes the error.
    async fn report(&self, origin: &Origin, pin: Pin, err: GameError) {
        let fallback = if origin.admin {
            Screen::HostSelectQuiz
        } else {
            Screen::Entrance
        };
        let game = self.games.get(&pin);

        let (screen, clear_pin) = match &err {
            GameError::NotFound(_)
            | GameError::NoQuiz(_)
            | GameError::PinExhausted
            | GameError::PlayerNotInGame => (fallback, true),
            GameError::UnexpectedState(state) => match game {
                Some(game) if game.is_host(&origin.session_id) => (host_screen(*state), false),
                Some(game) => (
                    player_screen(*state, game.has_answered(&origin.session_id)),
                    false,
                ),
                None => (fallback, true),
            },
            GameError::InvalidAnswer(_) => (Screen::AnswerQuestion, false),
            GameError::DuplicateName(_) | GameError::MissingName => (Screen::Entrance, true),
            GameError::NotHost | GameError::InvalidSnapshot(_) => (fallback, false),
        };

        self.report_with(origin, err, screen, clear_pin).await;
    }

    async fn report_with(&self, origin: &Origin, err: GameError, screen: Screen, clear_pin: bool) {
        debug!(
            "Rejected request from {}: {} (kind {:?})",
            origin.session_id,
            err,
            err.kind()
        );
        self.send_session(SessionMsg::Error {
            session_ids: vec![origin.session_id.clone()],
            message: err.to_string(),
            next_screen: screen,
            clear_pin,
        })
        .await;
    }

    async fn send_session(&self, message: SessionMsg) {
        if let Err(e) = self.sessions.send(message).await {
            warn!("Game actor could not reach session actor: {}", e);
        }
    }

    async fn to_client(&self, client_id: ClientId, message: ServerMessage) {
        if let Err(e) = self
            .delivery
            .send(ClientDelivery::Text { client_id, message })
            .await
        {
            warn!("Failed to deliver to client {}: {}", client_id, e);
        }
    }
}
