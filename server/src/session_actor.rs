//! Session actor: owns every session record, interprets client commands and
//! decides which screen each client is on.
//!
//! A connection is anonymous until it sends `session <id>`; from then on its
//! commands act on behalf of that session. Sessions outlive connections: a
//! disconnect only unbinds the client, and an idle session is removed by the
//! reaper once it expires.

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, info, warn};
use shared::{ClientCommand, ClientId, Pin, RawCommand, Screen, ServerMessage, SessionId};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::bus::{Topic, TopicBus};
use crate::config::ServerConfig;
use crate::error::{BusError, SessionError};
use crate::messages::{
    ClientDelivery, CloseReason, GameMsg, InboundCommand, Origin, QuizMsg, Reaped, SessionMsg,
    CLIENT_DELIVERY, GAME_TOPIC, INCOMING_COMMANDS, QUIZ_TOPIC, SESSION_TOPIC,
};
use crate::persistence::{session_key, Persistence};
use crate::session::Session;
use crate::utils::{decode_credentials, get_timestamp};

pub struct SessionActor {
    sessions: HashMap<SessionId, Session>,
    /// Which session each identified connection speaks for
    clients: HashMap<ClientId, SessionId>,
    persistence: Persistence,
    timeout: Duration,
    admin_user: String,
    admin_password: String,
    commands: mpsc::Receiver<InboundCommand>,
    inbox: mpsc::Receiver<SessionMsg>,
    games: Topic<GameMsg>,
    quizzes: Topic<QuizMsg>,
    delivery: Topic<ClientDelivery>,
    shutdown: CancellationToken,
}

impl SessionActor {
    pub fn new(
        bus: &TopicBus,
        persistence: Persistence,
        config: &ServerConfig,
        shutdown: CancellationToken,
    ) -> Result<Self, BusError> {
        Ok(Self {
            sessions: HashMap::new(),
            clients: HashMap::new(),
            persistence,
            timeout: config.session_timeout,
            admin_user: config.admin_user.clone(),
            admin_password: config.admin_password.clone(),
            commands: bus.subscribe(&INCOMING_COMMANDS)?,
            inbox: bus.subscribe(&SESSION_TOPIC)?,
            games: bus.topic(&GAME_TOPIC)?,
            quizzes: bus.topic(&QUIZ_TOPIC)?,
            delivery: bus.topic(&CLIENT_DELIVERY)?,
            shutdown,
        })
    }

    pub async fn run(mut self) {
        info!("Session actor started");

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                message = self.inbox.recv() => match message {
                    Some(message) => self.handle_message(message).await,
                    None => break,
                },
                command = self.commands.recv() => match command {
                    Some(InboundCommand { client_id, command }) => {
                        self.handle_command(client_id, command).await
                    }
                    None => break,
                },
            }
        }

        info!("Session actor stopped with {} sessions", self.sessions.len());
    }

    /// Makes sure a session is in memory, reading it back from the store on a
    /// miss. Returns false when the session exists nowhere.
    async fn ensure_loaded(&mut self, session_id: &str) -> bool {
        if self.sessions.contains_key(session_id) {
            return true;
        }
        match self.persistence.load::<Session>(&session_key(session_id)).await {
            Some(stored) => {
                let session = stored.hydrated(self.timeout);
                debug!("Rehydrated session {}", session_id);
                self.sessions.insert(session.id.clone(), session);
                true
            }
            None => false,
        }
    }

    async fn persist(&self, session_id: &str) {
        if let Some(session) = self.sessions.get(session_id) {
            self.persistence
                .save(&session_key(session_id), session, Some(self.timeout))
                .await;
        }
    }

    async fn handle_command(&mut self, client_id: ClientId, raw: RawCommand) {
        let session_id = match self.clients.get(&client_id) {
            Some(session_id) if self.sessions.contains_key(session_id) => session_id.clone(),
            Some(_) => {
                self.clients.remove(&client_id);
                return self.identify(client_id, raw).await;
            }
            None => return self.identify(client_id, raw).await,
        };

        let command = match ClientCommand::try_from(&raw) {
            Ok(command) => command,
            Err(e) => {
                debug!("Client {} sent a bad command: {}", client_id, e);
                let screen = self.sessions.get(&session_id).map_or(Screen::Entrance, |s| s.screen);
                self.to_client(client_id, ServerMessage::error(e.to_string(), screen))
                    .await;
                return;
            }
        };

        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.extend(self.timeout);
        }
        self.dispatch(session_id, client_id, command).await;
    }

    /// Handles a command from a connection that has not said who it is yet.
    async fn identify(&mut self, client_id: ClientId, raw: RawCommand) {
        let session_id = match ClientCommand::try_from(&raw) {
            Ok(ClientCommand::Session(id)) => id.trim().to_string(),
            _ => {
                debug!("Client {} must identify before '{}'", client_id, raw.verb);
                self.to_client(client_id, ServerMessage::RegisterSession).await;
                return;
            }
        };

        if !self.ensure_loaded(&session_id).await {
            info!("Created session {}", session_id);
            self.sessions
                .insert(session_id.clone(), Session::new(session_id.clone(), self.timeout));
        }

        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        if let Some(bound) = session.client_id {
            if bound != client_id {
                warn!(
                    "Client {} tried to take over session {} bound to client {}",
                    client_id, session_id, bound
                );
                let err = SessionError::DuplicateSession(session_id);
                self.to_client(client_id, ServerMessage::error(err.to_string(), Screen::Entrance))
                    .await;
                return;
            }
        }

        session.bind(client_id);
        session.extend(self.timeout);
        let screen = session.screen;
        self.clients.insert(client_id, session_id.clone());
        info!("Client {} identified as session {}", client_id, session_id);

        self.move_session_to_screen(&session_id, screen).await;
    }

    async fn dispatch(&mut self, session_id: SessionId, client_id: ClientId, command: ClientCommand) {
        let Some(session) = self.sessions.get(&session_id) else {
            return;
        };
        let origin = Origin {
            session_id: session_id.clone(),
            client_id,
            admin: session.admin,
        };
        let pin = session.game_pin;

        match command {
            ClientCommand::Session(other) => {
                if other.trim() == session_id {
                    let screen = session.screen;
                    self.move_session_to_screen(&session_id, screen).await;
                    return;
                }
                self.unbind_client(client_id).await;
                self.identify(client_id, RawCommand::new("session", other)).await;
            }
            ClientCommand::JoinGame(request) => {
                self.send_game(GameMsg::Join {
                    origin,
                    pin: request.pin,
                    name: request.name,
                })
                .await
            }
            ClientCommand::AdminLogin(encoded) => self.admin_login(&session_id, &encoded).await,
            ClientCommand::HostGame => {
                self.move_session_to_screen(&session_id, Screen::HostSelectQuiz)
                    .await
            }
            ClientCommand::HostGameLobby(quiz_id) => {
                if !origin.admin {
                    self.move_session_to_screen(&session_id, Screen::AuthenticateUser)
                        .await;
                    return;
                }
                self.send_game(GameMsg::Create { origin, quiz_id }).await
            }
            ClientCommand::HostBackToStart => match pin {
                Some(pin) if origin.admin => {
                    self.send_game(GameMsg::Close {
                        origin,
                        pin,
                        reason: CloseReason::HostLeft,
                    })
                    .await
                }
                _ => {
                    self.move_session_to_screen(&session_id, Screen::HostSelectQuiz)
                        .await
                }
            },
            command => self.dispatch_game_command(origin, pin, command).await,
        }
    }

    /// Commands that act on the game the session is bound to.
    async fn dispatch_game_command(
        &mut self,
        origin: Origin,
        pin: Option<Pin>,
        command: ClientCommand,
    ) {
        let host_only = matches!(
            command,
            ClientCommand::StartGame
                | ClientCommand::ShowResults
                | ClientCommand::NextQuestion
                | ClientCommand::CancelGame
                | ClientCommand::DeleteGame
                | ClientCommand::QueryHostResults
        );
        if host_only && !origin.admin {
            self.move_session_to_screen(&origin.session_id, Screen::AuthenticateUser)
                .await;
            return;
        }

        let Some(pin) = pin else {
            let screen = if origin.admin {
                Screen::HostSelectQuiz
            } else {
                Screen::Entrance
            };
            debug!("Session {} sent '{}' outside a game", origin.session_id, command.verb());
            self.to_client(
                origin.client_id,
                ServerMessage::error("you are not part of a game", screen),
            )
            .await;
            return;
        };

        let message = match command {
            ClientCommand::Answer(answer) => GameMsg::RegisterAnswer {
                origin,
                pin,
                answer,
            },
            ClientCommand::StartGame => GameMsg::Start { origin, pin },
            ClientCommand::ShowResults => GameMsg::ShowResults { origin, pin },
            ClientCommand::NextQuestion => GameMsg::NextQuestion { origin, pin },
            ClientCommand::CancelGame => GameMsg::Close {
                origin,
                pin,
                reason: CloseReason::Cancelled,
            },
            ClientCommand::DeleteGame => GameMsg::Close {
                origin,
                pin,
                reason: CloseReason::Deleted,
            },
            ClientCommand::QueryDisplayChoices => GameMsg::QueryDisplayChoices { origin, pin },
            ClientCommand::QueryPlayerResults => GameMsg::QueryPlayerResults { origin, pin },
            ClientCommand::QueryHostResults => GameMsg::QueryHostResults { origin, pin },
            other => {
                debug!("'{}' is not a game command", other.verb());
                return;
            }
        };
        self.send_game(message).await;
    }

    async fn admin_login(&mut self, session_id: &str, encoded: &str) {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return;
        };

        if !session.admin {
            let valid = decode_credentials(encoded)
                .map(|(user, pass)| user == self.admin_user && pass == self.admin_password)
                .unwrap_or(false);
            if !valid {
                warn!("Failed admin login for session {}", session_id);
                if let Some(client_id) = session.client_id {
                    self.to_client(client_id, ServerMessage::InvalidCredentials)
                        .await;
                }
                return;
            }
            session.admin = true;
            info!("Session {} is now an admin", session_id);
        }

        self.move_session_to_screen(session_id, Screen::HostSelectQuiz)
            .await;
    }

    /// Switches a session to `screen`, redirecting when the session may not be
    /// there, and triggers the data push the screen needs.
    async fn move_session_to_screen(&mut self, session_id: &str, screen: Screen) {
        let Some(session) = self.sessions.get(session_id) else {
            debug!("Screen change for unknown session {}", session_id);
            return;
        };

        let mut screen = screen;
        if screen.requires_admin() && !session.admin {
            screen = Screen::AuthenticateUser;
        }
        if screen.requires_game() && session.game_pin.is_none() {
            screen = if session.admin {
                Screen::HostSelectQuiz
            } else {
                Screen::Entrance
            };
        }

        let client_id = session.client_id;
        if let Some(client_id) = client_id {
            let origin = Origin {
                session_id: session_id.to_string(),
                client_id,
                admin: session.admin,
            };
            let pin = session.game_pin;
            self.screen_side_effect(screen, origin, pin).await;
        }

        if let Some(session) = self.sessions.get_mut(session_id) {
            session.screen = screen;
            session.extend(self.timeout);
        }
        self.persist(session_id).await;

        if let Some(client_id) = client_id {
            self.to_client(client_id, ServerMessage::Screen(screen)).await;
        }
    }

    async fn screen_side_effect(&self, screen: Screen, origin: Origin, pin: Option<Pin>) {
        match (screen, pin) {
            (Screen::HostSelectQuiz, _) => {
                if let Err(e) = self
                    .quizzes
                    .send(QuizMsg::SendAllQuizzes {
                        client_id: origin.client_id,
                    })
                    .await
                {
                    warn!("Session actor could not reach quiz actor: {}", e);
                }
            }
            (Screen::HostGameLobby, Some(pin)) => {
                self.send_game(GameMsg::SendLobbyMetadata { origin, pin }).await
            }
            (Screen::HostShowQuestion, Some(pin)) => {
                self.send_game(GameMsg::SendCurrentQuestion { origin, pin })
                    .await
            }
            (Screen::HostShowGameResults, Some(pin)) => {
                self.send_game(GameMsg::SendWinners { origin, pin }).await
            }
            _ => {}
        }
    }

    async fn unbind_client(&mut self, client_id: ClientId) {
        let Some(session_id) = self.clients.remove(&client_id) else {
            return;
        };
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.unbind();
        }
        self.persist(&session_id).await;
        debug!("Client {} released session {}", client_id, session_id);
    }

    async fn handle_message(&mut self, message: SessionMsg) {
        match message {
            SessionMsg::ClientDisconnected { client_id } => {
                self.unbind_client(client_id).await;
                info!("Client {} disconnected", client_id);
            }
            SessionMsg::MoveToScreen { session_id, screen } => {
                self.move_session_to_screen(&session_id, screen).await
            }
            SessionMsg::BroadcastScreen {
                session_ids,
                screen,
            } => {
                for session_id in session_ids {
                    self.move_session_to_screen(&session_id, screen).await;
                }
            }
            SessionMsg::BindGamePin {
                session_id,
                pin,
                name,
            } => {
                if !self.ensure_loaded(&session_id).await {
                    return;
                }
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.game_pin = Some(pin);
                    session.name = name;
                }
                self.persist(&session_id).await;
            }
            SessionMsg::UnbindGamePin { session_id } => {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.clear_game();
                }
                self.persist(&session_id).await;
            }
            SessionMsg::Deliver {
                session_id,
                message,
            } => {
                if let Some(client_id) = self.sessions.get(&session_id).and_then(|s| s.client_id) {
                    self.to_client(client_id, message).await;
                }
            }
            SessionMsg::Error {
                session_ids,
                message,
                next_screen,
                clear_pin,
            } => {
                for session_id in session_ids {
                    let Some(session) = self.sessions.get_mut(&session_id) else {
                        if clear_pin {
                            self.release_stored(&session_id, None).await;
                        }
                        continue;
                    };
                    if clear_pin {
                        session.clear_game();
                    }
                    session.screen = next_screen;
                    let client_id = session.client_id;
                    self.persist(&session_id).await;
                    if let Some(client_id) = client_id {
                        self.to_client(client_id, ServerMessage::error(message.clone(), next_screen))
                            .await;
                    }
                }
            }
            SessionMsg::ReapExpired { reply } => {
                let _ = reply.send(self.reap_expired());
            }
            SessionMsg::ReleaseGame { released } => self.release_game(released).await,
            SessionMsg::List { reply } => {
                let mut sessions: Vec<Session> = self.sessions.values().cloned().collect();
                sessions.sort_by(|a, b| a.id.cmp(&b.id));
                let _ = reply.send(sessions);
            }
            SessionMsg::Get { session_id, reply } => {
                let found = self.ensure_loaded(&session_id).await;
                let result = match self.sessions.get(&session_id) {
                    Some(session) if found => Ok(session.clone()),
                    _ => Err(SessionError::NotFound(session_id)),
                };
                let _ = reply.send(result);
            }
            SessionMsg::Extend { session_id, reply } => {
                let result = if self.ensure_loaded(&session_id).await {
                    if let Some(session) = self.sessions.get_mut(&session_id) {
                        session.extend(self.timeout);
                    }
                    self.persist(&session_id).await;
                    self.sessions
                        .get(&session_id)
                        .cloned()
                        .ok_or(SessionError::NotFound(session_id))
                } else {
                    Err(SessionError::NotFound(session_id))
                };
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            SessionMsg::Delete { session_id, reply } => {
                let result = self.delete(session_id).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
        }
    }

    /// Drops every expired session from memory. The stored copy is left to
    /// its own expiry. Nothing is sent from here: the reaper task passes the
    /// result on to the transport and the game actor.
    fn reap_expired(&mut self) -> Reaped {
        let now = get_timestamp();
        let expired: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|session| session.is_expired(now))
            .map(|session| session.id.clone())
            .collect();

        let mut reaped = Reaped::default();
        for session_id in expired {
            let Some(session) = self.sessions.remove(&session_id) else {
                continue;
            };
            if let Some(client_id) = session.client_id {
                self.clients.remove(&client_id);
                reaped.client_ids.push(client_id);
            }
            if let Some(pin) = session.game_pin {
                reaped.departed.push((pin, session_id.clone()));
            }
            info!("Reaped expired session {}", session_id);
        }
        reaped
    }

    async fn release_game(&mut self, released: Vec<(Pin, SessionId)>) {
        for (pin, session_id) in released {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                self.release_stored(&session_id, Some(pin)).await;
                continue;
            };
            if session.game_pin != Some(pin) {
                continue;
            }
            session.leave_game();
            let screen = session.screen;
            debug!("Session {} released from game {}", session_id, pin);
            self.move_session_to_screen(&session_id, screen).await;
        }
    }

    /// Rewrites the stored copy of a session that is not in memory so it no
    /// longer points at a game. With `pin` set, only a copy bound to that
    /// game is touched.
    async fn release_stored(&self, session_id: &str, pin: Option<Pin>) {
        let key = session_key(session_id);
        let Some(mut stored) = self.persistence.load::<Session>(&key).await else {
            return;
        };
        let Some(stored_pin) = stored.game_pin else {
            return;
        };
        if pin.is_some_and(|pin| pin != stored_pin) {
            return;
        }
        stored.leave_game();
        self.persistence.save(&key, &stored, Some(self.timeout)).await;
        debug!("Released stored session {} from game {}", session_id, stored_pin);
    }

    async fn delete(&mut self, session_id: SessionId) -> Result<(), SessionError> {
        if !self.ensure_loaded(&session_id).await {
            return Err(SessionError::NotFound(session_id));
        }
        let Some(session) = self.sessions.remove(&session_id) else {
            return Err(SessionError::NotFound(session_id));
        };
        self.persistence.delete(&session_key(&session_id)).await;

        if let Some(client_id) = session.client_id {
            self.clients.remove(&client_id);
            if let Err(e) = self
                .delivery
                .send(ClientDelivery::Disconnect {
                    client_ids: vec![client_id],
                })
                .await
            {
                warn!("Failed to disconnect client {}: {}", client_id, e);
            }
        }
        if let Some(pin) = session.game_pin {
            self.send_game(GameMsg::SessionsGone {
                departed: vec![(pin, session_id.clone())],
            })
            .await;
        }
        info!("Deleted session {}", session_id);
        Ok(())
    }

    async fn send_game(&self, message: GameMsg) {
        if let Err(e) = self.games.send(message).await {
            warn!("Session actor could not reach game actor: {}", e);
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

/// Periodically asks the session actor to drop expired sessions, then tells
/// the transport to disconnect whoever was bound to them and the game actor
/// which of them were in a game.
pub async fn run_reaper(
    sessions: Topic<SessionMsg>,
    games: Topic<GameMsg>,
    delivery: Topic<ClientDelivery>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Skip the first tick since it fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let (reply, rx) = oneshot::channel();
        if sessions.send(SessionMsg::ReapExpired { reply }).await.is_err() {
            break;
        }
        let Reaped {
            client_ids,
            departed,
        } = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = rx => match result {
                Ok(reaped) => reaped,
                Err(_) => break,
            },
        };

        if !client_ids.is_empty() {
            debug!("Reaper disconnecting {} clients", client_ids.len());
            if delivery
                .send(ClientDelivery::Disconnect { client_ids })
                .await
                .is_err()
            {
                break;
            }
        }
        if !departed.is_empty() {
            debug!("Reaper releasing {} sessions from their games", departed.len());
            if games.send(GameMsg::SessionsGone { departed }).await.is_err() {
                break;
            }
        }
    }

    info!("Session reaper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use std::sync::Arc;
    use tokio::time::{sleep, timeout};

    struct Harness {
        commands: Topic<InboundCommand>,
        sessions: Topic<SessionMsg>,
        delivery: mpsc::Receiver<ClientDelivery>,
        games: mpsc::Receiver<GameMsg>,
        quizzes: mpsc::Receiver<QuizMsg>,
        shutdown: CancellationToken,
    }

    impl Harness {
        fn start(persistence: Persistence, config: ServerConfig) -> Self {
            let bus = TopicBus::new(64);
            let shutdown = CancellationToken::new();
            let actor = SessionActor::new(&bus, persistence, &config, shutdown.clone()).unwrap();
            tokio::spawn(actor.run());
            Self {
                commands: bus.topic(&INCOMING_COMMANDS).unwrap(),
                sessions: bus.topic(&SESSION_TOPIC).unwrap(),
                delivery: bus.subscribe(&CLIENT_DELIVERY).unwrap(),
                games: bus.subscribe(&GAME_TOPIC).unwrap(),
                quizzes: bus.subscribe(&QUIZ_TOPIC).unwrap(),
                shutdown,
            }
        }

        async fn send(&self, client_id: ClientId, line: &str) {
            let command = RawCommand::parse(line).unwrap();
            self.commands
                .send(InboundCommand { client_id, command })
                .await
                .unwrap();
        }

        async fn next_text(&mut self) -> (ClientId, ServerMessage) {
            match timeout(Duration::from_secs(1), self.delivery.recv())
                .await
                .unwrap()
                .unwrap()
            {
                ClientDelivery::Text { client_id, message } => (client_id, message),
                other => panic!("unexpected delivery: {:?}", other),
            }
        }

        async fn get(&self, session_id: &str) -> Result<Session, SessionError> {
            let (reply, rx) = oneshot::channel();
            self.sessions
                .send(SessionMsg::Get {
                    session_id: session_id.to_string(),
                    reply,
                })
                .await
                .unwrap();
            rx.await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_unidentified_client_must_register() {
        let mut harness = Harness::start(Persistence::disabled(), ServerConfig::default());
        harness.send(1, "answer 2").await;
        assert_eq!(harness.next_text().await, (1, ServerMessage::RegisterSession));
        harness.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_identify_and_reject_duplicate() {
        let mut harness = Harness::start(Persistence::disabled(), ServerConfig::default());

        harness.send(1, "session X").await;
        assert_eq!(
            harness.next_text().await,
            (1, ServerMessage::Screen(Screen::Entrance))
        );

        harness.send(2, "session X").await;
        match harness.next_text().await {
            (2, ServerMessage::Error(payload)) => {
                assert_eq!(payload.next_screen, Screen::Entrance);
                assert!(payload.message.contains("already connected"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
        assert_eq!(harness.get("X").await.unwrap().client_id, Some(1));

        harness
            .sessions
            .send(SessionMsg::ClientDisconnected { client_id: 1 })
            .await
            .unwrap();
        harness.send(2, "session X").await;
        assert_eq!(
            harness.next_text().await,
            (2, ServerMessage::Screen(Screen::Entrance))
        );
        assert_eq!(harness.get("X").await.unwrap().client_id, Some(2));

        harness.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_admin_login() {
        let config = ServerConfig {
            admin_user: "root".into(),
            admin_password: "pw".into(),
            ..ServerConfig::default()
        };
        let mut harness = Harness::start(Persistence::disabled(), config);
        harness.send(1, "session host").await;
        harness.next_text().await;

        harness.send(1, "host-game").await;
        assert_eq!(
            harness.next_text().await,
            (1, ServerMessage::Screen(Screen::AuthenticateUser))
        );

        let wrong = STANDARD.encode("root:nope");
        harness.send(1, &format!("admin-login {wrong}")).await;
        assert_eq!(harness.next_text().await, (1, ServerMessage::InvalidCredentials));

        let right = STANDARD.encode("root:pw");
        harness.send(1, &format!("admin-login {right}")).await;
        assert!(matches!(
            harness.quizzes.recv().await,
            Some(QuizMsg::SendAllQuizzes { client_id: 1 })
        ));
        assert_eq!(
            harness.next_text().await,
            (1, ServerMessage::Screen(Screen::HostSelectQuiz))
        );
        assert!(harness.get("host").await.unwrap().admin);

        harness.send(1, "host-game-lobby 3").await;
        match harness.games.recv().await {
            Some(GameMsg::Create { origin, quiz_id }) => {
                assert_eq!(quiz_id, 3);
                assert!(origin.admin);
                assert_eq!(origin.session_id, "host");
            }
            other => panic!("unexpected message: {:?}", other),
        }

        harness.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_game_screens_need_a_pin() {
        let mut harness = Harness::start(Persistence::disabled(), ServerConfig::default());
        harness.send(1, "session p").await;
        harness.next_text().await;

        harness
            .sessions
            .send(SessionMsg::MoveToScreen {
                session_id: "p".into(),
                screen: Screen::AnswerQuestion,
            })
            .await
            .unwrap();
        assert_eq!(
            harness.next_text().await,
            (1, ServerMessage::Screen(Screen::Entrance))
        );

        harness.send(1, "answer 1").await;
        assert!(matches!(
            harness.next_text().await,
            (1, ServerMessage::Error(_))
        ));

        harness
            .sessions
            .send(SessionMsg::BindGamePin {
                session_id: "p".into(),
                pin: 12,
                name: Some("Ann".into()),
            })
            .await
            .unwrap();
        harness.send(1, "answer 1").await;
        assert!(matches!(
            harness.games.recv().await,
            Some(GameMsg::RegisterAnswer {
                pin: 12,
                answer: 1,
                ..
            })
        ));

        harness.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_reaper_expires_and_store_rehydrates() {
        let store = Arc::new(MemoryStore::new());
        let config = ServerConfig {
            session_timeout: Duration::from_millis(20),
            ..ServerConfig::default()
        };
        let mut harness = Harness::start(Persistence::new(store.clone()), config);

        harness.send(7, "session old").await;
        harness.next_text().await;
        sleep(Duration::from_millis(50)).await;

        let (reply, rx) = oneshot::channel();
        harness
            .sessions
            .send(SessionMsg::ReapExpired { reply })
            .await
            .unwrap();
        assert_eq!(
            rx.await.unwrap(),
            Reaped {
                client_ids: vec![7],
                departed: vec![],
            }
        );

        let (reply, rx) = oneshot::channel();
        harness.sessions.send(SessionMsg::List { reply }).await.unwrap();
        assert!(rx.await.unwrap().is_empty());

        let rehydrated = harness.get("old").await.unwrap();
        assert_eq!(rehydrated.client_id, None);
        assert_eq!(store.ttl("session:old").await, Some(Duration::from_millis(20)));

        harness.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_delete_disconnects_client() {
        let store = Arc::new(MemoryStore::new());
        let mut harness =
            Harness::start(Persistence::new(store.clone()), ServerConfig::default());
        harness.send(3, "session gone").await;
        harness.next_text().await;

        let (reply, rx) = oneshot::channel();
        harness
            .sessions
            .send(SessionMsg::Delete {
                session_id: "gone".into(),
                reply: Some(reply),
            })
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap(), Ok(()));
        assert!(matches!(
            harness.delivery.recv().await,
            Some(ClientDelivery::Disconnect { client_ids }) if client_ids == vec![3]
        ));
        assert_eq!(
            harness.get("gone").await,
            Err(SessionError::NotFound("gone".into()))
        );
        assert!(store.is_empty().await);

        harness.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_reaper_task_disconnects_and_releases() {
        let bus = TopicBus::new(8);
        let shutdown = CancellationToken::new();
        let mut inbox = bus.subscribe(&SESSION_TOPIC).unwrap();
        let mut games = bus.subscribe(&GAME_TOPIC).unwrap();
        let mut delivery = bus.subscribe(&CLIENT_DELIVERY).unwrap();
        tokio::spawn(run_reaper(
            bus.topic(&SESSION_TOPIC).unwrap(),
            bus.topic(&GAME_TOPIC).unwrap(),
            bus.topic(&CLIENT_DELIVERY).unwrap(),
            Duration::from_millis(10),
            shutdown.clone(),
        ));

        match timeout(Duration::from_secs(1), inbox.recv()).await.unwrap() {
            Some(SessionMsg::ReapExpired { reply }) => reply
                .send(Reaped {
                    client_ids: vec![4, 5],
                    departed: vec![(31, "p".to_string()), (31, "q".to_string())],
                })
                .unwrap(),
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(matches!(
            delivery.recv().await,
            Some(ClientDelivery::Disconnect { client_ids }) if client_ids == vec![4, 5]
        ));
        match timeout(Duration::from_secs(1), games.recv()).await.unwrap() {
            Some(GameMsg::SessionsGone { departed }) => assert_eq!(departed.len(), 2),
            other => panic!("unexpected message: {:?}", other),
        }
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_reaping_a_game_session_reports_it_without_messaging_games() {
        let config = ServerConfig {
            session_timeout: Duration::from_millis(20),
            ..ServerConfig::default()
        };
        let mut harness = Harness::start(Persistence::disabled(), config);
        harness.send(2, "session p").await;
        harness.next_text().await;
        harness
            .sessions
            .send(SessionMsg::BindGamePin {
                session_id: "p".into(),
                pin: 12,
                name: Some("Ann".into()),
            })
            .await
            .unwrap();
        sleep(Duration::from_millis(50)).await;

        let (reply, rx) = oneshot::channel();
        harness
            .sessions
            .send(SessionMsg::ReapExpired { reply })
            .await
            .unwrap();
        assert_eq!(
            rx.await.unwrap(),
            Reaped {
                client_ids: vec![2],
                departed: vec![(12, "p".to_string())],
            }
        );
        assert!(harness.games.try_recv().is_err());

        harness.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_release_game_clears_only_matching_pins() {
        let store = Arc::new(MemoryStore::new());
        let persistence = Persistence::new(store);
        let mut harness = Harness::start(persistence.clone(), ServerConfig::default());

        harness.send(1, "session live").await;
        harness.next_text().await;
        harness
            .sessions
            .send(SessionMsg::BindGamePin {
                session_id: "live".into(),
                pin: 12,
                name: Some("Ann".into()),
            })
            .await
            .unwrap();
        harness
            .sessions
            .send(SessionMsg::MoveToScreen {
                session_id: "live".into(),
                screen: Screen::WaitForGameStart,
            })
            .await
            .unwrap();
        assert_eq!(
            harness.next_text().await,
            (1, ServerMessage::Screen(Screen::WaitForGameStart))
        );

        let ttl = Duration::from_secs(60);
        for (id, pin) in [("stored", 12), ("elsewhere", 13)] {
            let mut session = Session::new(id, ttl);
            session.game_pin = Some(pin);
            session.screen = Screen::WaitForGameStart;
            persistence
                .save(&session_key(id), &session, Some(ttl))
                .await;
        }

        harness
            .sessions
            .send(SessionMsg::ReleaseGame {
                released: vec![
                    (12, "live".to_string()),
                    (12, "stored".to_string()),
                    (12, "elsewhere".to_string()),
                ],
            })
            .await
            .unwrap();
        assert_eq!(
            harness.next_text().await,
            (1, ServerMessage::Screen(Screen::Entrance))
        );
        assert_eq!(harness.get("live").await.unwrap().game_pin, None);

        let stored: Session = persistence.load(&session_key("stored")).await.unwrap();
        assert_eq!(stored.game_pin, None);
        assert_eq!(stored.screen, Screen::Entrance);
        let elsewhere: Session = persistence.load(&session_key("elsewhere")).await.unwrap();
        assert_eq!(elsewhere.game_pin, Some(13));

        harness.shutdown.cancel();
    }
}
