//! Integration tests for the quiz server
//!
//! These tests drive the assembled actors through the topic bus the same way
//! the transport does, plus one pass over a real TCP socket.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use server::app::QuizServer;
use server::bus::Topic;
use server::config::ServerConfig;
use server::error::ErrorKind;
use server::game::GameState;
use server::messages::{
    ClientDelivery, InboundCommand, SessionMsg, CLIENT_DELIVERY, INCOMING_COMMANDS, SESSION_TOPIC,
};
use server::persistence::{MemoryStore, Persistence};
use shared::{ClientId, Pin, Question, Quiz, QuizId, RawCommand, Screen, ServerMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

/// Stand-in for the TCP transport: feeds lines in and collects deliveries
struct Harness {
    server: QuizServer,
    store: Arc<MemoryStore>,
    commands: Topic<InboundCommand>,
    delivery: mpsc::Receiver<ClientDelivery>,
    backlog: Vec<(ClientId, ServerMessage)>,
    disconnected: Vec<ClientId>,
}

impl Harness {
    fn start(config: ServerConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    fn with_store(config: ServerConfig, store: Arc<MemoryStore>) -> Self {
        let server = QuizServer::start(&config, Persistence::new(store.clone())).unwrap();
        let bus = server.bus();
        Self {
            commands: bus.topic(&INCOMING_COMMANDS).unwrap(),
            delivery: bus.subscribe(&CLIENT_DELIVERY).unwrap(),
            server,
            store,
            backlog: Vec::new(),
            disconnected: Vec::new(),
        }
    }

    async fn send(&self, client_id: ClientId, line: &str) {
        let command = RawCommand::parse(line).unwrap();
        self.commands
            .send(InboundCommand { client_id, command })
            .await
            .unwrap();
    }

    /// Waits for the first message to `client_id` matching `pred`. Anything
    /// else that arrives meanwhile is kept for later expectations.
    async fn expect<F>(&mut self, client_id: ClientId, pred: F) -> ServerMessage
    where
        F: Fn(&ServerMessage) -> bool,
    {
        if let Some(pos) = self
            .backlog
            .iter()
            .position(|(id, message)| *id == client_id && pred(message))
        {
            return self.backlog.remove(pos).1;
        }

        loop {
            let delivery = timeout(WAIT, self.delivery.recv())
                .await
                .expect("timed out waiting for a delivery")
                .expect("delivery topic closed");
            match delivery {
                ClientDelivery::Text {
                    client_id: id,
                    message,
                } => {
                    if id == client_id && pred(&message) {
                        return message;
                    }
                    self.backlog.push((id, message));
                }
                ClientDelivery::Disconnect { client_ids } => self.disconnected.extend(client_ids),
            }
        }
    }

    async fn expect_screen(&mut self, client_id: ClientId, screen: Screen) {
        self.expect(client_id, |message| *message == ServerMessage::Screen(screen))
            .await;
    }

    async fn expect_error(&mut self, client_id: ClientId) -> String {
        match self
            .expect(client_id, |message| matches!(message, ServerMessage::Error(_)))
            .await
        {
            ServerMessage::Error(payload) => payload.message,
            other => panic!("expected an error, got {:?}", other),
        }
    }

    async fn expect_disconnect(&mut self, client_id: ClientId) {
        while !self.disconnected.contains(&client_id) {
            match timeout(WAIT, self.delivery.recv())
                .await
                .expect("timed out waiting for a disconnect")
                .expect("delivery topic closed")
            {
                ClientDelivery::Text { client_id, message } => {
                    self.backlog.push((client_id, message))
                }
                ClientDelivery::Disconnect { client_ids } => self.disconnected.extend(client_ids),
            }
        }
    }

    async fn add_quiz(&self, questions: usize) -> QuizId {
        let questions = (0..questions)
            .map(|i| Question::new(format!("Question {}", i), &["Red", "Green", "Blue"], 1))
            .collect();
        let quiz = Quiz::new("Colours", 30, questions);
        self.server.quizzes().add(quiz).await.unwrap().id
    }

    /// Logs `client_id` in as an admin and opens a lobby for `quiz_id`.
    async fn open_lobby(&mut self, client_id: ClientId, quiz_id: QuizId) -> Pin {
        self.send(client_id, "session host").await;
        self.expect_screen(client_id, Screen::Entrance).await;

        let credentials = STANDARD.encode("admin:admin");
        self.send(client_id, &format!("admin-login {}", credentials))
            .await;
        self.expect_screen(client_id, Screen::HostSelectQuiz).await;
        self.expect(client_id, |m| matches!(m, ServerMessage::AllQuizzes(_)))
            .await;

        self.send(client_id, &format!("host-game-lobby {}", quiz_id))
            .await;
        self.expect_screen(client_id, Screen::HostGameLobby).await;
        match self
            .expect(client_id, |m| matches!(m, ServerMessage::LobbyGameMetadata(_)))
            .await
        {
            ServerMessage::LobbyGameMetadata(metadata) => {
                assert_eq!(metadata.name, "Colours");
                assert!(metadata.players.is_empty());
                metadata.pin
            }
            other => panic!("expected lobby metadata, got {:?}", other),
        }
    }

    async fn join(&mut self, client_id: ClientId, session: &str, pin: Pin, name: &str) {
        self.send(client_id, &format!("session {}", session)).await;
        self.expect_screen(client_id, Screen::Entrance).await;
        self.send(
            client_id,
            &format!(r#"join-game {{"pin":{},"name":"{}"}}"#, pin, name),
        )
        .await;
        self.expect_screen(client_id, Screen::WaitForGameStart).await;
    }
}

fn config() -> ServerConfig {
    ServerConfig {
        address: "127.0.0.1:0".to_string(),
        ..ServerConfig::default()
    }
}

/// SESSION LIFECYCLE TESTS
mod session_tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_session_is_rejected_until_released() {
        let mut harness = Harness::start(config());

        harness.send(1, "session shared").await;
        harness.expect_screen(1, Screen::Entrance).await;

        harness.send(2, "session shared").await;
        let message = harness.expect_error(2).await;
        assert!(message.contains("already connected"));

        // The transport reports the first connection closing
        let sessions = harness.server.bus().topic(&SESSION_TOPIC).unwrap();
        sessions
            .send(SessionMsg::ClientDisconnected { client_id: 1 })
            .await
            .unwrap();

        harness.send(2, "session shared").await;
        harness.expect_screen(2, Screen::Entrance).await;
        let session = harness.server.sessions().get("shared").await.unwrap();
        assert_eq!(session.client_id, Some(2));
    }

    #[tokio::test]
    async fn expired_session_is_reaped_then_rehydrated() {
        let mut harness = Harness::start(ServerConfig {
            session_timeout: Duration::from_millis(50),
            reaper_interval: Duration::from_millis(20),
            ..config()
        });

        harness.send(7, "session sleepy").await;
        harness.expect_screen(7, Screen::Entrance).await;
        harness.expect_disconnect(7).await;

        assert!(harness.server.sessions().list().await.unwrap().is_empty());

        let session = harness.server.sessions().get("sleepy").await.unwrap();
        assert_eq!(session.client_id, None);
        assert_eq!(session.screen, Screen::Entrance);
    }

    fn quick_reaping() -> ServerConfig {
        ServerConfig {
            session_timeout: Duration::from_millis(300),
            reaper_interval: Duration::from_millis(50),
            ..config()
        }
    }

    /// Polls until the game satisfies `done`, or is gone when `done` gets `None`.
    async fn wait_for_game<F>(harness: &Harness, pin: Pin, done: F)
    where
        F: Fn(Option<&server::game::Game>) -> bool,
    {
        timeout(WAIT, async {
            loop {
                let game = harness.server.games().get(pin).await.ok();
                if done(game.as_ref()) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("game never reached the expected state");
    }

    #[tokio::test]
    async fn reaped_lobby_player_leaves_the_game() {
        let mut harness = Harness::start(quick_reaping());
        let quiz_id = harness.add_quiz(1).await;
        let pin = harness.open_lobby(1, quiz_id).await;
        harness.join(2, "drifter", pin, "Drifter").await;

        harness.expect_disconnect(2).await;
        harness.expect_disconnect(1).await;
        wait_for_game(&harness, pin, |game| {
            game.is_some_and(|game| game.players.is_empty())
        })
        .await;

        let stored = harness.server.sessions().get("drifter").await.unwrap();
        assert_eq!(stored.game_pin, None);
        assert_eq!(stored.screen, Screen::Entrance);

        // Coming back lands on the entrance, free to join again
        harness.send(3, "session drifter").await;
        harness.expect_screen(3, Screen::Entrance).await;
        harness
            .send(3, &format!(r#"join-game {{"pin":{},"name":"Drifter"}}"#, pin))
            .await;
        harness.expect_screen(3, Screen::WaitForGameStart).await;
    }

    #[tokio::test]
    async fn reaped_host_takes_a_finished_game_along() {
        let mut harness = Harness::start(quick_reaping());
        let quiz_id = harness.add_quiz(0).await;
        let pin = harness.open_lobby(1, quiz_id).await;

        harness.send(1, "start-game").await;
        harness.expect_screen(1, Screen::HostShowGameResults).await;

        harness.expect_disconnect(1).await;
        wait_for_game(&harness, pin, |game| game.is_none()).await;

        let host = harness.server.sessions().get("host").await.unwrap();
        assert!(host.admin);
        assert_eq!(host.game_pin, None);
        assert_eq!(host.screen, Screen::HostSelectQuiz);

        harness.send(4, "session host").await;
        harness.expect_screen(4, Screen::HostSelectQuiz).await;
    }

    #[tokio::test]
    async fn reaping_a_crowded_lobby_keeps_the_server_responsive() {
        let config = ServerConfig {
            topic_capacity: 4,
            session_timeout: Duration::from_millis(500),
            reaper_interval: Duration::from_millis(100),
            ..config()
        };
        let crowd = config.topic_capacity * 6;
        let mut harness = Harness::start(config);
        let quiz_id = harness.add_quiz(1).await;
        let pin = harness.open_lobby(1, quiz_id).await;

        let clients: Vec<ClientId> = (10..10 + crowd as ClientId).collect();
        for &client_id in &clients {
            let session = format!("crowd-{}", client_id);
            let name = format!("Player {}", client_id);
            harness.join(client_id, &session, pin, &name).await;
        }

        harness.expect_disconnect(1).await;
        for &client_id in &clients {
            harness.expect_disconnect(client_id).await;
        }
        wait_for_game(&harness, pin, |game| {
            game.is_some_and(|game| game.players.is_empty())
        })
        .await;

        let sessions = timeout(WAIT, harness.server.sessions().list())
            .await
            .expect("session actor stopped answering after the reap")
            .unwrap();
        assert!(sessions.is_empty());

        let straggler = harness.server.sessions().get("crowd-10").await.unwrap();
        assert_eq!(straggler.game_pin, None);
    }

    #[tokio::test]
    async fn commands_before_identifying_are_refused() {
        let mut harness = Harness::start(config());

        harness.send(3, "answer 1").await;
        harness
            .expect(3, |m| *m == ServerMessage::RegisterSession)
            .await;
    }

    #[tokio::test]
    async fn deleted_session_is_disconnected() {
        let mut harness = Harness::start(config());

        harness.send(4, "session doomed").await;
        harness.expect_screen(4, Screen::Entrance).await;

        harness.server.sessions().delete("doomed").await.unwrap();
        harness.expect_disconnect(4).await;

        let err = harness.server.sessions().get("doomed").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(harness.store.is_empty().await);
    }
}

/// GAME FLOW TESTS
mod game_flow_tests {
    use super::*;

    #[tokio::test]
    async fn full_game_from_lobby_to_winners() {
        let mut harness = Harness::start(config());
        let quiz_id = harness.add_quiz(1).await;
        let pin = harness.open_lobby(1, quiz_id).await;

        harness.join(2, "ann", pin, "Ann").await;
        harness
            .expect(1, |m| {
                *m == ServerMessage::ParticipantsList(vec!["Ann".to_string()])
            })
            .await;

        harness.send(1, "start-game").await;
        harness.expect_screen(1, Screen::HostShowQuestion).await;
        harness.expect_screen(2, Screen::AnswerQuestion).await;
        match harness
            .expect(1, |m| matches!(m, ServerMessage::HostShowQuestion(_)))
            .await
        {
            ServerMessage::HostShowQuestion(view) => {
                assert_eq!(view.question, "Question 0");
                assert_eq!(view.total_players, 1);
                assert_eq!(view.total_questions, 1);
            }
            other => panic!("expected a question, got {:?}", other),
        }

        harness.send(2, "query-display-choices").await;
        harness
            .expect(2, |m| *m == ServerMessage::DisplayChoices(3))
            .await;

        // The only player answering closes the question
        harness.send(2, "answer 1").await;
        harness
            .expect(1, |m| matches!(m, ServerMessage::PlayersAnswered(_)))
            .await;
        harness.expect_screen(1, Screen::HostShowResults).await;
        harness.expect_screen(2, Screen::DisplayPlayerResults).await;

        harness.send(2, "query-player-results").await;
        let score = match harness
            .expect(2, |m| matches!(m, ServerMessage::PlayerResults(_)))
            .await
        {
            ServerMessage::PlayerResults(results) => {
                assert_eq!(results.name, "Ann");
                assert!(results.correct);
                assert!(results.score > 100 && results.score <= 200);
                results.score
            }
            other => panic!("expected player results, got {:?}", other),
        };

        harness.send(1, "query-host-results").await;
        match harness
            .expect(1, |m| matches!(m, ServerMessage::QuestionResults(_)))
            .await
        {
            ServerMessage::QuestionResults(results) => {
                assert_eq!(results.votes, vec![0, 1, 0]);
                assert_eq!(results.correct, 1);
                assert_eq!(results.top_scorers.len(), 1);
            }
            other => panic!("expected question results, got {:?}", other),
        }

        harness.send(1, "next-question").await;
        harness.expect_screen(1, Screen::HostShowGameResults).await;
        match harness
            .expect(1, |m| matches!(m, ServerMessage::ShowWinners(_)))
            .await
        {
            ServerMessage::ShowWinners(winners) => {
                assert_eq!(winners.len(), 1);
                assert_eq!(winners[0].name, "Ann");
                assert_eq!(winners[0].score, score);
            }
            other => panic!("expected winners, got {:?}", other),
        }

        let game = harness.server.games().get(pin).await.unwrap();
        assert_eq!(game.state, GameState::GameEnded);
    }

    #[tokio::test]
    async fn players_cannot_drive_the_game() {
        let mut harness = Harness::start(config());
        let quiz_id = harness.add_quiz(2).await;
        let pin = harness.open_lobby(1, quiz_id).await;
        harness.join(2, "bob", pin, "Bob").await;

        harness.send(2, "start-game").await;
        harness.expect_screen(2, Screen::AuthenticateUser).await;

        let game = harness.server.games().get(pin).await.unwrap();
        assert_eq!(game.state, GameState::NotStarted);
    }

    #[tokio::test]
    async fn duplicate_player_name_is_rejected() {
        let mut harness = Harness::start(config());
        let quiz_id = harness.add_quiz(1).await;
        let pin = harness.open_lobby(1, quiz_id).await;
        harness.join(2, "first", pin, "Sam").await;

        harness.send(3, "session second").await;
        harness.expect_screen(3, Screen::Entrance).await;
        harness
            .send(3, &format!(r#"join-game {{"pin":{},"name":"sam"}}"#, pin))
            .await;
        let message = harness.expect_error(3).await;
        assert!(message.contains("already taken"));
    }

    #[tokio::test]
    async fn deleting_a_game_sends_everyone_away() {
        let mut harness = Harness::start(config());
        let quiz_id = harness.add_quiz(1).await;
        let pin = harness.open_lobby(1, quiz_id).await;
        harness.join(2, "cat", pin, "Cat").await;

        harness.server.games().delete(pin).await.unwrap();
        harness.expect_error(2).await;
        harness.expect_screen(1, Screen::HostSelectQuiz).await;

        let err = harness.server.games().get(pin).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = harness.server.games().delete(pin).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let player = harness.server.sessions().get("cat").await.unwrap();
        assert_eq!(player.game_pin, None);
        assert_eq!(player.screen, Screen::Entrance);
    }

    #[tokio::test]
    async fn unknown_quiz_discards_the_game() {
        let mut harness = Harness::start(config());
        harness.send(1, "session host").await;
        harness.expect_screen(1, Screen::Entrance).await;
        harness
            .send(1, &format!("admin-login {}", STANDARD.encode("admin:admin")))
            .await;
        harness.expect_screen(1, Screen::HostSelectQuiz).await;

        harness.send(1, "host-game-lobby 999").await;
        harness.expect_error(1).await;

        assert!(harness.server.games().list().await.unwrap().is_empty());
        let host = harness.server.sessions().get("host").await.unwrap();
        assert_eq!(host.game_pin, None);
    }
}

/// ADMINISTRATIVE CLIENT TESTS
mod catalog_tests {
    use super::*;

    #[tokio::test]
    async fn quiz_crud_through_client() {
        let harness = Harness::start(config());
        let quizzes = harness.server.quizzes();

        let id = harness.add_quiz(2).await;
        let mut quiz = quizzes.get(id).await.unwrap();
        assert_eq!(quiz.questions.len(), 2);

        quiz.name = "Colours, revised".to_string();
        let updated = quizzes.update(quiz).await.unwrap();
        assert_eq!(quizzes.get(id).await.unwrap(), updated);

        let mut invalid = updated.clone();
        invalid.questions[0].correct = 9;
        let err = quizzes.update(invalid).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        quizzes.delete(id).await.unwrap();
        assert!(quizzes.list().await.unwrap().is_empty());
        assert_eq!(
            quizzes.get(id).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn quizzes_survive_a_restart() {
        let store = Arc::new(MemoryStore::new());

        let first = Harness::with_store(config(), store.clone());
        let id = first.add_quiz(1).await;
        first.server.shutdown().await;

        let second = Harness::with_store(config(), store);
        let quizzes = second.server.quizzes().list().await.unwrap();
        assert_eq!(quizzes.len(), 1);
        assert_eq!(quizzes[0].id, id);

        let next = second.add_quiz(1).await;
        assert!(next > id);
    }
}

/// NETWORK TESTS
mod network_tests {
    use super::*;
    use server::network::NetworkServer;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn line_protocol_over_tcp() {
        let config = config();
        let server = QuizServer::start(&config, Persistence::disabled()).unwrap();
        let bus = server.bus();
        let network = NetworkServer::bind(&config, &bus, server.shutdown_token())
            .await
            .unwrap();
        let addr = network.local_addr().unwrap();
        let network_handle = tokio::spawn(async move {
            let _ = network.run().await;
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer.write_all(b"hello\n").await.unwrap();
        let line = timeout(WAIT, lines.next_line()).await.unwrap().unwrap();
        assert_eq!(line.as_deref(), Some("register-session"));

        writer.write_all(b"session over-tcp\n").await.unwrap();
        let line = timeout(WAIT, lines.next_line()).await.unwrap().unwrap();
        assert_eq!(line.as_deref(), Some("screen entrance"));

        writer.write_all(b"answer nope\n").await.unwrap();
        let line = timeout(WAIT, lines.next_line()).await.unwrap().unwrap();
        assert!(line.unwrap().starts_with("error "));

        server.shutdown().await;
        assert!(timeout(WAIT, network_handle).await.is_ok());
    }
}
