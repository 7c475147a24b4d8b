//! Topics of the bus and the messages each one carries.
//!
//! Every actor consumes exactly one inbound enum. Request/reply exchanges
//! carry a [`Reply`] which the target writes once.

use shared::{ClientId, Pin, Quiz, QuizId, RawCommand, Screen, ServerMessage, SessionId};
use tokio::sync::oneshot;

use crate::bus::TopicName;
use crate::error::{GameError, QuizError, SessionError};
use crate::game::Game;
use crate::session::Session;

pub type Reply<T> = oneshot::Sender<T>;

pub const INCOMING_COMMANDS: TopicName<InboundCommand> = TopicName::new("incoming-commands");
pub const CLIENT_DELIVERY: TopicName<ClientDelivery> = TopicName::new("client-delivery");
pub const SESSION_TOPIC: TopicName<SessionMsg> = TopicName::new("session");
pub const GAME_TOPIC: TopicName<GameMsg> = TopicName::new("game");
pub const QUIZ_TOPIC: TopicName<QuizMsg> = TopicName::new("quiz");

/// A parsed line from one connected client
#[derive(Debug, Clone)]
pub struct InboundCommand {
    pub client_id: ClientId,
    pub command: RawCommand,
}

/// Instructions for the transport
#[derive(Debug, Clone)]
pub enum ClientDelivery {
    Text {
        client_id: ClientId,
        message: ServerMessage,
    },
    Disconnect {
        client_ids: Vec<ClientId>,
    },
}

/// Outcome of one reaper pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reaped {
    /// Connections that were bound to an expired session
    pub client_ids: Vec<ClientId>,
    /// Expired sessions that were part of a game
    pub departed: Vec<(Pin, SessionId)>,
}

/// The session and connection a game or quiz request came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub session_id: SessionId,
    pub client_id: ClientId,
    pub admin: bool,
}

#[derive(Debug)]
pub enum SessionMsg {
    ClientDisconnected {
        client_id: ClientId,
    },
    MoveToScreen {
        session_id: SessionId,
        screen: Screen,
    },
    BroadcastScreen {
        session_ids: Vec<SessionId>,
        screen: Screen,
    },
    BindGamePin {
        session_id: SessionId,
        pin: Pin,
        name: Option<String>,
    },
    UnbindGamePin {
        session_id: SessionId,
    },
    /// Pushes a message to whichever client is bound to the session
    Deliver {
        session_id: SessionId,
        message: ServerMessage,
    },
    /// Pushes an error and parks each session on `next_screen`
    Error {
        session_ids: Vec<SessionId>,
        message: String,
        next_screen: Screen,
        clear_pin: bool,
    },
    /// Drops expired sessions, replying with what the caller has to clean up
    ReapExpired {
        reply: Reply<Reaped>,
    },
    /// A game no longer knows these sessions. Each pin is cleared only while
    /// the session still points at that game, in memory or in the store.
    ReleaseGame {
        released: Vec<(Pin, SessionId)>,
    },
    List {
        reply: Reply<Vec<Session>>,
    },
    Get {
        session_id: SessionId,
        reply: Reply<Result<Session, SessionError>>,
    },
    Extend {
        session_id: SessionId,
        reply: Option<Reply<Result<Session, SessionError>>>,
    },
    Delete {
        session_id: SessionId,
        reply: Option<Reply<Result<(), SessionError>>>,
    },
}

/// Why a game is being torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Cancelled,
    Deleted,
    HostLeft,
}

impl CloseReason {
    pub fn message(&self) -> &'static str {
        match self {
            CloseReason::Cancelled => "the game was cancelled by the host",
            CloseReason::Deleted => "the game has been deleted",
            CloseReason::HostLeft => "the host has left the game",
        }
    }
}

#[derive(Debug)]
pub enum GameMsg {
    Create {
        origin: Origin,
        quiz_id: QuizId,
    },
    SetQuiz {
        pin: Pin,
        quiz: Quiz,
    },
    /// Removes a game that never got its quiz, without telling anyone
    Discard {
        pin: Pin,
    },
    Join {
        origin: Origin,
        pin: Pin,
        name: String,
    },
    RegisterAnswer {
        origin: Origin,
        pin: Pin,
        answer: usize,
    },
    Start {
        origin: Origin,
        pin: Pin,
    },
    ShowResults {
        origin: Origin,
        pin: Pin,
    },
    NextQuestion {
        origin: Origin,
        pin: Pin,
    },
    Close {
        origin: Origin,
        pin: Pin,
        reason: CloseReason,
    },
    QueryDisplayChoices {
        origin: Origin,
        pin: Pin,
    },
    QueryPlayerResults {
        origin: Origin,
        pin: Pin,
    },
    QueryHostResults {
        origin: Origin,
        pin: Pin,
    },
    SendLobbyMetadata {
        origin: Origin,
        pin: Pin,
    },
    SendCurrentQuestion {
        origin: Origin,
        pin: Pin,
    },
    SendWinners {
        origin: Origin,
        pin: Pin,
    },
    /// Sessions that were deleted or reaped while part of a game
    SessionsGone {
        departed: Vec<(Pin, SessionId)>,
    },
    List {
        reply: Reply<Vec<Game>>,
    },
    Get {
        pin: Pin,
        reply: Reply<Result<Game, GameError>>,
    },
    Update {
        game: Game,
        reply: Reply<Result<(), GameError>>,
    },
    Delete {
        pin: Pin,
        reply: Reply<Result<(), GameError>>,
    },
}

#[derive(Debug)]
pub enum QuizMsg {
    SendAllQuizzes {
        client_id: ClientId,
    },
    LookupForGame {
        quiz_id: QuizId,
        pin: Pin,
        origin: Origin,
    },
    List {
        reply: Reply<Vec<Quiz>>,
    },
    Get {
        id: QuizId,
        reply: Reply<Result<Quiz, QuizError>>,
    },
    Add {
        quiz: Quiz,
        reply: Reply<Result<Quiz, QuizError>>,
    },
    Update {
        quiz: Quiz,
        reply: Reply<Result<Quiz, QuizError>>,
    },
    Delete {
        id: QuizId,
        reply: Reply<Result<(), QuizError>>,
    },
}
