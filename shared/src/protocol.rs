//! Line protocol spoken between quiz clients and the server.
//!
//! Inbound lines have the shape `<verb>[ <argument>]` where the argument is
//! free-form text, often JSON. Outbound lines use the same shape, see
//! [`ServerMessage::to_line`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::quiz::QuizId;
use crate::Pin;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown command \"{0}\"")]
    UnknownVerb(String),
    #[error("command \"{0}\" requires an argument")]
    MissingArgument(&'static str),
    #[error("invalid argument for \"{verb}\": {reason}")]
    InvalidArgument { verb: &'static str, reason: String },
    #[error("unknown screen \"{0}\"")]
    UnknownScreen(String),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Named UI state a client is expected to render
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Screen {
    Entrance,
    WaitForGameStart,
    AnswerQuestion,
    WaitForQuestionEnd,
    DisplayPlayerResults,
    AuthenticateUser,
    HostSelectQuiz,
    HostGameLobby,
    HostShowQuestion,
    HostShowResults,
    HostShowGameResults,
}

impl Screen {
    pub fn as_str(&self) -> &'static str {
        match self {
            Screen::Entrance => "entrance",
            Screen::WaitForGameStart => "wait-for-game-start",
            Screen::AnswerQuestion => "answer-question",
            Screen::WaitForQuestionEnd => "wait-for-question-end",
            Screen::DisplayPlayerResults => "display-player-results",
            Screen::AuthenticateUser => "authenticate-user",
            Screen::HostSelectQuiz => "host-select-quiz",
            Screen::HostGameLobby => "host-game-lobby",
            Screen::HostShowQuestion => "host-show-question",
            Screen::HostShowResults => "host-show-results",
            Screen::HostShowGameResults => "host-show-game-results",
        }
    }

    /// Host screens are reserved for admin sessions.
    pub fn requires_admin(&self) -> bool {
        self.as_str().starts_with("host")
    }

    /// Screens that only make sense while the session is bound to a game.
    pub fn requires_game(&self) -> bool {
        matches!(
            self,
            Screen::WaitForGameStart
                | Screen::AnswerQuestion
                | Screen::WaitForQuestionEnd
                | Screen::DisplayPlayerResults
                | Screen::HostGameLobby
                | Screen::HostShowQuestion
                | Screen::HostShowResults
                | Screen::HostShowGameResults
        )
    }

    const ALL: [Screen; 11] = [
        Screen::Entrance,
        Screen::WaitForGameStart,
        Screen::AnswerQuestion,
        Screen::WaitForQuestionEnd,
        Screen::DisplayPlayerResults,
        Screen::AuthenticateUser,
        Screen::HostSelectQuiz,
        Screen::HostGameLobby,
        Screen::HostShowQuestion,
        Screen::HostShowResults,
        Screen::HostShowGameResults,
    ];
}

impl fmt::Display for Screen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Screen {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Screen::ALL
            .iter()
            .copied()
            .find(|screen| screen.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownScreen(s.to_string()))
    }
}

/// A client line split into its verb and free-form argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCommand {
    pub verb: String,
    pub arg: String,
}

impl RawCommand {
    /// Splits a line at the first space. Returns `None` for blank lines.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']).trim_start();
        if line.trim().is_empty() {
            return None;
        }

        let (verb, arg) = match line.split_once(' ') {
            Some((verb, arg)) => (verb, arg.trim()),
            None => (line.trim_end(), ""),
        };

        Some(Self {
            verb: verb.to_string(),
            arg: arg.to_string(),
        })
    }

    pub fn new(verb: impl Into<String>, arg: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            arg: arg.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub pin: Pin,
    pub name: String,
}

/// Every verb a client may send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Session(String),
    JoinGame(JoinRequest),
    Answer(usize),
    HostGame,
    HostGameLobby(QuizId),
    StartGame,
    ShowResults,
    NextQuestion,
    CancelGame,
    DeleteGame,
    AdminLogin(String),
    QueryDisplayChoices,
    QueryPlayerResults,
    QueryHostResults,
    HostBackToStart,
}

impl ClientCommand {
    pub fn verb(&self) -> &'static str {
        match self {
            ClientCommand::Session(_) => "session",
            ClientCommand::JoinGame(_) => "join-game",
            ClientCommand::Answer(_) => "answer",
            ClientCommand::HostGame => "host-game",
            ClientCommand::HostGameLobby(_) => "host-game-lobby",
            ClientCommand::StartGame => "start-game",
            ClientCommand::ShowResults => "show-results",
            ClientCommand::NextQuestion => "next-question",
            ClientCommand::CancelGame => "cancel-game",
            ClientCommand::DeleteGame => "delete-game",
            ClientCommand::AdminLogin(_) => "admin-login",
            ClientCommand::QueryDisplayChoices => "query-display-choices",
            ClientCommand::QueryPlayerResults => "query-player-results",
            ClientCommand::QueryHostResults => "query-host-results",
            ClientCommand::HostBackToStart => "host-back-to-start",
        }
    }
}

fn required<'a>(verb: &'static str, arg: &'a str) -> Result<&'a str, ProtocolError> {
    if arg.is_empty() {
        Err(ProtocolError::MissingArgument(verb))
    } else {
        Ok(arg)
    }
}

fn number<T: FromStr>(verb: &'static str, arg: &str) -> Result<T, ProtocolError> {
    required(verb, arg)?
        .parse()
        .map_err(|_| ProtocolError::InvalidArgument {
            verb,
            reason: format!("\"{arg}\" is not a valid number"),
        })
}

impl TryFrom<&RawCommand> for ClientCommand {
    type Error = ProtocolError;

    fn try_from(raw: &RawCommand) -> Result<Self, Self::Error> {
        let arg = raw.arg.as_str();
        let command = match raw.verb.as_str() {
            "session" => ClientCommand::Session(required("session", arg)?.to_string()),
            "join-game" => {
                let request: JoinRequest = serde_json::from_str(required("join-game", arg)?)
                    .map_err(|e| ProtocolError::InvalidArgument {
                        verb: "join-game",
                        reason: e.to_string(),
                    })?;
                ClientCommand::JoinGame(request)
            }
            "answer" => ClientCommand::Answer(number("answer", arg)?),
            "host-game" => ClientCommand::HostGame,
            "host-game-lobby" => ClientCommand::HostGameLobby(number("host-game-lobby", arg)?),
            "start-game" => ClientCommand::StartGame,
            "show-results" => ClientCommand::ShowResults,
            "next-question" => ClientCommand::NextQuestion,
            "cancel-game" => ClientCommand::CancelGame,
            "delete-game" => ClientCommand::DeleteGame,
            "admin-login" => ClientCommand::AdminLogin(required("admin-login", arg)?.to_string()),
            "query-display-choices" => ClientCommand::QueryDisplayChoices,
            "query-player-results" => ClientCommand::QueryPlayerResults,
            "query-host-results" => ClientCommand::QueryHostResults,
            "host-back-to-start" => ClientCommand::HostBackToStart,
            other => return Err(ProtocolError::UnknownVerb(other.to_string())),
        };
        Ok(command)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(rename = "nextscreen")]
    pub next_screen: Screen,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuizSummary {
    pub id: QuizId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobbyMetadata {
    pub pin: Pin,
    pub name: String,
    pub players: Vec<String>,
}

/// The live question as shown on the host screen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionView {
    #[serde(rename = "questionindex")]
    pub question_index: usize,
    #[serde(rename = "timeleft")]
    pub time_left: u64,
    pub answered: usize,
    #[serde(rename = "totalplayers")]
    pub total_players: usize,
    pub question: String,
    pub answers: Vec<String>,
    pub votes: Vec<u32>,
    #[serde(rename = "totalquestions")]
    pub total_questions: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerProgress {
    pub answered: usize,
    #[serde(rename = "totalplayers")]
    pub total_players: usize,
    pub votes: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub name: String,
    pub score: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionResults {
    #[serde(rename = "questionindex")]
    pub question_index: usize,
    pub question: String,
    pub answers: Vec<String>,
    pub correct: usize,
    pub votes: Vec<u32>,
    #[serde(rename = "totalvotes")]
    pub total_votes: u32,
    #[serde(rename = "totalquestions")]
    pub total_questions: usize,
    #[serde(rename = "topscorers")]
    pub top_scorers: Vec<ScoreEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerResults {
    pub name: String,
    pub score: u32,
    pub correct: bool,
}

/// Every message the server pushes to a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Screen(Screen),
    Error(ErrorPayload),
    AllQuizzes(Vec<QuizSummary>),
    LobbyGameMetadata(LobbyMetadata),
    HostShowQuestion(QuestionView),
    DisplayChoices(usize),
    PlayersAnswered(AnswerProgress),
    QuestionResults(QuestionResults),
    PlayerResults(PlayerResults),
    ShowWinners(Vec<ScoreEntry>),
    ParticipantsList(Vec<String>),
    InvalidCredentials,
    RegisterSession,
}

impl ServerMessage {
    pub fn error(message: impl Into<String>, next_screen: Screen) -> Self {
        ServerMessage::Error(ErrorPayload {
            message: message.into(),
            next_screen,
        })
    }

    pub fn verb(&self) -> &'static str {
        match self {
            ServerMessage::Screen(_) => "screen",
            ServerMessage::Error(_) => "error",
            ServerMessage::AllQuizzes(_) => "all-quizzes",
            ServerMessage::LobbyGameMetadata(_) => "lobby-game-metadata",
            ServerMessage::HostShowQuestion(_) => "host-show-question",
            ServerMessage::DisplayChoices(_) => "display-choices",
            ServerMessage::PlayersAnswered(_) => "players-answered",
            ServerMessage::QuestionResults(_) => "question-results",
            ServerMessage::PlayerResults(_) => "player-results",
            ServerMessage::ShowWinners(_) => "show-winners",
            ServerMessage::ParticipantsList(_) => "participants-list",
            ServerMessage::InvalidCredentials => "invalid-credentials",
            ServerMessage::RegisterSession => "register-session",
        }
    }

    /// Renders the message as a single protocol line without a trailing newline.
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        let arg = match self {
            ServerMessage::Screen(screen) => Some(screen.as_str().to_string()),
            ServerMessage::Error(payload) => Some(serde_json::to_string(payload)?),
            ServerMessage::AllQuizzes(quizzes) => Some(serde_json::to_string(quizzes)?),
            ServerMessage::LobbyGameMetadata(meta) => Some(serde_json::to_string(meta)?),
            ServerMessage::HostShowQuestion(view) => Some(serde_json::to_string(view)?),
            ServerMessage::DisplayChoices(count) => Some(count.to_string()),
            ServerMessage::PlayersAnswered(progress) => Some(serde_json::to_string(progress)?),
            ServerMessage::QuestionResults(results) => Some(serde_json::to_string(results)?),
            ServerMessage::PlayerResults(results) => Some(serde_json::to_string(results)?),
            ServerMessage::ShowWinners(winners) => Some(serde_json::to_string(winners)?),
            ServerMessage::ParticipantsList(names) => Some(serde_json::to_string(names)?),
            ServerMessage::InvalidCredentials | ServerMessage::RegisterSession => None,
        };

        Ok(match arg {
            Some(arg) => format!("{} {}", self.verb(), arg),
            None => self.verb().to_string(),
        })
    }
}
