//! Types shared between the quiz server and its clients: the quiz data model
//! and the text line protocol.

pub mod protocol;
pub mod quiz;

pub use protocol::{
    AnswerProgress, ClientCommand, ErrorPayload, JoinRequest, LobbyMetadata, PlayerResults,
    ProtocolError, QuestionResults, QuestionView, QuizSummary, RawCommand, ScoreEntry, Screen,
    ServerMessage,
};
pub use quiz::{Question, Quiz, QuizId, MIN_ANSWERS};

/// Transport-assigned id of one live connection
pub type ClientId = u32;
/// Numeric code identifying one live game
pub type Pin = u32;
/// Client-chosen durable identity, usually a persisted cookie
pub type SessionId = String;

/// Pins are drawn from `1..=MAX_PIN`
pub const MAX_PIN: Pin = 998;
/// Number of entries reported in winner and top-scorer lists
pub const TOP_SCORERS: usize = 5;
