//! Live game state and its question cycle.
//!
//! A [`Game`] is plain data mutated only by the game actor. Every method that
//! depends on time takes `now` in milliseconds since the epoch so the state
//! machine can be driven deterministically.

use std::collections::{HashMap, HashSet};
use std::fmt;

use log::info;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use shared::{
    AnswerProgress, LobbyMetadata, PlayerResults, Question, QuestionResults, QuestionView, Quiz,
    ScoreEntry, SessionId, Pin, MAX_PIN, TOP_SCORERS,
};

use crate::error::GameError;

/// Points for any correct answer, before the speed bonus
pub const BASE_SCORE: u32 = 100;
/// Pin draws before creation gives up
pub const PIN_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GameState {
    NotStarted,
    QuestionInProgress,
    ShowResults,
    GameEnded,
}

impl GameState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameState::NotStarted => "not-started",
            GameState::QuestionInProgress => "question-in-progress",
            GameState::ShowResults => "show-results",
            GameState::GameEnded => "game-ended",
        }
    }
}

impl fmt::Display for GameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Score for a correct answer given the time left on the clock.
///
/// `100 + floor(seconds_left * 100 / duration)`, with negative time counting as zero.
pub fn score(remaining_ms: i64, duration_secs: u32) -> u32 {
    if duration_secs == 0 {
        return BASE_SCORE;
    }
    let remaining = remaining_ms.max(0) as u64;
    let bonus = remaining * 100 / (duration_secs as u64 * 1000);
    BASE_SCORE + bonus.min(u32::MAX as u64 - BASE_SCORE as u64) as u32
}

/// Draws a pin from four random bytes, retrying when `is_taken` reports a
/// collision with a live game.
pub fn generate_pin<R, F>(rng: &mut R, is_taken: F) -> Result<Pin, GameError>
where
    R: RngCore + ?Sized,
    F: Fn(Pin) -> bool,
{
    for _ in 0..PIN_ATTEMPTS {
        let mut bytes = [0u8; 4];
        rng.fill_bytes(&mut bytes);
        let sum: u32 = bytes.iter().map(|&b| b as u32).sum();
        let pin = sum % MAX_PIN + 1;
        if !is_taken(pin) {
            return Ok(pin);
        }
    }
    Err(GameError::PinExhausted)
}

/// What happened to a registered answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnswerOutcome {
    /// False when the player had already answered this question
    pub counted: bool,
    pub state: GameState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Game {
    pub pin: Pin,
    pub host: SessionId,
    /// Score per player session
    pub players: HashMap<SessionId, u32>,
    #[serde(rename = "playernames")]
    pub player_names: HashMap<SessionId, String>,
    pub quiz: Option<Quiz>,
    #[serde(rename = "questionindex")]
    pub question_index: usize,
    /// Milliseconds since the epoch
    #[serde(rename = "questiondeadline")]
    pub question_deadline: u64,
    #[serde(rename = "playersanswered")]
    pub players_answered: HashSet<SessionId>,
    #[serde(rename = "playerscorrect")]
    pub players_correct: HashSet<SessionId>,
    pub votes: Vec<u32>,
    pub state: GameState,
}

impl Game {
    pub fn new(pin: Pin, host: impl Into<SessionId>) -> Self {
        Self {
            pin,
            host: host.into(),
            players: HashMap::new(),
            player_names: HashMap::new(),
            quiz: None,
            question_index: 0,
            question_deadline: 0,
            players_answered: HashSet::new(),
            players_correct: HashSet::new(),
            votes: Vec::new(),
            state: GameState::NotStarted,
        }
    }

    pub fn is_host(&self, session_id: &str) -> bool {
        self.host == session_id
    }

    pub fn is_player(&self, session_id: &str) -> bool {
        self.players.contains_key(session_id)
    }

    pub fn set_quiz(&mut self, quiz: Quiz) {
        self.quiz = Some(quiz);
    }

    pub fn question_count(&self) -> usize {
        self.quiz.as_ref().map_or(0, Quiz::question_count)
    }

    fn question_at(&self, index: usize) -> Result<&Question, GameError> {
        self.quiz
            .as_ref()
            .ok_or(GameError::NoQuiz(self.pin))?
            .question(index)
            .ok_or(GameError::UnexpectedState(self.state))
    }

    /// Adds a player to a game that has not started. Returns `false` when the
    /// session was already in the game.
    pub fn add_player(&mut self, session_id: &str, name: &str) -> Result<bool, GameError> {
        if self.is_player(session_id) {
            return Ok(false);
        }
        if self.state != GameState::NotStarted {
            return Err(GameError::UnexpectedState(self.state));
        }

        let name = name.trim();
        if name.is_empty() {
            return Err(GameError::MissingName);
        }
        let lowered = name.to_lowercase();
        if self
            .player_names
            .values()
            .any(|existing| existing.to_lowercase() == lowered)
        {
            return Err(GameError::DuplicateName(name.to_string()));
        }

        self.players.insert(session_id.to_string(), 0);
        self.player_names
            .insert(session_id.to_string(), name.to_string());
        Ok(true)
    }

    /// Drops a player from the lobby. Players of a started game keep their
    /// place on the scoreboard.
    pub fn remove_player(&mut self, session_id: &str) -> bool {
        if self.state != GameState::NotStarted {
            return false;
        }
        self.player_names.remove(session_id);
        self.players.remove(session_id).is_some()
    }

    fn init_question(&mut self, now: u64) {
        let (answer_count, duration) = match &self.quiz {
            Some(quiz) => (
                quiz.question(self.question_index)
                    .map_or(0, |q| q.answers.len()),
                quiz.question_duration,
            ),
            None => (0, 0),
        };

        self.players_answered.clear();
        self.players_correct.clear();
        self.votes = vec![0; answer_count];
        self.question_deadline = now + duration as u64 * 1000;
    }

    /// Moves the game to its next state and returns it.
    pub fn advance(&mut self, now: u64) -> GameState {
        let previous = self.state;
        self.state = match self.state {
            GameState::NotStarted => {
                if self.question_count() == 0 || self.players.is_empty() {
                    GameState::GameEnded
                } else {
                    self.question_index = 0;
                    self.init_question(now);
                    GameState::QuestionInProgress
                }
            }
            GameState::QuestionInProgress => GameState::ShowResults,
            GameState::ShowResults => {
                self.question_index += 1;
                if self.question_index >= self.question_count() {
                    GameState::GameEnded
                } else {
                    self.init_question(now);
                    GameState::QuestionInProgress
                }
            }
            GameState::GameEnded => GameState::GameEnded,
        };

        info!(
            "Game {}: {} -> {} (question {})",
            self.pin, previous, self.state, self.question_index
        );
        self.state
    }

    fn all_answered(&self) -> bool {
        !self.players.is_empty() && self.players_answered.len() >= self.players.len()
    }

    /// Fails unless a question is open; closes it if its time is up or every
    /// player has answered.
    fn ensure_question_live(&mut self, now: u64) -> Result<(), GameError> {
        if self.state != GameState::QuestionInProgress {
            return Err(GameError::UnexpectedState(self.state));
        }
        if now > self.question_deadline || self.all_answered() {
            self.state = GameState::ShowResults;
            info!("Game {}: question {} closed", self.pin, self.question_index);
            return Err(GameError::UnexpectedState(self.state));
        }
        Ok(())
    }

    pub fn register_answer(
        &mut self,
        session_id: &str,
        answer: usize,
        now: u64,
    ) -> Result<AnswerOutcome, GameError> {
        if !self.is_player(session_id) {
            return Err(GameError::PlayerNotInGame);
        }
        if self.state != GameState::QuestionInProgress {
            return Err(GameError::UnexpectedState(self.state));
        }
        if now > self.question_deadline {
            self.state = GameState::ShowResults;
            info!(
                "Game {}: late answer closed question {}",
                self.pin, self.question_index
            );
            return Err(GameError::UnexpectedState(self.state));
        }
        if self.players_answered.contains(session_id) {
            return Ok(AnswerOutcome {
                counted: false,
                state: self.state,
            });
        }

        let question = self.question_at(self.question_index)?;
        if answer >= question.answers.len() {
            return Err(GameError::InvalidAnswer(answer));
        }
        let correct = question.is_correct(answer);
        let duration = self.quiz.as_ref().map_or(0, |q| q.question_duration);

        self.players_answered.insert(session_id.to_string());
        if let Some(votes) = self.votes.get_mut(answer) {
            *votes += 1;
        }
        if correct {
            self.players_correct.insert(session_id.to_string());
            let remaining = self.question_deadline as i64 - now as i64;
            if let Some(total) = self.players.get_mut(session_id) {
                *total += score(remaining, duration);
            }
        }

        if self.all_answered() {
            self.state = GameState::ShowResults;
            info!("Game {}: every player answered", self.pin);
        }

        Ok(AnswerOutcome {
            counted: true,
            state: self.state,
        })
    }

    pub fn current_question(&mut self, now: u64) -> Result<QuestionView, GameError> {
        self.ensure_question_live(now)?;
        let question = self.question_at(self.question_index)?;

        Ok(QuestionView {
            question_index: self.question_index,
            time_left: self.question_deadline.saturating_sub(now) / 1000,
            answered: self.players_answered.len(),
            total_players: self.players.len(),
            question: question.question.clone(),
            answers: question.answers.clone(),
            votes: self.votes.clone(),
            total_questions: self.question_count(),
        })
    }

    /// Number of choices a player should be shown for the open question.
    pub fn display_choices(&mut self, session_id: &str, now: u64) -> Result<usize, GameError> {
        if !self.is_player(session_id) {
            return Err(GameError::PlayerNotInGame);
        }
        self.ensure_question_live(now)?;
        Ok(self.question_at(self.question_index)?.answers.len())
    }

    pub fn has_answered(&self, session_id: &str) -> bool {
        self.players_answered.contains(session_id)
    }

    pub fn show_results(&mut self) -> Result<(), GameError> {
        match self.state {
            GameState::QuestionInProgress | GameState::ShowResults => {
                self.state = GameState::ShowResults;
                Ok(())
            }
            other => Err(GameError::UnexpectedState(other)),
        }
    }

    pub fn question_results(&self) -> Result<QuestionResults, GameError> {
        let index = self
            .question_index
            .min(self.question_count().saturating_sub(1));
        let question = self.question_at(index)?;

        let votes = if self.votes.len() == question.answers.len() {
            self.votes.clone()
        } else {
            vec![0; question.answers.len()]
        };

        Ok(QuestionResults {
            question_index: index,
            question: question.question.clone(),
            answers: question.answers.clone(),
            correct: question.correct,
            total_votes: votes.iter().sum(),
            votes,
            total_questions: self.question_count(),
            top_scorers: self.winners(),
        })
    }

    /// Players by descending score, ties broken by name, capped at five.
    pub fn winners(&self) -> Vec<ScoreEntry> {
        let mut entries: Vec<ScoreEntry> = self
            .players
            .iter()
            .map(|(session_id, score)| ScoreEntry {
                name: self.player_names.get(session_id).cloned().unwrap_or_default(),
                score: *score,
            })
            .collect();
        entries.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.name.cmp(&b.name)));
        entries.truncate(TOP_SCORERS);
        entries
    }

    pub fn player_results(&self, session_id: &str) -> Result<PlayerResults, GameError> {
        let score = self
            .players
            .get(session_id)
            .ok_or(GameError::PlayerNotInGame)?;
        Ok(PlayerResults {
            name: self.player_names.get(session_id).cloned().unwrap_or_default(),
            score: *score,
            correct: self.players_correct.contains(session_id),
        })
    }

    pub fn answer_progress(&self) -> AnswerProgress {
        AnswerProgress {
            answered: self.players_answered.len(),
            total_players: self.players.len(),
            votes: self.votes.clone(),
        }
    }

    pub fn participant_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.player_names.values().cloned().collect();
        names.sort();
        names
    }

    pub fn lobby_metadata(&self) -> LobbyMetadata {
        LobbyMetadata {
            pin: self.pin,
            name: self.quiz.as_ref().map(|q| q.name.clone()).unwrap_or_default(),
            players: self.participant_names(),
        }
    }

    pub fn player_sessions(&self) -> Vec<SessionId> {
        self.players.keys().cloned().collect()
    }

    /// Checks the relations between the player sets and the open question.
    /// Used on snapshots that replace a live game wholesale.
    pub fn validate(&self) -> Result<(), GameError> {
        let invalid = |reason: &str| Err(GameError::InvalidSnapshot(reason.to_string()));

        if self.players.contains_key(&self.host) {
            return invalid("the host cannot also be a player");
        }
        if self.player_names.len() != self.players.len()
            || self.player_names.keys().any(|id| !self.players.contains_key(id))
        {
            return invalid("every player needs exactly one name");
        }
        if self.players_answered.iter().any(|id| !self.players.contains_key(id)) {
            return invalid("only players can have answered");
        }
        if !self.players_correct.is_subset(&self.players_answered) {
            return invalid("only players who answered can be correct");
        }

        match self.state {
            GameState::QuestionInProgress | GameState::ShowResults => {
                let Ok(question) = self.question_at(self.question_index) else {
                    return invalid("no question is open at the current index");
                };
                if self.votes.len() != question.answers.len() {
                    return invalid("votes must have one entry per answer");
                }
            }
            GameState::NotStarted | GameState::GameEnded => {}
        }
        Ok(())
    }
}
