//! Quiz definitions as stored in the catalog and embedded into live games.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

pub type QuizId = u64;

/// Minimum number of answer choices a question must offer
pub const MIN_ANSWERS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub question: String,
    pub answers: Vec<String>,
    pub correct: usize,
}

impl Question {
    pub fn new(question: impl Into<String>, answers: &[&str], correct: usize) -> Self {
        Self {
            question: question.into(),
            answers: answers.iter().map(|a| a.to_string()).collect(),
            correct,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.answers.len() < MIN_ANSWERS {
            return Err(format!(
                "question \"{}\" needs at least {} answers",
                self.question, MIN_ANSWERS
            ));
        }
        if self.correct >= self.answers.len() {
            return Err(format!(
                "question \"{}\" has correct answer {} but only {} answers",
                self.question,
                self.correct,
                self.answers.len()
            ));
        }
        Ok(())
    }

    pub fn is_correct(&self, answer: usize) -> bool {
        self.correct == answer
    }

    /// Permutes the answers in place and remaps `correct` so that it still
    /// points at the same answer text.
    pub fn shuffle_answers<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let mut order: Vec<usize> = (0..self.answers.len()).collect();
        order.shuffle(rng);

        let shuffled = order.iter().map(|&i| self.answers[i].clone()).collect();
        if let Some(new_correct) = order.iter().position(|&i| i == self.correct) {
            self.correct = new_correct;
        }
        self.answers = shuffled;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quiz {
    #[serde(default)]
    pub id: QuizId,
    pub name: String,
    /// Seconds each question stays open
    #[serde(rename = "questionduration")]
    pub question_duration: u32,
    #[serde(rename = "shuffleanswers", default)]
    pub shuffle_answers: bool,
    #[serde(default)]
    pub questions: Vec<Question>,
}

impl Quiz {
    pub fn new(name: impl Into<String>, question_duration: u32, questions: Vec<Question>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            question_duration,
            shuffle_answers: false,
            questions,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("quiz name must not be empty".to_string());
        }
        if self.question_duration == 0 {
            return Err("question duration must be positive".to_string());
        }
        self.questions.iter().try_for_each(Question::validate)
    }

    pub fn question(&self, index: usize) -> Option<&Question> {
        self.questions.get(index)
    }

    pub fn question_count(&self) -> usize {
        self.questions.len()
    }

    /// Produces the immutable copy a game embeds, shuffling answers when the
    /// quiz asks for it.
    pub fn snapshot_for_game<R: Rng + ?Sized>(&self, rng: &mut R) -> Quiz {
        let mut snapshot = self.clone();
        if snapshot.shuffle_answers {
            for question in &mut snapshot.questions {
                question.shuffle_answers(rng);
            }
        }
        snapshot
    }
}
