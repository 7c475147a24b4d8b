//! # Quiz Session Server Library
//!
//! This library provides the server core for live multiplayer quiz sessions.
//! A host picks a quiz and opens a game, players join it with a numeric pin,
//! and every connected client is driven from screen to screen as the game
//! moves through its questions.
//!
//! ## Architecture
//!
//! ### Actors on a Topic Bus
//! All mutable state lives inside three single-writer actors. Each actor owns
//! its data outright and consumes exactly one message type from a named,
//! bounded topic on the [`bus::TopicBus`]:
//! - The session actor owns sessions and client bindings
//! - The game actor owns live games and their state machines
//! - The quiz actor owns the quiz catalog
//!
//! Actors never share memory. Cross-actor effects are fire-and-forget sends,
//! and request/reply exchanges carry a one-shot reply channel.
//!
//! ### Sessions Outlive Connections
//! A session is identified by a client-chosen id and survives reconnects.
//! Idle sessions expire; a periodic reaper evicts them and disconnects the
//! clients still bound to them.
//!
//! ### Line Protocol
//! Clients speak newline-delimited text over TCP. Each line is a verb and an
//! optional argument, and structured payloads travel as JSON.
//!
//! ## Module Organization
//!
//! - `app`: composition root that starts and stops the actors
//! - `bus`: typed topic registry
//! - `client_manager` and `network`: TCP transport
//! - `game`: the game state machine and scoring
//! - `session_actor`, `game_actor`, `quiz_actor`: the actors
//! - `persistence`: optional Redis-backed snapshots
//! - `clients`: request/reply handles for the administrative surface
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::app::QuizServer;
//! use server::config::ServerConfig;
//! use server::network::NetworkServer;
//! use server::persistence::Persistence;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let quiz_server = QuizServer::start(&config, Persistence::disabled())?;
//!
//!     let bus = quiz_server.bus();
//!     let network = NetworkServer::bind(&config, &bus, quiz_server.shutdown_token()).await?;
//!     network.run().await?;
//!
//!     quiz_server.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod bus;
pub mod client_manager;
pub mod clients;
pub mod config;
pub mod error;
pub mod game;
pub mod game_actor;
pub mod messages;
pub mod network;
pub mod persistence;
pub mod quiz_actor;
pub mod session;
pub mod session_actor;
pub mod utils;
