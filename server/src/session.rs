use std::time::Duration;

use serde::{Deserialize, Serialize};
use shared::{ClientId, Pin, Screen, SessionId};

use crate::utils::expiry_from_now;

/// Durable identity of one participant, independent of any connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    /// Connection currently bound to the session, if any
    #[serde(rename = "clientid", default)]
    pub client_id: Option<ClientId>,
    pub screen: Screen,
    #[serde(rename = "gamepin", default)]
    pub game_pin: Option<Pin>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub admin: bool,
    /// Milliseconds since the epoch
    pub expiry: u64,
}

impl Session {
    pub fn new(id: impl Into<SessionId>, ttl: Duration) -> Self {
        Self {
            id: id.into(),
            client_id: None,
            screen: Screen::Entrance,
            game_pin: None,
            name: None,
            admin: false,
            expiry: expiry_from_now(ttl),
        }
    }

    /// Prepares a record read back from the store. A stored binding belongs
    /// to a connection this process never saw.
    pub fn hydrated(mut self, ttl: Duration) -> Self {
        self.client_id = None;
        self.extend(ttl);
        self
    }

    pub fn extend(&mut self, ttl: Duration) {
        self.expiry = expiry_from_now(ttl);
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now > self.expiry
    }

    #[cfg(test)]
    pub fn is_expired_now(&self) -> bool {
        self.is_expired(crate::utils::get_timestamp())
    }

    pub fn bind(&mut self, client_id: ClientId) {
        self.client_id = Some(client_id);
    }

    pub fn unbind(&mut self) -> Option<ClientId> {
        self.client_id.take()
    }

    pub fn clear_game(&mut self) {
        self.game_pin = None;
        self.name = None;
    }

    /// Forgets the game and steps off any screen that needs one.
    pub fn leave_game(&mut self) {
        self.clear_game();
        if self.screen.requires_game() {
            self.screen = if self.admin {
                Screen::HostSelectQuiz
            } else {
                Screen::Entrance
            };
        }
    }
}
