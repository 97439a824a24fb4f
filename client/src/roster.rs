use log::debug;
use shared::{Direction, PartySnapshot, PlayerView, SessionId};
use std::collections::HashMap;

/// Client-side picture of another player, built from world-state packets
#[derive(Debug, Clone)]
pub struct RemotePlayer {
    pub view: PlayerView,
    /// Position from the snapshot before the current one
    pub last_pos: (f32, f32),
    /// Whether the player moved between the last two snapshots
    pub is_moving: bool,
}

impl RemotePlayer {
    fn new(view: PlayerView) -> Self {
        Self {
            last_pos: (view.x, view.y),
            view,
            is_moving: false,
        }
    }

    fn apply(&mut self, view: PlayerView) {
        self.last_pos = (self.view.x, self.view.y);
        self.is_moving = view.x != self.view.x || view.y != self.view.y;
        self.view = view;
    }

    pub fn id(&self) -> SessionId {
        self.view.id
    }

    pub fn position(&self) -> (f32, f32) {
        (self.view.x, self.view.y)
    }

    pub fn direction(&self) -> Direction {
        self.view.direction
    }

    pub fn party(&self) -> Option<&PartySnapshot> {
        self.view.party.as_ref()
    }

    pub fn distance_to(&self, x: f32, y: f32) -> f32 {
        let dx = self.view.x - x;
        let dy = self.view.y - y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Every other player the server last told us about
#[derive(Debug, Default)]
pub struct RemoteRoster {
    players: HashMap<SessionId, RemotePlayer>,
}

impl RemoteRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the roster with a fresh world snapshot
    ///
    /// Players missing from the snapshot are dropped and our own session is
    /// skipped.
    pub fn apply(&mut self, players: Vec<PlayerView>, own_id: Option<SessionId>) {
        let before = self.players.len();
        let mut next = HashMap::with_capacity(players.len());

        for view in players {
            if Some(view.id) == own_id {
                continue;
            }

            let entry = match self.players.remove(&view.id) {
                Some(mut existing) => {
                    existing.apply(view);
                    existing
                }
                None => RemotePlayer::new(view),
            };
            next.insert(entry.id(), entry);
        }

        if next.len() != before {
            debug!("Roster now holds {} remote players", next.len());
        }
        self.players = next;
    }

    pub fn get(&self, id: SessionId) -> Option<&RemotePlayer> {
        self.players.get(&id)
    }

    /// Players standing on the given map, ordered by id
    pub fn on_map(&self, map: &str) -> Vec<&RemotePlayer> {
        let mut players: Vec<&RemotePlayer> = self
            .players
            .values()
            .filter(|player| player.view.map == map)
            .collect();
        players.sort_by_key(|player| player.id());
        players
    }

    /// Closest player on `map` within `radius` of the given point
    pub fn nearest_within(&self, map: &str, x: f32, y: f32, radius: f32) -> Option<&RemotePlayer> {
        self.players
            .values()
            .filter(|player| player.view.map == map)
            .map(|player| (player, player.distance_to(x, y)))
            .filter(|(_, distance)| *distance < radius)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(player, _)| player)
    }

    pub fn clear(&mut self) {
        self.players.clear();
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}
