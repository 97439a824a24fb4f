//! Bounded history of chat lines relayed between players

use shared::{ChatLine, SessionId, MAX_CHAT_LEN};
use std::collections::VecDeque;

pub struct ChatLog {
    lines: VecDeque<ChatLine>,
    capacity: usize,
}

impl ChatLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Records a line from a player
    ///
    /// Surrounding whitespace is trimmed and overlong text is cut to
    /// `MAX_CHAT_LEN` characters. Blank lines are dropped and return None.
    pub fn push(&mut self, from: SessionId, text: &str) -> Option<ChatLine> {
        let text = text.trim();
        if text.is_empty() || self.capacity == 0 {
            return None;
        }

        let line = ChatLine {
            from,
            text: text.chars().take(MAX_CHAT_LEN).collect(),
        };

        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.clone());

        Some(line)
    }

    /// The newest `limit` lines, oldest first
    pub fn recent(&self, limit: usize) -> Vec<ChatLine> {
        let skip = self.lines.len().saturating_sub(limit);
        self.lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
