//! Realtime transport seam and the refetch decision for incoming messages.
//!
//! One subscription is held per open board. Every row-level change
//! notification triggers an authoritative refetch; lightweight
//! `BoardTouched` announcements trigger one only when a different client
//! originated them, so a client never reacts to its own optimistic
//! mutations twice.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::domain::{BoardId, ClientId};
use shared::protocol::RealtimeMessage;
use tokio::sync::broadcast;

#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Subscribe to one channel. The receiver yields every message published
    /// on that channel, including this client's own.
    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<RealtimeMessage>>;

    async fn publish(&self, channel: &str, message: &RealtimeMessage) -> Result<()>;
}

/// Null transport: subscriptions fail, publishes are silently dropped. The
/// engine degrades to a single-client mode with no realtime sync.
pub struct MissingRealtimeTransport;

#[async_trait]
impl RealtimeTransport for MissingRealtimeTransport {
    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<RealtimeMessage>> {
        Err(anyhow!("realtime transport unavailable: channel {channel}"))
    }

    async fn publish(&self, _channel: &str, _message: &RealtimeMessage) -> Result<()> {
        Ok(())
    }
}

/// Whether a realtime message warrants a full reconciliation refetch of the
/// given open board.
pub fn should_refetch(message: &RealtimeMessage, board_id: BoardId, self_id: ClientId) -> bool {
    if message.board_id() != board_id {
        return false;
    }
    match message {
        RealtimeMessage::RowChanged { .. } => true,
        RealtimeMessage::BoardTouched { origin, .. } => *origin != self_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::protocol::{ChangeKind, ChangedTable};

    #[test]
    fn row_changes_always_refetch() {
        let board_id = BoardId::new();
        let me = ClientId::new();
        let msg = RealtimeMessage::RowChanged {
            board_id,
            table: ChangedTable::Cards,
            kind: ChangeKind::Update,
        };
        assert!(should_refetch(&msg, board_id, me));
    }

    #[test]
    fn own_announcements_are_skipped() {
        let board_id = BoardId::new();
        let me = ClientId::new();
        let mine = RealtimeMessage::BoardTouched {
            board_id,
            origin: me,
        };
        let theirs = RealtimeMessage::BoardTouched {
            board_id,
            origin: ClientId::new(),
        };
        assert!(!should_refetch(&mine, board_id, me));
        assert!(should_refetch(&theirs, board_id, me));
    }

    #[test]
    fn other_boards_are_ignored() {
        let me = ClientId::new();
        let msg = RealtimeMessage::BoardTouched {
            board_id: BoardId::new(),
            origin: ClientId::new(),
        };
        assert!(!should_refetch(&msg, BoardId::new(), me));
    }
}
