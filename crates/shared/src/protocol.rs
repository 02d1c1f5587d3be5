use serde::{Deserialize, Serialize};

use crate::domain::{BoardId, ClientId};

/// Table granularity for row-level change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangedTable {
    Boards,
    Lists,
    Cards,
    Labels,
    CardLabels,
    CardRelations,
    Checklists,
    ChecklistItems,
    Attachments,
    Comments,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Realtime notification for an open board. Two designs coexist on the same
/// wire:
///
/// - `RowChanged` is a row-level change notification from the datastore;
///   every one of them triggers a reconciliation refetch.
/// - `BoardTouched` is a lightweight announcement a client broadcasts after
///   each successful mutation, tagged with its own identity so peers can
///   skip notifications they caused themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RealtimeMessage {
    RowChanged {
        board_id: BoardId,
        table: ChangedTable,
        kind: ChangeKind,
    },
    BoardTouched {
        board_id: BoardId,
        origin: ClientId,
    },
}

impl RealtimeMessage {
    pub fn board_id(&self) -> BoardId {
        match self {
            RealtimeMessage::RowChanged { board_id, .. } => *board_id,
            RealtimeMessage::BoardTouched { board_id, .. } => *board_id,
        }
    }
}

/// Wire frame for the websocket transport: a message addressed to one
/// channel (one open board subscribes to `board:{board_id}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelFrame {
    pub channel: String,
    pub message: RealtimeMessage,
}

/// Channel key for a board's realtime traffic.
pub fn board_channel(board_id: BoardId) -> String {
    format!("board:{board_id}")
}
