//! The board reconciler: one injectable holder for the in-memory aggregate.
//!
//! Three write sources funnel through [`BoardStore::replace`]: optimistic
//! local mutations, snapshot rollbacks, and authoritative refetches. The
//! store arbitrates nothing beyond last-write-wins; a refetch may transiently
//! overwrite an unconfirmed optimistic change, and that mutation's later
//! confirmation or rollback applies on top of whatever the store holds then.

use std::sync::RwLock;

use shared::domain::{Board, BoardId};
use tokio::sync::broadcast;

/// Which write source produced a state replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    LocalMutation,
    Rollback,
    Refetch,
}

#[derive(Debug, Clone)]
pub struct StoreUpdate {
    pub board_id: BoardId,
    pub origin: WriteOrigin,
}

pub struct BoardStore {
    // std lock, held only inside short synchronous sections and never across
    // an await: the optimistic local phase must not suspend mid-update.
    board: RwLock<Option<Board>>,
    updates: broadcast::Sender<StoreUpdate>,
}

impl BoardStore {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            board: RwLock::new(None),
            updates,
        }
    }

    /// Cloned view of the current aggregate. Callers never receive
    /// references into the store, which is what keeps snapshots isolated
    /// from later mutations.
    pub fn current(&self) -> Option<Board> {
        self.board.read().expect("board lock poisoned").clone()
    }

    pub fn board_id(&self) -> Option<BoardId> {
        self.board
            .read()
            .expect("board lock poisoned")
            .as_ref()
            .map(|b| b.id)
    }

    pub fn replace(&self, board: Board, origin: WriteOrigin) {
        let board_id = board.id;
        *self.board.write().expect("board lock poisoned") = Some(board);
        let _ = self.updates.send(StoreUpdate { board_id, origin });
    }

    pub fn clear(&self) {
        *self.board.write().expect("board lock poisoned") = None;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreUpdate> {
        self.updates.subscribe()
    }
}

impl Default for BoardStore {
    fn default() -> Self {
        Self::new()
    }
}
