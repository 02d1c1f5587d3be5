//! Drag-and-drop interaction source.
//!
//! Toolkit-agnostic adapter between pointer-level drag callbacks and the
//! semantic move intents the executor consumes. A UI layer forwards its
//! drag events into a [`DragSession`]; a completed drop yields at most one
//! [`DropIntent`]. No ordering or persistence logic lives here.

use shared::domain::{CardId, ListId};

use crate::MoveListTarget;

/// What is being dragged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DragPayload {
    Card(CardId),
    List(ListId),
}

/// Where the pointer currently hovers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropTarget {
    /// Over a list's card area, below all cards.
    ListSurface(ListId),
    /// Over an existing card; a dropped card lands before it.
    BeforeCard { list_id: ListId, card_id: CardId },
    /// Over the gap following a list header; a dropped list lands after it.
    AfterList(ListId),
}

/// Semantic move produced by a completed drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropIntent {
    MoveCard {
        card_id: CardId,
        dest_list_id: ListId,
        before: Option<CardId>,
    },
    MoveList {
        list_id: ListId,
        target: MoveListTarget,
    },
}

/// Callback surface a UI toolkit drives.
pub trait DragDropDelegate {
    fn drag_started(&mut self, payload: DragPayload);
    fn drag_entered(&mut self, target: DropTarget);
    fn drag_left(&mut self);
    /// Completes the gesture. `None` when the drop happened nowhere useful.
    fn dropped(&mut self) -> Option<DropIntent>;
}

/// Default delegate: tracks one gesture at a time.
#[derive(Debug, Default)]
pub struct DragSession {
    payload: Option<DragPayload>,
    target: Option<DropTarget>,
}

impl DragSession {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DragDropDelegate for DragSession {
    fn drag_started(&mut self, payload: DragPayload) {
        self.payload = Some(payload);
        self.target = None;
    }

    fn drag_entered(&mut self, target: DropTarget) {
        if self.payload.is_some() {
            self.target = Some(target);
        }
    }

    fn drag_left(&mut self) {
        self.target = None;
    }

    fn dropped(&mut self) -> Option<DropIntent> {
        let payload = self.payload.take()?;
        let target = self.target.take()?;
        match (payload, target) {
            (DragPayload::Card(card_id), DropTarget::ListSurface(dest_list_id)) => {
                Some(DropIntent::MoveCard {
                    card_id,
                    dest_list_id,
                    before: None,
                })
            }
            (
                DragPayload::Card(card_id),
                DropTarget::BeforeCard {
                    list_id: dest_list_id,
                    card_id: before,
                },
            ) => Some(DropIntent::MoveCard {
                card_id,
                dest_list_id,
                before: Some(before),
            }),
            (DragPayload::List(list_id), DropTarget::AfterList(anchor)) => {
                (list_id != anchor).then_some(DropIntent::MoveList {
                    list_id,
                    target: MoveListTarget::NextTo(anchor),
                })
            }
            // Cards cannot land in list gaps; lists cannot land on cards.
            _ => None,
        }
    }
}
