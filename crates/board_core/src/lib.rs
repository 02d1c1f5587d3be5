//! Client-side engine for a collaborative kanban board.
//!
//! [`BoardClient`] owns the optimistic mutation flow: every user-initiated
//! write is applied to the in-memory aggregate synchronously, then mirrored
//! to the datastore; a failed remote write restores the snapshot captured
//! before the local change. A realtime listener refetches the authoritative
//! aggregate whenever another client announces a change.
#![recursion_limit = "256"]

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use shared::domain::{
    Attachment, AttachmentId, BackgroundConfig, Board, BoardId, Card, CardId, Checklist,
    ChecklistId, ChecklistItem, ChecklistItemId, ClientId, Comment, CommentId, Label, LabelId,
    List, ListId, RelatedCardSummary, UserProfile,
};
use shared::protocol::{board_channel, RealtimeMessage};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub mod datasource;
pub mod dnd;
pub mod listener;
pub mod position;
pub mod rest;
pub mod store;
pub mod transport;

pub use datasource::{
    BoardDataSource, BoardPatch, CardPatch, ChecklistItemPatch, LabelPatch, ListPatch,
    MissingDataSource, MissingObjectStore, ObjectStore,
};
pub use dnd::{DragDropDelegate, DragPayload, DragSession, DropIntent, DropTarget};
pub use listener::{should_refetch, MissingRealtimeTransport, RealtimeTransport};
pub use position::{append_position, between_position};
pub use rest::{RestDataSource, RestObjectStore};
pub use store::{BoardStore, StoreUpdate, WriteOrigin};
pub use transport::WebSocketTransport;

const ATTACHMENTS_BUCKET: &str = "attachments";

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("no board is open")]
    NoBoardOpen,
    #[error("unknown list {0}")]
    UnknownList(ListId),
    #[error("unknown card {0}")]
    UnknownCard(CardId),
    #[error("unknown label {0}")]
    UnknownLabel(LabelId),
    #[error("unknown checklist {0}")]
    UnknownChecklist(ChecklistId),
    #[error("unknown checklist item {0}")]
    UnknownChecklistItem(ChecklistItemId),
    #[error("unknown attachment {0}")]
    UnknownAttachment(AttachmentId),
    #[error("unknown comment {0}")]
    UnknownComment(CommentId),
    #[error("card {card_id} has no relation to {related_id}")]
    UnknownRelation {
        card_id: CardId,
        related_id: CardId,
    },
    #[error("failed to {action}: {source}")]
    RemoteWrite {
        action: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to upload attachment: {0}")]
    Upload(#[source] anyhow::Error),
}

/// Notifications for a UI layer: mutation outcomes, authoritative refetches,
/// and subscription health.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    BoardLoaded { board_id: BoardId },
    MutationSucceeded { action: &'static str },
    MutationFailed { action: &'static str, message: String },
    Refetched { board_id: BoardId },
    RefetchFailed { message: String },
    SubscriptionLost { message: String },
}

/// Where a list should move, relative to its siblings in current
/// position-sorted order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveListTarget {
    /// Swap with the left neighbor; no-op for the leftmost list.
    Left,
    /// Swap with the right neighbor; no-op for the rightmost list.
    Right,
    /// Relocate immediately after the given list.
    NextTo(ListId),
}

/// Outcome of a mutation's local phase.
enum Applied<T> {
    Changed(T),
    Noop,
}

/// The optimistic mutation executor.
///
/// Mutations are not serialized against each other: each one carries its own
/// pre-mutation snapshot, and a rollback restores that snapshot wholesale.
/// When two in-flight mutations touch overlapping entities, rolling back the
/// older one can discard the newer one's already-confirmed effect. The next
/// refetch converges the view; the engine favors this simplicity over
/// per-entity coordination.
pub struct BoardClient {
    datasource: Arc<dyn BoardDataSource>,
    realtime: Arc<dyn RealtimeTransport>,
    objects: Arc<dyn ObjectStore>,
    store: Arc<BoardStore>,
    client_id: ClientId,
    events: broadcast::Sender<ClientEvent>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
}

impl BoardClient {
    /// Client with no realtime transport or object storage wired up: it
    /// works single-client with no sync and no attachment uploads.
    pub fn new(datasource: Arc<dyn BoardDataSource>) -> Arc<Self> {
        Self::new_with_dependencies(
            datasource,
            Arc::new(MissingRealtimeTransport),
            Arc::new(MissingObjectStore),
        )
    }

    pub fn new_with_dependencies(
        datasource: Arc<dyn BoardDataSource>,
        realtime: Arc<dyn RealtimeTransport>,
        objects: Arc<dyn ObjectStore>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            datasource,
            realtime,
            objects,
            store: Arc::new(BoardStore::new()),
            client_id: ClientId::new(),
            events,
            listener_task: Mutex::new(None),
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn store(&self) -> Arc<BoardStore> {
        Arc::clone(&self.store)
    }

    pub fn current_board(&self) -> Option<Board> {
        self.store.current()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Load the authoritative aggregate and start the realtime listener.
    pub async fn open_board(self: &Arc<Self>, board_id: BoardId) -> anyhow::Result<()> {
        let mut board = self
            .datasource
            .fetch_board(board_id)
            .await
            .context("failed to load board")?;
        board.normalize();
        self.store.replace(board, WriteOrigin::Refetch);
        let _ = self.events.send(ClientEvent::BoardLoaded { board_id });
        info!(board_id = %board_id, "board opened");
        self.start_listener(board_id).await;
        Ok(())
    }

    /// Tear down the listener and drop the aggregate.
    pub async fn close_board(&self) {
        if let Some(task) = self.listener_task.lock().await.take() {
            task.abort();
        }
        self.store.clear();
    }

    async fn start_listener(self: &Arc<Self>, board_id: BoardId) {
        let channel = board_channel(board_id);
        let mut rx = match self.realtime.subscribe(&channel).await {
            Ok(rx) => rx,
            Err(err) => {
                warn!(board_id = %board_id, "realtime subscription failed: {err}");
                let _ = self.events.send(ClientEvent::SubscriptionLost {
                    message: err.to_string(),
                });
                return;
            }
        };

        let client = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        if should_refetch(&message, board_id, client.client_id) {
                            client.refetch(board_id).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Missed notifications; the refetch covers them all.
                        warn!(board_id = %board_id, skipped, "realtime receiver lagged");
                        client.refetch(board_id).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        let _ = client.events.send(ClientEvent::SubscriptionLost {
                            message: "realtime connection closed".to_string(),
                        });
                        break;
                    }
                }
            }
        });

        if let Some(old) = self.listener_task.lock().await.replace(task) {
            old.abort();
        }
    }

    /// Authoritative overwrite of the aggregate. May land while a local
    /// mutation's remote write is still pending; that is accepted.
    async fn refetch(&self, board_id: BoardId) {
        match self.datasource.fetch_board(board_id).await {
            Ok(mut board) => {
                board.normalize();
                self.store.replace(board, WriteOrigin::Refetch);
                let _ = self.events.send(ClientEvent::Refetched { board_id });
            }
            Err(err) => {
                warn!(board_id = %board_id, "refetch failed: {err}");
                let _ = self.events.send(ClientEvent::RefetchFailed {
                    message: err.to_string(),
                });
            }
        }
    }

    async fn announce(&self, board_id: BoardId) {
        let message = RealtimeMessage::BoardTouched {
            board_id,
            origin: self.client_id,
        };
        if let Err(err) = self.realtime.publish(&board_channel(board_id), &message).await {
            warn!(board_id = %board_id, "realtime announce failed: {err}");
        }
    }

    /// Two-phase mutation: apply locally on a working copy, replace the
    /// visible aggregate, then issue the remote write. The local phase is
    /// fully synchronous; the pre-mutation snapshot is restored on remote
    /// failure. `Applied::Noop` short-circuits without any state change or
    /// remote write.
    async fn mutate<T, Fut>(
        &self,
        action: &'static str,
        apply: impl FnOnce(&mut Board) -> Result<Applied<T>, MutationError>,
        remote: impl FnOnce(T) -> Fut,
    ) -> Result<(), MutationError>
    where
        Fut: std::future::Future<Output = anyhow::Result<()>>,
    {
        let snapshot = self.store.current().ok_or(MutationError::NoBoardOpen)?;
        let board_id = snapshot.id;
        let mut next = snapshot.clone();
        let payload = match apply(&mut next)? {
            Applied::Changed(payload) => payload,
            Applied::Noop => return Ok(()),
        };
        self.store.replace(next, WriteOrigin::LocalMutation);

        match remote(payload).await {
            Ok(()) => {
                self.announce(board_id).await;
                let _ = self.events.send(ClientEvent::MutationSucceeded { action });
                Ok(())
            }
            Err(source) => {
                warn!(board_id = %board_id, action, "remote write failed, rolling back: {source}");
                self.store.replace(snapshot, WriteOrigin::Rollback);
                let err = MutationError::RemoteWrite { action, source };
                let _ = self.events.send(ClientEvent::MutationFailed {
                    action,
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    // ---- cards ----

    /// Create a card in `list_id`. With no anchor the card is appended;
    /// with `insert_after` it lands between the sibling holding that
    /// position and the sibling's successor. An anchor no sibling holds
    /// (concurrently removed) degrades to append.
    pub async fn add_card(
        &self,
        list_id: ListId,
        content: impl Into<String>,
        insert_after: Option<f64>,
    ) -> Result<CardId, MutationError> {
        let content = content.into();
        let card_id = CardId::new();
        let ds = Arc::clone(&self.datasource);
        self.mutate(
            "add card",
            move |board| {
                let list = board
                    .list_mut(list_id)
                    .ok_or(MutationError::UnknownList(list_id))?;
                let (index, position) = match insert_after {
                    Some(anchor) => match list.cards.iter().position(|c| c.position == anchor) {
                        Some(i) => {
                            let after = list.cards.get(i + 1).map(|c| c.position);
                            (i + 1, position::between_position(Some(anchor), after))
                        }
                        None => (
                            list.cards.len(),
                            position::append_position(list.cards.iter().map(|c| c.position)),
                        ),
                    },
                    None => (
                        list.cards.len(),
                        position::append_position(list.cards.iter().map(|c| c.position)),
                    ),
                };
                let mut card = Card::new(list_id, content, position);
                card.id = card_id;
                list.cards.insert(index, card.clone());
                Ok(Applied::Changed(card))
            },
            |card| async move { ds.insert_card(&card).await },
        )
        .await?;
        Ok(card_id)
    }

    /// Move a card anywhere on the board into `dest_list_id`, before the
    /// given sibling or at the end. Dropping a card onto itself is a no-op:
    /// no snapshot, no remote write.
    pub async fn move_card(
        &self,
        card_id: CardId,
        dest_list_id: ListId,
        before: Option<CardId>,
    ) -> Result<(), MutationError> {
        if before == Some(card_id) {
            return Ok(());
        }
        let ds = Arc::clone(&self.datasource);
        self.mutate(
            "move card",
            move |board| {
                let mut card = board
                    .take_card(card_id)
                    .ok_or(MutationError::UnknownCard(card_id))?;
                let dest = board
                    .list_mut(dest_list_id)
                    .ok_or(MutationError::UnknownList(dest_list_id))?;
                let index = before
                    .and_then(|b| dest.cards.iter().position(|c| c.id == b))
                    .unwrap_or(dest.cards.len());
                let prev = index
                    .checked_sub(1)
                    .and_then(|i| dest.cards.get(i))
                    .map(|c| c.position);
                let next = dest.cards.get(index).map(|c| c.position);
                let position = position::between_position(prev, next);
                card.list_id = dest_list_id;
                card.position = position;
                dest.cards.insert(index, card);
                Ok(Applied::Changed(position))
            },
            |position| async move {
                ds.update_card(
                    card_id,
                    CardPatch {
                        list_id: Some(dest_list_id),
                        position: Some(position),
                        ..Default::default()
                    },
                )
                .await
            },
        )
        .await
    }

    pub async fn update_card(
        &self,
        card_id: CardId,
        patch: CardPatch,
    ) -> Result<(), MutationError> {
        let ds = Arc::clone(&self.datasource);
        self.mutate(
            "update card",
            move |board| {
                let card = board
                    .card_mut(card_id)
                    .ok_or(MutationError::UnknownCard(card_id))?;
                apply_card_patch(card, &patch);
                Ok(Applied::Changed(patch))
            },
            |patch| async move { ds.update_card(card_id, patch).await },
        )
        .await
    }

    /// Delete a card. Denormalized related-card summaries held by other
    /// cards are left alone; the next refetch reconciles them.
    pub async fn delete_card(&self, card_id: CardId) -> Result<(), MutationError> {
        let ds = Arc::clone(&self.datasource);
        self.mutate(
            "delete card",
            move |board| {
                board
                    .take_card(card_id)
                    .ok_or(MutationError::UnknownCard(card_id))?;
                Ok(Applied::Changed(()))
            },
            |()| async move { ds.delete_card(card_id).await },
        )
        .await
    }

    // ---- lists ----

    pub async fn add_list(&self, title: impl Into<String>) -> Result<ListId, MutationError> {
        let title = title.into();
        let list_id = ListId::new();
        let ds = Arc::clone(&self.datasource);
        self.mutate(
            "add list",
            move |board| {
                let position = position::append_position(board.lists.iter().map(|l| l.position));
                let mut list = List::new(board.id, title, position);
                list.id = list_id;
                board.lists.push(list.clone());
                Ok(Applied::Changed(list))
            },
            |list| async move { ds.insert_list(&list).await },
        )
        .await?;
        Ok(list_id)
    }

    /// Relocate a list among its siblings. Direction moves at either
    /// boundary of the sequence are no-ops.
    pub async fn move_list(
        &self,
        list_id: ListId,
        target: MoveListTarget,
    ) -> Result<(), MutationError> {
        let ds = Arc::clone(&self.datasource);
        self.mutate(
            "move list",
            move |board| {
                // Establish current order by position before any index math.
                board.normalize();
                let from = board
                    .lists
                    .iter()
                    .position(|l| l.id == list_id)
                    .ok_or(MutationError::UnknownList(list_id))?;
                if let MoveListTarget::NextTo(anchor) = target {
                    if anchor == list_id {
                        return Ok(Applied::Noop);
                    }
                }
                let mut list = board.lists.remove(from);
                // Indices below are in the remaining order, without `list`.
                let insert_at = match target {
                    MoveListTarget::Left => {
                        if from == 0 {
                            return Ok(Applied::Noop);
                        }
                        from - 1
                    }
                    MoveListTarget::Right => {
                        if from == board.lists.len() {
                            return Ok(Applied::Noop);
                        }
                        from + 1
                    }
                    MoveListTarget::NextTo(anchor) => {
                        let anchor_index = board
                            .lists
                            .iter()
                            .position(|l| l.id == anchor)
                            .ok_or(MutationError::UnknownList(anchor))?;
                        anchor_index + 1
                    }
                };
                let prev = insert_at
                    .checked_sub(1)
                    .and_then(|i| board.lists.get(i))
                    .map(|l| l.position);
                let next = board.lists.get(insert_at).map(|l| l.position);
                let position = position::between_position(prev, next);
                list.position = position;
                board.lists.insert(insert_at, list);
                Ok(Applied::Changed(position))
            },
            |position| async move {
                ds.update_list(
                    list_id,
                    ListPatch {
                        position: Some(position),
                        ..Default::default()
                    },
                )
                .await
            },
        )
        .await
    }

    pub async fn rename_list(
        &self,
        list_id: ListId,
        title: impl Into<String>,
    ) -> Result<(), MutationError> {
        let title = title.into();
        let ds = Arc::clone(&self.datasource);
        self.mutate(
            "rename list",
            move |board| {
                let list = board
                    .list_mut(list_id)
                    .ok_or(MutationError::UnknownList(list_id))?;
                let patch = ListPatch {
                    title: Some(title.clone()),
                    ..Default::default()
                };
                list.title = title;
                Ok(Applied::Changed(patch))
            },
            |patch| async move { ds.update_list(list_id, patch).await },
        )
        .await
    }

    pub async fn set_list_limit(
        &self,
        list_id: ListId,
        card_limit: Option<u32>,
    ) -> Result<(), MutationError> {
        let ds = Arc::clone(&self.datasource);
        self.mutate(
            "set list limit",
            move |board| {
                let list = board
                    .list_mut(list_id)
                    .ok_or(MutationError::UnknownList(list_id))?;
                list.card_limit = card_limit;
                Ok(Applied::Changed(()))
            },
            |()| async move {
                ds.update_list(
                    list_id,
                    ListPatch {
                        card_limit: Some(card_limit),
                        ..Default::default()
                    },
                )
                .await
            },
        )
        .await
    }

    /// Delete a list and, with it, its cards (the backend cascades).
    pub async fn delete_list(&self, list_id: ListId) -> Result<(), MutationError> {
        let ds = Arc::clone(&self.datasource);
        self.mutate(
            "delete list",
            move |board| {
                let index = board
                    .lists
                    .iter()
                    .position(|l| l.id == list_id)
                    .ok_or(MutationError::UnknownList(list_id))?;
                board.lists.remove(index);
                Ok(Applied::Changed(()))
            },
            |()| async move { ds.delete_list(list_id).await },
        )
        .await
    }

    // ---- labels ----

    pub async fn create_label(
        &self,
        name: Option<String>,
        color: impl Into<String>,
    ) -> Result<LabelId, MutationError> {
        let color = color.into();
        let label_id = LabelId::new();
        let ds = Arc::clone(&self.datasource);
        self.mutate(
            "create label",
            move |board| {
                let label = Label {
                    id: label_id,
                    name,
                    color,
                    board_id: board.id,
                };
                board.labels.push(label.clone());
                Ok(Applied::Changed(label))
            },
            |label| async move { ds.insert_label(&label).await },
        )
        .await?;
        Ok(label_id)
    }

    /// Update a label everywhere it appears: the board's palette and every
    /// card's denormalized copy.
    pub async fn update_label(
        &self,
        label_id: LabelId,
        patch: LabelPatch,
    ) -> Result<(), MutationError> {
        let ds = Arc::clone(&self.datasource);
        self.mutate(
            "update label",
            move |board| {
                if !board.labels.iter().any(|l| l.id == label_id) {
                    return Err(MutationError::UnknownLabel(label_id));
                }
                fn apply(label: &mut Label, patch: &LabelPatch) {
                    if let Some(name) = &patch.name {
                        label.name = name.clone();
                    }
                    if let Some(color) = &patch.color {
                        label.color = color.clone();
                    }
                }
                for label in board.labels.iter_mut().filter(|l| l.id == label_id) {
                    apply(label, &patch);
                }
                for list in &mut board.lists {
                    for card in &mut list.cards {
                        for label in card.labels.iter_mut().filter(|l| l.id == label_id) {
                            apply(label, &patch);
                        }
                    }
                }
                Ok(Applied::Changed(patch))
            },
            |patch| async move { ds.update_label(label_id, patch).await },
        )
        .await
    }

    pub async fn delete_label(&self, label_id: LabelId) -> Result<(), MutationError> {
        let ds = Arc::clone(&self.datasource);
        self.mutate(
            "delete label",
            move |board| {
                let index = board
                    .labels
                    .iter()
                    .position(|l| l.id == label_id)
                    .ok_or(MutationError::UnknownLabel(label_id))?;
                board.labels.remove(index);
                for list in &mut board.lists {
                    for card in &mut list.cards {
                        card.labels.retain(|l| l.id != label_id);
                    }
                }
                Ok(Applied::Changed(()))
            },
            |()| async move { ds.delete_label(label_id).await },
        )
        .await
    }

    /// Add the label to the card, or remove it if already present.
    pub async fn toggle_card_label(
        &self,
        card_id: CardId,
        label_id: LabelId,
    ) -> Result<(), MutationError> {
        let ds = Arc::clone(&self.datasource);
        self.mutate(
            "toggle label",
            move |board| {
                let label = board
                    .labels
                    .iter()
                    .find(|l| l.id == label_id)
                    .cloned()
                    .ok_or(MutationError::UnknownLabel(label_id))?;
                let card = board
                    .card_mut(card_id)
                    .ok_or(MutationError::UnknownCard(card_id))?;
                if let Some(index) = card.labels.iter().position(|l| l.id == label_id) {
                    card.labels.remove(index);
                    Ok(Applied::Changed(false))
                } else {
                    card.labels.push(label);
                    Ok(Applied::Changed(true))
                }
            },
            |linked| async move {
                if linked {
                    ds.link_card_label(card_id, label_id).await
                } else {
                    ds.unlink_card_label(card_id, label_id).await
                }
            },
        )
        .await
    }

    // ---- relations ----

    /// Relate two cards. Only the initiating card's summary list is updated
    /// locally; the counterpart's copy appears on the next refetch.
    pub async fn add_relation(
        &self,
        card_id: CardId,
        related_id: CardId,
    ) -> Result<(), MutationError> {
        if card_id == related_id {
            return Ok(());
        }
        let ds = Arc::clone(&self.datasource);
        self.mutate(
            "add relation",
            move |board| {
                let related = board
                    .lists
                    .iter()
                    .find_map(|l| {
                        l.cards
                            .iter()
                            .find(|c| c.id == related_id)
                            .map(|c| (c.content.clone(), l.title.clone()))
                    })
                    .ok_or(MutationError::UnknownCard(related_id))?;
                let card = board
                    .card_mut(card_id)
                    .ok_or(MutationError::UnknownCard(card_id))?;
                if card.related_cards.iter().any(|r| r.id == related_id) {
                    return Ok(Applied::Noop);
                }
                card.related_cards.push(RelatedCardSummary {
                    id: related_id,
                    content: related.0,
                    list_title: related.1,
                });
                Ok(Applied::Changed(()))
            },
            |()| async move { ds.insert_relation(card_id, related_id).await },
        )
        .await
    }

    pub async fn remove_relation(
        &self,
        card_id: CardId,
        related_id: CardId,
    ) -> Result<(), MutationError> {
        let ds = Arc::clone(&self.datasource);
        self.mutate(
            "remove relation",
            move |board| {
                let card = board
                    .card_mut(card_id)
                    .ok_or(MutationError::UnknownCard(card_id))?;
                let index = card
                    .related_cards
                    .iter()
                    .position(|r| r.id == related_id)
                    .ok_or(MutationError::UnknownRelation {
                        card_id,
                        related_id,
                    })?;
                card.related_cards.remove(index);
                Ok(Applied::Changed(()))
            },
            |()| async move { ds.delete_relation(card_id, related_id).await },
        )
        .await
    }

    // ---- comments ----

    pub async fn add_comment(
        &self,
        card_id: CardId,
        author: UserProfile,
        content: impl Into<String>,
    ) -> Result<CommentId, MutationError> {
        let content = content.into();
        let comment_id = CommentId::new();
        let now = Utc::now();
        let ds = Arc::clone(&self.datasource);
        self.mutate(
            "add comment",
            move |board| {
                let card = board
                    .card_mut(card_id)
                    .ok_or(MutationError::UnknownCard(card_id))?;
                let comment = Comment {
                    id: comment_id,
                    content,
                    created_at: now,
                    updated_at: now,
                    user_id: author.id,
                    user: author,
                };
                card.comments.push(comment.clone());
                Ok(Applied::Changed(comment))
            },
            |comment| async move { ds.insert_comment(card_id, &comment).await },
        )
        .await?;
        Ok(comment_id)
    }

    pub async fn delete_comment(&self, comment_id: CommentId) -> Result<(), MutationError> {
        let ds = Arc::clone(&self.datasource);
        self.mutate(
            "delete comment",
            move |board| {
                for list in &mut board.lists {
                    for card in &mut list.cards {
                        if let Some(index) =
                            card.comments.iter().position(|c| c.id == comment_id)
                        {
                            card.comments.remove(index);
                            return Ok(Applied::Changed(()));
                        }
                    }
                }
                Err(MutationError::UnknownComment(comment_id))
            },
            |()| async move { ds.delete_comment(comment_id).await },
        )
        .await
    }

    // ---- checklists ----

    pub async fn add_checklist(
        &self,
        card_id: CardId,
        title: impl Into<String>,
    ) -> Result<ChecklistId, MutationError> {
        let title = title.into();
        let checklist_id = ChecklistId::new();
        let ds = Arc::clone(&self.datasource);
        self.mutate(
            "add checklist",
            move |board| {
                let card = board
                    .card_mut(card_id)
                    .ok_or(MutationError::UnknownCard(card_id))?;
                let position =
                    position::append_position(card.checklists.iter().map(|c| c.position));
                let checklist = Checklist {
                    id: checklist_id,
                    title,
                    position,
                    card_id,
                    items: Vec::new(),
                };
                card.checklists.push(checklist.clone());
                Ok(Applied::Changed(checklist))
            },
            |checklist| async move { ds.insert_checklist(&checklist).await },
        )
        .await?;
        Ok(checklist_id)
    }

    pub async fn delete_checklist(&self, checklist_id: ChecklistId) -> Result<(), MutationError> {
        let ds = Arc::clone(&self.datasource);
        self.mutate(
            "delete checklist",
            move |board| {
                for list in &mut board.lists {
                    for card in &mut list.cards {
                        if let Some(index) =
                            card.checklists.iter().position(|c| c.id == checklist_id)
                        {
                            card.checklists.remove(index);
                            return Ok(Applied::Changed(()));
                        }
                    }
                }
                Err(MutationError::UnknownChecklist(checklist_id))
            },
            |()| async move { ds.delete_checklist(checklist_id).await },
        )
        .await
    }

    pub async fn add_checklist_item(
        &self,
        checklist_id: ChecklistId,
        content: impl Into<String>,
    ) -> Result<ChecklistItemId, MutationError> {
        let content = content.into();
        let item_id = ChecklistItemId::new();
        let ds = Arc::clone(&self.datasource);
        self.mutate(
            "add checklist item",
            move |board| {
                let checklist = board
                    .checklist_mut(checklist_id)
                    .ok_or(MutationError::UnknownChecklist(checklist_id))?;
                let position =
                    position::append_position(checklist.items.iter().map(|i| i.position));
                let item = ChecklistItem {
                    id: item_id,
                    content,
                    is_completed: false,
                    position,
                    checklist_id,
                };
                checklist.items.push(item.clone());
                Ok(Applied::Changed(item))
            },
            |item| async move { ds.insert_checklist_item(&item).await },
        )
        .await?;
        Ok(item_id)
    }

    pub async fn set_checklist_item_completed(
        &self,
        item_id: ChecklistItemId,
        is_completed: bool,
    ) -> Result<(), MutationError> {
        let ds = Arc::clone(&self.datasource);
        self.mutate(
            "update checklist item",
            move |board| {
                let item = board
                    .checklist_item_mut(item_id)
                    .ok_or(MutationError::UnknownChecklistItem(item_id))?;
                item.is_completed = is_completed;
                Ok(Applied::Changed(()))
            },
            |()| async move {
                ds.update_checklist_item(
                    item_id,
                    ChecklistItemPatch {
                        is_completed: Some(is_completed),
                        ..Default::default()
                    },
                )
                .await
            },
        )
        .await
    }

    pub async fn delete_checklist_item(
        &self,
        item_id: ChecklistItemId,
    ) -> Result<(), MutationError> {
        let ds = Arc::clone(&self.datasource);
        self.mutate(
            "delete checklist item",
            move |board| {
                for list in &mut board.lists {
                    for card in &mut list.cards {
                        for checklist in &mut card.checklists {
                            if let Some(index) =
                                checklist.items.iter().position(|i| i.id == item_id)
                            {
                                checklist.items.remove(index);
                                return Ok(Applied::Changed(()));
                            }
                        }
                    }
                }
                Err(MutationError::UnknownChecklistItem(item_id))
            },
            |()| async move { ds.delete_checklist_item(item_id).await },
        )
        .await
    }

    // ---- attachments ----

    /// Upload the bytes, then optimistically insert the attachment row. The
    /// upload happens first so a row never points at a missing object; an
    /// upload failure leaves local state untouched.
    pub async fn attach_file(
        &self,
        card_id: CardId,
        file_name: impl Into<String>,
        file_type: Option<String>,
        bytes: Vec<u8>,
    ) -> Result<AttachmentId, MutationError> {
        let file_name = file_name.into();
        let attachment_id = AttachmentId::new();
        let file_path = format!("{card_id}/{attachment_id}/{file_name}");
        self.objects
            .upload(ATTACHMENTS_BUCKET, &file_path, bytes)
            .await
            .map_err(MutationError::Upload)?;

        let created_at = Utc::now();
        let ds = Arc::clone(&self.datasource);
        self.mutate(
            "attach file",
            move |board| {
                let card = board
                    .card_mut(card_id)
                    .ok_or(MutationError::UnknownCard(card_id))?;
                let attachment = Attachment {
                    id: attachment_id,
                    card_id,
                    file_path,
                    file_name,
                    file_type,
                    created_at,
                };
                card.attachments.push(attachment.clone());
                Ok(Applied::Changed(attachment))
            },
            |attachment| async move { ds.insert_attachment(&attachment).await },
        )
        .await?;
        Ok(attachment_id)
    }

    pub async fn delete_attachment(
        &self,
        attachment_id: AttachmentId,
    ) -> Result<(), MutationError> {
        let ds = Arc::clone(&self.datasource);
        let objects = Arc::clone(&self.objects);
        self.mutate(
            "delete attachment",
            move |board| {
                for list in &mut board.lists {
                    for card in &mut list.cards {
                        if let Some(index) =
                            card.attachments.iter().position(|a| a.id == attachment_id)
                        {
                            let attachment = card.attachments.remove(index);
                            return Ok(Applied::Changed(attachment.file_path));
                        }
                    }
                }
                Err(MutationError::UnknownAttachment(attachment_id))
            },
            |file_path| async move {
                ds.delete_attachment(attachment_id).await?;
                // Best effort: a stranded object is invisible to the board.
                if let Err(err) = objects.remove(ATTACHMENTS_BUCKET, &[file_path]).await {
                    warn!(attachment_id = %attachment_id, "attachment object removal failed: {err}");
                }
                Ok(())
            },
        )
        .await
    }

    // ---- board fields ----

    pub async fn rename_board(&self, name: impl Into<String>) -> Result<(), MutationError> {
        let name = name.into();
        let ds = Arc::clone(&self.datasource);
        self.mutate(
            "rename board",
            move |board| {
                board.name = name.clone();
                Ok(Applied::Changed((
                    board.id,
                    BoardPatch {
                        name: Some(name),
                        ..Default::default()
                    },
                )))
            },
            |(board_id, patch)| async move { ds.update_board(board_id, patch).await },
        )
        .await
    }

    pub async fn set_background(
        &self,
        background_config: Option<BackgroundConfig>,
    ) -> Result<(), MutationError> {
        let ds = Arc::clone(&self.datasource);
        self.mutate(
            "update background",
            move |board| {
                board.background_config = background_config.clone();
                Ok(Applied::Changed((
                    board.id,
                    BoardPatch {
                        background_config: Some(background_config),
                        ..Default::default()
                    },
                )))
            },
            |(board_id, patch)| async move { ds.update_board(board_id, patch).await },
        )
        .await
    }

    /// Soft-delete (close) or restore the board.
    pub async fn set_closed(&self, is_closed: bool) -> Result<(), MutationError> {
        let ds = Arc::clone(&self.datasource);
        self.mutate(
            "update board",
            move |board| {
                board.is_closed = is_closed;
                Ok(Applied::Changed((
                    board.id,
                    BoardPatch {
                        is_closed: Some(is_closed),
                        ..Default::default()
                    },
                )))
            },
            |(board_id, patch)| async move { ds.update_board(board_id, patch).await },
        )
        .await
    }

    // ---- drag and drop ----

    /// Dispatch a completed drop gesture to the corresponding move.
    pub async fn apply_drop(&self, intent: DropIntent) -> Result<(), MutationError> {
        match intent {
            DropIntent::MoveCard {
                card_id,
                dest_list_id,
                before,
            } => self.move_card(card_id, dest_list_id, before).await,
            DropIntent::MoveList { list_id, target } => self.move_list(list_id, target).await,
        }
    }
}

fn apply_card_patch(card: &mut Card, patch: &CardPatch) {
    if let Some(content) = &patch.content {
        card.content = content.clone();
    }
    if let Some(description) = &patch.description {
        card.description = description.clone();
    }
    if let Some(start_date) = &patch.start_date {
        card.start_date = *start_date;
    }
    if let Some(due_date) = &patch.due_date {
        card.due_date = *due_date;
    }
    if let Some(is_completed) = patch.is_completed {
        card.is_completed = is_completed;
    }
    if let Some(cover_config) = &patch.cover_config {
        card.cover_config = cover_config.clone();
    }
    // list_id and position describe moves and are only set by move_card.
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
