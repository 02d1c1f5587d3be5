//! Trait seams for the external datastore and object storage collaborators.
//!
//! The engine never talks to a concrete backend directly; every remote write
//! the optimistic executor issues goes through [`BoardDataSource`]. Patch
//! structs use double-`Option` fields where the backend distinguishes
//! "leave unchanged" (outer `None`) from "set to null" (`Some(None)`), which
//! serde serializes as an absent field vs. an explicit `null`.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::domain::{
    Attachment, AttachmentId, BackgroundConfig, Board, BoardId, Card, CardId, Checklist,
    ChecklistId, ChecklistItem, ChecklistItemId, Comment, CommentId, CoverConfig, Label, LabelId,
    List, ListId,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoardPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_config: Option<Option<BackgroundConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_closed: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_limit: Option<Option<u32>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CardPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<Option<DateTime<Utc>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<Option<DateTime<Utc>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_completed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_config: Option<Option<CoverConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_id: Option<ListId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChecklistItemPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_completed: Option<bool>,
}

/// Row-level interface to the hosted datastore. Inserts carry client-minted
/// ids, so no created row needs to round-trip back.
#[async_trait]
pub trait BoardDataSource: Send + Sync {
    /// Fetch the full nested aggregate for one board. Callers normalize
    /// ordering; implementations only assemble the rows.
    async fn fetch_board(&self, board_id: BoardId) -> Result<Board>;

    async fn update_board(&self, board_id: BoardId, patch: BoardPatch) -> Result<()>;

    async fn insert_list(&self, list: &List) -> Result<()>;
    async fn update_list(&self, list_id: ListId, patch: ListPatch) -> Result<()>;
    /// Deleting a list cascades its cards on the backend.
    async fn delete_list(&self, list_id: ListId) -> Result<()>;

    async fn insert_card(&self, card: &Card) -> Result<()>;
    async fn update_card(&self, card_id: CardId, patch: CardPatch) -> Result<()>;
    async fn delete_card(&self, card_id: CardId) -> Result<()>;

    async fn insert_label(&self, label: &Label) -> Result<()>;
    async fn update_label(&self, label_id: LabelId, patch: LabelPatch) -> Result<()>;
    async fn delete_label(&self, label_id: LabelId) -> Result<()>;
    async fn link_card_label(&self, card_id: CardId, label_id: LabelId) -> Result<()>;
    async fn unlink_card_label(&self, card_id: CardId, label_id: LabelId) -> Result<()>;

    /// The relation pair is stored once; lookups match either side.
    async fn insert_relation(&self, card1_id: CardId, card2_id: CardId) -> Result<()>;
    async fn delete_relation(&self, card1_id: CardId, card2_id: CardId) -> Result<()>;

    async fn insert_checklist(&self, checklist: &Checklist) -> Result<()>;
    async fn delete_checklist(&self, checklist_id: ChecklistId) -> Result<()>;
    async fn insert_checklist_item(&self, item: &ChecklistItem) -> Result<()>;
    async fn update_checklist_item(
        &self,
        item_id: ChecklistItemId,
        patch: ChecklistItemPatch,
    ) -> Result<()>;
    async fn delete_checklist_item(&self, item_id: ChecklistItemId) -> Result<()>;

    async fn insert_attachment(&self, attachment: &Attachment) -> Result<()>;
    async fn delete_attachment(&self, attachment_id: AttachmentId) -> Result<()>;

    async fn insert_comment(&self, card_id: CardId, comment: &Comment) -> Result<()>;
    async fn delete_comment(&self, comment_id: CommentId) -> Result<()>;
}

/// Binary object storage for attachments, covers and backgrounds.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(&self, bucket: &str, path: &str, bytes: Vec<u8>) -> Result<()>;
    async fn download(&self, bucket: &str, path: &str) -> Result<Vec<u8>>;
    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<()>;
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;
}

/// Null datasource: every call fails. Used where a client is constructed
/// before its backend wiring exists.
pub struct MissingDataSource;

macro_rules! missing {
    ($what:literal) => {
        Err(anyhow!(concat!("datastore unavailable: ", $what)))
    };
}

#[async_trait]
impl BoardDataSource for MissingDataSource {
    async fn fetch_board(&self, _board_id: BoardId) -> Result<Board> {
        missing!("fetch_board")
    }

    async fn update_board(&self, _board_id: BoardId, _patch: BoardPatch) -> Result<()> {
        missing!("update_board")
    }

    async fn insert_list(&self, _list: &List) -> Result<()> {
        missing!("insert_list")
    }

    async fn update_list(&self, _list_id: ListId, _patch: ListPatch) -> Result<()> {
        missing!("update_list")
    }

    async fn delete_list(&self, _list_id: ListId) -> Result<()> {
        missing!("delete_list")
    }

    async fn insert_card(&self, _card: &Card) -> Result<()> {
        missing!("insert_card")
    }

    async fn update_card(&self, _card_id: CardId, _patch: CardPatch) -> Result<()> {
        missing!("update_card")
    }

    async fn delete_card(&self, _card_id: CardId) -> Result<()> {
        missing!("delete_card")
    }

    async fn insert_label(&self, _label: &Label) -> Result<()> {
        missing!("insert_label")
    }

    async fn update_label(&self, _label_id: LabelId, _patch: LabelPatch) -> Result<()> {
        missing!("update_label")
    }

    async fn delete_label(&self, _label_id: LabelId) -> Result<()> {
        missing!("delete_label")
    }

    async fn link_card_label(&self, _card_id: CardId, _label_id: LabelId) -> Result<()> {
        missing!("link_card_label")
    }

    async fn unlink_card_label(&self, _card_id: CardId, _label_id: LabelId) -> Result<()> {
        missing!("unlink_card_label")
    }

    async fn insert_relation(&self, _card1_id: CardId, _card2_id: CardId) -> Result<()> {
        missing!("insert_relation")
    }

    async fn delete_relation(&self, _card1_id: CardId, _card2_id: CardId) -> Result<()> {
        missing!("delete_relation")
    }

    async fn insert_checklist(&self, _checklist: &Checklist) -> Result<()> {
        missing!("insert_checklist")
    }

    async fn delete_checklist(&self, _checklist_id: ChecklistId) -> Result<()> {
        missing!("delete_checklist")
    }

    async fn insert_checklist_item(&self, _item: &ChecklistItem) -> Result<()> {
        missing!("insert_checklist_item")
    }

    async fn update_checklist_item(
        &self,
        _item_id: ChecklistItemId,
        _patch: ChecklistItemPatch,
    ) -> Result<()> {
        missing!("update_checklist_item")
    }

    async fn delete_checklist_item(&self, _item_id: ChecklistItemId) -> Result<()> {
        missing!("delete_checklist_item")
    }

    async fn insert_attachment(&self, _attachment: &Attachment) -> Result<()> {
        missing!("insert_attachment")
    }

    async fn delete_attachment(&self, _attachment_id: AttachmentId) -> Result<()> {
        missing!("delete_attachment")
    }

    async fn insert_comment(&self, _card_id: CardId, _comment: &Comment) -> Result<()> {
        missing!("insert_comment")
    }

    async fn delete_comment(&self, _comment_id: CommentId) -> Result<()> {
        missing!("delete_comment")
    }
}

/// Null object storage: every call fails.
pub struct MissingObjectStore;

#[async_trait]
impl ObjectStore for MissingObjectStore {
    async fn upload(&self, _bucket: &str, _path: &str, _bytes: Vec<u8>) -> Result<()> {
        Err(anyhow!("object storage unavailable: upload"))
    }

    async fn download(&self, _bucket: &str, _path: &str) -> Result<Vec<u8>> {
        Err(anyhow!("object storage unavailable: download"))
    }

    async fn remove(&self, _bucket: &str, _paths: &[String]) -> Result<()> {
        Err(anyhow!("object storage unavailable: remove"))
    }

    async fn list(&self, _bucket: &str, _prefix: &str) -> Result<Vec<String>> {
        Err(anyhow!("object storage unavailable: list"))
    }
}
