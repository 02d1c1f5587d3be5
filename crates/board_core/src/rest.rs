//! PostgREST-style datastore adapter.
//!
//! Rows live in a hosted relational store exposed over HTTP: nested selects
//! assemble the board aggregate in one round trip, inserts POST rows with
//! client-minted ids, partial updates PATCH behind `id=eq.{id}` filters, and
//! join-table rows are deleted by match predicates. An object-storage
//! endpoint next to it serves attachment and background binaries.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared::domain::{
    Attachment, AttachmentId, BackgroundConfig, Board, BoardId, BoardMember, Card, CardId,
    Checklist, ChecklistId, ChecklistItem, ChecklistItemId, Comment, CommentId, CoverConfig,
    Label, LabelId, List, ListId,
};
use shared::error::{ApiError, ApiException, ErrorCode};
use url::Url;

use crate::datasource::{
    BoardDataSource, BoardPatch, CardPatch, ChecklistItemPatch, LabelPatch, ListPatch,
    ObjectStore,
};

/// Nested select assembling the whole aggregate, mirroring the relational
/// schema: labels and members hang off the board, cards carry their join
/// tables, and relations are fetched from both sides.
const BOARD_SELECT: &str = concat!(
    "id,name,background_config,is_closed,",
    "labels(*),",
    "members:board_members(user_id,role,user:profiles(*)),",
    "lists(id,title,position,board_id,card_limit,",
    "cards(id,content,description,start_date,due_date,position,list_id,",
    "is_completed,cover_config,",
    "card_labels(labels(*)),",
    "relations_as_card1:card_relations!card1_id(card2:cards!card2_id(id,content,list:lists(title))),",
    "relations_as_card2:card_relations!card2_id(card1:cards!card1_id(id,content,list:lists(title))),",
    "checklists(*,items:checklist_items(*)),",
    "attachments(*),",
    "comments(*,user:profiles(*))))"
);

pub struct RestDataSource {
    http: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl RestDataSource {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid datastore base url")?;
        Ok(Self {
            http: Client::new(),
            base_url,
            api_key,
        })
    }

    fn table_url(&self, table: &str) -> Result<Url> {
        self.base_url
            .join(table)
            .with_context(|| format!("invalid table endpoint: {table}"))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let mut builder = self.http.request(method, url);
        if let Some(key) = &self.api_key {
            builder = builder
                .header("apikey", key)
                .header(header::AUTHORIZATION, format!("Bearer {key}"));
        }
        builder
    }

    async fn insert(&self, table: &str, body: serde_json::Value) -> Result<()> {
        let response = self
            .request(Method::POST, self.table_url(table)?)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("insert into {table} failed"))?;
        check(response, &format!("insert into {table}")).await?;
        Ok(())
    }

    async fn update<B: Serialize>(
        &self,
        table: &str,
        filters: &[(&str, String)],
        body: &B,
    ) -> Result<()> {
        let response = self
            .request(Method::PATCH, self.table_url(table)?)
            .query(filters)
            .json(body)
            .send()
            .await
            .with_context(|| format!("update of {table} failed"))?;
        check(response, &format!("update of {table}")).await?;
        Ok(())
    }

    async fn delete(&self, table: &str, filters: &[(&str, String)]) -> Result<()> {
        let response = self
            .request(Method::DELETE, self.table_url(table)?)
            .query(filters)
            .send()
            .await
            .with_context(|| format!("delete from {table} failed"))?;
        check(response, &format!("delete from {table}")).await?;
        Ok(())
    }
}

/// Turn a rejected response into a structured [`ApiException`]. The
/// datastore reports errors as an [`ApiError`] JSON body; anything else is
/// mapped from the status code.
async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let exception = match serde_json::from_str::<ApiError>(&body) {
        Ok(api) => ApiException::new(api.code, api.message),
        Err(_) => {
            let message = if body.is_empty() {
                status.to_string()
            } else {
                body
            };
            ApiException::new(code_for_status(status), message)
        }
    };
    Err(anyhow::Error::new(exception).context(format!("{what} rejected")))
}

fn code_for_status(status: reqwest::StatusCode) -> ErrorCode {
    match status.as_u16() {
        400 | 422 => ErrorCode::Validation,
        401 => ErrorCode::Unauthorized,
        403 => ErrorCode::Forbidden,
        404 => ErrorCode::NotFound,
        409 => ErrorCode::Conflict,
        429 => ErrorCode::RateLimited,
        _ => ErrorCode::Internal,
    }
}

fn id_filter(id: impl std::fmt::Display) -> [(&'static str, String); 1] {
    [("id", format!("eq.{id}"))]
}

// Wire shapes for the nested select. Join-table rows are flattened into the
// domain aggregate before it leaves this module.

#[derive(Debug, Deserialize)]
struct BoardRow {
    id: BoardId,
    name: String,
    #[serde(default)]
    background_config: Option<BackgroundConfig>,
    #[serde(default)]
    is_closed: bool,
    #[serde(default)]
    labels: Vec<Label>,
    #[serde(default)]
    members: Vec<BoardMember>,
    #[serde(default)]
    lists: Vec<ListRow>,
}

#[derive(Debug, Deserialize)]
struct ListRow {
    id: ListId,
    title: String,
    position: f64,
    board_id: BoardId,
    #[serde(default)]
    card_limit: Option<u32>,
    #[serde(default)]
    cards: Vec<CardRow>,
}

#[derive(Debug, Deserialize)]
struct CardRow {
    id: CardId,
    content: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    due_date: Option<DateTime<Utc>>,
    position: f64,
    list_id: ListId,
    #[serde(default)]
    is_completed: bool,
    #[serde(default)]
    cover_config: Option<CoverConfig>,
    #[serde(default)]
    card_labels: Vec<CardLabelRow>,
    #[serde(default)]
    relations_as_card1: Vec<RelationAsCard1>,
    #[serde(default)]
    relations_as_card2: Vec<RelationAsCard2>,
    #[serde(default)]
    checklists: Vec<Checklist>,
    #[serde(default)]
    attachments: Vec<Attachment>,
    #[serde(default)]
    comments: Vec<Comment>,
}

#[derive(Debug, Deserialize)]
struct CardLabelRow {
    labels: Option<Label>,
}

#[derive(Debug, Deserialize)]
struct RelationAsCard1 {
    card2: RelatedRow,
}

#[derive(Debug, Deserialize)]
struct RelationAsCard2 {
    card1: RelatedRow,
}

#[derive(Debug, Deserialize)]
struct RelatedRow {
    id: CardId,
    content: String,
    list: ListTitleRow,
}

#[derive(Debug, Deserialize)]
struct ListTitleRow {
    title: String,
}

impl From<CardRow> for Card {
    fn from(row: CardRow) -> Self {
        let labels = row
            .card_labels
            .into_iter()
            .filter_map(|link| link.labels)
            .collect();
        let related_cards = row
            .relations_as_card1
            .into_iter()
            .map(|r| r.card2)
            .chain(row.relations_as_card2.into_iter().map(|r| r.card1))
            .map(|related| shared::domain::RelatedCardSummary {
                id: related.id,
                content: related.content,
                list_title: related.list.title,
            })
            .collect();
        Card {
            id: row.id,
            content: row.content,
            description: row.description,
            start_date: row.start_date,
            due_date: row.due_date,
            position: row.position,
            list_id: row.list_id,
            is_completed: row.is_completed,
            cover_config: row.cover_config,
            labels,
            related_cards,
            checklists: row.checklists,
            attachments: row.attachments,
            comments: row.comments,
        }
    }
}

impl From<BoardRow> for Board {
    fn from(row: BoardRow) -> Self {
        Board {
            id: row.id,
            name: row.name,
            background_config: row.background_config,
            is_closed: row.is_closed,
            labels: row.labels,
            members: row.members,
            lists: row
                .lists
                .into_iter()
                .map(|list| List {
                    id: list.id,
                    title: list.title,
                    position: list.position,
                    board_id: list.board_id,
                    card_limit: list.card_limit,
                    cards: list.cards.into_iter().map(Card::from).collect(),
                })
                .collect(),
        }
    }
}

#[async_trait]
impl BoardDataSource for RestDataSource {
    async fn fetch_board(&self, board_id: BoardId) -> Result<Board> {
        let response = self
            .request(Method::GET, self.table_url("boards")?)
            .query(&[
                ("id", format!("eq.{board_id}")),
                ("select", BOARD_SELECT.to_string()),
            ])
            // Single-object representation instead of a one-element array.
            .header(header::ACCEPT, "application/vnd.pgrst.object+json")
            .send()
            .await
            .context("board fetch failed")?;
        let row: BoardRow = check(response, "board fetch")
            .await?
            .json()
            .await
            .context("board fetch returned an undecodable aggregate")?;
        Ok(row.into())
    }

    async fn update_board(&self, board_id: BoardId, patch: BoardPatch) -> Result<()> {
        self.update("boards", &id_filter(board_id), &patch).await
    }

    async fn insert_list(&self, list: &List) -> Result<()> {
        self.insert(
            "lists",
            json!({
                "id": list.id,
                "title": list.title,
                "position": list.position,
                "board_id": list.board_id,
                "card_limit": list.card_limit,
            }),
        )
        .await
    }

    async fn update_list(&self, list_id: ListId, patch: ListPatch) -> Result<()> {
        self.update("lists", &id_filter(list_id), &patch).await
    }

    async fn delete_list(&self, list_id: ListId) -> Result<()> {
        self.delete("lists", &id_filter(list_id)).await
    }

    async fn insert_card(&self, card: &Card) -> Result<()> {
        self.insert(
            "cards",
            json!({
                "id": card.id,
                "content": card.content,
                "description": card.description,
                "start_date": card.start_date,
                "due_date": card.due_date,
                "position": card.position,
                "list_id": card.list_id,
                "is_completed": card.is_completed,
                "cover_config": card.cover_config,
            }),
        )
        .await
    }

    async fn update_card(&self, card_id: CardId, patch: CardPatch) -> Result<()> {
        self.update("cards", &id_filter(card_id), &patch).await
    }

    async fn delete_card(&self, card_id: CardId) -> Result<()> {
        self.delete("cards", &id_filter(card_id)).await
    }

    async fn insert_label(&self, label: &Label) -> Result<()> {
        self.insert(
            "labels",
            json!({
                "id": label.id,
                "name": label.name,
                "color": label.color,
                "board_id": label.board_id,
            }),
        )
        .await
    }

    async fn update_label(&self, label_id: LabelId, patch: LabelPatch) -> Result<()> {
        self.update("labels", &id_filter(label_id), &patch).await
    }

    async fn delete_label(&self, label_id: LabelId) -> Result<()> {
        self.delete("labels", &id_filter(label_id)).await
    }

    async fn link_card_label(&self, card_id: CardId, label_id: LabelId) -> Result<()> {
        self.insert(
            "card_labels",
            json!({ "card_id": card_id, "label_id": label_id }),
        )
        .await
    }

    async fn unlink_card_label(&self, card_id: CardId, label_id: LabelId) -> Result<()> {
        self.delete(
            "card_labels",
            &[
                ("card_id", format!("eq.{card_id}")),
                ("label_id", format!("eq.{label_id}")),
            ],
        )
        .await
    }

    async fn insert_relation(&self, card1_id: CardId, card2_id: CardId) -> Result<()> {
        self.insert(
            "card_relations",
            json!({ "card1_id": card1_id, "card2_id": card2_id }),
        )
        .await
    }

    async fn delete_relation(&self, card1_id: CardId, card2_id: CardId) -> Result<()> {
        // The pair is stored once in either orientation.
        self.delete(
            "card_relations",
            &[(
                "or",
                format!(
                    "(and(card1_id.eq.{card1_id},card2_id.eq.{card2_id}),\
                     and(card1_id.eq.{card2_id},card2_id.eq.{card1_id}))"
                ),
            )],
        )
        .await
    }

    async fn insert_checklist(&self, checklist: &Checklist) -> Result<()> {
        self.insert(
            "checklists",
            json!({
                "id": checklist.id,
                "title": checklist.title,
                "position": checklist.position,
                "card_id": checklist.card_id,
            }),
        )
        .await
    }

    async fn delete_checklist(&self, checklist_id: ChecklistId) -> Result<()> {
        self.delete("checklists", &id_filter(checklist_id)).await
    }

    async fn insert_checklist_item(&self, item: &ChecklistItem) -> Result<()> {
        self.insert(
            "checklist_items",
            json!({
                "id": item.id,
                "content": item.content,
                "is_completed": item.is_completed,
                "position": item.position,
                "checklist_id": item.checklist_id,
            }),
        )
        .await
    }

    async fn update_checklist_item(
        &self,
        item_id: ChecklistItemId,
        patch: ChecklistItemPatch,
    ) -> Result<()> {
        self.update("checklist_items", &id_filter(item_id), &patch)
            .await
    }

    async fn delete_checklist_item(&self, item_id: ChecklistItemId) -> Result<()> {
        self.delete("checklist_items", &id_filter(item_id)).await
    }

    async fn insert_attachment(&self, attachment: &Attachment) -> Result<()> {
        self.insert(
            "attachments",
            json!({
                "id": attachment.id,
                "card_id": attachment.card_id,
                "file_path": attachment.file_path,
                "file_name": attachment.file_name,
                "file_type": attachment.file_type,
                "created_at": attachment.created_at,
            }),
        )
        .await
    }

    async fn delete_attachment(&self, attachment_id: AttachmentId) -> Result<()> {
        self.delete("attachments", &id_filter(attachment_id)).await
    }

    async fn insert_comment(&self, card_id: CardId, comment: &Comment) -> Result<()> {
        self.insert(
            "comments",
            json!({
                "id": comment.id,
                "card_id": card_id,
                "content": comment.content,
                "created_at": comment.created_at,
                "updated_at": comment.updated_at,
                "user_id": comment.user_id,
            }),
        )
        .await
    }

    async fn delete_comment(&self, comment_id: CommentId) -> Result<()> {
        self.delete("comments", &id_filter(comment_id)).await
    }
}

/// Object storage served next to the datastore (`{base}/object/...`).
pub struct RestObjectStore {
    http: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl RestObjectStore {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid object storage base url")?;
        Ok(Self {
            http: Client::new(),
            base_url,
            api_key,
        })
    }

    fn object_url(&self, segments: &str) -> Result<Url> {
        self.base_url
            .join(segments)
            .with_context(|| format!("invalid object path: {segments}"))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let mut builder = self.http.request(method, url);
        if let Some(key) = &self.api_key {
            builder = builder
                .header("apikey", key)
                .header(header::AUTHORIZATION, format!("Bearer {key}"));
        }
        builder
    }
}

#[derive(Debug, Deserialize)]
struct ObjectEntry {
    name: String,
}

#[async_trait]
impl ObjectStore for RestObjectStore {
    async fn upload(&self, bucket: &str, path: &str, bytes: Vec<u8>) -> Result<()> {
        self.request(
            Method::POST,
            self.object_url(&format!("object/{bucket}/{path}"))?,
        )
        .header("x-upsert", "true")
        .body(bytes)
        .send()
        .await
        .context("object upload failed")?
        .error_for_status()
        .context("object upload rejected")?;
        Ok(())
    }

    async fn download(&self, bucket: &str, path: &str) -> Result<Vec<u8>> {
        let bytes = self
            .request(
                Method::GET,
                self.object_url(&format!("object/{bucket}/{path}"))?,
            )
            .send()
            .await
            .context("object download failed")?
            .error_for_status()
            .context("object download rejected")?
            .bytes()
            .await
            .context("object download body unreadable")?;
        Ok(bytes.to_vec())
    }

    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<()> {
        self.request(Method::DELETE, self.object_url(&format!("object/{bucket}"))?)
            .json(&json!({ "prefixes": paths }))
            .send()
            .await
            .context("object removal failed")?
            .error_for_status()
            .context("object removal rejected")?;
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let entries: Vec<ObjectEntry> = self
            .request(
                Method::POST,
                self.object_url(&format!("object/list/{bucket}"))?,
            )
            .json(&json!({ "prefix": prefix }))
            .send()
            .await
            .context("object listing failed")?
            .error_for_status()
            .context("object listing rejected")?
            .json()
            .await
            .context("object listing returned undecodable entries")?;
        Ok(entries.into_iter().map(|e| e.name).collect())
    }
}

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod tests;
