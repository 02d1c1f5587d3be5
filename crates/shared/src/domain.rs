use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ClientId);
id_newtype!(BoardId);
id_newtype!(ListId);
id_newtype!(CardId);
id_newtype!(LabelId);
id_newtype!(ChecklistId);
id_newtype!(ChecklistItemId);
id_newtype!(AttachmentId);
id_newtype!(CommentId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Owner,
    Editor,
    Viewer,
}

/// Visual background of a board: a flat color, a hosted image from the image
/// search proxy, or an image the user uploaded to object storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackgroundConfig {
    Color {
        color: String,
    },
    Image {
        full_url: String,
        thumb_url: String,
        user_name: String,
        user_link: String,
    },
    CustomImage {
        path: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverSize {
    Full,
    Header,
}

/// Card cover: a background config plus how much of the card it occupies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverConfig {
    #[serde(flatten)]
    pub background: BackgroundConfig,
    pub size: CoverSize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub id: LabelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub color: String,
    pub board_id: BoardId,
}

/// Denormalized summary of a related card: enough to render a link chip
/// without holding the full card. The authoritative copy lives in the
/// relations join table; local copies are reconciled on refetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedCardSummary {
    pub id: CardId,
    pub content: String,
    pub list_title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub id: ChecklistItemId,
    pub content: String,
    pub is_completed: bool,
    pub position: f64,
    pub checklist_id: ChecklistId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checklist {
    pub id: ChecklistId,
    pub title: String,
    pub position: f64,
    pub card_id: CardId,
    #[serde(default)]
    pub items: Vec<ChecklistItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: AttachmentId,
    pub card_id: CardId,
    pub file_path: String,
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardMember {
    pub user_id: UserId,
    pub role: MemberRole,
    pub user: UserProfile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub user_id: UserId,
    pub user: UserProfile,
}

/// A unit of work within a list. `position` is a fractional sort key, not an
/// index: ordering among siblings is always re-derived by sorting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub id: CardId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    pub position: f64,
    pub list_id: ListId,
    pub is_completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_config: Option<CoverConfig>,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub related_cards: Vec<RelatedCardSummary>,
    #[serde(default)]
    pub checklists: Vec<Checklist>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

impl Card {
    /// A freshly created card with empty metadata collections.
    pub fn new(list_id: ListId, content: impl Into<String>, position: f64) -> Self {
        Self {
            id: CardId::new(),
            content: content.into(),
            description: None,
            start_date: None,
            due_date: None,
            position,
            list_id,
            is_completed: false,
            cover_config: None,
            labels: Vec::new(),
            related_cards: Vec::new(),
            checklists: Vec::new(),
            attachments: Vec::new(),
            comments: Vec::new(),
        }
    }
}

/// An ordered column of cards. The `cards` vec is kept sorted by position,
/// but sibling positions remain the source of truth for ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct List {
    pub id: ListId,
    pub title: String,
    pub position: f64,
    pub board_id: BoardId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_limit: Option<u32>,
    #[serde(default)]
    pub cards: Vec<Card>,
}

impl List {
    pub fn new(board_id: BoardId, title: impl Into<String>, position: f64) -> Self {
        Self {
            id: ListId::new(),
            title: title.into(),
            position,
            board_id,
            card_limit: None,
            cards: Vec::new(),
        }
    }
}

/// Top-level aggregate: lists, labels and members of one board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Board {
    pub id: BoardId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_config: Option<BackgroundConfig>,
    #[serde(default)]
    pub is_closed: bool,
    #[serde(default)]
    pub lists: Vec<List>,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub members: Vec<BoardMember>,
}

fn by_position(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

impl Board {
    /// Re-derive every ordering from positions. Sorts are stable, so
    /// transient position ties (possible during concurrent inserts) keep
    /// insertion order instead of flapping.
    pub fn normalize(&mut self) {
        self.lists.sort_by(|a, b| by_position(a.position, b.position));
        for list in &mut self.lists {
            list.cards.sort_by(|a, b| by_position(a.position, b.position));
            for card in &mut list.cards {
                card.checklists
                    .sort_by(|a, b| by_position(a.position, b.position));
                for checklist in &mut card.checklists {
                    checklist
                        .items
                        .sort_by(|a, b| by_position(a.position, b.position));
                }
            }
        }
    }

    pub fn list(&self, id: ListId) -> Option<&List> {
        self.lists.iter().find(|l| l.id == id)
    }

    pub fn list_mut(&mut self, id: ListId) -> Option<&mut List> {
        self.lists.iter_mut().find(|l| l.id == id)
    }

    /// Find a card anywhere on the board.
    pub fn card(&self, id: CardId) -> Option<&Card> {
        self.lists
            .iter()
            .find_map(|l| l.cards.iter().find(|c| c.id == id))
    }

    pub fn card_mut(&mut self, id: CardId) -> Option<&mut Card> {
        self.lists
            .iter_mut()
            .find_map(|l| l.cards.iter_mut().find(|c| c.id == id))
    }

    /// Remove a card from whichever list currently owns it.
    pub fn take_card(&mut self, id: CardId) -> Option<Card> {
        for list in &mut self.lists {
            if let Some(index) = list.cards.iter().position(|c| c.id == id) {
                return Some(list.cards.remove(index));
            }
        }
        None
    }

    pub fn checklist_mut(&mut self, id: ChecklistId) -> Option<&mut Checklist> {
        self.lists.iter_mut().find_map(|l| {
            l.cards
                .iter_mut()
                .find_map(|c| c.checklists.iter_mut().find(|cl| cl.id == id))
        })
    }

    pub fn checklist_item_mut(&mut self, id: ChecklistItemId) -> Option<&mut ChecklistItem> {
        self.lists.iter_mut().find_map(|l| {
            l.cards.iter_mut().find_map(|c| {
                c.checklists
                    .iter_mut()
                    .find_map(|cl| cl.items.iter_mut().find(|item| item.id == id))
            })
        })
    }
}
