use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::domain::{
    Attachment, AttachmentId, Board, BoardId, Card, CardId, Checklist, ChecklistId, ChecklistItem,
    ChecklistItemId, Comment, CommentId, Label, LabelId, List, ListId,
};
use shared::protocol::RealtimeMessage;
use tokio::sync::{broadcast, Notify};
use tokio::time::timeout;

use super::*;

struct TestDataSource {
    board: StdMutex<Board>,
    calls: StdMutex<Vec<String>>,
    fail_on: StdMutex<HashSet<&'static str>>,
    // Card updates for this card block until the Notify fires.
    gated_card: StdMutex<Option<(CardId, Arc<Notify>)>>,
}

impl TestDataSource {
    fn new(board: Board) -> Arc<Self> {
        Arc::new(Self {
            board: StdMutex::new(board),
            calls: StdMutex::new(Vec::new()),
            fail_on: StdMutex::new(HashSet::new()),
            gated_card: StdMutex::new(None),
        })
    }

    fn fail(&self, method: &'static str) {
        self.fail_on.lock().unwrap().insert(method);
    }

    fn gate_card_update(&self, card_id: CardId) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gated_card.lock().unwrap() = Some((card_id, Arc::clone(&gate)));
        gate
    }

    fn set_board(&self, board: Board) {
        *self.board.lock().unwrap() = board;
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn call_count(&self, method: &str) -> usize {
        self.calls().iter().filter(|c| *c == method).count()
    }

    fn hit(&self, method: &'static str) -> Result<()> {
        self.calls.lock().unwrap().push(method.to_string());
        if self.fail_on.lock().unwrap().contains(method) {
            return Err(anyhow!("injected failure: {method}"));
        }
        Ok(())
    }
}

#[async_trait]
impl BoardDataSource for TestDataSource {
    async fn fetch_board(&self, _board_id: BoardId) -> Result<Board> {
        self.hit("fetch_board")?;
        Ok(self.board.lock().unwrap().clone())
    }

    async fn update_board(&self, _board_id: BoardId, _patch: BoardPatch) -> Result<()> {
        self.hit("update_board")
    }

    async fn insert_list(&self, _list: &List) -> Result<()> {
        self.hit("insert_list")
    }

    async fn update_list(&self, _list_id: ListId, _patch: ListPatch) -> Result<()> {
        self.hit("update_list")
    }

    async fn delete_list(&self, _list_id: ListId) -> Result<()> {
        self.hit("delete_list")
    }

    async fn insert_card(&self, card: &Card) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("insert_card:{}", card.position));
        if self.fail_on.lock().unwrap().contains("insert_card") {
            return Err(anyhow!("injected failure: insert_card"));
        }
        Ok(())
    }

    async fn update_card(&self, card_id: CardId, patch: CardPatch) -> Result<()> {
        let gate = {
            let mut gated = self.gated_card.lock().unwrap();
            match gated.take() {
                Some((gated_id, gate)) if gated_id == card_id => Some(gate),
                other => {
                    *gated = other;
                    None
                }
            }
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.calls.lock().unwrap().push(format!(
            "update_card:{}",
            patch.position.map(|p| p.to_string()).unwrap_or_default()
        ));
        if self.fail_on.lock().unwrap().contains("update_card") {
            return Err(anyhow!("injected failure: update_card"));
        }
        Ok(())
    }

    async fn delete_card(&self, _card_id: CardId) -> Result<()> {
        self.hit("delete_card")
    }

    async fn insert_label(&self, _label: &Label) -> Result<()> {
        self.hit("insert_label")
    }

    async fn update_label(&self, _label_id: LabelId, _patch: LabelPatch) -> Result<()> {
        self.hit("update_label")
    }

    async fn delete_label(&self, _label_id: LabelId) -> Result<()> {
        self.hit("delete_label")
    }

    async fn link_card_label(&self, _card_id: CardId, _label_id: LabelId) -> Result<()> {
        self.hit("link_card_label")
    }

    async fn unlink_card_label(&self, _card_id: CardId, _label_id: LabelId) -> Result<()> {
        self.hit("unlink_card_label")
    }

    async fn insert_relation(&self, _card1_id: CardId, _card2_id: CardId) -> Result<()> {
        self.hit("insert_relation")
    }

    async fn delete_relation(&self, _card1_id: CardId, _card2_id: CardId) -> Result<()> {
        self.hit("delete_relation")
    }

    async fn insert_checklist(&self, _checklist: &Checklist) -> Result<()> {
        self.hit("insert_checklist")
    }

    async fn delete_checklist(&self, _checklist_id: ChecklistId) -> Result<()> {
        self.hit("delete_checklist")
    }

    async fn insert_checklist_item(&self, _item: &ChecklistItem) -> Result<()> {
        self.hit("insert_checklist_item")
    }

    async fn update_checklist_item(
        &self,
        _item_id: ChecklistItemId,
        _patch: ChecklistItemPatch,
    ) -> Result<()> {
        self.hit("update_checklist_item")
    }

    async fn delete_checklist_item(&self, _item_id: ChecklistItemId) -> Result<()> {
        self.hit("delete_checklist_item")
    }

    async fn insert_attachment(&self, _attachment: &Attachment) -> Result<()> {
        self.hit("insert_attachment")
    }

    async fn delete_attachment(&self, _attachment_id: AttachmentId) -> Result<()> {
        self.hit("delete_attachment")
    }

    async fn insert_comment(&self, _card_id: CardId, _comment: &Comment) -> Result<()> {
        self.hit("insert_comment")
    }

    async fn delete_comment(&self, _comment_id: CommentId) -> Result<()> {
        self.hit("delete_comment")
    }
}

/// In-process transport: subscriptions share one broadcast channel and the
/// test injects peer messages by sending on it. Published messages are only
/// recorded, never echoed back.
struct TestRealtimeTransport {
    sender: broadcast::Sender<RealtimeMessage>,
    published: StdMutex<Vec<(String, RealtimeMessage)>>,
}

impl TestRealtimeTransport {
    fn new() -> Arc<Self> {
        let (sender, _) = broadcast::channel(64);
        Arc::new(Self {
            sender,
            published: StdMutex::new(Vec::new()),
        })
    }

    fn inject(&self, message: RealtimeMessage) {
        let _ = self.sender.send(message);
    }

    fn published(&self) -> Vec<(String, RealtimeMessage)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl RealtimeTransport for TestRealtimeTransport {
    async fn subscribe(&self, _channel: &str) -> Result<broadcast::Receiver<RealtimeMessage>> {
        Ok(self.sender.subscribe())
    }

    async fn publish(&self, channel: &str, message: &RealtimeMessage) -> Result<()> {
        self.published
            .lock()
            .unwrap()
            .push((channel.to_string(), message.clone()));
        Ok(())
    }
}

struct Fixture {
    board_id: BoardId,
    todo: ListId,
    done: ListId,
    card_a: CardId,
    card_b: CardId,
    board: Board,
}

/// Two lists: "Todo" (position 1) holding cards A (1) and B (2), and an
/// empty "Done" (position 2).
fn fixture() -> Fixture {
    let board_id = BoardId::new();
    let mut todo = List::new(board_id, "Todo", 1.0);
    let done = List::new(board_id, "Done", 2.0);
    let card_a = Card::new(todo.id, "A", 1.0);
    let card_b = Card::new(todo.id, "B", 2.0);
    let (a_id, b_id) = (card_a.id, card_b.id);
    todo.cards = vec![card_a, card_b];
    let fixture = Fixture {
        board_id,
        todo: todo.id,
        done: done.id,
        card_a: a_id,
        card_b: b_id,
        board: Board {
            id: board_id,
            name: "Project".to_string(),
            background_config: None,
            is_closed: false,
            lists: vec![todo, done],
            labels: Vec::new(),
            members: Vec::new(),
        },
    };
    fixture
}

async fn open_client(
    fixture: &Fixture,
) -> (
    Arc<BoardClient>,
    Arc<TestDataSource>,
    Arc<TestRealtimeTransport>,
) {
    let ds = TestDataSource::new(fixture.board.clone());
    let rt = TestRealtimeTransport::new();
    let client = BoardClient::new_with_dependencies(
        Arc::clone(&ds) as Arc<dyn BoardDataSource>,
        Arc::clone(&rt) as Arc<dyn RealtimeTransport>,
        Arc::new(MissingObjectStore),
    );
    client.open_board(fixture.board_id).await.unwrap();
    (client, ds, rt)
}

async fn wait_for_event(
    rx: &mut broadcast::Receiver<ClientEvent>,
    matches: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            let event = rx.recv().await.unwrap();
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn positions(board: &Board, list_id: ListId) -> Vec<f64> {
    board
        .list(list_id)
        .unwrap()
        .cards
        .iter()
        .map(|c| c.position)
        .collect()
}

#[tokio::test]
async fn failed_move_restores_the_snapshot() {
    let fx = fixture();
    let (client, ds, _rt) = open_client(&fx).await;
    let before = client.current_board().unwrap();
    let mut origins = client.store().subscribe();

    ds.fail("update_card");
    let err = client.move_card(fx.card_a, fx.done, None).await;
    assert!(matches!(err, Err(MutationError::RemoteWrite { .. })));

    // The optimistic write was visible, then rolled back wholesale.
    assert_eq!(origins.try_recv().unwrap().origin, WriteOrigin::LocalMutation);
    assert_eq!(origins.try_recv().unwrap().origin, WriteOrigin::Rollback);
    assert_eq!(client.current_board().unwrap(), before);
}

#[tokio::test]
async fn move_into_empty_list_takes_position_one() {
    let fx = fixture();
    let (client, ds, _rt) = open_client(&fx).await;

    client.move_card(fx.card_a, fx.done, None).await.unwrap();

    let board = client.current_board().unwrap();
    let moved = board.card(fx.card_a).unwrap();
    assert_eq!(moved.list_id, fx.done);
    assert_eq!(moved.position, 1.0);
    assert_eq!(positions(&board, fx.todo), vec![2.0]);
    assert_eq!(ds.call_count("update_card:1"), 1);
}

#[tokio::test]
async fn move_before_a_card_bisects_the_gap() {
    let fx = fixture();
    let (client, _ds, _rt) = open_client(&fx).await;

    // B currently follows A; moving B before A lands in (0, 1).
    client
        .move_card(fx.card_b, fx.todo, Some(fx.card_a))
        .await
        .unwrap();

    let board = client.current_board().unwrap();
    assert_eq!(board.card(fx.card_b).unwrap().position, 0.5);
    let list = board.list(fx.todo).unwrap();
    assert_eq!(list.cards[0].id, fx.card_b);
    assert_eq!(list.cards[1].id, fx.card_a);
}

#[tokio::test]
async fn move_onto_itself_is_a_noop() {
    let fx = fixture();
    let (client, ds, _rt) = open_client(&fx).await;
    let before = client.current_board().unwrap();
    let baseline = ds.calls().len();

    client
        .move_card(fx.card_a, fx.todo, Some(fx.card_a))
        .await
        .unwrap();

    assert_eq!(ds.calls().len(), baseline);
    assert_eq!(client.current_board().unwrap(), before);
}

#[tokio::test]
async fn boundary_list_moves_are_noops() {
    let fx = fixture();
    let (client, ds, _rt) = open_client(&fx).await;
    let baseline = ds.calls().len();

    client
        .move_list(fx.todo, MoveListTarget::Left)
        .await
        .unwrap();
    client
        .move_list(fx.done, MoveListTarget::Right)
        .await
        .unwrap();

    assert_eq!(ds.calls().len(), baseline);
}

#[tokio::test]
async fn move_list_right_lands_after_its_neighbor() {
    let fx = fixture();
    let (client, ds, _rt) = open_client(&fx).await;

    client
        .move_list(fx.todo, MoveListTarget::Right)
        .await
        .unwrap();

    let board = client.current_board().unwrap();
    assert_eq!(board.lists[0].id, fx.done);
    assert_eq!(board.lists[1].id, fx.todo);
    // Past the rightmost sibling: max + 1.
    assert_eq!(board.list(fx.todo).unwrap().position, 3.0);
    assert_eq!(ds.call_count("update_list"), 1);
}

#[tokio::test]
async fn anchored_card_insert_bisects_toward_the_successor() {
    let fx = fixture();
    let mut board = fx.board.clone();
    {
        let list = board.list_mut(fx.todo).unwrap();
        list.cards[0].position = 3.0;
        list.cards[1].position = 5.0;
    }
    let fx = Fixture { board, ..fx };
    let (client, ds, _rt) = open_client(&fx).await;

    let new_id = client.add_card(fx.todo, "between", Some(3.0)).await.unwrap();

    let board = client.current_board().unwrap();
    assert_eq!(board.card(new_id).unwrap().position, 4.0);
    assert_eq!(positions(&board, fx.todo), vec![3.0, 4.0, 5.0]);
    assert_eq!(ds.call_count("insert_card:4"), 1);
}

#[tokio::test]
async fn appended_card_takes_max_plus_one() {
    let fx = fixture();
    let (client, _ds, _rt) = open_client(&fx).await;

    let in_todo = client.add_card(fx.todo, "third", None).await.unwrap();
    let in_done = client.add_card(fx.done, "first", None).await.unwrap();

    let board = client.current_board().unwrap();
    assert_eq!(board.card(in_todo).unwrap().position, 3.0);
    assert_eq!(board.card(in_done).unwrap().position, 1.0);
}

#[tokio::test]
async fn vanished_anchor_degrades_to_append() {
    let fx = fixture();
    let (client, _ds, _rt) = open_client(&fx).await;

    let new_id = client.add_card(fx.todo, "late", Some(99.0)).await.unwrap();

    let board = client.current_board().unwrap();
    assert_eq!(board.card(new_id).unwrap().position, 3.0);
}

#[tokio::test]
async fn successful_mutation_announces_to_peers() {
    let fx = fixture();
    let (client, _ds, rt) = open_client(&fx).await;
    let mut events = client.subscribe_events();

    client.add_card(fx.todo, "hello", None).await.unwrap();
    wait_for_event(&mut events, |e| {
        matches!(e, ClientEvent::MutationSucceeded { action } if *action == "add card")
    })
    .await;

    let published = rt.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, format!("board:{}", fx.board_id));
    match &published[0].1 {
        RealtimeMessage::BoardTouched { board_id, origin } => {
            assert_eq!(*board_id, fx.board_id);
            assert_eq!(*origin, client.client_id());
        }
        other => panic!("unexpected announcement: {other:?}"),
    }
}

#[tokio::test]
async fn foreign_announcement_triggers_a_refetch() {
    let fx = fixture();
    let (client, ds, rt) = open_client(&fx).await;
    let mut events = client.subscribe_events();

    // A peer renamed the board behind our back.
    let mut renamed = fx.board.clone();
    renamed.name = "Renamed".to_string();
    ds.set_board(renamed);
    rt.inject(RealtimeMessage::BoardTouched {
        board_id: fx.board_id,
        origin: ClientId::new(),
    });

    wait_for_event(&mut events, |e| matches!(e, ClientEvent::Refetched { .. })).await;
    assert_eq!(client.current_board().unwrap().name, "Renamed");
}

#[tokio::test]
async fn own_announcement_does_not_refetch() {
    let fx = fixture();
    let (client, ds, rt) = open_client(&fx).await;

    let fetches = ds.call_count("fetch_board");
    rt.inject(RealtimeMessage::BoardTouched {
        board_id: fx.board_id,
        origin: client.client_id(),
    });
    // Give the listener a chance to (wrongly) react.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(ds.call_count("fetch_board"), fetches);
}

#[tokio::test]
async fn row_change_notifications_always_refetch() {
    let fx = fixture();
    let (client, _ds, rt) = open_client(&fx).await;
    let mut events = client.subscribe_events();

    rt.inject(RealtimeMessage::RowChanged {
        board_id: fx.board_id,
        table: shared::protocol::ChangedTable::Cards,
        kind: shared::protocol::ChangeKind::Insert,
    });

    wait_for_event(&mut events, |e| matches!(e, ClientEvent::Refetched { .. })).await;
}

#[tokio::test]
async fn delete_list_drops_its_cards_locally() {
    let fx = fixture();
    let (client, ds, _rt) = open_client(&fx).await;

    client.delete_list(fx.todo).await.unwrap();

    let board = client.current_board().unwrap();
    assert!(board.list(fx.todo).is_none());
    assert!(board.card(fx.card_a).is_none());
    assert_eq!(ds.call_count("delete_list"), 1);
    // No per-card deletes: the backend cascades.
    assert_eq!(ds.call_count("delete_card"), 0);
}

#[tokio::test]
async fn toggling_a_label_links_then_unlinks() {
    let fx = fixture();
    let (client, ds, _rt) = open_client(&fx).await;

    let label_id = client
        .create_label(Some("bug".to_string()), "#ff0000")
        .await
        .unwrap();

    client.toggle_card_label(fx.card_a, label_id).await.unwrap();
    let board = client.current_board().unwrap();
    assert_eq!(board.card(fx.card_a).unwrap().labels.len(), 1);

    client.toggle_card_label(fx.card_a, label_id).await.unwrap();
    let board = client.current_board().unwrap();
    assert!(board.card(fx.card_a).unwrap().labels.is_empty());

    assert_eq!(ds.call_count("link_card_label"), 1);
    assert_eq!(ds.call_count("unlink_card_label"), 1);
}

#[tokio::test]
async fn label_update_reaches_denormalized_copies() {
    let fx = fixture();
    let (client, _ds, _rt) = open_client(&fx).await;

    let label_id = client.create_label(None, "#00ff00").await.unwrap();
    client.toggle_card_label(fx.card_b, label_id).await.unwrap();
    client
        .update_label(
            label_id,
            LabelPatch {
                color: Some("#0000ff".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let board = client.current_board().unwrap();
    assert_eq!(board.labels[0].color, "#0000ff");
    assert_eq!(board.card(fx.card_b).unwrap().labels[0].color, "#0000ff");
}

#[tokio::test]
async fn relation_updates_only_the_initiating_card() {
    let fx = fixture();
    let (client, ds, _rt) = open_client(&fx).await;

    client.add_relation(fx.card_a, fx.card_b).await.unwrap();

    let board = client.current_board().unwrap();
    let a = board.card(fx.card_a).unwrap();
    assert_eq!(a.related_cards.len(), 1);
    assert_eq!(a.related_cards[0].id, fx.card_b);
    assert_eq!(a.related_cards[0].content, "B");
    assert_eq!(a.related_cards[0].list_title, "Todo");
    // The counterpart waits for the next refetch.
    assert!(board.card(fx.card_b).unwrap().related_cards.is_empty());
    assert_eq!(ds.call_count("insert_relation"), 1);

    client.remove_relation(fx.card_a, fx.card_b).await.unwrap();
    let board = client.current_board().unwrap();
    assert!(board.card(fx.card_a).unwrap().related_cards.is_empty());
}

#[tokio::test]
async fn mutations_without_an_open_board_are_rejected() {
    let ds = TestDataSource::new(fixture().board);
    let client = BoardClient::new(Arc::clone(&ds) as Arc<dyn BoardDataSource>);

    let err = client.add_card(ListId::new(), "orphan", None).await;
    assert!(matches!(err, Err(MutationError::NoBoardOpen)));
    assert!(ds.calls().is_empty());
}

#[tokio::test]
async fn refetch_during_a_pending_write_survives_its_confirmation() {
    let fx = fixture();
    let (client, ds, rt) = open_client(&fx).await;
    let mut events = client.subscribe_events();

    let gate = ds.gate_card_update(fx.card_a);
    let pending = {
        let client = Arc::clone(&client);
        let card_a = fx.card_a;
        tokio::spawn(async move {
            client
                .update_card(
                    card_a,
                    CardPatch {
                        content: Some("A, edited".to_string()),
                        ..Default::default()
                    },
                )
                .await
        })
    };
    tokio::task::yield_now().await;

    // An authoritative refetch lands while the write is still in flight.
    let mut remote = fx.board.clone();
    remote.list_mut(fx.todo).unwrap().title = "Remote".to_string();
    ds.set_board(remote);
    rt.inject(RealtimeMessage::BoardTouched {
        board_id: fx.board_id,
        origin: ClientId::new(),
    });
    wait_for_event(&mut events, |e| matches!(e, ClientEvent::Refetched { .. })).await;
    assert_eq!(
        client.current_board().unwrap().list(fx.todo).unwrap().title,
        "Remote"
    );

    gate.notify_one();
    pending.await.unwrap().unwrap();

    // Confirmation never re-applies local state, so the authoritative view
    // stays in place until the next refetch reconciles the edit.
    let board = client.current_board().unwrap();
    assert_eq!(board.list(fx.todo).unwrap().title, "Remote");
    assert_eq!(board.card(fx.card_a).unwrap().content, "A");
}

// Mutations are deliberately not serialized against each other. When an
// older mutation's remote write fails after a newer mutation has already
// been confirmed, the rollback restores the older snapshot and discards the
// newer result until the next refetch. This test pins that behavior.
#[tokio::test]
async fn rollback_of_older_mutation_discards_newer_confirmed_write() {
    let fx = fixture();
    let (client, ds, _rt) = open_client(&fx).await;

    let gate = ds.gate_card_update(fx.card_a);
    ds.fail("update_card");

    let older = {
        let client = Arc::clone(&client);
        let card_a = fx.card_a;
        tokio::spawn(async move {
            client
                .update_card(
                    card_a,
                    CardPatch {
                        content: Some("A, edited".to_string()),
                        ..Default::default()
                    },
                )
                .await
        })
    };
    // Let the older mutation apply locally and park in its remote write.
    tokio::task::yield_now().await;
    assert_eq!(
        client.current_board().unwrap().card(fx.card_a).unwrap().content,
        "A, edited"
    );

    client.rename_list(fx.todo, "Doing").await.unwrap();
    assert_eq!(
        client.current_board().unwrap().list(fx.todo).unwrap().title,
        "Doing"
    );

    gate.notify_one();
    let result = older.await.unwrap();
    assert!(matches!(result, Err(MutationError::RemoteWrite { .. })));

    // The rename was confirmed remotely, yet the rollback clobbered it.
    let board = client.current_board().unwrap();
    assert_eq!(board.list(fx.todo).unwrap().title, "Todo");
    assert_eq!(board.card(fx.card_a).unwrap().content, "A");
    assert_eq!(ds.call_count("update_list"), 1);
}

#[tokio::test]
async fn close_board_clears_the_store() {
    let fx = fixture();
    let (client, _ds, _rt) = open_client(&fx).await;

    client.close_board().await;

    assert!(client.current_board().is_none());
    let err = client.add_card(fx.todo, "late", None).await;
    assert!(matches!(err, Err(MutationError::NoBoardOpen)));
}

#[tokio::test]
async fn drop_intents_dispatch_to_moves() {
    let fx = fixture();
    let (client, _ds, _rt) = open_client(&fx).await;

    client
        .apply_drop(DropIntent::MoveCard {
            card_id: fx.card_a,
            dest_list_id: fx.done,
            before: None,
        })
        .await
        .unwrap();

    let board = client.current_board().unwrap();
    assert_eq!(board.card(fx.card_a).unwrap().list_id, fx.done);
}
