use std::sync::Arc;

use anyhow::Result;
use board_core::{
    BoardClient, BoardDataSource, ClientEvent, MissingObjectStore, MissingRealtimeTransport,
    ObjectStore, RealtimeTransport, RestDataSource, RestObjectStore, WebSocketTransport,
};
use clap::Parser;
use shared::domain::BoardId;
use uuid::Uuid;

/// Open a board against a hosted datastore and follow it live.
#[derive(Parser, Debug)]
struct Args {
    /// Base URL of the datastore REST endpoint.
    #[arg(long)]
    server_url: String,
    /// Base URL of the object storage endpoint; attachments are disabled
    /// without it.
    #[arg(long)]
    storage_url: Option<String>,
    /// Websocket relay endpoint; realtime sync is disabled without it.
    #[arg(long)]
    ws_url: Option<String>,
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    board_id: Uuid,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let datasource: Arc<dyn BoardDataSource> = Arc::new(RestDataSource::new(
        &args.server_url,
        args.api_key.clone(),
    )?);
    let realtime: Arc<dyn RealtimeTransport> = match &args.ws_url {
        Some(url) => WebSocketTransport::connect(url).await?,
        None => Arc::new(MissingRealtimeTransport),
    };
    let objects: Arc<dyn ObjectStore> = match &args.storage_url {
        Some(url) => Arc::new(RestObjectStore::new(url, args.api_key.clone())?),
        None => Arc::new(MissingObjectStore),
    };

    let client = BoardClient::new_with_dependencies(datasource, realtime, objects);
    let mut events = client.subscribe_events();
    client.open_board(BoardId(args.board_id)).await?;

    print_board(&client);

    loop {
        match events.recv().await? {
            ClientEvent::Refetched { .. } => {
                println!("-- board changed remotely --");
                print_board(&client);
            }
            ClientEvent::RefetchFailed { message } => {
                eprintln!("refetch failed: {message}");
            }
            ClientEvent::SubscriptionLost { message } => {
                eprintln!("realtime subscription lost: {message}");
                break;
            }
            _ => {}
        }
    }

    client.close_board().await;
    Ok(())
}

fn print_board(client: &BoardClient) {
    let Some(board) = client.current_board() else {
        println!("(no board open)");
        return;
    };
    println!("{}", board.name);
    for list in &board.lists {
        let limit = list
            .card_limit
            .map(|n| format!(" (limit {n})"))
            .unwrap_or_default();
        println!("  [{}]{limit}", list.title);
        for card in &list.cards {
            let done = if card.is_completed { "x" } else { " " };
            println!("    [{done}] {}", card.content);
        }
    }
}
