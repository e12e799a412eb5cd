use std::collections::HashMap;

use tracing::{debug, warn};

use gamegram_types::{
    ChannelRow, Message, MessageId, MessageRow, PageQuery, Reaction, ReactionRow, RemoteError,
    RemoteStore, Room, RoomId,
};

/// Fetch a page of messages and attach their reactions. A failed reaction
/// lookup still yields the messages.
pub async fn fetch_messages(
    remote: &dyn RemoteStore,
    query: PageQuery,
) -> Result<Vec<Message>, RemoteError> {
    let rows = remote.fetch_page(query).await?;
    let mut messages = decode_messages(rows, query.room_id);

    let ids: Vec<MessageId> = messages.iter().filter_map(Message::server_id).collect();
    if ids.is_empty() {
        return Ok(messages);
    }
    match remote.fetch_reactions(&ids).await {
        Ok(rows) => attach_reactions(&mut messages, rows),
        Err(e) => warn!("could not load reactions for {} messages: {}", ids.len(), e),
    }
    Ok(messages)
}

/// Rows that fail to decode, or belong to another room, are dropped.
pub fn decode_messages(rows: Vec<MessageRow>, room_id: RoomId) -> Vec<Message> {
    rows.into_iter()
        .filter_map(|row| match Message::try_from(row) {
            Ok(msg) if msg.room_id == room_id => Some(msg),
            Ok(msg) => {
                debug!(
                    message_id = ?msg.server_id(),
                    room_id = msg.room_id,
                    "skipping row from another room"
                );
                None
            }
            Err(e) => {
                warn!("dropping malformed message row: {}", e);
                None
            }
        })
        .collect()
}

pub fn decode_reaction(row: ReactionRow) -> Option<Reaction> {
    match Reaction::try_from(row) {
        Ok(reaction) => Some(reaction),
        Err(e) => {
            warn!("dropping malformed reaction row: {}", e);
            None
        }
    }
}

pub fn decode_rooms(rows: Vec<ChannelRow>) -> Vec<Room> {
    rows.into_iter()
        .filter_map(|row| match Room::try_from(row) {
            Ok(room) => Some(room),
            Err(e) => {
                warn!("dropping malformed channel row: {}", e);
                None
            }
        })
        .collect()
}

fn attach_reactions(messages: &mut [Message], rows: Vec<ReactionRow>) {
    let index: HashMap<MessageId, usize> = messages
        .iter()
        .enumerate()
        .filter_map(|(idx, m)| m.server_id().map(|id| (id, idx)))
        .collect();

    for reaction in rows.into_iter().filter_map(decode_reaction) {
        let Some(&idx) = index.get(&reaction.message_id) else {
            continue;
        };
        let target = &mut messages[idx];
        if !target.reactions.iter().any(|r| r.id == reaction.id) {
            target.reactions.push(reaction);
        }
    }
}
