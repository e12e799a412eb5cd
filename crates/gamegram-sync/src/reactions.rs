use serde::Serialize;

use gamegram_types::Reaction;

/// Reactions on one message sharing an emoji.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    pub reacted_by_me: bool,
    pub usernames: Vec<String>,
}

/// Groups a message's reactions by emoji, in order of first appearance.
/// Derived on every read so it cannot drift from the store.
pub fn summarize(reactions: &[Reaction], me: &str) -> Vec<ReactionGroup> {
    let mut groups: Vec<ReactionGroup> = Vec::new();
    for r in reactions {
        let group = match groups.iter().position(|g| g.emoji == r.emoji) {
            Some(idx) => &mut groups[idx],
            None => {
                groups.push(ReactionGroup {
                    emoji: r.emoji.clone(),
                    count: 0,
                    reacted_by_me: false,
                    usernames: Vec::new(),
                });
                let last = groups.len() - 1;
                &mut groups[last]
            }
        };
        if group.usernames.contains(&r.username) {
            continue;
        }
        group.count += 1;
        group.reacted_by_me |= r.username == me;
        group.usernames.push(r.username.clone());
    }
    groups
}
