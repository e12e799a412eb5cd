use gamegram_sync::ScrollPosition;
use gamegram_types::{MessageId, RoomId, TempId};

/// One line of stdin.
#[derive(Debug, Clone, PartialEq)]
pub enum CliCommand {
    Send(String),
    /// Post as another user through the loopback store.
    PostAs { username: String, text: String },
    React { message_id: MessageId, emoji: String },
    Older,
    Bottom,
    Scroll(ScrollPosition),
    Offline,
    Online,
    Hide,
    Show,
    Retry(TempId),
    Discard(TempId),
    Refresh,
    Channels,
    Join(RoomId),
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  <text>                               send a message
  /as <user> <text>                    post as someone else
  /react <message-id> <emoji>          toggle a reaction
  /older                               load older history
  /bottom                              jump to the newest message
  /scroll <offset> <viewport> <content>
  /offline | /online                   drop or restore the network
  /hide | /show                        page visibility
  /retry <temp-id> | /discard <temp-id>
  /refresh
  /channels | /join <room-id>          list rooms or switch to one
  /quit";

pub fn parse(line: &str) -> Result<Option<CliCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(CliCommand::Send(line.to_string())));
    };

    let mut parts = rest.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();

    let command = match (name, args.as_slice()) {
        ("as", [username, text @ ..]) if !text.is_empty() => CliCommand::PostAs {
            username: username.to_string(),
            text: text.join(" "),
        },
        ("react", [id, emoji]) => CliCommand::React {
            message_id: id.parse().map_err(|_| format!("not a message id: {}", id))?,
            emoji: emoji.to_string(),
        },
        ("older", []) => CliCommand::Older,
        ("bottom", []) => CliCommand::Bottom,
        ("scroll", [offset, viewport, content]) => CliCommand::Scroll(ScrollPosition {
            offset: number(offset)?,
            viewport_height: number(viewport)?,
            content_height: number(content)?,
        }),
        ("offline", []) => CliCommand::Offline,
        ("online", []) => CliCommand::Online,
        ("hide", []) => CliCommand::Hide,
        ("show", []) => CliCommand::Show,
        ("retry", [temp]) => CliCommand::Retry(TempId::from(*temp)),
        ("discard", [temp]) => CliCommand::Discard(TempId::from(*temp)),
        ("refresh", []) => CliCommand::Refresh,
        ("channels", []) => CliCommand::Channels,
        ("join", [id]) => {
            CliCommand::Join(id.parse().map_err(|_| format!("not a room id: {}", id))?)
        }
        ("help", []) => CliCommand::Help,
        ("quit", []) | ("exit", []) => CliCommand::Quit,
        _ => return Err(format!("unknown command: /{}", rest)),
    };
    Ok(Some(command))
}

fn number(raw: &str) -> Result<f64, String> {
    raw.parse().map_err(|_| format!("not a number: {}", raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_send() {
        assert_eq!(parse("  hello there ").unwrap(), Some(CliCommand::Send("hello there".into())));
        assert_eq!(parse("   ").unwrap(), None);
    }

    #[test]
    fn parses_commands_with_arguments() {
        assert_eq!(
            parse("/react 12 🔥").unwrap(),
            Some(CliCommand::React {
                message_id: 12,
                emoji: "🔥".into()
            })
        );
        assert_eq!(
            parse("/as @bo good game").unwrap(),
            Some(CliCommand::PostAs {
                username: "@bo".into(),
                text: "good game".into()
            })
        );
        assert_eq!(
            parse("/scroll 0 500 2400").unwrap(),
            Some(CliCommand::Scroll(ScrollPosition {
                offset: 0.0,
                viewport_height: 500.0,
                content_height: 2400.0
            }))
        );
        assert_eq!(
            parse("/retry temp-abc").unwrap(),
            Some(CliCommand::Retry(TempId::from("temp-abc")))
        );
        assert_eq!(parse("/channels").unwrap(), Some(CliCommand::Channels));
        assert_eq!(parse("/join 3").unwrap(), Some(CliCommand::Join(3)));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse("/react x 🔥").is_err());
        assert!(parse("/scroll 1 2").is_err());
        assert!(parse("/as @bo").is_err());
        assert!(parse("/dance").is_err());
        assert!(parse("/join general").is_err());
        assert!(parse("/join").is_err());
    }
}
