//! Telegram message links.
//!
//! Accepted forms, with an optional `-<to>` range suffix and any query
//! string ignored:
//!
//! - `https://t.me/c/<id>/<msg>`: private chat, internal id `-100<id>`
//! - `https://t.me/b/<bot>/<msg>`: chat with a bot
//! - `https://t.me/<username>/<msg>`: public channel or group
//!
//! Invite links (`t.me/+...`, `t.me/joinchat/...`) are recognised so they
//! can be refused with a useful message.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::LinkError;
use crate::queue::task::{BatchRequest, ChatRef, SourceRef};

static MESSAGE_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)^https?://(?:www\.)?(?:t|telegram)\.me/
          (?:c/(?P<private>\d+)|b/(?P<bot>[A-Za-z0-9_]+)|(?P<public>[A-Za-z0-9_]+))
          /(?P<from>\d+)(?:-(?P<to>\d+))?/?$",
    )
    .expect("message link pattern")
});

static INVITE_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://(?:www\.)?(?:t|telegram)\.me/(?:\+|joinchat/)[A-Za-z0-9_-]+")
        .expect("invite link pattern")
});

/// What a link points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTarget {
    Single(SourceRef),
    Range(BatchRequest),
}

/// Parse one link.
pub fn parse_link(link: &str) -> Result<LinkTarget, LinkError> {
    let link = link.trim();
    let link = link.split(['?', '#']).next().unwrap_or(link);

    if INVITE_LINK.is_match(link) {
        return Err(LinkError::Invite);
    }
    let caps = MESSAGE_LINK
        .captures(link)
        .ok_or(LinkError::Unrecognized)?;

    let chat = if let Some(id) = caps.name("private") {
        ChatRef::Id(private_chat_id(id.as_str())?)
    } else if let Some(bot) = caps.name("bot") {
        ChatRef::Bot(bot.as_str().to_string())
    } else {
        let name = caps.name("public").map_or("", |m| m.as_str());
        ChatRef::Username(name.to_string())
    };

    let from = message_id(caps.name("from").map_or("", |m| m.as_str()))?;
    let to = match caps.name("to") {
        Some(to) => message_id(to.as_str())?,
        None => from,
    };

    if to < from {
        return Err(LinkError::InvalidRange {
            start: from,
            end: to,
        });
    }
    if to == from {
        Ok(LinkTarget::Single(SourceRef::new(chat, from)))
    } else {
        Ok(LinkTarget::Range(BatchRequest {
            chat,
            start: from,
            end: to,
        }))
    }
}

/// First thing in `text` that looks like a Telegram link.
pub fn find_link(text: &str) -> Option<&str> {
    text.split_whitespace().find(|word| {
        word.starts_with("https://t.me/")
            || word.starts_with("http://t.me/")
            || word.starts_with("https://telegram.me/")
    })
}

fn private_chat_id(raw: &str) -> Result<i64, LinkError> {
    format!("-100{raw}")
        .parse()
        .map_err(|_| LinkError::InvalidMessageId(raw.to_string()))
}

fn message_id(raw: &str) -> Result<i64, LinkError> {
    match raw.parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(LinkError::InvalidMessageId(raw.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_link_maps_to_internal_id() {
        let target = parse_link("https://t.me/c/1234567890/42").unwrap();
        assert_eq!(
            target,
            LinkTarget::Single(SourceRef::new(ChatRef::Id(-1001234567890), 42))
        );
    }

    #[test]
    fn public_range_link() {
        let target = parse_link("https://t.me/somechannel/100-200?single").unwrap();
        let LinkTarget::Range(req) = target else {
            panic!("expected range");
        };
        assert_eq!(req.chat, ChatRef::Username("somechannel".into()));
        assert_eq!((req.start, req.end), (100, 200));
        assert_eq!(req.len(), 101);
    }

    #[test]
    fn bot_link() {
        let target = parse_link("https://t.me/b/some_bot/7").unwrap();
        assert_eq!(
            target,
            LinkTarget::Single(SourceRef::new(ChatRef::Bot("some_bot".into()), 7))
        );
    }

    #[test]
    fn degenerate_range_is_single() {
        assert!(matches!(
            parse_link("https://t.me/news/5-5"),
            Ok(LinkTarget::Single(_))
        ));
    }

    #[test]
    fn invite_links_are_refused() {
        assert_eq!(parse_link("https://t.me/+AbCdEf123"), Err(LinkError::Invite));
        assert_eq!(
            parse_link("https://t.me/joinchat/AbCdEf123"),
            Err(LinkError::Invite)
        );
    }

    #[test]
    fn malformed_links() {
        assert_eq!(parse_link("https://t.me/news"), Err(LinkError::Unrecognized));
        assert_eq!(parse_link("https://example.com/a/1"), Err(LinkError::Unrecognized));
        assert_eq!(
            parse_link("https://t.me/news/0"),
            Err(LinkError::InvalidMessageId("0".into()))
        );
        assert_eq!(
            parse_link("https://t.me/news/20-10"),
            Err(LinkError::InvalidRange { start: 20, end: 10 })
        );
    }

    #[test]
    fn finds_link_in_message_text() {
        assert_eq!(
            find_link("grab this https://t.me/news/5 please"),
            Some("https://t.me/news/5")
        );
        assert_eq!(find_link("no links here"), None);
    }
}
