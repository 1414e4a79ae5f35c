use crate::engine::events::{
    ChatMetadata, KEY_ACCOUNT, KEY_CHANNEL, KEY_EMOTE, KEY_MESSAGE, KEY_META_TYPE, KEY_MSG_TYPE,
    META_TYPE_IRC,
};

use super::parser::{IrcMessage, split_tags};

/// Default host the upstream service uses in its prefixes.
pub const DEFAULT_SERVICE_HOST: &str = "tmi.twitch.tv";

const CTCP_DELIM: char = '\x01';
const ACTION_HEADER: &str = "\x01ACTION ";

/// Turns tagged upstream lines into chat metadata.
///
/// A line qualifies when its untagged part has the shape
/// `:<...service-host> <OPCODE> #<channel> ...`. For `PRIVMSG` the sending
/// account is taken from the host mask `<account>.<service-host>` and the
/// trailing parameter is the message.
#[derive(Debug, Clone)]
pub struct ChatSynthesizer {
    service_host: String,
    user_host_suffix: String,
}

impl Default for ChatSynthesizer {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE_HOST)
    }
}

impl ChatSynthesizer {
    pub fn new(service_host: &str) -> Self {
        Self {
            service_host: service_host.to_string(),
            user_host_suffix: format!(".{}", service_host),
        }
    }

    pub fn service_host(&self) -> &str {
        &self.service_host
    }

    /// True if `host` is the service itself or one of its per-user hosts.
    pub fn is_service_host(&self, host: &str) -> bool {
        host == self.service_host || host.ends_with(&self.user_host_suffix)
    }

    /// Build metadata for a tagged line, or None if it carries no channel.
    pub fn synthesize(&self, line: &str) -> Option<ChatMetadata> {
        let (mut metadata, rest) = split_tags(line);
        let msg = IrcMessage::parse(rest).ok()?;

        if !self.is_service_host(msg.prefix_host()?) {
            return None;
        }
        let channel = msg.params.first()?.strip_prefix('#')?;
        if !is_word(channel) {
            return None;
        }

        metadata.insert(KEY_META_TYPE.into(), META_TYPE_IRC.into());
        metadata.insert(KEY_CHANNEL.into(), channel.to_string());
        metadata.insert(KEY_MSG_TYPE.into(), msg.command.clone());

        if msg.command == "PRIVMSG"
            && let Some((account, text)) = self.privmsg_fields(&msg)
        {
            metadata.insert(KEY_ACCOUNT.into(), account.to_string());
            match action_payload(text) {
                Some(emote) => metadata.insert(KEY_EMOTE.into(), emote.to_string()),
                None => metadata.insert(KEY_MESSAGE.into(), text.to_string()),
            };
        }

        Some(metadata)
    }

    fn privmsg_fields<'a>(&self, msg: &'a IrcMessage) -> Option<(&'a str, &'a str)> {
        let host = msg.prefix_host()?;
        let account = host.strip_suffix(&self.user_host_suffix)?;
        if !is_word(account) {
            return None;
        }
        let text = msg.params.get(1)?;
        if text.is_empty() {
            return None;
        }
        Some((account, text.as_str()))
    }
}

/// `\x01ACTION <payload>\x01` -> payload
fn action_payload(text: &str) -> Option<&str> {
    text.strip_prefix(ACTION_HEADER)?.strip_suffix(CTCP_DELIM)
}

fn is_word(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
