use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Unique identifier for a downstream endpoint. Allocated monotonically and never reused.
pub type EndpointId = u64;

/// String-keyed metadata for one upstream chat line. Serialized as one flat JSON object.
pub type ChatMetadata = BTreeMap<String, String>;

/// Event-type discriminator key and its value for chat events.
pub const KEY_META_TYPE: &str = "json_meta_type";
pub const META_TYPE_IRC: &str = "irc";
/// Channel the line was addressed to (without `#`).
pub const KEY_CHANNEL: &str = "irc_channel";
/// Upstream opcode, e.g. `PRIVMSG`, `USERNOTICE`, `CLEARCHAT`.
pub const KEY_MSG_TYPE: &str = "irc_msg_type";
/// Sending account, PRIVMSG only.
pub const KEY_ACCOUNT: &str = "irc_account";
/// Plain message text, PRIVMSG only.
pub const KEY_MESSAGE: &str = "irc_msg";
/// `/me` action payload, PRIVMSG only. Mutually exclusive with `KEY_MESSAGE`.
pub const KEY_EMOTE: &str = "irc_emote";

/// A command sent by a downstream client, one JSON object per line.
///
/// `{"op":"join","channel":"bar"}`
/// `{"op":"leave","channel":"bar"}`
/// `{"op":"chat","channel":"bar","message":"hello"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Join { channel: String },
    Leave { channel: String },
    Chat { channel: String, message: String },
}

impl Command {
    /// Decode one command line. Unknown ops and missing fields are errors.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end_matches('\r'))
    }

    pub fn channel(&self) -> &str {
        match self {
            Command::Join { channel } | Command::Leave { channel } | Command::Chat { channel, .. } => {
                channel
            }
        }
    }
}

/// Serialize metadata to one newline-terminated JSON line.
pub fn encode_event(metadata: &ChatMetadata) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(metadata)?;
    line.push('\n');
    Ok(line)
}
