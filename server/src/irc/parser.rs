use crate::engine::events::ChatMetadata;

/// Marker that introduces an IRCv3 tag prefix.
pub const TAG_MARKER: u8 = b'@';

/// An untagged IRC protocol message.
///
/// Wire format: `[:prefix] COMMAND [params...] [:trailing]`
///
/// Examples:
///   `:foo!foo@foo.tmi.twitch.tv PRIVMSG #bar :hello`
///   `:tmi.twitch.tv CLEARCHAT #bar :spammer`
///   `PING :tmi.twitch.tv`
#[derive(Debug, Clone, PartialEq)]
pub struct IrcMessage {
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl IrcMessage {
    pub fn new(command: &str, params: Vec<String>) -> Self {
        IrcMessage {
            prefix: None,
            command: command.to_string(),
            params,
        }
    }

    /// Parse a single IRC line (tags already removed, terminator optional).
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']);

        if line.is_empty() {
            return Err(ParseError::Empty);
        }

        let mut remaining = line;
        let mut prefix = None;

        if let Some(rest) = remaining.strip_prefix(':') {
            match rest.find(' ') {
                Some(idx) => {
                    prefix = Some(rest[..idx].to_string());
                    remaining = rest[idx..].trim_start();
                }
                None => return Err(ParseError::MissingCommand),
            }
        }

        let command;
        match remaining.find(' ') {
            Some(idx) => {
                command = remaining[..idx].to_uppercase();
                remaining = remaining[idx..].trim_start();
            }
            None => {
                command = remaining.to_uppercase();
                remaining = "";
            }
        }

        if command.is_empty() {
            return Err(ParseError::MissingCommand);
        }

        let mut params = Vec::new();
        while !remaining.is_empty() {
            if let Some(trailing) = remaining.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }

            match remaining.find(' ') {
                Some(idx) => {
                    params.push(remaining[..idx].to_string());
                    remaining = remaining[idx..].trim_start();
                }
                None => {
                    params.push(remaining.to_string());
                    break;
                }
            }
        }

        Ok(IrcMessage {
            prefix,
            command,
            params,
        })
    }

    /// Format to wire format without the trailing CRLF.
    pub fn format(&self) -> String {
        let mut out = String::with_capacity(512);

        if let Some(ref prefix) = self.prefix {
            out.push(':');
            out.push_str(prefix);
            out.push(' ');
        }

        out.push_str(&self.command);

        for (i, param) in self.params.iter().enumerate() {
            out.push(' ');
            let last = i == self.params.len() - 1;
            if last && (param.contains(' ') || param.is_empty() || param.starts_with(':')) {
                out.push(':');
            }
            // Strip \r\n to prevent command injection via user content
            let sanitized = param.replace(['\r', '\n'], " ");
            out.push_str(&sanitized);
        }

        out
    }

    /// Format with the CRLF terminator appended.
    pub fn to_line(&self) -> String {
        let mut line = self.format();
        line.push_str("\r\n");
        line
    }

    /// The host part of the prefix: after `@` for a user mask, else the whole prefix.
    pub fn prefix_host(&self) -> Option<&str> {
        let prefix = self.prefix.as_deref()?;
        Some(match prefix.rfind('@') {
            Some(idx) => &prefix[idx + 1..],
            None => prefix,
        })
    }
}

#[derive(Debug, PartialEq)]
pub enum ParseError {
    Empty,
    MissingCommand,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Empty => write!(f, "empty message"),
            ParseError::MissingCommand => write!(f, "missing command"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Parse the `@k=v;k=v ` tag prefix of a line into a map.
/// Best-effort: malformed pairs are dropped, never an error.
pub fn parse_tags(line: &str) -> ChatMetadata {
    split_tags(line).0
}

/// Parse the tag prefix and return it with the rest of the line after the
/// terminating space. A line without the marker has no tags.
///
/// Keys have `-` normalized to `_`. Keys and values are unescaped:
/// `\:` is `;`, `\s` is a space, `\r`/`\n` are CR/LF, and any other escaped
/// byte stands for itself.
pub fn split_tags(line: &str) -> (ChatMetadata, &str) {
    let mut tags = ChatMetadata::new();
    let bytes = line.as_bytes();

    if bytes.first() != Some(&TAG_MARKER) {
        return (tags, line);
    }

    let mut key: Vec<u8> = Vec::new();
    let mut value: Vec<u8> = Vec::new();
    let mut seen_equals = false;
    let mut rest = "";

    let mut i = 1;
    while i < bytes.len() {
        let c = bytes[i];

        if c == b'\\' {
            if let Some(&escaped) = bytes.get(i + 1) {
                let target = if seen_equals { &mut value } else { &mut key };
                target.push(unescape(escaped));
            }
            i += 2;
            continue;
        }

        if c == b' ' {
            rest = &line[i + 1..];
            break;
        }

        match c {
            b';' => {
                flush_pair(&mut tags, &mut key, &mut value, seen_equals);
                seen_equals = false;
            }
            b'=' if !seen_equals => seen_equals = true,
            _ if seen_equals => value.push(c),
            _ => key.push(c),
        }
        i += 1;
    }

    flush_pair(&mut tags, &mut key, &mut value, seen_equals);
    (tags, rest)
}

fn unescape(c: u8) -> u8 {
    match c {
        b':' => b';',
        b's' => b' ',
        b'r' => b'\r',
        b'n' => b'\n',
        other => other,
    }
}

fn flush_pair(tags: &mut ChatMetadata, key: &mut Vec<u8>, value: &mut Vec<u8>, seen_equals: bool) {
    if seen_equals && !key.is_empty() {
        let k = String::from_utf8_lossy(key).replace('-', "_");
        let v = String::from_utf8_lossy(value).into_owned();
        tags.insert(k, v);
    }
    key.clear();
    value.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_prefix() {
        let msg = IrcMessage::parse(":foo!foo@foo.tmi.twitch.tv PRIVMSG #bar :hello world").unwrap();
        assert_eq!(msg.prefix, Some("foo!foo@foo.tmi.twitch.tv".into()));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#bar", "hello world"]);
        assert_eq!(msg.prefix_host(), Some("foo.tmi.twitch.tv"));
    }

    #[test]
    fn test_parse_server_prefix() {
        let msg = IrcMessage::parse(":tmi.twitch.tv RECONNECT").unwrap();
        assert_eq!(msg.prefix_host(), Some("tmi.twitch.tv"));
        assert_eq!(msg.command, "RECONNECT");
        assert!(msg.params.is_empty());
    }

    #[test]
    fn test_parse_ping() {
        let msg = IrcMessage::parse("PING :tmi.twitch.tv").unwrap();
        assert_eq!(msg.prefix, None);
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.params, vec!["tmi.twitch.tv"]);
    }

    #[test]
    fn test_parse_ctcp_action() {
        let msg = IrcMessage::parse(":a!a@a.tmi.twitch.tv PRIVMSG #c :\x01ACTION waves\x01").unwrap();
        assert_eq!(msg.params[1], "\x01ACTION waves\x01");
    }

    #[test]
    fn test_parse_empty_and_prefix_only() {
        assert_eq!(IrcMessage::parse(""), Err(ParseError::Empty));
        assert_eq!(IrcMessage::parse("\r\n"), Err(ParseError::Empty));
        assert_eq!(IrcMessage::parse(":prefix"), Err(ParseError::MissingCommand));
    }

    #[test]
    fn test_format_privmsg_with_trailing() {
        let msg = IrcMessage::new("PRIVMSG", vec!["#bar".into(), "hello world".into()]);
        assert_eq!(msg.to_line(), "PRIVMSG #bar :hello world\r\n");
    }

    #[test]
    fn test_format_single_word_trailing() {
        let msg = IrcMessage::new("JOIN", vec!["#bar".into()]);
        assert_eq!(msg.format(), "JOIN #bar");
    }

    #[test]
    fn test_format_leading_colon_in_trailing() {
        let msg = IrcMessage::new("PRIVMSG", vec!["#bar".into(), ":)".into()]);
        assert_eq!(msg.format(), "PRIVMSG #bar ::)");
    }

    #[test]
    fn test_format_strips_crlf_injection() {
        let msg = IrcMessage::new(
            "PRIVMSG",
            vec!["#bar".into(), "hi\r\nJOIN #evil".into()],
        );
        assert_eq!(msg.format(), "PRIVMSG #bar :hi  JOIN #evil");
    }

    #[test]
    fn test_parse_error_display() {
        assert_eq!(format!("{}", ParseError::Empty), "empty message");
        assert_eq!(format!("{}", ParseError::MissingCommand), "missing command");
    }

    // ── Tag prefix ──

    #[test]
    fn test_tags_simple_pairs() {
        let tags = parse_tags("@a=1;b=2 rest");
        assert_eq!(tags.len(), 2);
        assert_eq!(tags["a"], "1");
        assert_eq!(tags["b"], "2");
    }

    #[test]
    fn test_tags_escaped_semicolon_in_key() {
        let tags = parse_tags(r"@a\;b=1 rest");
        assert_eq!(tags.len(), 1);
        assert_eq!(tags["a;b"], "1");
    }

    #[test]
    fn test_tags_hyphen_normalized() {
        let tags = parse_tags("@x-y=1 rest");
        assert_eq!(tags["x_y"], "1");
        assert!(!tags.contains_key("x-y"));
    }

    #[test]
    fn test_tags_value_escapes() {
        let tags = parse_tags(r"@system-msg=5\sraiders\sfrom\:\\here;k=v rest");
        assert_eq!(tags["system_msg"], r"5 raiders from;\here");
        assert_eq!(tags["k"], "v");
    }

    #[test]
    fn test_tags_escaped_space_does_not_terminate() {
        let (tags, rest) = split_tags(r"@a=x\ y b=c :host CMD");
        assert_eq!(tags["a"], "x y");
        assert_eq!(rest, "b=c :host CMD");
    }

    #[test]
    fn test_tags_pair_without_equals_is_skipped() {
        let tags = parse_tags("@flag;a=1;;b=2 rest");
        assert_eq!(tags.len(), 2);
        assert_eq!(tags["a"], "1");
        assert_eq!(tags["b"], "2");
    }

    #[test]
    fn test_tags_empty_value_kept_empty_key_skipped() {
        let tags = parse_tags("@emotes=;=x rest");
        assert_eq!(tags.len(), 1);
        assert_eq!(tags["emotes"], "");
    }

    #[test]
    fn test_tags_value_may_contain_equals() {
        let tags = parse_tags("@a=b=c rest");
        assert_eq!(tags["a"], "b=c");
    }

    #[test]
    fn test_tags_utf8_values() {
        let tags = parse_tags("@display-name=Jos\u{e9} rest");
        assert_eq!(tags["display_name"], "Jos\u{e9}");
    }

    #[test]
    fn test_tags_without_rest() {
        let (tags, rest) = split_tags("@a=1;b=2");
        assert_eq!(tags.len(), 2);
        assert_eq!(rest, "");
    }

    #[test]
    fn test_tags_trailing_backslash_dropped() {
        let tags = parse_tags("@a=1\\");
        assert_eq!(tags["a"], "1");
    }

    #[test]
    fn test_split_tags_returns_untagged_rest() {
        let (tags, rest) =
            split_tags("@display-name=Foo :foo!foo@foo.tmi.twitch.tv PRIVMSG #bar :hello");
        assert_eq!(tags["display_name"], "Foo");
        assert_eq!(rest, ":foo!foo@foo.tmi.twitch.tv PRIVMSG #bar :hello");
    }

    #[test]
    fn test_split_tags_untagged_line() {
        let (tags, rest) = split_tags("PING :tmi.twitch.tv");
        assert!(tags.is_empty());
        assert_eq!(rest, "PING :tmi.twitch.tv");
    }
}
