//! IRC-lite message parsing and serialization.
//!
//! Wire form: `[:prefix ] command (SPACE param)* [ SPACE :trailing ] CRLF`.
//! A trailing parameter (introduced by `:`) may contain spaces; all other
//! parameters are single tokens.

/// One parsed IRC message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl Message {
    pub fn new(
        prefix: Option<&str>,
        command: &str,
        params: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            prefix: prefix.map(str::to_owned),
            command: command.to_owned(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    /// A channel PRIVMSG from `nick`.
    pub fn privmsg(nick: &str, channel: &str, text: &str) -> Self {
        Self::new(Some(nick), "PRIVMSG", [channel, text])
    }

    /// Serialize to the wire form, CRLF-terminated. The last parameter is
    /// `:`-prefixed when it contains a space (or is empty).
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        if let Some(prefix) = &self.prefix {
            out.push(':');
            out.push_str(prefix);
            out.push(' ');
        }
        out.push_str(&self.command);
        for (i, param) in self.params.iter().enumerate() {
            out.push(' ');
            let last = i == self.params.len() - 1;
            if last && (param.contains(' ') || param.is_empty()) {
                out.push(':');
            }
            out.push_str(param);
        }
        out.push_str("\r\n");
        out
    }

    /// Parse one line (without its CRLF).
    pub fn parse(line: &str) -> Self {
        let mut msg = Message::default();
        let mut rest = line;

        if let Some(stripped) = rest.strip_prefix(':') {
            match stripped.split_once(' ') {
                Some((prefix, tail)) => {
                    msg.prefix = Some(prefix.to_owned());
                    rest = tail;
                }
                None => {
                    msg.prefix = Some(stripped.to_owned());
                    return msg;
                }
            }
        }

        let mut tokens = rest.trim_start().splitn(2, ' ');
        msg.command = tokens.next().unwrap_or_default().to_owned();
        let mut rest = tokens.next().unwrap_or_default();

        while !rest.is_empty() {
            if let Some(trailing) = rest.strip_prefix(':') {
                msg.params.push(trailing.to_owned());
                break;
            }
            match rest.split_once(' ') {
                Some((token, tail)) => {
                    if !token.is_empty() {
                        msg.params.push(token.to_owned());
                    }
                    rest = tail;
                }
                None => {
                    msg.params.push(rest.to_owned());
                    break;
                }
            }
        }

        msg
    }
}

/// Turn escaped `\n`/`\r` sequences back into real control characters.
///
/// Senders escape newlines to keep a message on one wire line; the
/// transcript stores the unescaped form while broadcasts keep the wire
/// form untouched.
pub fn unescape_text(text: &str) -> String {
    text.replace("\\n", "\n").replace("\\r", "\r")
}
