//! Event grammar for captured node output.
//!
//! A node's output is scanned line by line. Four fixed patterns are
//! recognised, anywhere in the line so log prefixes (timestamps, levels,
//! targets) do not matter:
//!
//! | Event     | Pattern                                                  |
//! |-----------|----------------------------------------------------------|
//! | `Bind`    | ``listening on https://<addr>``                          |
//! | `Connect` | ``Connected to `<addr>` ``                               |
//! | `Send`    | ``Sending message `<id>` to ["<addr>", "<addr>", ...]``  |
//! | `Receive` | ``Received message `<id>` from `<addr>` ``               |
//!
//! Lines matching none of the markers are ignored. A line that carries a
//! marker but does not match its full pattern is a [`ParseError`]: garbled
//! log output is a regression signal in itself.

use once_cell::sync::Lazy;
use regex::Regex;

/// Regex for the bind line emitted when the listener starts.
static BIND_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"listening on https://([^\s`]+)").unwrap_or_else(|_| unreachable!())
});

/// Regex for the outbound connection line.
static CONNECT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Connected to `([^`\s]+)`").unwrap_or_else(|_| unreachable!()));

/// Regex for a broadcast line. The recipient list is parsed separately.
static SEND_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Sending message `([a-zA-Z0-9]+)` to \[([^\]]*)\]").unwrap_or_else(|_| unreachable!())
});

/// Regex for one quoted recipient address.
static RECIPIENT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^"([^"\s]+)"$"#).unwrap_or_else(|_| unreachable!()));

/// Regex for a delivery line.
static RECEIVE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Received message `([a-zA-Z0-9]+)` from `([^`\s]+)`").unwrap_or_else(|_| unreachable!())
});

/// Kinds of events in the grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Listener started.
    Bind,
    /// Outbound connection established.
    Connect,
    /// Broadcast sent.
    Send,
    /// Message received.
    Receive,
}

impl EventKind {
    /// Substring that marks a line as claiming to be this kind of event.
    fn marker(self) -> &'static str {
        match self {
            Self::Bind => "listening on https://",
            Self::Connect => "Connected to `",
            Self::Send => "Sending message `",
            Self::Receive => "Received message `",
        }
    }

    const ALL: [Self; 4] = [Self::Bind, Self::Connect, Self::Send, Self::Receive];
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bind => write!(f, "bind"),
            Self::Connect => write!(f, "connect"),
            Self::Send => write!(f, "send"),
            Self::Receive => write!(f, "receive"),
        }
    }
}

/// One semantically-typed occurrence in a node's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The node began listening on `address`.
    Bind {
        /// Listen address as rendered by the node.
        address: String,
    },
    /// The node dialled `peer` successfully.
    Connect {
        /// Peer address.
        peer: String,
    },
    /// The node broadcast `message` to `recipients`, in rendered order.
    Send {
        /// Message identifier.
        message: String,
        /// Recipient addresses.
        recipients: Vec<String>,
    },
    /// The node received `message` originated by `from`.
    Receive {
        /// Message identifier.
        message: String,
        /// Originator address.
        from: String,
    },
}

/// A line that looks like an event but does not match its pattern.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line_number}: malformed {kind} line: {line:?}")]
pub struct ParseError {
    /// 1-based line number in the captured text.
    pub line_number: usize,
    /// Kind the line claimed to be.
    pub kind: EventKind,
    /// The offending line.
    pub line: String,
}

/// Parse one line.
///
/// Returns `Ok(None)` for lines that are not events. The caller supplies
/// `line_number` for error reporting.
pub fn parse_line(line: &str, line_number: usize) -> Result<Option<Event>, ParseError> {
    let Some(kind) = EventKind::ALL
        .into_iter()
        .find(|kind| line.contains(kind.marker()))
    else {
        return Ok(None);
    };

    let malformed = || ParseError {
        line_number,
        kind,
        line: line.to_string(),
    };

    let event = match kind {
        EventKind::Bind => {
            let caps = BIND_REGEX.captures(line).ok_or_else(malformed)?;
            Event::Bind {
                address: caps[1].to_string(),
            }
        }
        EventKind::Connect => {
            let caps = CONNECT_REGEX.captures(line).ok_or_else(malformed)?;
            Event::Connect {
                peer: caps[1].to_string(),
            }
        }
        EventKind::Send => {
            let caps = SEND_REGEX.captures(line).ok_or_else(malformed)?;
            let recipients = parse_recipients(&caps[2]).ok_or_else(malformed)?;
            Event::Send {
                message: caps[1].to_string(),
                recipients,
            }
        }
        EventKind::Receive => {
            let caps = RECEIVE_REGEX.captures(line).ok_or_else(malformed)?;
            Event::Receive {
                message: caps[1].to_string(),
                from: caps[2].to_string(),
            }
        }
    };
    Ok(Some(event))
}

/// Split `"a", "b"` into addresses. `None` if any element is not a quoted address.
fn parse_recipients(list: &str) -> Option<Vec<String>> {
    if list.trim().is_empty() {
        return Some(Vec::new());
    }
    list.split(',')
        .map(|item| {
            RECIPIENT_REGEX
                .captures(item.trim())
                .map(|caps| caps[1].to_string())
        })
        .collect()
}

/// Parse a node's whole captured output into events, in line order.
pub fn parse_events(text: &str) -> Result<Vec<Event>, ParseError> {
    let mut events = Vec::new();
    for (index, line) in text.lines().enumerate() {
        if let Some(event) = parse_line(line, index + 1)? {
            events.push(event);
        }
    }
    Ok(events)
}

/// Ordered events of one node with the queries the checks need.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventLog {
    events: Vec<Event>,
}

impl EventLog {
    /// Parse captured output.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        parse_events(text).map(|events| Self { events })
    }

    /// All events in emission order.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Addresses of every bind event.
    pub fn binds(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Bind { address } => Some(address.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Peers of every connect event.
    pub fn connects(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Connect { peer } => Some(peer.as_str()),
                _ => None,
            })
            .collect()
    }

    /// `(message, recipients)` of every send event.
    pub fn sends(&self) -> Vec<(&str, &[String])> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Send {
                    message,
                    recipients,
                } => Some((message.as_str(), recipients.as_slice())),
                _ => None,
            })
            .collect()
    }

    /// Identifiers of sent messages, in send order.
    pub fn sent_messages(&self) -> Vec<&str> {
        self.sends().into_iter().map(|(message, _)| message).collect()
    }

    /// Identifiers of messages received from `sender`, in receive order.
    pub fn received_from(&self, sender: &str) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Receive { message, from } if from == sender => Some(message.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
[2024-05-01T10:00:00Z INFO  warp::server] Server::run; addr=127.0.0.1:8081
[2024-05-01T10:00:00Z INFO  warp::server] listening on https://127.0.0.1:8081
[2024-05-01T10:00:00Z INFO  simplep2pgossip::saabisu] Connected to `127.0.0.1:8080`
[2024-05-01T10:00:05Z INFO  simplep2pgossip::server] Received message `Xk3vQ9pLm2aB7cDe` from `127.0.0.1:8080`
[2024-05-01T10:00:07Z INFO  simplep2pgossip::saabisu] Sending message `Zz81nHq0Lw3PtYu4` to [\"127.0.0.1:8080\", \"127.0.0.1:8082\"]
[2024-05-01T10:00:08Z INFO  simplep2pgossip::saabisu] Couldn't send message to peer 127.0.0.1:8082: timeout
";

    #[test]
    fn test_parse_sample_in_order() {
        let events = parse_events(SAMPLE).expect("sample parses");
        assert_eq!(
            events,
            vec![
                Event::Bind {
                    address: "127.0.0.1:8081".into()
                },
                Event::Connect {
                    peer: "127.0.0.1:8080".into()
                },
                Event::Receive {
                    message: "Xk3vQ9pLm2aB7cDe".into(),
                    from: "127.0.0.1:8080".into()
                },
                Event::Send {
                    message: "Zz81nHq0Lw3PtYu4".into(),
                    recipients: vec!["127.0.0.1:8080".into(), "127.0.0.1:8082".into()],
                },
            ]
        );
    }

    #[test]
    fn test_unrelated_lines_ignored() {
        assert_eq!(parse_line("Error on connecting to `127.0.0.1:8080`: `refused`", 1), Ok(None));
        assert_eq!(parse_line("Default path", 2), Ok(None));
        assert_eq!(parse_line("", 3), Ok(None));
    }

    #[test]
    fn test_empty_recipient_list() {
        let event = parse_line("Sending message `abc123` to []", 1).unwrap();
        assert_eq!(
            event,
            Some(Event::Send {
                message: "abc123".into(),
                recipients: Vec::new()
            })
        );
    }

    #[test]
    fn test_non_alphanumeric_message_is_malformed() {
        let err = parse_line("Received message `ab-cd` from `127.0.0.1:8080`", 7).unwrap_err();
        assert_eq!(err.kind, EventKind::Receive);
        assert_eq!(err.line_number, 7);
    }

    #[test]
    fn test_unquoted_recipient_is_malformed() {
        let err = parse_line("Sending message `abc` to [127.0.0.1:8080]", 1).unwrap_err();
        assert_eq!(err.kind, EventKind::Send);
    }

    #[test]
    fn test_unterminated_connect_is_malformed() {
        let err = parse_line("Connected to `127.0.0.1:8080", 4).unwrap_err();
        assert_eq!(err.kind, EventKind::Connect);
        assert!(err.to_string().contains("line 4"));
    }

    #[test]
    fn test_parse_error_reports_line_number_in_text() {
        let text = "listening on https://127.0.0.1:8080\nnoise\nSending message `a b` to []\n";
        let err = parse_events(text).unwrap_err();
        assert_eq!(err.line_number, 3);
    }

    #[test]
    fn test_parse_is_pure() {
        let first = EventLog::parse(SAMPLE).unwrap();
        let second = EventLog::parse(SAMPLE).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_event_log_queries() {
        let text = "\
Sending message `m1` to [\"127.0.0.1:8081\"]
Received message `r1` from `127.0.0.1:8081`
Received message `r2` from `127.0.0.1:8082`
Sending message `m2` to [\"127.0.0.1:8081\"]
Received message `r3` from `127.0.0.1:8081`
";
        let log = EventLog::parse(text).unwrap();
        assert_eq!(log.sent_messages(), vec!["m1", "m2"]);
        assert_eq!(log.received_from("127.0.0.1:8081"), vec!["r1", "r3"]);
        assert_eq!(log.received_from("127.0.0.1:8082"), vec!["r2"]);
        assert!(log.binds().is_empty());
        assert!(log.connects().is_empty());
        assert_eq!(log.events().len(), 5);
    }
}
