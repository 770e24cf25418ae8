//! Blocking IMAP4rev1 session over any `Read + Write` stream.
//!
//! Only the handful of commands the triage run needs: LOGIN, SELECT,
//! UID SEARCH, UID FETCH, LIST, CREATE, UID COPY and LOGOUT. The session
//! tracks its own state and refuses commands issued in the wrong one.
//! Run it inside `spawn_blocking`.

use std::io::{BufRead, BufReader, Read, Write};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, warn};

use crate::error::MailboxError;

static UID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bUID (\d+)").expect("static regex"));
static INTERNALDATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"INTERNALDATE "([^"]+)""#).expect("static regex"));

/// Connection state of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No stream.
    Disconnected,
    /// Greeted and authenticated, no mailbox selected.
    Connected,
    /// A mailbox is selected read-write.
    MailboxOpen { mailbox: String },
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::MailboxOpen { .. } => "mailbox-open",
        }
    }
}

/// An untagged (`* ...`) response line and any literals it carried.
#[derive(Debug, Clone, Default)]
pub struct Untagged {
    /// Response text without the leading `* `; literal markers (`{n}`) stay in place.
    pub text: String,
    pub literals: Vec<Literal>,
}

/// Literal payload, with the byte offset in `text` right after its `{n}` marker.
#[derive(Debug, Clone)]
pub struct Literal {
    pub offset: usize,
    pub data: Vec<u8>,
}

/// One entry of a LIST response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub flags: Vec<String>,
    pub delimiter: Option<char>,
    pub name: String,
}

/// The pieces of a FETCH response the client cares about.
#[derive(Debug, Clone, Default)]
pub struct FetchedParts {
    pub uid: Option<u32>,
    pub internal_date: Option<DateTime<Utc>>,
    pub header: Vec<u8>,
    pub body: Vec<u8>,
}

/// IMAP client session.
pub struct ImapSession<S: Read + Write> {
    stream: Option<BufReader<S>>,
    state: SessionState,
    next_tag: u32,
}

impl<S: Read + Write> Default for ImapSession<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Read + Write> ImapSession<S> {
    pub fn new() -> Self {
        Self {
            stream: None,
            state: SessionState::Disconnected,
            next_tag: 1,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, SessionState::MailboxOpen { .. })
    }

    /// Read the greeting from a fresh stream and authenticate.
    pub fn login(&mut self, stream: S, username: &str, password: &str) -> Result<(), MailboxError> {
        if self.state != SessionState::Disconnected {
            return Err(self.invalid_state("LOGIN", "disconnected"));
        }
        self.stream = Some(BufReader::new(stream));

        let greeting = self.read_line()?;
        if !(greeting.starts_with("* OK") || greeting.starts_with("* PREAUTH")) {
            self.drop_stream();
            return Err(MailboxError::Protocol {
                command: "greeting".into(),
                reason: greeting,
            });
        }
        // PREAUTH would skip LOGIN, but state transitions stay the same.
        self.state = SessionState::Connected;

        let command = format!("LOGIN {} {}", quote(username), quote(password));
        match self.run("LOGIN", &command) {
            Ok(_) => {
                debug!(user = %username, "IMAP login succeeded");
                Ok(())
            }
            Err(MailboxError::Command { reason, .. }) => {
                self.drop_stream();
                Err(MailboxError::AuthFailed {
                    user: username.to_string(),
                    reason,
                })
            }
            Err(e) => {
                self.drop_stream();
                Err(e)
            }
        }
    }

    /// Select a mailbox read-write.
    pub fn select(&mut self, mailbox: &str) -> Result<(), MailboxError> {
        self.require_authenticated("SELECT")?;
        self.run("SELECT", &format!("SELECT {}", quote(mailbox)))?;
        self.state = SessionState::MailboxOpen {
            mailbox: mailbox.to_string(),
        };
        Ok(())
    }

    /// `UID SEARCH <criteria>`; returns matching UIDs in server order.
    pub fn uid_search(&mut self, criteria: &str) -> Result<Vec<u32>, MailboxError> {
        self.require_open("UID SEARCH")?;
        let responses = self.run("UID SEARCH", &format!("UID SEARCH {criteria}"))?;
        Ok(responses
            .iter()
            .filter_map(|r| r.text.strip_prefix("SEARCH"))
            .flat_map(|rest| rest.split_whitespace().filter_map(|n| n.parse().ok()))
            .collect())
    }

    /// `UID FETCH <uid> <items>`; returns the FETCH responses.
    pub fn uid_fetch(&mut self, uid: u32, items: &str) -> Result<Vec<Untagged>, MailboxError> {
        self.require_open("UID FETCH")?;
        let responses = self.run("UID FETCH", &format!("UID FETCH {uid} {items}"))?;
        Ok(responses
            .into_iter()
            .filter(|r| is_fetch_response(&r.text))
            .collect())
    }

    /// `LIST "" "*"`: every folder in the account.
    pub fn list(&mut self) -> Result<Vec<ListEntry>, MailboxError> {
        self.require_authenticated("LIST")?;
        let responses = self.run("LIST", "LIST \"\" \"*\"")?;
        Ok(responses.iter().filter_map(parse_list_entry).collect())
    }

    pub fn create(&mut self, folder: &str) -> Result<(), MailboxError> {
        self.require_authenticated("CREATE")?;
        self.run("CREATE", &format!("CREATE {}", quote(folder)))?;
        Ok(())
    }

    pub fn uid_copy(&mut self, uid: u32, folder: &str) -> Result<(), MailboxError> {
        self.require_open("UID COPY")?;
        self.run("UID COPY", &format!("UID COPY {uid} {}", quote(folder)))?;
        Ok(())
    }

    /// End the session. A no-op when already disconnected.
    pub fn logout(&mut self) {
        if self.state == SessionState::Disconnected {
            return;
        }
        if let Err(e) = self.run("LOGOUT", "LOGOUT") {
            debug!(error = %e, "LOGOUT did not complete cleanly");
        }
        self.drop_stream();
    }

    // ── Internals ───────────────────────────────────────────────────

    fn require_authenticated(&self, command: &str) -> Result<(), MailboxError> {
        match self.state {
            SessionState::Disconnected => Err(self.invalid_state(command, "an authenticated session")),
            _ => Ok(()),
        }
    }

    fn require_open(&self, command: &str) -> Result<(), MailboxError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(self.invalid_state(command, "an open mailbox"))
        }
    }

    fn invalid_state(&self, command: &str, expected: &'static str) -> MailboxError {
        MailboxError::InvalidState {
            command: command.to_string(),
            expected,
            actual: self.state.label(),
        }
    }

    fn drop_stream(&mut self) {
        self.stream = None;
        self.state = SessionState::Disconnected;
    }

    /// Send a tagged command and collect untagged responses until completion.
    ///
    /// I/O failures tear the session down so the next caller reconnects.
    fn run(&mut self, name: &str, command: &str) -> Result<Vec<Untagged>, MailboxError> {
        let result = self.exchange(name, command);
        if let Err(MailboxError::Io(_) | MailboxError::Closed) = &result {
            warn!(command = name, "IMAP connection lost");
            self.drop_stream();
        }
        result
    }

    fn exchange(&mut self, name: &str, command: &str) -> Result<Vec<Untagged>, MailboxError> {
        let tag = format!("A{:04}", self.next_tag);
        self.next_tag += 1;

        let stream = self.stream.as_mut().ok_or(MailboxError::Closed)?;
        let writer = stream.get_mut();
        writer.write_all(format!("{tag} {command}\r\n").as_bytes())?;
        writer.flush()?;

        let mut responses = Vec::new();
        loop {
            let line = self.read_line()?;
            if let Some(rest) = line.strip_prefix("* ") {
                let untagged = self.read_untagged(rest.to_string())?;
                if untagged.text.starts_with("BYE") && name != "LOGOUT" {
                    return Err(MailboxError::Closed);
                }
                responses.push(untagged);
            } else if let Some(rest) = line
                .strip_prefix(tag.as_str())
                .and_then(|r| r.strip_prefix(' '))
            {
                let (status, text) = rest.split_once(' ').unwrap_or((rest, ""));
                return match status.to_ascii_uppercase().as_str() {
                    "OK" => Ok(responses),
                    "NO" | "BAD" => Err(MailboxError::Command {
                        command: name.to_string(),
                        reason: format!("{status} {text}"),
                    }),
                    _ => Err(MailboxError::Protocol {
                        command: name.to_string(),
                        reason: line.clone(),
                    }),
                };
            } else if line.starts_with('+') {
                // No command here sends literals, so a continuation is unexpected.
                return Err(MailboxError::Protocol {
                    command: name.to_string(),
                    reason: format!("unexpected continuation: {line}"),
                });
            } else {
                debug!(command = name, line = %line, "Ignoring unrecognized response line");
            }
        }
    }

    /// Read the rest of an untagged response, following `{n}` literals.
    fn read_untagged(&mut self, first: String) -> Result<Untagged, MailboxError> {
        let mut untagged = Untagged {
            text: first,
            literals: Vec::new(),
        };
        while let Some(size) = literal_size(&untagged.text) {
            let stream = self.stream.as_mut().ok_or(MailboxError::Closed)?;
            let mut data = vec![0u8; size];
            stream.read_exact(&mut data)?;
            untagged.literals.push(Literal {
                offset: untagged.text.len(),
                data,
            });
            let rest = self.read_line()?;
            untagged.text.push_str(&rest);
        }
        Ok(untagged)
    }

    /// Read one CRLF-terminated line, without the terminator.
    fn read_line(&mut self) -> Result<String, MailboxError> {
        let stream = self.stream.as_mut().ok_or(MailboxError::Closed)?;
        let mut buf = Vec::new();
        if stream.read_until(b'\n', &mut buf)? == 0 {
            return Err(MailboxError::Closed);
        }
        while buf.last().is_some_and(|b| *b == b'\n' || *b == b'\r') {
            buf.pop();
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

// ── Parsing helpers ─────────────────────────────────────────────────

/// Quote a string for use as an IMAP quoted-string.
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        if ch == '"' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

/// Size of a literal announced at the end of `text` (`... {123}`).
fn literal_size(text: &str) -> Option<usize> {
    let inner = text.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].trim_end_matches('+').parse().ok()
}

fn is_fetch_response(text: &str) -> bool {
    let mut parts = text.split_whitespace();
    parts.next().is_some_and(|n| n.parse::<u32>().is_ok())
        && parts.next().is_some_and(|w| w.eq_ignore_ascii_case("FETCH"))
}

/// Parse `LIST (<flags>) <delimiter> <name>`.
pub fn parse_list_entry(untagged: &Untagged) -> Option<ListEntry> {
    let rest = untagged.text.strip_prefix("LIST ")?.trim_start();
    let rest = rest.strip_prefix('(')?;
    let close = rest.find(')')?;
    let flags = rest[..close]
        .split_whitespace()
        .map(str::to_string)
        .collect();
    let rest = rest[close + 1..].trim_start();

    let (delimiter, rest) = if let Some(after) = rest.strip_prefix("NIL") {
        (None, after)
    } else {
        let (token, after) = take_quoted(rest)?;
        (token.chars().next(), after)
    };
    let rest = rest.trim_start();

    let name = if let Some(literal) = untagged.literals.first() {
        String::from_utf8_lossy(&literal.data).into_owned()
    } else if rest.starts_with('"') {
        take_quoted(rest)?.0
    } else {
        rest.trim().to_string()
    };

    Some(ListEntry {
        flags,
        delimiter,
        name,
    })
}

/// Take a leading quoted string, unescaping `\"` and `\\`.
fn take_quoted(input: &str) -> Option<(String, &str)> {
    let body = input.strip_prefix('"')?;
    let mut out = String::new();
    let mut escaped = false;
    for (i, ch) in body.char_indices() {
        if escaped {
            out.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == '"' {
            return Some((out, &body[i + 1..]));
        } else {
            out.push(ch);
        }
    }
    None
}

/// Pull UID, INTERNALDATE and the header/text sections out of a FETCH response.
pub fn parse_fetch(untagged: &Untagged) -> FetchedParts {
    let uid = UID_RE
        .captures(&untagged.text)
        .and_then(|c| c[1].parse().ok());
    let internal_date = INTERNALDATE_RE
        .captures(&untagged.text)
        .and_then(|c| parse_internal_date(&c[1]));

    let mut parts = FetchedParts {
        uid,
        internal_date,
        ..Default::default()
    };

    for literal in &untagged.literals {
        let before = &untagged.text[..literal.offset];
        let Some(section_start) = before.rfind("BODY[") else {
            continue;
        };
        let section = before[section_start..].to_ascii_uppercase();
        if section.contains("HEADER") {
            parts.header = literal.data.clone();
        } else if section.contains("TEXT") {
            parts.body = literal.data.clone();
        }
    }
    parts
}

/// Parse an INTERNALDATE value such as ` 7-Jul-2025 14:03:11 +0200`.
pub fn parse_internal_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(value.trim(), "%d-%b-%Y %H:%M:%S %z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    /// Stream that replays a fixed server transcript and records what the client wrote.
    struct Scripted {
        input: Cursor<Vec<u8>>,
        written: Vec<u8>,
    }

    impl Scripted {
        fn new(server: &str) -> Self {
            Self {
                input: Cursor::new(server.as_bytes().to_vec()),
                written: Vec::new(),
            }
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn written(session: &ImapSession<Scripted>) -> String {
        let stream = session.stream.as_ref().unwrap().get_ref();
        String::from_utf8_lossy(&stream.written).into_owned()
    }

    #[test]
    fn login_and_select_transition_state() {
        let mut session = ImapSession::new();
        let server = "* OK ready\r\n\
                      A0001 OK LOGIN completed\r\n\
                      * 3 EXISTS\r\n\
                      A0002 OK [READ-WRITE] SELECT completed\r\n";
        session
            .login(Scripted::new(server), "me@example.com", "pa\"ss")
            .unwrap();
        assert_eq!(session.state(), &SessionState::Connected);

        session.select("INBOX").unwrap();
        assert!(session.is_open());

        let sent = written(&session);
        assert!(sent.contains("A0001 LOGIN \"me@example.com\" \"pa\\\"ss\"\r\n"));
        assert!(sent.contains("A0002 SELECT \"INBOX\"\r\n"));
    }

    #[test]
    fn rejected_login_is_auth_failure() {
        let mut session = ImapSession::new();
        let server = "* OK ready\r\nA0001 NO [AUTHENTICATIONFAILED] Invalid credentials\r\n";
        let err = session
            .login(Scripted::new(server), "me@example.com", "wrong")
            .unwrap_err();
        assert!(matches!(err, MailboxError::AuthFailed { .. }));
        assert_eq!(session.state(), &SessionState::Disconnected);
    }

    #[test]
    fn commands_refused_in_wrong_state() {
        let mut session: ImapSession<Scripted> = ImapSession::new();
        let err = session.uid_search("ALL").unwrap_err();
        assert!(matches!(
            err,
            MailboxError::InvalidState { actual: "disconnected", .. }
        ));
        assert!(session.create("X").is_err());
    }

    #[test]
    fn search_returns_uids_in_order() {
        let mut session = ImapSession::new();
        let server = "* OK ready\r\n\
                      A0001 OK\r\n\
                      A0002 OK\r\n\
                      * SEARCH 12 15 19\r\n\
                      A0003 OK SEARCH completed\r\n";
        session.login(Scripted::new(server), "u", "p").unwrap();
        session.select("INBOX").unwrap();
        let uids = session.uid_search("SINCE 17-Oct-2026").unwrap();
        assert_eq!(uids, vec![12, 15, 19]);
    }

    #[test]
    fn fetch_reads_literals() {
        let header = "Subject: Hello\r\nFrom: a@b.com\r\n\r\n";
        let body = "Hi there";
        let server = format!(
            "* OK ready\r\nA0001 OK\r\nA0002 OK\r\n\
             * 4 FETCH (UID 19 INTERNALDATE \"17-Oct-2026 09:15:00 +0000\" BODY[HEADER] {{{}}}\r\n{} BODY[TEXT]<0> {{{}}}\r\n{})\r\n\
             A0003 OK FETCH completed\r\n",
            header.len(),
            header,
            body.len(),
            body
        );
        let mut session = ImapSession::new();
        session.login(Scripted::new(&server), "u", "p").unwrap();
        session.select("INBOX").unwrap();

        let responses = session.uid_fetch(19, "(UID)").unwrap();
        assert_eq!(responses.len(), 1);
        let parts = parse_fetch(&responses[0]);
        assert_eq!(parts.uid, Some(19));
        assert_eq!(
            parts.internal_date.unwrap().to_rfc3339(),
            "2026-10-17T09:15:00+00:00"
        );
        assert_eq!(parts.header, header.as_bytes());
        assert_eq!(parts.body, body.as_bytes());
    }

    #[test]
    fn failed_command_keeps_session() {
        let server = "* OK ready\r\nA0001 OK\r\nA0002 NO [ALREADYEXISTS] Mailbox exists\r\n";
        let mut session = ImapSession::new();
        session.login(Scripted::new(server), "u", "p").unwrap();
        let err = session.create("AI-Priority").unwrap_err();
        assert!(matches!(err, MailboxError::Command { .. }));
        assert_eq!(session.state(), &SessionState::Connected);
    }

    #[test]
    fn closed_stream_disconnects() {
        let server = "* OK ready\r\nA0001 OK\r\n";
        let mut session = ImapSession::new();
        session.login(Scripted::new(server), "u", "p").unwrap();
        let err = session.list().unwrap_err();
        assert!(matches!(err, MailboxError::Closed));
        assert_eq!(session.state(), &SessionState::Disconnected);
    }

    #[test]
    fn logout_twice_is_safe() {
        let server = "* OK ready\r\nA0001 OK\r\n* BYE logging out\r\nA0002 OK LOGOUT\r\n";
        let mut session = ImapSession::new();
        session.login(Scripted::new(server), "u", "p").unwrap();
        session.logout();
        assert_eq!(session.state(), &SessionState::Disconnected);
        session.logout();
        assert_eq!(session.state(), &SessionState::Disconnected);
    }

    #[test]
    fn parse_list_variants() {
        let quoted = Untagged {
            text: r#"LIST (\HasChildren) "/" "AI-Priority""#.into(),
            literals: vec![],
        };
        let entry = parse_list_entry(&quoted).unwrap();
        assert_eq!(entry.name, "AI-Priority");
        assert_eq!(entry.delimiter, Some('/'));
        assert_eq!(entry.flags, vec!["\\HasChildren"]);

        let atom = Untagged {
            text: r#"LIST (\HasNoChildren) "." INBOX"#.into(),
            literals: vec![],
        };
        let entry = parse_list_entry(&atom).unwrap();
        assert_eq!(entry.name, "INBOX");
        assert_eq!(entry.delimiter, Some('.'));

        let noselect = Untagged {
            text: r#"LIST (\Noselect \HasChildren) "/" "[Gmail]""#.into(),
            literals: vec![],
        };
        assert_eq!(
            parse_list_entry(&noselect).unwrap().flags,
            vec!["\\Noselect", "\\HasChildren"]
        );
    }

    #[test]
    fn literal_size_detection() {
        assert_eq!(literal_size("BODY[TEXT] {42}"), Some(42));
        assert_eq!(literal_size("BODY[TEXT] {42+}"), Some(42));
        assert_eq!(literal_size("FLAGS (\\Seen)"), None);
    }

    #[test]
    fn internal_date_with_space_padded_day() {
        let dt = parse_internal_date(" 7-Jul-2025 14:03:11 +0200").unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-07-07T12:03:11+00:00");
    }
}
