//! Mailbox client: fetch recent messages, file them into folders, disconnect.
//!
//! Wraps the blocking [`ImapSession`] behind the async [`MailStore`] trait.
//! Each operation locks the session and runs on the blocking pool; the session
//! itself is exclusively owned by one client, and one client by one run.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, Utc};
use mail_parser::MessageParser;
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use super::folders::{FolderTree, target_folders};
use super::protocol::{ImapSession, SessionState, parse_fetch};
use super::types::{Classification, Message};
use crate::config::MailboxConfig;
use crate::error::MailboxError;

/// Mailbox that messages are fetched from and copied out of.
pub const INBOX: &str = "INBOX";

/// Windows up to this long are searched by day and then filtered precisely.
const SUB_DAY_WINDOW: Duration = Duration::from_secs(24 * 3600);

/// Extra days searched below the cutoff for sub-day windows (today + yesterday).
const LOOKBACK_FLOOR_DAYS: u64 = 1;

/// Body bytes requested per message. Large enough that an encoded first
/// text part usually arrives whole.
const BODY_FETCH_BYTES: usize = 16384;

/// Characters of decoded body text kept on a [`Message`].
const BODY_EXCERPT_CHARS: usize = 4096;

/// The full header (MIME structure included) plus a bounded prefix of the body.
const FETCH_ITEMS: &str = "(UID INTERNALDATE BODY.PEEK[HEADER] BODY.PEEK[TEXT]<0.16384>)";

// ── MailStore trait ─────────────────────────────────────────────────

/// Mail-store operations the pipeline depends on.
#[async_trait]
pub trait MailStore: Send + Sync {
    /// Messages received within `window` of now, in mailbox search order.
    ///
    /// Connection-level failures are returned; a single message that cannot be
    /// fetched is replaced by [`Message::placeholder`] and filtered out.
    async fn fetch_recent(&self, window: Duration) -> Result<Vec<Message>, MailboxError>;

    /// File a message into the folder of every true facet.
    ///
    /// Best-effort: failures are logged and never surface to the caller.
    async fn organize(&self, uid: u32, classification: &Classification);

    /// Close the connection. Safe to call repeatedly.
    async fn disconnect(&self);
}

// ── Connector ───────────────────────────────────────────────────────

/// Opens the byte stream a session runs over.
pub trait Connector: Send + Sync + 'static {
    type Stream: Read + Write + Send + 'static;

    fn connect(&self, config: &MailboxConfig) -> Result<Self::Stream, MailboxError>;
}

/// Implicit-TLS stream (IMAPS, port 993).
pub type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Connects over TCP and wraps the socket in rustls with the webpki roots.
#[derive(Debug, Clone, Default)]
pub struct TlsConnector;

impl Connector for TlsConnector {
    type Stream = TlsStream;

    fn connect(&self, config: &MailboxConfig) -> Result<TlsStream, MailboxError> {
        let tcp = TcpStream::connect((config.host.as_str(), config.port)).map_err(|e| {
            MailboxError::Connect {
                host: config.host.clone(),
                port: config.port,
                reason: e.to_string(),
            }
        })?;
        tcp.set_read_timeout(Some(config.read_timeout))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls::pki_types::ServerName::try_from(config.host.clone())
            .map_err(|e| MailboxError::Tls(format!("invalid server name: {e}")))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| MailboxError::Tls(e.to_string()))?;

        Ok(rustls::StreamOwned::new(conn, tcp))
    }
}

// ── MailboxClient ───────────────────────────────────────────────────

/// IMAP-backed [`MailStore`]. Connects lazily on first use.
pub struct MailboxClient<C: Connector = TlsConnector> {
    config: Arc<MailboxConfig>,
    connector: Arc<C>,
    session: Arc<Mutex<ImapSession<C::Stream>>>,
}

impl MailboxClient<TlsConnector> {
    pub fn new(config: MailboxConfig) -> Self {
        Self::with_connector(config, TlsConnector)
    }
}

impl<C: Connector> MailboxClient<C> {
    pub fn with_connector(config: MailboxConfig, connector: C) -> Self {
        Self {
            config: Arc::new(config),
            connector: Arc::new(connector),
            session: Arc::new(Mutex::new(ImapSession::new())),
        }
    }

    /// Run `op` against an open session on the blocking pool.
    ///
    /// Reconnects and reselects INBOX first if the session is not open.
    async fn with_open_session<T, F>(&self, op: F) -> Result<T, MailboxError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapSession<C::Stream>) -> Result<T, MailboxError> + Send + 'static,
    {
        let config = Arc::clone(&self.config);
        let connector = Arc::clone(&self.connector);
        let session = Arc::clone(&self.session);

        tokio::task::spawn_blocking(move || {
            let mut session = session
                .lock()
                .map_err(|_| MailboxError::Task("session lock poisoned".into()))?;
            ensure_open(&mut *session, &config, connector.as_ref())?;
            op(&mut *session)
        })
        .await
        .map_err(|e| MailboxError::Task(e.to_string()))?
    }

    /// Fetch and parse one UID, substituting a placeholder on failure.
    fn fetch_one(session: &mut ImapSession<C::Stream>, uid: u32) -> Message {
        let result = session.uid_fetch(uid, FETCH_ITEMS).and_then(|responses| {
            responses
                .iter()
                .map(parse_fetch)
                .find(|parts| parts.uid.is_none_or(|u| u == uid))
                .ok_or_else(|| MailboxError::Protocol {
                    command: "UID FETCH".into(),
                    reason: format!("no FETCH data for uid {uid}"),
                })
        });

        match result {
            Ok(parts) => build_message(uid, parts.internal_date, &parts.header, &parts.body),
            Err(e) => {
                warn!(uid, error = %e, "Failed to fetch email, using placeholder");
                Message::placeholder(uid)
            }
        }
    }

    /// Create any missing segments of `folder`, then copy into it.
    ///
    /// LIST and CREATE failures are logged and the copy is still attempted;
    /// only the COPY result decides whether filing failed. Returns the server
    /// name the message was copied to.
    fn file_into(
        session: &mut ImapSession<C::Stream>,
        uid: u32,
        folder: &str,
    ) -> Result<String, MailboxError> {
        let tree = match session.list() {
            Ok(entries) => FolderTree::from_entries(&entries),
            Err(e) => {
                warn!(folder, error = %e, "Could not list folders, attempting copy anyway");
                FolderTree::default()
            }
        };
        let missing = tree.missing_prefixes(folder);
        if missing.is_empty() {
            debug!(folder, "Folder already exists");
        }
        for prefix in missing {
            info!(folder = %prefix, "Creating folder");
            if let Err(e) = session.create(&prefix) {
                warn!(folder = %prefix, error = %e, "Could not create folder, attempting copy anyway");
            }
        }
        let target = tree.server_name(folder);
        session.uid_copy(uid, &target)?;
        Ok(target)
    }
}

fn ensure_open<C: Connector>(
    session: &mut ImapSession<C::Stream>,
    config: &MailboxConfig,
    connector: &C,
) -> Result<(), MailboxError> {
    if session.is_open() {
        return Ok(());
    }
    if *session.state() != SessionState::Connected {
        info!(host = %config.host, port = config.port, "Connecting to IMAP server");
        let stream = connector.connect(config)?;
        session.login(stream, &config.username, config.password.expose_secret())?;
        info!("IMAP connection ready");
    }
    session.select(INBOX)?;
    debug!("Inbox opened");
    Ok(())
}

#[async_trait]
impl<C: Connector> MailStore for MailboxClient<C> {
    async fn fetch_recent(&self, window: Duration) -> Result<Vec<Message>, MailboxError> {
        let now = Utc::now();
        let plan = SearchPlan::new(now, window);
        info!(
            since = %plan.since,
            cutoff = %plan.cutoff,
            precise = plan.precise,
            "Searching for recent emails"
        );

        let criteria = format!("SINCE {}", imap_date(plan.since));
        let uids = self
            .with_open_session(move |session| session.uid_search(&criteria))
            .await?;

        if uids.is_empty() {
            info!("No emails found for the specified date range");
            return Ok(Vec::new());
        }
        info!(count = uids.len(), "Found candidate emails, fetching headers");

        let batch_size = self.config.fetch_batch_size.max(1);
        let batch_count = uids.len().div_ceil(batch_size);
        let mut messages = Vec::with_capacity(uids.len());

        for (index, batch) in uids.chunks(batch_size).enumerate() {
            debug!(batch = index + 1, of = batch_count, uids = ?batch, "Fetching batch");
            let batch = batch.to_vec();
            let fetched = self
                .with_open_session(move |session| {
                    Ok(batch
                        .into_iter()
                        .map(|uid| Self::fetch_one(session, uid))
                        .collect::<Vec<_>>())
                })
                .await?;

            messages.extend(fetched.into_iter().filter(|m| {
                if m.is_placeholder() {
                    debug!(uid = m.uid, "Email could not be fetched, skipping");
                    return false;
                }
                let keep = plan.keeps(m.date);
                if !keep {
                    debug!(uid = m.uid, date = %m.date, "Email outside window, skipping");
                }
                keep
            }));

            if index + 1 < batch_count && !self.config.fetch_batch_pause.is_zero() {
                tokio::time::sleep(self.config.fetch_batch_pause).await;
            }
        }

        info!(count = messages.len(), "Fetched emails within the time window");
        Ok(messages)
    }

    async fn organize(&self, uid: u32, classification: &Classification) {
        let folders = target_folders(&self.config.folder_root, classification);
        if folders.is_empty() {
            debug!(uid, "No folders to apply");
            return;
        }

        for folder in folders {
            let target = folder.clone();
            let result = self
                .with_open_session(move |session| Self::file_into(session, uid, &target))
                .await;
            match result {
                Ok(target) => info!(uid, folder = %target, "Copied email to folder"),
                Err(e) => warn!(uid, folder = %folder, error = %e, "Could not copy email to folder"),
            }
        }
    }

    async fn disconnect(&self) {
        let session = Arc::clone(&self.session);
        let result = tokio::task::spawn_blocking(move || {
            if let Ok(mut session) = session.lock() {
                session.logout();
            }
        })
        .await;
        match result {
            Ok(()) => debug!("IMAP connection closed"),
            Err(e) => warn!(error = %e, "Error during IMAP disconnect"),
        }
    }
}

// ── Search window ───────────────────────────────────────────────────

/// How a lookback window maps onto IMAP's day-granular SINCE search.
#[derive(Debug, Clone, Copy)]
struct SearchPlan {
    /// Exact cutoff instant.
    cutoff: DateTime<Utc>,
    /// Day passed to SINCE.
    since: NaiveDate,
    /// Whether results are filtered to the exact cutoff.
    precise: bool,
}

impl SearchPlan {
    fn new(now: DateTime<Utc>, window: Duration) -> Self {
        let cutoff = chrono::Duration::from_std(window)
            .ok()
            .and_then(|delta| now.checked_sub_signed(delta))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        if window <= SUB_DAY_WINDOW {
            let since = now
                .date_naive()
                .checked_sub_days(Days::new(LOOKBACK_FLOOR_DAYS))
                .unwrap_or(NaiveDate::MIN);
            Self {
                cutoff,
                since,
                precise: true,
            }
        } else {
            Self {
                cutoff,
                since: cutoff.date_naive(),
                precise: false,
            }
        }
    }

    fn keeps(&self, date: DateTime<Utc>) -> bool {
        if self.precise {
            date >= self.cutoff
        } else {
            date.date_naive() >= self.since
        }
    }
}

/// IMAP date (`17-Oct-2026`).
fn imap_date(date: NaiveDate) -> String {
    date.format("%-d-%b-%Y").to_string()
}

// ── Message building ────────────────────────────────────────────────

/// Build a [`Message`] from the fetched header and (possibly truncated) body.
fn build_message(
    uid: u32,
    internal_date: Option<DateTime<Utc>>,
    header: &[u8],
    body: &[u8],
) -> Message {
    let body = &body[..body.len().min(BODY_FETCH_BYTES)];
    let raw = [header, body].concat();
    let parsed = MessageParser::default().parse(&raw);

    let subject = parsed
        .as_ref()
        .and_then(|p| p.subject())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("No Subject")
        .to_string();
    let from = parsed
        .as_ref()
        .and_then(|p| p.from())
        .map(format_addresses)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "Unknown".to_string());
    let to = parsed
        .as_ref()
        .and_then(|p| p.to())
        .map(format_addresses)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "Unknown".to_string());
    let header_date = parsed
        .as_ref()
        .and_then(|p| p.date())
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0));
    let message_id = parsed
        .as_ref()
        .and_then(|p| p.message_id())
        .map(|id| id.to_string())
        .unwrap_or_else(|| format!("uid-{uid}"));

    let date = internal_date.or(header_date).unwrap_or_else(|| {
        warn!(uid, "Email has no usable date, treating as just received");
        Utc::now()
    });

    Message {
        uid,
        subject,
        from,
        to,
        date,
        body: body_excerpt(parsed.as_ref(), body),
        message_id,
    }
}

fn format_addresses(address: &mail_parser::Address) -> String {
    address
        .iter()
        .map(|addr| match (addr.name(), addr.address()) {
            (Some(name), Some(email)) => format!("{name} <{email}>"),
            (None, Some(email)) => email.to_string(),
            (Some(name), None) => name.to_string(),
            (None, None) => String::new(),
        })
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Readable body text: the first text part, else the first HTML part with
/// tags stripped. Falls back to the raw section when MIME parsing fails.
fn body_excerpt(parsed: Option<&mail_parser::Message<'_>>, raw_body: &[u8]) -> String {
    let text = match parsed {
        Some(p) => p
            .body_text(0)
            .map(|text| text.into_owned())
            .or_else(|| p.body_html(0).map(|html| strip_html(&html)))
            .unwrap_or_default(),
        None => strip_html(&String::from_utf8_lossy(raw_body)),
    };
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match collapsed.char_indices().nth(BODY_EXCERPT_CHARS) {
        Some((end, _)) => collapsed[..end].to_string(),
        None => collapsed,
    }
}

fn strip_html(html: &str) -> String {
    let mut result = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result
}

// ── Tests ───────────────────────────────────────────────────────────
