//! Mail-store access: IMAP session, folder tree and the pipeline-facing client.

pub mod client;
pub mod folders;
pub mod protocol;
pub mod types;

pub use client::{Connector, INBOX, MailStore, MailboxClient, TlsConnector};
pub use types::{Classification, Message};
