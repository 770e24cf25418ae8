//! Organizational folder tree and facet → folder mapping.

use std::collections::BTreeMap;

use super::protocol::ListEntry;
use super::types::Classification;

/// Child folder for messages that need a reply.
pub const NEEDS_REPLY_FOLDER: &str = "Needs Reply";
/// Child folder for business opportunities.
pub const BUSINESS_FOLDER: &str = "Business";

/// Hierarchy delimiter assumed when LIST reports none.
pub const DEFAULT_DELIMITER: char = '/';

/// Hierarchical folder names as reported by LIST.
///
/// Paths passed in are always `/`-delimited; names handed back for CREATE and
/// COPY use the server's own delimiter.
#[derive(Debug, Clone)]
pub struct FolderTree {
    root: FolderNode,
    delimiter: char,
}

impl Default for FolderTree {
    fn default() -> Self {
        Self {
            root: FolderNode::default(),
            delimiter: DEFAULT_DELIMITER,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct FolderNode {
    children: BTreeMap<String, FolderNode>,
}

impl FolderTree {
    /// Build the tree from LIST entries, splitting each name on its own delimiter.
    ///
    /// The first delimiter LIST reports becomes the tree's delimiter.
    pub fn from_entries(entries: &[ListEntry]) -> Self {
        let mut tree = Self::default();
        if let Some(delim) = entries.iter().find_map(|e| e.delimiter) {
            tree.delimiter = delim;
        }
        for entry in entries {
            match entry.delimiter {
                Some(delim) => tree.insert(entry.name.split(delim)),
                None => tree.insert(std::iter::once(entry.name.as_str())),
            }
        }
        tree
    }

    /// Record a folder path (segments from the root).
    pub fn insert<'a>(&mut self, segments: impl IntoIterator<Item = &'a str>) {
        let mut node = &mut self.root;
        for segment in segments.into_iter().filter(|s| !s.is_empty()) {
            node = node.children.entry(segment.to_string()).or_default();
        }
    }

    /// Walk a `/`-delimited path segment by segment.
    ///
    /// The first missing segment short-circuits to `false`.
    pub fn contains(&self, path: &str) -> bool {
        let mut node = &self.root;
        for segment in split_path(path) {
            match node.children.get(segment) {
                Some(child) => node = child,
                None => return false,
            }
        }
        true
    }

    pub fn delimiter(&self) -> char {
        self.delimiter
    }

    /// The mailbox name the server knows `path` by.
    pub fn server_name(&self, path: &str) -> String {
        let mut buf = [0; 4];
        let delim: &str = self.delimiter.encode_utf8(&mut buf);
        split_path(path).collect::<Vec<_>>().join(delim)
    }

    /// Server names of every prefix of `path` that does not exist yet, parent first.
    pub fn missing_prefixes(&self, path: &str) -> Vec<String> {
        let segments: Vec<&str> = split_path(path).collect();
        (1..=segments.len())
            .map(|n| segments[..n].join("/"))
            .filter(|prefix| !self.contains(prefix))
            .map(|prefix| self.server_name(&prefix))
            .collect()
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Folder paths a classification should be filed under, in a stable order.
pub fn target_folders(root: &str, classification: &Classification) -> Vec<String> {
    let mut folders = Vec::new();
    if classification.needs_reply {
        folders.push(format!("{root}/{NEEDS_REPLY_FOLDER}"));
    }
    if classification.is_business {
        folders.push(format!("{root}/{BUSINESS_FOLDER}"));
    }
    folders
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, delim: Option<char>) -> ListEntry {
        ListEntry {
            flags: vec![],
            delimiter: delim,
            name: name.to_string(),
        }
    }

    #[test]
    fn contains_walks_segments() {
        let tree = FolderTree::from_entries(&[
            entry("INBOX", Some('/')),
            entry("AI-Priority", Some('/')),
            entry("AI-Priority/Needs Reply", Some('/')),
        ]);
        assert!(tree.contains("AI-Priority"));
        assert!(tree.contains("AI-Priority/Needs Reply"));
        assert!(!tree.contains("AI-Priority/Business"));
        assert!(!tree.contains("Other/Needs Reply"));
    }

    #[test]
    fn server_delimiter_respected() {
        let mut tree = FolderTree::from_entries(&[
            entry("INBOX", Some('.')),
            entry("AI-Priority.Business", Some('.')),
        ]);
        assert_eq!(tree.delimiter(), '.');
        assert!(tree.contains("AI-Priority/Business"));
        assert_eq!(
            tree.server_name("AI-Priority/Needs Reply"),
            "AI-Priority.Needs Reply"
        );
        assert_eq!(
            tree.missing_prefixes("AI-Priority/Needs Reply"),
            vec!["AI-Priority.Needs Reply"]
        );

        // Once the server lists what was created, nothing is missing.
        tree.insert("AI-Priority.Needs Reply".split('.'));
        assert!(tree.missing_prefixes("AI-Priority/Needs Reply").is_empty());
    }

    #[test]
    fn no_delimiter_defaults_to_slash() {
        let tree = FolderTree::from_entries(&[entry("INBOX", None)]);
        assert_eq!(tree.delimiter(), DEFAULT_DELIMITER);
        assert_eq!(
            tree.missing_prefixes("AI-Priority/Business"),
            vec!["AI-Priority", "AI-Priority/Business"]
        );
    }

    #[test]
    fn missing_prefixes_parent_first() {
        let tree = FolderTree::from_entries(&[entry("INBOX", Some('/'))]);
        assert_eq!(
            tree.missing_prefixes("AI-Priority/Needs Reply"),
            vec!["AI-Priority", "AI-Priority/Needs Reply"]
        );

        let tree = FolderTree::from_entries(&[entry("AI-Priority", Some('/'))]);
        assert_eq!(
            tree.missing_prefixes("AI-Priority/Business"),
            vec!["AI-Priority/Business"]
        );
    }

    #[test]
    fn target_folders_per_facet() {
        let both = Classification {
            needs_reply: true,
            is_business: true,
            reasoning: String::new(),
        };
        assert_eq!(
            target_folders("AI-Priority", &both),
            vec!["AI-Priority/Needs Reply", "AI-Priority/Business"]
        );

        let neither = Classification::default();
        assert!(target_folders("AI-Priority", &neither).is_empty());
    }
}
