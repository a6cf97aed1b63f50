//! Token model: kinds, ID normalization, and command templates
//!
//! A token identifies one addressable sub-device within a node. Tokens are
//! immutable value objects once constructed; the only field attached later is
//! the resolved per-token log path.

mod catalog;

pub use catalog::{NodeEntry, TokenCatalog, TokenRecord};

use crate::batch::CommandAction;
use crate::defaults;
use std::fmt;
use std::path::PathBuf;

/// The closed set of sub-device kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// Field bus controller: numeric IDs, read-only interaction
    Fbc,
    /// Remote peripheral card: free-form IDs, print/clear interaction
    Rpc,
}

impl TokenKind {
    /// Parse a kind from an external record, case-insensitively
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fbc" => Some(TokenKind::Fbc),
            "rpc" => Some(TokenKind::Rpc),
            _ => None,
        }
    }

    /// Normalize a raw token ID per this kind's rule.
    ///
    /// Fbc: all-numeric IDs are zero-padded to 3 digits, alphanumeric IDs are
    /// upper-cased. Rpc: lower-cased with non-alphanumeric characters
    /// stripped.
    pub fn normalize_id(&self, raw: &str) -> String {
        let raw = raw.trim();
        match self {
            TokenKind::Fbc => {
                if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit()) {
                    format!("{:0>3}", raw)
                } else {
                    raw.to_ascii_uppercase()
                }
            }
            TokenKind::Rpc => raw
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .map(|c| c.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Build the wire command for a normalized ID.
    ///
    /// The trailing "0000" suffix is a fixed protocol convention and must be
    /// preserved byte-for-byte.
    pub fn command(&self, normalized_id: &str, action: CommandAction) -> String {
        match self {
            // Fbc devices only support the read exchange
            TokenKind::Fbc => format!("read fbc {}0000", normalized_id),
            TokenKind::Rpc => match action {
                CommandAction::Clear => format!("clear rpc {}0000", normalized_id),
                // Read defaults to the non-destructive print
                CommandAction::Read | CommandAction::Print => {
                    format!("print rpc {}0000", normalized_id)
                }
            },
        }
    }

    /// Default remote port for endpoints of this kind
    pub fn default_port(&self) -> u16 {
        match self {
            TokenKind::Fbc | TokenKind::Rpc => defaults::DEFAULT_PORT,
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Fbc => write!(f, "FBC"),
            TokenKind::Rpc => write!(f, "RPC"),
        }
    }
}

/// Remote endpoint of a token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// "host:port" form used for socket connects and log lines
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            host: defaults::FALLBACK_ADDRESS.into(),
            port: defaults::DEFAULT_PORT,
        }
    }
}

/// One addressable sub-device within a node
#[derive(Debug, Clone)]
pub struct Token {
    /// Normalized identifier, unique within (node, kind)
    pub token_id: String,
    pub kind: TokenKind,
    pub owning_node: String,
    pub endpoint: Endpoint,
    /// Session protocol, "telnet" unless the record says otherwise
    pub protocol: String,
    /// Resolved per-token log path, attached when the log stream is opened
    pub log_path: Option<PathBuf>,
}

impl Token {
    /// Construct a token with a normalized ID and default protocol
    pub fn new(raw_id: &str, kind: TokenKind, node: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            token_id: kind.normalize_id(raw_id),
            kind,
            owning_node: node.into(),
            endpoint,
            protocol: defaults::DEFAULT_PROTOCOL.into(),
            log_path: None,
        }
    }

    /// Registry key for session sharing: one session per (node, kind)
    pub fn session_key(&self) -> String {
        format!("{}_{}", self.owning_node, self.kind)
    }
}
