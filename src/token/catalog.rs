//! Immutable token catalog
//!
//! The catalog is a snapshot of the external configuration loader's output,
//! built once and handed to the batch processor at batch start. A reload
//! produces a new catalog; in-flight batches keep the snapshot they started
//! with.

use super::{Endpoint, Token, TokenKind};
use crate::defaults;
use std::collections::HashMap;
use tracing::warn;

/// One row from the external configuration loader
#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub token_id: String,
    /// Kind as a case-insensitive string ("fbc" / "rpc")
    pub token_kind: String,
    pub ip_address: String,
    pub port: Option<u16>,
    pub protocol: Option<String>,
}

impl TokenRecord {
    /// Convert a record into a token owned by `node`.
    ///
    /// Returns None for unknown kinds. A malformed or missing IP degrades to
    /// the sentinel address; session connect fails gracefully on it, so a bad
    /// record costs one failed task rather than a rejected catalog.
    pub fn to_token(&self, node: &str) -> Option<Token> {
        let kind = TokenKind::parse(&self.token_kind)?;

        let host = self.ip_address.trim();
        let host = if host.is_empty() || host.parse::<std::net::IpAddr>().is_err() {
            defaults::FALLBACK_ADDRESS.to_string()
        } else {
            host.to_string()
        };

        let mut token = Token::new(
            &self.token_id,
            kind,
            node,
            Endpoint::new(host, self.port.unwrap_or_else(|| kind.default_port())),
        );
        if let Some(protocol) = &self.protocol {
            token.protocol = protocol.trim().to_ascii_lowercase();
        }
        Some(token)
    }
}

/// Tokens known for one node
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub name: String,
    /// Node management address, used for synthesized tokens
    pub address: String,
    pub tokens: Vec<Token>,
}

/// Read-only token catalog keyed by node name
#[derive(Debug, Clone, Default)]
pub struct TokenCatalog {
    nodes: HashMap<String, NodeEntry>,
}

impl TokenCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node and its token records. Records with unknown kinds are
    /// skipped with a warning.
    pub fn add_node(&mut self, name: &str, address: &str, records: &[TokenRecord]) {
        let tokens = records
            .iter()
            .filter_map(|record| {
                let token = record.to_token(name);
                if token.is_none() {
                    warn!(
                        "Skipping token {} on {}: unknown kind {:?}",
                        record.token_id, name, record.token_kind
                    );
                }
                token
            })
            .collect();

        self.nodes.insert(
            name.to_string(),
            NodeEntry {
                name: name.to_string(),
                address: address.to_string(),
                tokens,
            },
        );
    }

    /// Look up a node's management address
    pub fn node_address(&self, node: &str) -> Option<&str> {
        self.nodes.get(node).map(|entry| entry.address.as_str())
    }

    /// Number of tokens known for a node
    pub fn token_count(&self, node: &str) -> usize {
        self.nodes.get(node).map(|e| e.tokens.len()).unwrap_or(0)
    }

    /// Resolve a requested token against the node's known set.
    ///
    /// Exact match is by (normalized id, kind). A miss never fails: it
    /// degrades to a synthesized transient token carrying the node address
    /// when the node is known, or default endpoint fields otherwise.
    pub fn resolve(&self, node: &str, raw_id: &str, kind: TokenKind) -> Token {
        let normalized = kind.normalize_id(raw_id);

        if let Some(entry) = self.nodes.get(node) {
            if let Some(token) = entry
                .tokens
                .iter()
                .find(|t| t.token_id == normalized && t.kind == kind)
            {
                return token.clone();
            }
            // Known node, unknown token: synthesize against the node address
            return Token::new(
                raw_id,
                kind,
                node,
                Endpoint::new(entry.address.clone(), kind.default_port()),
            );
        }

        Token::new(raw_id, kind, node, Endpoint::default())
    }
}
