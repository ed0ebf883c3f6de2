//! Audit logging for tenant-visible gateway events.
//!
//! Every entry is emitted via `tracing::info!` on the dedicated `audit`
//! target with structured fields, making the trail queryable by any log
//! aggregator. The gateway itself never reads entries back.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `request` | Any authenticated request completes |
//! | `token.issued` | A gateway token is issued for a tenant |
//! | `oauth.redirect` | An authorization URL is handed to the browser |
//! | `oauth.exchanged` | An authorization code is exchanged for tokens |
//! | `oauth.refreshed` | An access token is refreshed |
//! | `oauth.invalidated` | Stored OAuth artifacts are cleared |
//! | `tool.executed` | A tool call is forwarded upstream |

use serde::Serialize;

/// Outcome class recorded with every entry.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The operation completed
    Ok,
    /// The operation was rejected before reaching upstream
    Denied,
    /// The operation failed
    Error,
}

/// A single append-only audit entry.
#[derive(Debug, Serialize)]
pub struct AuditEntry {
    /// Event name (e.g. `"tool.executed"`)
    pub event: &'static str,
    /// Tenant the entry belongs to
    pub tenant: String,
    /// Upstream server involved, when applicable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// Tool involved, when applicable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Outcome class
    pub outcome: Outcome,
}

impl AuditEntry {
    /// Entry for a completed authenticated request.
    #[must_use]
    pub fn request(tenant: &str, outcome: Outcome) -> Self {
        Self {
            event: "request",
            tenant: tenant.to_string(),
            server_id: None,
            tool_name: None,
            outcome,
        }
    }

    /// Entry for a named event scoped to an upstream server.
    #[must_use]
    pub fn server(event: &'static str, tenant: &str, server_id: &str, outcome: Outcome) -> Self {
        Self {
            event,
            tenant: tenant.to_string(),
            server_id: Some(server_id.to_string()),
            tool_name: None,
            outcome,
        }
    }

    /// Entry for a tool execution.
    #[must_use]
    pub fn tool(tenant: &str, server_id: &str, tool_name: &str, outcome: Outcome) -> Self {
        Self {
            event: "tool.executed",
            tenant: tenant.to_string(),
            server_id: Some(server_id.to_string()),
            tool_name: Some(tool_name.to_string()),
            outcome,
        }
    }

    /// Emit the entry on the `audit` target. The timestamp comes from the
    /// subscriber, keeping entries consistent with surrounding log lines.
    pub fn emit(&self) {
        tracing::info!(
            target: "audit",
            event = self.event,
            tenant = %self.tenant,
            server_id = self.server_id.as_deref(),
            tool_name = self.tool_name.as_deref(),
            outcome = ?self.outcome,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_entry_has_no_server() {
        let entry = AuditEntry::request("t-1", Outcome::Ok);
        assert_eq!(entry.event, "request");
        assert!(entry.server_id.is_none());
        assert!(entry.tool_name.is_none());
    }

    #[test]
    fn tool_entry_carries_names() {
        let entry = AuditEntry::tool("t-1", "notion", "search_pages", Outcome::Error);
        assert_eq!(entry.server_id.as_deref(), Some("notion"));
        assert_eq!(entry.tool_name.as_deref(), Some("search_pages"));
        assert_eq!(entry.outcome, Outcome::Error);
    }

    #[test]
    fn serialization_skips_absent_fields() {
        let entry = AuditEntry::request("t-1", Outcome::Denied);
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("server_id").is_none());
        assert_eq!(json["outcome"], "denied");
    }
}
