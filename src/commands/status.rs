//! Session status reporting

use chrono::{DateTime, Utc};
use colored::Colorize;
use prettytable::{row, Table};
use serde::Serialize;

use crate::auth::session::{Session, SessionSnapshot, SessionState};
use crate::commands::SessionContext;
use crate::config::Config;
use crate::error::{OidcError, Result};

/// Serializable view of the session; never includes token values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub state: SessionState,
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_token_expires_at: Option<DateTime<Utc>>,
    pub identity_token_expired: bool,
    pub has_refresh_token: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl StatusReport {
    /// Builds the report for `snapshot` as seen at `now`.
    pub fn from_snapshot(snapshot: &SessionSnapshot, now: DateTime<Utc>) -> Self {
        let session = snapshot.session.as_deref();
        Self {
            state: snapshot.state,
            authenticated: snapshot.is_authenticated_at(now),
            subject: session.map(|s| s.profile.sub.clone()),
            name: session.map(|s| s.profile.display_name().to_string()),
            expires_at: session.map(|s| s.expires_at),
            expires_in_secs: session.map(|s| s.expires_in(now).num_seconds()),
            identity_token_expires_at: session.and_then(Session::identity_token_expires_at),
            identity_token_expired: session.is_some_and(|s| s.identity_token_expired_at(now)),
            has_refresh_token: session.is_some_and(|s| s.refresh_token.is_some()),
            scope: session.and_then(|s| s.scope.clone()),
            last_error: snapshot.last_error.clone(),
        }
    }
}

/// Print the current session.
///
/// # Arguments
///
/// * `config` - Loaded configuration
/// * `json` - Output JSON instead of a table
pub async fn show_status(config: Config, json: bool) -> Result<()> {
    let ctx = SessionContext::new(config, false)?;
    let report = StatusReport::from_snapshot(&ctx.manager.get_session(), ctx.manager.now());

    if json {
        let out = serde_json::to_string_pretty(&report).map_err(OidcError::Serialization)?;
        println!("{}", out);
    } else {
        print_table(&report);
    }
    Ok(())
}

fn print_table(report: &StatusReport) {
    let state = match report.state {
        SessionState::Authenticated => report.state.to_string().green(),
        SessionState::Authenticating | SessionState::Renewing => report.state.to_string().yellow(),
        SessionState::Unauthenticated => report.state.to_string().normal(),
        SessionState::Expired | SessionState::Error => report.state.to_string().red(),
    };

    let mut table = Table::new();
    table.add_row(row!["State", state]);
    table.add_row(row!["Authenticated", report.authenticated]);
    if let Some(name) = &report.name {
        table.add_row(row!["User", name]);
    }
    if let Some(subject) = &report.subject {
        table.add_row(row!["Subject", subject]);
    }
    if let (Some(at), Some(secs)) = (report.expires_at, report.expires_in_secs) {
        table.add_row(row!["Expires", format!("{} ({}s)", at.to_rfc3339(), secs)]);
    }
    if let Some(at) = report.identity_token_expires_at {
        let at = at.to_rfc3339();
        if report.identity_token_expired {
            table.add_row(row!["ID token expires", format!("{} (expired)", at).yellow()]);
        } else {
            table.add_row(row!["ID token expires", at]);
        }
    }
    if let Some(scope) = &report.scope {
        table.add_row(row!["Scope", scope]);
    }
    table.add_row(row!["Refresh token", report.has_refresh_token]);
    if let Some(error) = &report.last_error {
        table.add_row(row!["Last error", error.red()]);
    }

    println!();
    table.printstd();
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{sample_session, test_epoch};
    use std::sync::Arc;

    #[test]
    fn test_report_for_empty_snapshot() {
        let report = StatusReport::from_snapshot(&SessionSnapshot::default(), test_epoch());
        assert_eq!(report.state, SessionState::Unauthenticated);
        assert!(!report.authenticated);
        assert!(report.subject.is_none());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["state"], "unauthenticated");
        assert!(json.get("subject").is_none());
    }

    #[test]
    fn test_report_never_contains_tokens() {
        let now = test_epoch();
        let session = sample_session(now);
        let snapshot = SessionSnapshot {
            state: SessionState::Authenticated,
            session: Some(Arc::new(session.clone())),
            generation: 1,
            last_error: None,
        };

        let report = StatusReport::from_snapshot(&snapshot, now);
        assert!(report.authenticated);
        assert_eq!(report.expires_in_secs, Some(3600));
        assert_eq!(report.name.as_deref(), Some("Alice Example"));
        assert!(!report.identity_token_expired);

        let json = serde_json::to_string(&report).unwrap();
        assert!(!json.contains(&session.access_token));
        assert!(!json.contains(session.refresh_token.as_deref().unwrap()));
        assert!(!json.contains(&session.identity_token));
    }

    #[test]
    fn test_report_for_expired_session() {
        let now = test_epoch();
        let snapshot = SessionSnapshot {
            state: SessionState::Authenticated,
            session: Some(Arc::new(sample_session(now - chrono::Duration::hours(2)))),
            generation: 3,
            last_error: None,
        };
        let report = StatusReport::from_snapshot(&snapshot, now);
        assert!(!report.authenticated);
        assert_eq!(report.expires_in_secs, Some(-3600));
    }

    #[test]
    fn test_report_flags_expired_identity_token_after_refresh() {
        let now = test_epoch();
        let mut session = sample_session(now);
        session.profile.exp = (now - chrono::Duration::seconds(10)).timestamp();
        let snapshot = SessionSnapshot {
            state: SessionState::Authenticated,
            session: Some(Arc::new(session)),
            generation: 2,
            last_error: None,
        };

        let report = StatusReport::from_snapshot(&snapshot, now);
        assert!(report.authenticated);
        assert!(report.identity_token_expired);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["identity_token_expired"], true);
    }
}
