//! Session Summaries
//!
//! After a stream completes successfully the recorded session is handed to a
//! `SessionSummarizer`. Summaries are best effort: a failure is logged and
//! never fails the stream.

use async_trait::async_trait;
use auditstream_core::event::{DatabaseSessionEnd, SessionEnd};
use auditstream_core::SessionEvent;

use crate::error::Result;

#[async_trait]
pub trait SessionSummarizer: Send + Sync {
    /// Summarize an SSH session using its end event.
    async fn summarize_ssh(&self, event: &SessionEnd) -> Result<()>;

    /// Summarize a database session using its end event.
    async fn summarize_database(&self, event: &DatabaseSessionEnd) -> Result<()>;

    /// Summarize a session whose end event was never recorded.
    async fn summarize_without_end_event(&self, session_id: &str) -> Result<()>;
}

/// End events captured while recording.
///
/// A session can record both an SSH end and a database end. The SSH end wins
/// when both are present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapturedEnd {
    pub ssh: Option<SessionEnd>,
    pub database: Option<DatabaseSessionEnd>,
}

impl CapturedEnd {
    /// Remember `event` if it ends a session. A later end of the same kind
    /// replaces the earlier one.
    pub fn capture(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::SessionEnd(end) => self.ssh = Some(end.clone()),
            SessionEvent::DatabaseSessionEnd(end) => self.database = Some(end.clone()),
            _ => {}
        }
    }

    /// Dispatch to exactly one summarizer method.
    pub async fn summarize(&self, summarizer: &dyn SessionSummarizer, session_id: &str) -> Result<()> {
        if let Some(event) = &self.ssh {
            return summarizer.summarize_ssh(event).await;
        }
        if let Some(event) = &self.database {
            return summarizer.summarize_database(event).await;
        }
        summarizer.summarize_without_end_event(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use auditstream_core::event::SessionPrint;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Calls(Mutex<Vec<String>>);

    #[async_trait]
    impl SessionSummarizer for Calls {
        async fn summarize_ssh(&self, event: &SessionEnd) -> Result<()> {
            self.0.lock().unwrap().push(format!("ssh:{}", event.user));
            Ok(())
        }

        async fn summarize_database(&self, event: &DatabaseSessionEnd) -> Result<()> {
            self.0.lock().unwrap().push(format!("database:{}", event.database_name));
            Ok(())
        }

        async fn summarize_without_end_event(&self, session_id: &str) -> Result<()> {
            self.0.lock().unwrap().push(format!("none:{session_id}"));
            Ok(())
        }
    }

    fn ssh_end(user: &str) -> SessionEvent {
        SessionEvent::SessionEnd(SessionEnd {
            user: user.to_string(),
            ..Default::default()
        })
    }

    fn db_end(database: &str) -> SessionEvent {
        SessionEvent::DatabaseSessionEnd(DatabaseSessionEnd {
            database_name: database.to_string(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_ssh_end_wins_over_database_end() {
        let mut captured = CapturedEnd::default();
        captured.capture(&ssh_end("alice"));
        captured.capture(&db_end("orders"));
        assert!(captured.ssh.is_some() && captured.database.is_some());

        let calls = Calls::default();
        captured.summarize(&calls, "s1").await.unwrap();
        assert_eq!(*calls.0.lock().unwrap(), vec!["ssh:alice"]);
    }

    #[tokio::test]
    async fn test_database_end_alone() {
        let mut captured = CapturedEnd::default();
        captured.capture(&db_end("orders"));
        captured.capture(&SessionEvent::SessionPrint(SessionPrint::default()));

        let calls = Calls::default();
        captured.summarize(&calls, "s1").await.unwrap();
        assert_eq!(*calls.0.lock().unwrap(), vec!["database:orders"]);
    }

    #[tokio::test]
    async fn test_later_end_of_same_kind_replaces_earlier() {
        let mut captured = CapturedEnd::default();
        captured.capture(&ssh_end("alice"));
        captured.capture(&ssh_end("bob"));

        let calls = Calls::default();
        captured.summarize(&calls, "s1").await.unwrap();
        CapturedEnd::default().summarize(&calls, "s1").await.unwrap();
        assert_eq!(*calls.0.lock().unwrap(), vec!["ssh:bob", "none:s1"]);
    }
}
