//! Session persistence — dual storage per session.
//!
//! Every session writes two artifacts: a JSONL audit trail (append-only,
//! date-partitioned, authoritative) and a state snapshot (atomic
//! temp-then-rename). The snapshot is a materialized view: when it is
//! missing or corrupt, the session is rebuilt by replaying the audit trail.

pub mod error;
pub mod manager;
pub mod session;

pub use error::{Result, SessionError};
pub use manager::{SessionInfo, SessionManager};
pub use session::{AuditEvent, Session, AUDIT_TRUNCATION_LIMIT};
