//! Identifier generation for session and correlation codes.

use uuid::Uuid;

/// Source of session codes and hit/event correlation codes.
pub trait IdGenerator: Send + Sync {
    /// New session code. Time-ordered so codes sort by creation.
    fn session_code(&self) -> String;

    /// New locally generated hit or event code.
    fn correlation_code(&self) -> String;
}

/// UUID v7 session codes, UUID v4 correlation codes.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn session_code(&self) -> String {
        Uuid::now_v7().to_string()
    }

    fn correlation_code(&self) -> String {
        Uuid::new_v4().to_string()
    }
}
