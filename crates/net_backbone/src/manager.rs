//! The handler contract between workers and the code that consumes messages.

use crate::message::{Message, MessageType};

/// A handler registered with one or more workers.
///
/// A worker offers each message to its managers in registration order,
/// skipping those whose [`Manager::supported_types`] do not include the
/// message's discriminant. The first manager to return `true` ends the
/// search; returning `false` lets the next one try.
///
/// The same manager instance may be registered on several workers, so any
/// state it keeps must be safe to touch from several threads at once.
pub trait Manager: Send + Sync {
    /// Discriminants this manager wants to see.
    fn supported_types(&self) -> &[MessageType];

    /// Handles `message`, returning whether it was consumed.
    fn process_message(&self, message: &Message) -> bool;

    /// Name used in log output.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}
