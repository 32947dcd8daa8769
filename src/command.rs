//! Command context carried alongside every command.

use serde::{Deserialize, Serialize};

use crate::event::Metadata;

/// Cross-cutting metadata passed alongside a command.
///
/// Carries audit trail and correlation information without polluting the
/// `Command` or `DomainEvent` types. Every field is flattened into the
/// opaque key-value [`Metadata`] of each event the command produces.
///
/// # Examples
///
/// ```
/// use eventstream_es::CommandContext;
///
/// let ctx = CommandContext::default()
///     .with_actor("user-42")
///     .with_correlation_id("req-abc-123")
///     .with_meta("source", "api");
///
/// assert_eq!(ctx.actor.as_deref(), Some("user-42"));
/// assert_eq!(ctx.correlation_id.as_deref(), Some("req-abc-123"));
/// assert_eq!(ctx.metadata.get("source").map(String::as_str), Some("api"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandContext {
    /// Identity of the actor issuing the command (e.g. a user ID).
    pub actor: Option<String>,
    /// Correlation ID for tracing a request across aggregates.
    pub correlation_id: Option<String>,
    /// Arbitrary key-value pairs copied onto each produced event.
    pub metadata: Metadata,
}

/// Metadata key under which the command actor is recorded.
pub const ACTOR_KEY: &str = "actor";

/// Metadata key under which the correlation ID is recorded.
pub const CORRELATION_ID_KEY: &str = "correlation_id";

impl CommandContext {
    /// Set the actor identity.
    ///
    /// # Arguments
    ///
    /// * `actor` - Any value convertible to `String` identifying who issued
    ///   the command (e.g. a user ID or service name).
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Add one metadata entry. A later call with the same key wins.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Flatten the context into the metadata stamped on each event.
    ///
    /// `actor` and `correlation_id` override same-named entries in
    /// [`metadata`](CommandContext::metadata).
    pub fn to_metadata(&self) -> Metadata {
        let mut meta = self.metadata.clone();
        if let Some(ref actor) = self.actor {
            meta.insert(ACTOR_KEY.to_owned(), actor.clone());
        }
        if let Some(ref cid) = self.correlation_id {
            meta.insert(CORRELATION_ID_KEY.to_owned(), cid.clone());
        }
        meta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_context_has_no_fields_set() {
        let ctx = CommandContext::default();
        assert_eq!(ctx.actor, None);
        assert_eq!(ctx.correlation_id, None);
        assert!(ctx.metadata.is_empty());
        assert!(ctx.to_metadata().is_empty());
    }

    #[test]
    fn builder_chains_all_fields() {
        let ctx = CommandContext::default()
            .with_actor("admin")
            .with_correlation_id("req-abc")
            .with_meta("source", "test");

        assert_eq!(ctx.actor.as_deref(), Some("admin"));
        assert_eq!(ctx.correlation_id.as_deref(), Some("req-abc"));
        assert_eq!(ctx.metadata.get("source").map(String::as_str), Some("test"));
    }

    #[test]
    fn builder_accepts_string_owned() {
        let ctx = CommandContext::default()
            .with_actor(String::from("svc-payments"))
            .with_correlation_id(String::from("id-007"));

        assert_eq!(ctx.actor.as_deref(), Some("svc-payments"));
        assert_eq!(ctx.correlation_id.as_deref(), Some("id-007"));
    }

    #[test]
    fn to_metadata_flattens_actor_and_correlation() {
        let meta = CommandContext::default()
            .with_meta("source", "cli")
            .with_meta(ACTOR_KEY, "spoofed")
            .with_actor("user-1")
            .with_correlation_id("corr-1")
            .to_metadata();

        assert_eq!(meta.len(), 3);
        assert_eq!(meta[ACTOR_KEY], "user-1");
        assert_eq!(meta[CORRELATION_ID_KEY], "corr-1");
        assert_eq!(meta["source"], "cli");
    }

    #[test]
    fn command_context_serde_roundtrip() {
        let ctx = CommandContext::default()
            .with_actor("user-1")
            .with_correlation_id("corr-1")
            .with_meta("key", "value");

        let json = serde_json::to_string(&ctx).expect("serialization should succeed");
        let deserialized: CommandContext =
            serde_json::from_str(&json).expect("deserialization should succeed");
        assert_eq!(deserialized, ctx);
    }
}
