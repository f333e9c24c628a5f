use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

/// Token linking a request to its eventual reply.
///
/// Carried in the AMQP `correlation-id` property. The client generates a
/// fresh UUID v4 for every send and never reuses one, so a late reply can
/// only ever match the request that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(Arc<str>);

impl CorrelationId {
    /// Generate a new unique correlation ID.
    pub fn generate() -> Self {
        // ---
        Self(Arc::from(Uuid::new_v4().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shared string form, as stored in an [`Envelope`](crate::Envelope).
    pub fn as_arc(&self) -> Arc<str> {
        self.0.clone()
    }
}

impl From<Arc<str>> for CorrelationId {
    fn from(value: Arc<str>) -> Self {
        Self(value)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn generated_ids_are_unique_uuids() {
        // ---
        let id1 = CorrelationId::generate();
        let id2 = CorrelationId::generate();
        assert_ne!(id1, id2);
        assert!(Uuid::parse_str(id1.as_str()).is_ok());
    }

    #[test]
    fn arc_round_trip_keeps_value() {
        // ---
        let id = CorrelationId::from("abc-123");
        assert_eq!(CorrelationId::from(id.as_arc()), id);
        assert_eq!(id.to_string(), "abc-123");
    }
}
