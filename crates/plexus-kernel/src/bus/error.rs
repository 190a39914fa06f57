//! Error types for the event bus.

use thiserror::Error;

/// All errors that can be returned by [`EventBus`](super::EventBus) operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BusError {
    /// The buffer is at capacity and the event was not critical.
    #[error("Event buffer full ({capacity} slots), dropped non-critical event '{event_type}'")]
    BufferFull {
        capacity: usize,
        event_type: String,
    },

    /// The buffer is completely full of critical events; even the reserved
    /// headroom is exhausted.
    #[error("Event buffer exhausted including critical headroom, dropped '{event_type}'")]
    HeadroomExhausted { event_type: String },

    /// A management call referenced a subscription ID that is not registered.
    #[error("Subscription '{0}' not found")]
    SubscriptionNotFound(String),

    /// The bus has been shut down; no further publishes are accepted.
    #[error("Event bus is shut down")]
    ShutDown,
}

/// Error returned by a subscriber's event handler.
///
/// Subscriber failures never propagate to publishers; the bus counts them
/// and quarantines repeat offenders. The type exists so handlers can use
/// `?` internally.
pub type SubscriberError = Box<dyn std::error::Error + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_full_display_names_event_type() {
        let e = BusError::BufferFull {
            capacity: 1024,
            event_type: "step:completed".into(),
        };
        assert!(e.to_string().contains("step:completed"));
        assert!(e.to_string().contains("1024"));
    }

    #[test]
    fn subscription_not_found_display() {
        let e = BusError::SubscriptionNotFound("sub-9".into());
        assert!(e.to_string().contains("sub-9"));
    }
}
