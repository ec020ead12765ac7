pub mod chat;
pub mod config;
pub mod error;
pub mod logging;
pub mod moderation;
pub mod platform;
pub mod session;
pub mod telemetry;

// Re-export the main error types for convenience
pub use error::{ActionError, ConnectError, SessionError};

// Re-export the moderation core
pub use moderation::{
    ActionExecutor, ChannelName, ChatMessage, Classifier, ModerationAction, ModerationApi,
    ModerationVerdict, RuleBasedClassifier,
};

// Re-export chat connectors
pub use chat::{ChatConnector, Credentials, InMemoryConnector, TwitchConnector};

// Re-export session management
pub use session::{SessionDeps, SessionRegistry, SessionStats, SessionStatus};

// Re-export telemetry
pub use telemetry::{ObserverHandle, TelemetryBroadcaster, TelemetryEvent, TelemetryServer};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_structure() {
        assert!(std::any::type_name::<SessionRegistry>().contains("SessionRegistry"));
        assert!(std::any::type_name::<platform::HelixClient>().contains("HelixClient"));
    }

    #[test]
    fn test_error_types_re_exported() {
        let err = SessionError::NotFound {
            channel: ChannelName::new("streamer"),
        };
        assert_eq!(err.to_string(), "No session for channel 'streamer'");

        let _connect = ConnectError::Closed;
        let _action = ActionError::Timeout { after_ms: 5000 };
    }
}
