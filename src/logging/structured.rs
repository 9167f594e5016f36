use std::collections::BTreeMap;
use tracing::{debug, error, info, trace, warn};

/// Context information for log messages
#[derive(Debug, Clone)]
pub struct LogContext {
    /// Component name (e.g., "coordinator", "health", "cache")
    pub component: String,
    /// Gateway instance the message concerns
    pub instance_id: Option<String>,
    /// Additional context fields
    pub extra_fields: BTreeMap<String, String>,
}

impl LogContext {
    /// Create a new log context
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            instance_id: None,
            extra_fields: BTreeMap::new(),
        }
    }

    /// Set gateway instance
    #[must_use]
    pub fn with_instance(mut self, instance_id: &str) -> Self {
        self.instance_id = Some(instance_id.to_string());
        self
    }

    /// Add extra field
    #[must_use]
    pub fn with_field(mut self, key: &str, value: String) -> Self {
        self.extra_fields.insert(key.to_string(), value);
        self
    }
}

/// Structured logger with context
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    pub(crate) context: LogContext,
}

impl StructuredLogger {
    /// Create a new structured logger with context
    pub const fn new(context: LogContext) -> Self {
        Self { context }
    }

    fn instance(&self) -> &str {
        self.context.instance_id.as_deref().unwrap_or("-")
    }

    /// Extra fields as `key=value` pairs in key order
    fn extras(&self) -> String {
        self.context
            .extra_fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn info(&self, message: &str) {
        info!(component = %self.context.component, instance = self.instance(), extra = %self.extras(), "{message}");
    }

    pub fn warn(&self, message: &str) {
        warn!(component = %self.context.component, instance = self.instance(), extra = %self.extras(), "{message}");
    }

    pub fn error(&self, message: &str) {
        error!(component = %self.context.component, instance = self.instance(), extra = %self.extras(), "{message}");
    }

    pub fn debug(&self, message: &str) {
        debug!(component = %self.context.component, instance = self.instance(), extra = %self.extras(), "{message}");
    }

    pub fn trace(&self, message: &str) {
        trace!(component = %self.context.component, instance = self.instance(), extra = %self.extras(), "{message}");
    }
}

/// Create a logger for a specific component
pub fn get_logger(component: &str) -> StructuredLogger {
    StructuredLogger::new(LogContext::new(component))
}
/// Create a logger with full context
pub const fn get_logger_with_context(context: LogContext) -> StructuredLogger {
    StructuredLogger::new(context)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_context() {
        let context = LogContext::new("coordinator")
            .with_instance("172.27.153.1")
            .with_field("protocol", "legacy".to_string());

        assert_eq!(context.component, "coordinator");
        assert_eq!(context.instance_id.as_deref(), Some("172.27.153.1"));
        assert_eq!(
            context.extra_fields.get("protocol"),
            Some(&"legacy".to_string())
        );
    }

    #[test]
    fn extras_are_key_ordered() {
        let logger = get_logger_with_context(
            LogContext::new("health")
                .with_instance("pvs")
                .with_field("b", "2".to_string())
                .with_field("a", "1".to_string()),
        );
        assert_eq!(logger.extras(), "a=1 b=2");
        assert_eq!(logger.instance(), "pvs");
        assert_eq!(get_logger("cache").instance(), "-");
    }

    #[test]
    fn logs_without_subscriber() {
        let logger = get_logger("coordinator");
        assert_eq!(logger.context.component, "coordinator");

        logger.info("Test info message");
        logger.debug("Test debug message");
        logger.warn("Test warning message");
        logger.error("Test error message");
        logger.trace("Test trace message");
    }
}
