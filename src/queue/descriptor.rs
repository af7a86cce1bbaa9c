use serde::Serialize;
use std::time::Duration;

use crate::config::QueueSettings;
use crate::error::{OutboxError, OutboxResult};

/// Static configuration for one logical queue
///
/// Built once from [`QueueSettings`] and shared read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueDescriptor {
    name: String,
    partition_count: u32,
    batch_size: u32,
    retry_count: u32,
    start_delay: Duration,
    dispatch_interval: Duration,
    receive_timeout: Duration,
    payload_type: String,
    auto_acknowledge: bool,
    audit_enabled: bool,
    db_connection: Option<String>,
}

impl QueueDescriptor {
    /// Validate settings and build the descriptor
    ///
    /// `default_payload_type` is used when the settings do not override it,
    /// normally the Rust type name of the queue's entity.
    pub fn from_settings(settings: &QueueSettings, default_payload_type: &str) -> OutboxResult<Self> {
        if settings.name.trim().is_empty() {
            return Err(OutboxError::configuration("queue name must not be empty"));
        }
        if settings.thread_pool_size == 0 {
            return Err(OutboxError::configuration(format!(
                "queue '{}': thread_pool_size must be at least 1",
                settings.name
            )));
        }
        if i32::try_from(settings.thread_pool_size).is_err() {
            return Err(OutboxError::configuration(format!(
                "queue '{}': thread_pool_size {} is too large",
                settings.name, settings.thread_pool_size
            )));
        }
        if settings.fetch_batch_size == 0 {
            return Err(OutboxError::configuration(format!(
                "queue '{}': fetch_batch_size must be at least 1",
                settings.name
            )));
        }
        if settings.send_interval_ms == 0 {
            return Err(OutboxError::configuration(format!(
                "queue '{}': send_interval_ms must be greater than zero",
                settings.name
            )));
        }

        Ok(Self {
            name: settings.name.clone(),
            partition_count: settings.thread_pool_size,
            batch_size: settings.fetch_batch_size,
            retry_count: settings.retry_count,
            start_delay: Duration::from_millis(settings.start_delay_ms),
            dispatch_interval: Duration::from_millis(settings.send_interval_ms),
            receive_timeout: Duration::from_millis(settings.receive_timeout_ms),
            payload_type: settings
                .payload_type
                .clone()
                .unwrap_or_else(|| default_payload_type.to_string()),
            auto_acknowledge: settings.auto_ack,
            audit_enabled: settings.audit_enabled,
            db_connection: settings.db_connection.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// Configured reclaim budget. Not enforced by the dispatch path.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn start_delay(&self) -> Duration {
        self.start_delay
    }

    pub fn dispatch_interval(&self) -> Duration {
        self.dispatch_interval
    }

    pub fn receive_timeout(&self) -> Duration {
        self.receive_timeout
    }

    pub fn payload_type(&self) -> &str {
        &self.payload_type
    }

    pub fn auto_acknowledge(&self) -> bool {
        self.auto_acknowledge
    }

    pub fn audit_enabled(&self) -> bool {
        self.audit_enabled
    }

    pub fn db_connection(&self) -> Option<&str> {
        self.db_connection.as_deref()
    }

    /// Partition ids served by this queue, `0..partition_count`
    pub fn partitions(&self) -> impl Iterator<Item = i32> {
        // partition_count fits in i32, checked in from_settings
        0..self.partition_count as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_settings() {
        let descriptor =
            QueueDescriptor::from_settings(&QueueSettings::named("orders"), "app::OrderPlaced")
                .unwrap();

        assert_eq!(descriptor.name(), "orders");
        assert_eq!(descriptor.partition_count(), 8);
        assert_eq!(descriptor.batch_size(), 32);
        assert_eq!(descriptor.retry_count(), 5);
        assert_eq!(descriptor.start_delay(), Duration::from_secs(20));
        assert_eq!(descriptor.dispatch_interval(), Duration::from_secs(10));
        assert_eq!(descriptor.receive_timeout(), Duration::from_secs(30));
        assert_eq!(descriptor.payload_type(), "app::OrderPlaced");
        assert!(!descriptor.auto_acknowledge());
        assert_eq!(descriptor.partitions().collect::<Vec<_>>(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_payload_type_override() {
        let mut settings = QueueSettings::named("orders");
        settings.payload_type = Some("com.example.OrderPlaced".to_string());
        let descriptor = QueueDescriptor::from_settings(&settings, "ignored").unwrap();
        assert_eq!(descriptor.payload_type(), "com.example.OrderPlaced");
    }

    #[test]
    fn test_rejects_invalid_settings() {
        let mut settings = QueueSettings::named("orders");
        settings.thread_pool_size = 0;
        assert!(QueueDescriptor::from_settings(&settings, "t").is_err());

        let mut settings = QueueSettings::named("orders");
        settings.fetch_batch_size = 0;
        assert!(QueueDescriptor::from_settings(&settings, "t").is_err());

        let mut settings = QueueSettings::named("orders");
        settings.send_interval_ms = 0;
        assert!(QueueDescriptor::from_settings(&settings, "t").is_err());

        assert!(QueueDescriptor::from_settings(&QueueSettings::named("  "), "t").is_err());
    }
}
