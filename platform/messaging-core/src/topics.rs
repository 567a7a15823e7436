//! Static topic registry
//!
//! Maps logical categories to physical topic names of the form
//! `<domain>.<category>.<action>`. The table is fixed at build time; renaming
//! a topic needs a coordinated migration of every producer and consumer.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;

/// Logical topic categories known to the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicCategory {
    TransactionInitiated,
    TransactionValidated,
    TransactionCompleted,
    TransactionFailed,
    TransactionReversed,
    FraudAnalysisComplete,
    FraudDetected,
    FraudManualReview,
    UserEvents,
    SecurityEvents,
    Notifications,
    AmlChecks,
    AmlAlerts,
    AuditLog,
}

impl TopicCategory {
    pub const ALL: [TopicCategory; 14] = [
        TopicCategory::TransactionInitiated,
        TopicCategory::TransactionValidated,
        TopicCategory::TransactionCompleted,
        TopicCategory::TransactionFailed,
        TopicCategory::TransactionReversed,
        TopicCategory::FraudAnalysisComplete,
        TopicCategory::FraudDetected,
        TopicCategory::FraudManualReview,
        TopicCategory::UserEvents,
        TopicCategory::SecurityEvents,
        TopicCategory::Notifications,
        TopicCategory::AmlChecks,
        TopicCategory::AmlAlerts,
        TopicCategory::AuditLog,
    ];

    /// Physical topic name
    pub fn name(&self) -> &'static str {
        match self {
            TopicCategory::TransactionInitiated => "banking.transactions.initiated",
            TopicCategory::TransactionValidated => "banking.transactions.validated",
            TopicCategory::TransactionCompleted => "banking.transactions.completed",
            TopicCategory::TransactionFailed => "banking.transactions.failed",
            TopicCategory::TransactionReversed => "banking.transactions.reversed",
            TopicCategory::FraudAnalysisComplete => "banking.fraud.analysis-complete",
            TopicCategory::FraudDetected => "banking.fraud.detected",
            TopicCategory::FraudManualReview => "banking.fraud.manual-review",
            TopicCategory::UserEvents => "banking.users.events",
            TopicCategory::SecurityEvents => "banking.security.events",
            TopicCategory::Notifications => "banking.notifications.requested",
            TopicCategory::AmlChecks => "banking.aml.checks",
            TopicCategory::AmlAlerts => "banking.aml.alerts",
            TopicCategory::AuditLog => "banking.audit.events",
        }
    }

    /// Logical key, e.g. `USER_EVENTS`
    pub fn key(&self) -> &'static str {
        match self {
            TopicCategory::TransactionInitiated => "TRANSACTION_INITIATED",
            TopicCategory::TransactionValidated => "TRANSACTION_VALIDATED",
            TopicCategory::TransactionCompleted => "TRANSACTION_COMPLETED",
            TopicCategory::TransactionFailed => "TRANSACTION_FAILED",
            TopicCategory::TransactionReversed => "TRANSACTION_REVERSED",
            TopicCategory::FraudAnalysisComplete => "FRAUD_ANALYSIS_COMPLETE",
            TopicCategory::FraudDetected => "FRAUD_DETECTED",
            TopicCategory::FraudManualReview => "FRAUD_MANUAL_REVIEW",
            TopicCategory::UserEvents => "USER_EVENTS",
            TopicCategory::SecurityEvents => "SECURITY_EVENTS",
            TopicCategory::Notifications => "NOTIFICATIONS",
            TopicCategory::AmlChecks => "AML_CHECKS",
            TopicCategory::AmlAlerts => "AML_ALERTS",
            TopicCategory::AuditLog => "AUDIT_LOG",
        }
    }
}

// Keys and physical names both resolve to the physical name.
static REGISTRY: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut map = HashMap::with_capacity(TopicCategory::ALL.len() * 2);
    for category in TopicCategory::ALL {
        map.insert(category.key(), category.name());
        map.insert(category.name(), category.name());
    }
    map
});

impl fmt::Display for TopicCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Resolve a logical key or a physical name to the registered physical name.
pub fn lookup(topic: &str) -> Option<&'static str> {
    REGISTRY.get(topic).copied()
}

/// Resolve `topic` for publishing or subscribing.
///
/// Registered keys and names resolve through the table. Unregistered names
/// pass through unchanged when they are already shaped like a physical
/// topic (`<domain>.<category>.<action>`); anything else is rejected.
pub fn resolve_topic(topic: &str) -> Option<String> {
    if let Some(name) = lookup(topic) {
        return Some(name.to_string());
    }
    is_physical_name(topic).then(|| topic.to_string())
}

/// Three non-empty dot-separated segments of `[a-z0-9-]`
pub fn is_physical_name(topic: &str) -> bool {
    let segments: Vec<&str> = topic.split('.').collect();
    segments.len() == 3
        && segments.iter().all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        })
}
