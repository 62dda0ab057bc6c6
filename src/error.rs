use std::time::Duration;

// Errors from the limits pipeline. Quota denials are NOT errors - they are
// normal decision outcomes carried in Decision/UsageDecision.
#[derive(Debug, thiserror::Error)]
pub enum LimitError {
    // Backing store unreachable or returned an error
    #[error("limit store unavailable: {0}")]
    StoreUnavailable(String),

    // Store call exceeded its budget; treated the same as unavailable
    #[error("limit store timed out after {0:?}")]
    StoreTimeout(Duration),

    // Subscription lookup failed (tier resolution falls back to basic)
    #[error("subscription lookup failed for tenant {tenant}: {reason}")]
    SubscriptionLookup { tenant: String, reason: String },
}

impl LimitError {
    // Both variants mean "store down" for policy purposes
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            LimitError::StoreUnavailable(_) | LimitError::StoreTimeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, LimitError>;
