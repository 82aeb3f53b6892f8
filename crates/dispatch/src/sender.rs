//! Transport seam. The engine only needs `EmailSender`: one call per
//! tracking record, with the outcome classified transient or permanent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use cadence_core::types::EmailAccount;

/// Credentials handed to the transport; scheduling never sees provider
/// secrets beyond this.
#[derive(Debug, Clone)]
pub struct AccountCredentials {
    pub account_id: Uuid,
    pub address: String,
    pub from_name: String,
}

impl From<&EmailAccount> for AccountCredentials {
    fn from(account: &EmailAccount) -> Self {
        Self {
            account_id: account.id,
            address: account.address.clone(),
            from_name: account.from_name.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub message_id: String,
    pub to: String,
    pub subject: String,
    pub html_body: String,
    pub account: AccountCredentials,
}

#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub message_id: String,
    pub provider_message_id: Option<String>,
    pub accepted_at: DateTime<Utc>,
}

/// Send failures, split by whether a retry can help.
#[derive(Debug, Clone, Error)]
pub enum SendError {
    #[error("send timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("provider rate limit exceeded")]
    RateLimited,

    #[error("provider error: {0}")]
    Provider(String),

    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("hard bounce: {0}")]
    HardBounce(String),

    #[error("authentication failed: {0}")]
    AuthFailure(String),
}

impl SendError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SendError::Timeout
                | SendError::Connection(_)
                | SendError::RateLimited
                | SendError::Provider(_)
        )
    }
}

/// Abstract transport. Must be safe to call at most once per tracking
/// record; the worker guarantees it never re-sends a used `message_id`.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, request: &SendRequest) -> Result<SendReceipt, SendError>;
}

/// Development transport: accepts everything and logs the would-be send.
/// Builds the relay payload the way a real provider adapter would, so the
/// wiring is exercised end to end.
pub struct BlackholeSender;

#[async_trait]
impl EmailSender for BlackholeSender {
    async fn send(&self, request: &SendRequest) -> Result<SendReceipt, SendError> {
        let _payload = serde_json::json!({
            "personalizations": [{
                "to": [{"email": request.to}],
                "custom_args": {"message_id": request.message_id}
            }],
            "from": {
                "email": request.account.address,
                "name": request.account.from_name
            },
            "subject": request.subject,
            "content": [{
                "type": "text/html",
                "value": request.html_body
            }],
        });

        debug!(
            message_id = %request.message_id,
            to = %request.to,
            from = %request.account.address,
            "Blackhole sender accepted email"
        );
        metrics::counter!("cadence.blackhole_sends").increment(1);

        Ok(SendReceipt {
            message_id: request.message_id.clone(),
            provider_message_id: Some(format!("bh-{}", Uuid::new_v4())),
            accepted_at: Utc::now(),
        })
    }
}
