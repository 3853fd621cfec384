//! Web push fan-out.
//!
//! The [`Dispatcher`] sends one message to every stored subscription and
//! prunes endpoints the push service reports as gone. Delivery itself
//! sits behind the [`PushGateway`] trait; the production [`WebPush`]
//! implementation encrypts the payload (RFC 8291) and signs the request
//! with VAPID (RFC 8292) via the `web-push` crate, then sends it through
//! a shared `reqwest::Client`.
//!
//! Per-subscription failures never escape the dispatcher: they only
//! affect the delivered count and subscription pruning.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::store::{Store, Subscription};

/// Push message time-to-live at the push service, in seconds.
const PUSH_TTL: u32 = 86_400;

/// Classification of one delivery attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The push service accepted the message.
    Delivered,
    /// The push service reported the endpoint no longer exists
    /// (404/410); the subscription should be pruned.
    Gone,
    /// Any other failure: network error, malformed subscription,
    /// transient 5xx. The subscription is kept.
    Failed,
}

/// External push-delivery capability, narrow enough to fake in tests.
#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn deliver(&self, subscription: &Subscription, payload: &[u8]) -> DeliveryOutcome;
}

/// Fans one message out to every subscription in the store.
pub struct Dispatcher {
    store: Arc<Store>,
    gateway: Arc<dyn PushGateway>,
}

impl Dispatcher {
    pub fn new(store: Arc<Store>, gateway: Arc<dyn PushGateway>) -> Self {
        Self { store, gateway }
    }

    /// Deliver `{title, body, data}` to all current subscriptions.
    ///
    /// Reads the subscription list once at the start; a concurrent
    /// subscribe is picked up by the next dispatch. Returns the number
    /// of deliveries the push service accepted. Never errors: storage
    /// or delivery problems are logged and absorbed into the count.
    pub async fn dispatch(&self, title: &str, body: &str, data: Value) -> usize {
        let payload = json!({
            "title": title,
            "body": body,
            "data": data,
        })
        .to_string();

        let subscriptions = match self.store.subscriptions() {
            Ok(subs) => subs,
            Err(e) => {
                log::error!("[Push] Failed to read subscriptions: {e:#}");
                return 0;
            }
        };

        let mut delivered = 0;
        let mut gone: Vec<String> = Vec::new();

        for sub in &subscriptions {
            match self.gateway.deliver(sub, payload.as_bytes()).await {
                DeliveryOutcome::Delivered => delivered += 1,
                DeliveryOutcome::Gone => {
                    log::info!(
                        "[Push] Subscription expired, pruning {}",
                        truncate(&sub.endpoint, 60)
                    );
                    gone.push(sub.endpoint.clone());
                }
                DeliveryOutcome::Failed => {
                    log::warn!("[Push] Delivery failed for {}", truncate(&sub.endpoint, 60));
                }
            }
        }

        for endpoint in &gone {
            if let Err(e) = self.store.remove_subscription(endpoint) {
                log::error!("[Push] Failed to prune {}: {e:#}", truncate(endpoint, 60));
            }
        }

        delivered
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Production gateway: RFC 8291 encryption + VAPID signing, sent over HTTP.
pub struct WebPush {
    client: reqwest::Client,
    vapid_private_b64: String,
    contact: String,
}

impl WebPush {
    /// `vapid_private_b64` is the raw 32-byte P-256 scalar (base64url);
    /// `contact` becomes the VAPID `sub` claim.
    pub fn new(client: reqwest::Client, vapid_private_b64: String, contact: String) -> Self {
        Self {
            client,
            vapid_private_b64,
            contact,
        }
    }

    async fn try_deliver(
        &self,
        subscription: &Subscription,
        payload: &[u8],
    ) -> anyhow::Result<DeliveryOutcome> {
        use anyhow::Context;
        use web_push::{
            ContentEncoding, SubscriptionInfo, VapidSignatureBuilder, WebPushMessageBuilder,
        };

        let sub_info = SubscriptionInfo::new(
            &subscription.endpoint,
            &subscription.keys.p256dh,
            &subscription.keys.auth,
        );

        let mut sig_builder =
            VapidSignatureBuilder::from_base64(&self.vapid_private_b64, &sub_info)
                .context("failed to build VAPID signature")?;
        sig_builder.add_claim("sub", self.contact.as_str());
        let sig = sig_builder.build().context("failed to sign VAPID JWT")?;

        let mut builder = WebPushMessageBuilder::new(&sub_info);
        builder.set_payload(ContentEncoding::Aes128Gcm, payload);
        builder.set_vapid_signature(sig);
        builder.set_ttl(PUSH_TTL);
        let message = builder.build().context("failed to build web push message")?;

        // The web-push crate's own HTTP client is behind the isahc
        // feature; the request is assembled here instead so the shared
        // reqwest client handles connection pooling.
        let mut request = self
            .client
            .post(message.endpoint.to_string())
            .header("TTL", message.ttl.to_string());

        if let Some(urgency) = message.urgency {
            request = request.header("Urgency", urgency.to_string());
        }
        if let Some(topic) = message.topic {
            request = request.header("Topic", topic);
        }
        if let Some(push_payload) = message.payload {
            request = request
                .header("Content-Encoding", push_payload.content_encoding.to_str())
                .header("Content-Type", "application/octet-stream");
            for (key, value) in &push_payload.crypto_headers {
                request = request.header(*key, value.as_str());
            }
            request = request.body(push_payload.content);
        }

        let response = request.send().await.context("web push request failed")?;
        let status = response.status().as_u16();

        match status {
            200..=299 => Ok(DeliveryOutcome::Delivered),
            404 | 410 => Ok(DeliveryOutcome::Gone),
            _ => {
                let detail = response.text().await.unwrap_or_default();
                log::warn!("[Push] Push service returned HTTP {status}: {detail}");
                Ok(DeliveryOutcome::Failed)
            }
        }
    }
}

#[async_trait]
impl PushGateway for WebPush {
    async fn deliver(&self, subscription: &Subscription, payload: &[u8]) -> DeliveryOutcome {
        match self.try_deliver(subscription, payload).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!(
                    "[Push] Delivery error for {}: {e:#}",
                    truncate(&subscription.endpoint, 60)
                );
                DeliveryOutcome::Failed
            }
        }
    }
}
