//! Client Facade.
//!
//! The produce/consume surface for callers: argument checks, then straight
//! delegation to the [`Broker`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::core::broker::Broker;
use crate::core::consumer::{Consumer, RegistrationHandle};
use crate::core::error::{BrokerError, BrokerResult};
use crate::core::message::{Message, MessageId};

#[derive(Debug, Clone)]
pub struct Client {
    broker: Arc<Broker>,
}

impl Client {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Fire-and-forget publish.
    pub fn publish(&self, queue: &str, payload: impl Into<Bytes>) -> BrokerResult<MessageId> {
        let payload = non_empty(payload.into())?;
        self.broker.publish(queue, payload, None)
    }

    /// Subscribes a fresh callback. Use [`Client::subscribe_shared`] to get
    /// idempotent registration of one callback instance.
    pub fn subscribe<C: Consumer>(&self, queue: &str, consumer: C) -> BrokerResult<RegistrationHandle> {
        self.subscribe_shared(queue, Arc::new(consumer))
    }

    pub fn subscribe_shared(
        &self,
        queue: &str,
        consumer: Arc<dyn Consumer>,
    ) -> BrokerResult<RegistrationHandle> {
        self.broker.register_consumer(queue, consumer)
    }

    pub fn unsubscribe(&self, handle: RegistrationHandle) -> bool {
        self.broker.unregister_consumer(handle)
    }

    pub async fn request(
        &self,
        queue: &str,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> BrokerResult<Bytes> {
        let payload = non_empty(payload.into())?;
        self.broker.request(queue, payload, timeout).await
    }

    pub fn reply(&self, original: &Message, payload: impl Into<Bytes>) -> BrokerResult<MessageId> {
        let payload = non_empty(payload.into())?;
        self.broker.reply(original, payload)
    }
}

fn non_empty(payload: Bytes) -> BrokerResult<Bytes> {
    if payload.is_empty() {
        return Err(BrokerError::InvalidArgument(
            "payload must not be empty".to_string(),
        ));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::consumer::ConsumerError;

    fn client() -> Client {
        Client::new(Arc::new(Broker::default()))
    }

    #[test]
    fn empty_payload_is_rejected_before_enqueue() {
        let client = client();
        let err = client.publish("orders", "").expect_err("empty payload");
        assert!(matches!(err, BrokerError::InvalidArgument(_)));
        assert!(client.broker().queue_stats("orders").is_err());
    }

    #[test]
    fn empty_queue_name_is_rejected() {
        let client = client();
        assert!(matches!(
            client.publish("", "hello"),
            Err(BrokerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn publish_and_subscribe_delegate_to_broker() {
        let client = client();
        let handle = client
            .subscribe("orders", |_msg: Message| async { Ok::<(), ConsumerError>(()) })
            .expect("subscribe");
        client.publish("orders", "hello").expect("publish");

        assert_eq!(client.broker().consumers_on("orders"), vec![handle]);
        assert_eq!(client.broker().queue_stats("orders").expect("stats").pending, 1);
        assert!(client.unsubscribe(handle));
        assert!(!client.unsubscribe(handle));
    }

    #[tokio::test]
    async fn request_with_empty_payload_fails_fast() {
        let client = client();
        let err = client
            .request("svc", Bytes::new(), Duration::from_secs(5))
            .await
            .expect_err("empty payload");
        assert!(matches!(err, BrokerError::InvalidArgument(_)));
    }
}
