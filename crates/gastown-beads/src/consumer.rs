//! JetStream durable pull transport for mutation events.
//!
//! Alternative to the SSE push stream: mutation events are published
//! to a JetStream subject and read through a named durable consumer,
//! so events survive controller restarts. The durable name must be
//! namespace-specific so controllers in different namespaces do not
//! steal each other's deliveries.

use futures::stream::BoxStream;
use futures::StreamExt;

use async_nats::jetstream;
use async_nats::jetstream::consumer::pull::MessagesError;
use async_nats::jetstream::consumer::PullConsumer;

use crate::error::{BeadsError, Result};
use crate::types::MutationEvent;

/// The JetStream stream holding mutation events.
const STREAM_NAME: &str = "BEADS";

/// Factory for durable pull subscriptions on the event bus.
#[derive(Debug, Clone)]
pub struct DurableConsumer {
    url: String,
    token: Option<String>,
    subject: String,
    durable: String,
}

impl DurableConsumer {
    /// Create a consumer factory.
    ///
    /// `durable` names the server-side consumer; it should embed the
    /// controller's namespace.
    #[must_use]
    pub fn new(
        url: impl Into<String>,
        token: Option<String>,
        subject: impl Into<String>,
        durable: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            token,
            subject: subject.into(),
            durable: durable.into(),
        }
    }

    /// Connect and bind the durable consumer.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus is unreachable or the stream or
    /// consumer cannot be created.
    pub async fn connect(&self) -> Result<MutationMessages> {
        let mut options = async_nats::ConnectOptions::new();
        if let Some(token) = &self.token {
            options = options.token(token.clone());
        }
        let client = options
            .connect(&self.url)
            .await
            .map_err(|e| BeadsError::Bus(format!("connect to {} failed: {e}", self.url)))?;

        let js = jetstream::new(client);
        let stream = js
            .get_or_create_stream(jetstream::stream::Config {
                name: STREAM_NAME.to_string(),
                subjects: vec![self.subject.clone()],
                ..Default::default()
            })
            .await
            .map_err(|e| BeadsError::Bus(format!("stream {STREAM_NAME} unavailable: {e}")))?;

        let consumer: PullConsumer = stream
            .get_or_create_consumer(
                &self.durable,
                jetstream::consumer::pull::Config {
                    durable_name: Some(self.durable.clone()),
                    filter_subject: self.subject.clone(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BeadsError::Bus(format!("consumer {} unavailable: {e}", self.durable)))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| BeadsError::Bus(format!("message stream failed: {e}")))?;

        tracing::debug!(
            subject = %self.subject,
            durable = %self.durable,
            "bound durable event consumer"
        );

        Ok(MutationMessages {
            inner: messages.boxed(),
        })
    }
}

/// One live durable subscription, yielding decoded mutation events.
pub struct MutationMessages {
    inner: BoxStream<'static, std::result::Result<jetstream::Message, MessagesError>>,
}

impl MutationMessages {
    /// Read and acknowledge the next mutation event.
    ///
    /// Undecodable payloads are acknowledged and dropped with a
    /// warning so they are not redelivered forever. Returns `Ok(None)`
    /// when the subscription ends.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription fails mid-read.
    pub async fn next_event(&mut self) -> Result<Option<MutationEvent>> {
        while let Some(message) = self.inner.next().await {
            let message =
                message.map_err(|e| BeadsError::Bus(format!("event bus read failed: {e}")))?;

            let decoded = serde_json::from_slice::<MutationEvent>(&message.payload);
            if let Err(e) = message.ack().await {
                tracing::warn!(error = %e, "failed to ack event bus message");
            }

            match decoded {
                Ok(event) => return Ok(Some(event)),
                Err(e) => {
                    tracing::warn!(error = %e, "dropping undecodable event bus message");
                }
            }
        }
        Ok(None)
    }
}
