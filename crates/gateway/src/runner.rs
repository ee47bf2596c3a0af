use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::events::{
    default_dispatcher, EventContext, EventDispatcher, GatewayEnvelope,
    GatewayEvent, HandlerResult,
};
use crate::reply::OutboundAction;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport failed to connect: {0}")]
    Connect(String),
    #[error("transport read failed: {0}")]
    Receive(String),
    #[error("transport ack failed: {0}")]
    Acknowledge(String),
    #[error("transport delivery failed: {0}")]
    Deliver(String),
    #[error("transport disconnect failed: {0}")]
    Disconnect(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { max_retries: 5, base_delay_ms: 250, max_delay_ms: 5_000 }
    }
}

impl ReconnectPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let multiplier = 1_u64 << exponent;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

/// Connection to the chat platform. `next_envelope` returning `Ok(None)`
/// means the platform closed the session cleanly.
#[async_trait]
pub trait GatewayTransport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;
    async fn next_envelope(&self) -> Result<Option<GatewayEnvelope>, TransportError>;
    async fn acknowledge(&self, envelope_id: &str) -> Result<(), TransportError>;
    async fn deliver(&self, action: &OutboundAction) -> Result<(), TransportError>;
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Used when no bot token is configured: connects, yields nothing, closes.
#[derive(Default)]
pub struct NoopGatewayTransport;

#[async_trait]
impl GatewayTransport for NoopGatewayTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn next_envelope(&self) -> Result<Option<GatewayEnvelope>, TransportError> {
        Ok(None)
    }

    async fn acknowledge(&self, _envelope_id: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn deliver(&self, _action: &OutboundAction) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

pub struct GatewayRunner {
    transport: Arc<dyn GatewayTransport>,
    dispatcher: EventDispatcher,
    reconnect_policy: ReconnectPolicy,
}

impl Default for GatewayRunner {
    fn default() -> Self {
        Self {
            transport: Arc::new(NoopGatewayTransport),
            dispatcher: default_dispatcher(),
            reconnect_policy: ReconnectPolicy::default(),
        }
    }
}

impl GatewayRunner {
    pub fn new(
        transport: Arc<dyn GatewayTransport>,
        dispatcher: EventDispatcher,
        reconnect_policy: ReconnectPolicy,
    ) -> Self {
        Self { transport, dispatcher, reconnect_policy }
    }

    /// Runs until the transport closes cleanly or reconnects are exhausted.
    /// Neither case is an error for the process.
    pub async fn start(&self) -> Result<()> {
        for attempt in 0..=self.reconnect_policy.max_retries {
            match self.connect_and_pump(attempt).await {
                Ok(()) => return Ok(()),
                Err(transport_error) => {
                    warn!(
                        event_name = "gateway.transport.failed",
                        attempt,
                        max_retries = self.reconnect_policy.max_retries,
                        error = %transport_error,
                        "gateway transport failed"
                    );

                    if attempt >= self.reconnect_policy.max_retries {
                        warn!(
                            event_name = "gateway.transport.retries_exhausted",
                            max_retries = self.reconnect_policy.max_retries,
                            "gateway retries exhausted; continuing process without crash"
                        );
                        return Ok(());
                    }

                    let delay = self.reconnect_policy.backoff(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Ok(())
    }

    async fn connect_and_pump(&self, attempt: u32) -> Result<(), TransportError> {
        info!(attempt, "opening gateway connection");
        self.transport.connect().await?;
        info!(event_name = "gateway.transport.connected", attempt, "gateway connected");

        loop {
            let Some(envelope) = self.transport.next_envelope().await? else {
                info!(attempt, "gateway stream closed");
                self.transport.disconnect().await?;
                return Ok(());
            };
            let (channel_id, user_id) = correlation_fields(&envelope);

            info!(
                event_name = "ingress.gateway.envelope_received",
                envelope_id = %envelope.envelope_id,
                event_type = ?envelope.event.event_type(),
                correlation_id = %envelope.envelope_id,
                channel_id = channel_id.unwrap_or("unknown"),
                user_id = user_id.unwrap_or("unknown"),
                "received gateway envelope"
            );

            if let Err(error) = self.transport.acknowledge(&envelope.envelope_id).await {
                warn!(
                    event_name = "ingress.gateway.ack_sent",
                    envelope_id = %envelope.envelope_id,
                    correlation_id = %envelope.envelope_id,
                    error = %error,
                    "failed to acknowledge gateway envelope"
                );
            } else {
                debug!(
                    event_name = "ingress.gateway.ack_sent",
                    envelope_id = %envelope.envelope_id,
                    correlation_id = %envelope.envelope_id,
                    "acknowledged gateway envelope"
                );
            }

            let context = EventContext { correlation_id: envelope.envelope_id.clone() };
            match self.dispatcher.dispatch(&envelope, &context).await {
                Ok(HandlerResult::Responded(actions)) => self.deliver_all(&context, &actions).await,
                Ok(HandlerResult::Processed | HandlerResult::Ignored) => {}
                Err(error) => {
                    warn!(
                        envelope_id = %envelope.envelope_id,
                        correlation_id = %envelope.envelope_id,
                        channel_id = channel_id.unwrap_or("unknown"),
                        error = %error,
                        "event dispatch failed; continuing gateway loop"
                    );
                }
            }
        }
    }

    /// Delivery failures (a reaction on a deleted message, a missing
    /// permission) are logged and never end the loop.
    async fn deliver_all(&self, context: &EventContext, actions: &[OutboundAction]) {
        for action in actions {
            if let Err(error) = self.transport.deliver(action).await {
                warn!(
                    event_name = "egress.gateway.delivery_failed",
                    correlation_id = %context.correlation_id,
                    error = %error,
                    "failed to deliver outbound action"
                );
            }
        }
    }
}

fn correlation_fields(envelope: &GatewayEnvelope) -> (Option<&str>, Option<&str>) {
    match &envelope.event {
        GatewayEvent::Message(event) => {
            (Some(event.channel_id.as_str()), Some(event.author_id.as_str()))
        }
        GatewayEvent::Command(payload) => {
            (Some(payload.channel_id.as_str()), Some(payload.user_id.as_str()))
        }
        GatewayEvent::ReactionAdded(event) => {
            (Some(event.channel_id.as_str()), Some(event.reactor_id.as_str()))
        }
        GatewayEvent::Unsupported { .. } => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    use super::{GatewayRunner, GatewayTransport, ReconnectPolicy, TransportError};
    use crate::events::{
        default_dispatcher, EventDispatcher, GatewayEnvelope, GatewayEvent, ReactionAddedEvent,
    };
    use crate::reply::OutboundAction;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct ScriptedTransport {
        state: Mutex<ScriptedState>,
    }

    #[derive(Default)]
    struct ScriptedState {
        connect_results: VecDeque<Result<(), TransportError>>,
        envelopes: VecDeque<Result<Option<GatewayEnvelope>, TransportError>>,
        deliver_results: VecDeque<Result<(), TransportError>>,
        connect_attempts: usize,
        acknowledgements: Vec<String>,
        deliveries: Vec<OutboundAction>,
        disconnect_calls: usize,
    }

    impl ScriptedTransport {
        fn with_script(
            connect_results: Vec<Result<(), TransportError>>,
            envelopes: Vec<Result<Option<GatewayEnvelope>, TransportError>>,
        ) -> Self {
            Self {
                state: Mutex::new(ScriptedState {
                    connect_results: connect_results.into(),
                    envelopes: envelopes.into(),
                    ..ScriptedState::default()
                }),
            }
        }

        async fn connect_attempts(&self) -> usize {
            self.state.lock().await.connect_attempts
        }

        async fn acknowledgements(&self) -> Vec<String> {
            self.state.lock().await.acknowledgements.clone()
        }

        async fn deliveries(&self) -> Vec<OutboundAction> {
            self.state.lock().await.deliveries.clone()
        }
    }

    #[async_trait]
    impl GatewayTransport for ScriptedTransport {
        async fn connect(&self) -> Result<(), TransportError> {
            let mut state = self.state.lock().await;
            state.connect_attempts += 1;
            state.connect_results.pop_front().unwrap_or(Ok(()))
        }

        async fn next_envelope(&self) -> Result<Option<GatewayEnvelope>, TransportError> {
            let mut state = self.state.lock().await;
            state.envelopes.pop_front().unwrap_or(Ok(None))
        }

        async fn acknowledge(&self, envelope_id: &str) -> Result<(), TransportError> {
            let mut state = self.state.lock().await;
            state.acknowledgements.push(envelope_id.to_owned());
            Ok(())
        }

        async fn deliver(&self, action: &OutboundAction) -> Result<(), TransportError> {
            let mut state = self.state.lock().await;
            state.deliveries.push(action.clone());
            state.deliver_results.pop_front().unwrap_or(Ok(()))
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            let mut state = self.state.lock().await;
            state.disconnect_calls += 1;
            Ok(())
        }
    }

    fn unsupported(envelope_id: &str) -> GatewayEnvelope {
        GatewayEnvelope {
            envelope_id: envelope_id.to_owned(),
            event: GatewayEvent::Unsupported { event_type: "typing_start".to_owned() },
        }
    }

    fn delete_reaction(envelope_id: &str, message_id: &str) -> GatewayEnvelope {
        GatewayEnvelope {
            envelope_id: envelope_id.to_owned(),
            event: GatewayEvent::ReactionAdded(ReactionAddedEvent {
                channel_id: "C1".to_owned(),
                message_id: message_id.to_owned(),
                message_author_is_self: true,
                reactor_id: "U1".to_owned(),
                reactor_is_bot: false,
                reactor_can_manage_messages: true,
                emoji: "🗑️".to_owned(),
            }),
        }
    }

    fn instant_policy() -> ReconnectPolicy {
        ReconnectPolicy { max_retries: 2, base_delay_ms: 0, max_delay_ms: 0 }
    }

    #[tokio::test]
    async fn reconnects_after_initial_connect_failure() {
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![Err(TransportError::Connect("network down".to_owned())), Ok(())],
            vec![Ok(Some(unsupported("env-1"))), Ok(None)],
        ));

        let runner =
            GatewayRunner::new(transport.clone(), EventDispatcher::default(), instant_policy());

        runner.start().await.expect("runner should not fail");

        assert_eq!(transport.connect_attempts().await, 2);
        assert_eq!(transport.acknowledgements().await, vec!["env-1"]);
        assert_eq!(transport.state.lock().await.disconnect_calls, 1);
    }

    #[tokio::test]
    async fn exhausts_retries_without_crashing() {
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![
                Err(TransportError::Connect("fail-1".to_owned())),
                Err(TransportError::Connect("fail-2".to_owned())),
                Err(TransportError::Connect("fail-3".to_owned())),
            ],
            vec![],
        ));

        let runner =
            GatewayRunner::new(transport.clone(), EventDispatcher::default(), instant_policy());

        runner.start().await.expect("runner should degrade gracefully");
        assert_eq!(transport.connect_attempts().await, 3);
    }

    #[tokio::test]
    async fn read_failure_mid_stream_triggers_reconnect() {
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![Ok(()), Ok(())],
            vec![
                Ok(Some(unsupported("env-1"))),
                Err(TransportError::Receive("socket reset".to_owned())),
                Ok(Some(unsupported("env-2"))),
                Ok(None),
            ],
        ));

        let runner =
            GatewayRunner::new(transport.clone(), EventDispatcher::default(), instant_policy());
        runner.start().await.expect("runner should recover");

        assert_eq!(transport.connect_attempts().await, 2);
        assert_eq!(transport.acknowledgements().await, vec!["env-1", "env-2"]);
    }

    #[tokio::test]
    async fn handler_actions_are_delivered_and_delivery_failures_do_not_stop_the_loop() {
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![Ok(())],
            vec![
                Ok(Some(delete_reaction("env-1", "B1"))),
                Ok(Some(delete_reaction("env-2", "B2"))),
                Ok(None),
            ],
        ));
        transport
            .state
            .lock()
            .await
            .deliver_results
            .push_back(Err(TransportError::Deliver("unknown message".to_owned())));

        let runner = GatewayRunner::new(transport.clone(), default_dispatcher(), instant_policy());
        runner.start().await.expect("runner should not fail");

        assert_eq!(
            transport.deliveries().await,
            vec![
                OutboundAction::DeleteMessage {
                    channel_id: "C1".to_owned(),
                    message_id: "B1".to_owned(),
                },
                OutboundAction::DeleteMessage {
                    channel_id: "C1".to_owned(),
                    message_id: "B2".to_owned(),
                },
            ]
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(250));
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(4), Duration::from_millis(4_000));
        assert_eq!(policy.backoff(5), Duration::from_millis(5_000));
        assert_eq!(policy.backoff(40), Duration::from_millis(5_000));
    }

    #[test]
    fn extracts_channel_and_user_correlation_fields() {
        let envelope = delete_reaction("env-3", "B3");
        assert_eq!(super::correlation_fields(&envelope), (Some("C1"), Some("U1")));
        assert_eq!(super::correlation_fields(&unsupported("env-4")), (None, None));
    }
}
