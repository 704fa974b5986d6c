//! Event node execution: blocking waits with timeout and cancellation.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::ChainExecutor;
use crate::errors::{EngineError, Result};
use crate::events::{LogLevel, SipDirection, SipMessageInfo};
use crate::graph::{EventKind, EventSpec, GraphNode};
use crate::session::SipSignal;

impl ChainExecutor {
    pub(super) async fn execute_event(
        &self,
        cancel: &CancellationToken,
        node: &GraphNode,
        spec: &EventSpec,
    ) -> Result<()> {
        // An explicit timeout of zero falls back to the event default.
        let timeout = if node.timeout.is_zero() {
            spec.kind.default_timeout()
        } else {
            node.timeout
        };

        self.emitter.action_log(
            &node.id,
            &node.instance_id,
            format!("Waiting for {} (timeout: {timeout:?})", spec.kind),
            LogLevel::Info,
        );

        match spec.kind {
            EventKind::Incoming => self.wait_incoming(cancel, node, timeout).await,
            EventKind::Disconnected => self.wait_disconnected(cancel, node, timeout).await,
            EventKind::Ringing => self.ringing(node),
            EventKind::Timeout => self.scripted_delay(cancel, node, timeout).await,
            EventKind::DtmfReceived => self.wait_dtmf(cancel, node, spec, timeout).await,
            EventKind::Held => {
                self.wait_sip_signal(cancel, node, SipSignal::Held, timeout)
                    .await
            }
            EventKind::Retrieved => {
                self.wait_sip_signal(cancel, node, SipSignal::Retrieved, timeout)
                    .await
            }
            EventKind::Transferred => {
                self.wait_sip_signal(cancel, node, SipSignal::Transferred, timeout)
                    .await
            }
        }
    }

    async fn wait_incoming(
        &self,
        cancel: &CancellationToken,
        node: &GraphNode,
        timeout: Duration,
    ) -> Result<()> {
        let instance_id = &node.instance_id;
        let instance = self.instances.get(instance_id)?;
        let mut incoming = instance.incoming().await;

        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            _ = tokio::time::sleep(timeout) => Err(EngineError::EventTimeout {
                event: "INCOMING".to_string(),
                timeout,
            }),
            session = incoming.recv() => {
                let session = session.ok_or(EngineError::Cancelled)?;
                let from_user = session.from_uri().user.clone();
                let to_user = session.to_uri().user.clone();
                self.sessions.store_pending(instance_id, session).await;
                self.emitter.action_log_sip(
                    &node.id,
                    instance_id,
                    format!("INCOMING event received from {from_user}"),
                    LogLevel::Info,
                    SipMessageInfo::new(SipDirection::Received, "INVITE")
                        .from(from_user)
                        .to(to_user),
                );
                Ok(())
            }
        }
    }

    async fn wait_disconnected(
        &self,
        cancel: &CancellationToken,
        node: &GraphNode,
        timeout: Duration,
    ) -> Result<()> {
        let instance_id = &node.instance_id;
        let dialog = self
            .sessions
            .dialog(instance_id)
            .await
            .ok_or_else(|| EngineError::NoActiveDialog(instance_id.clone()))?;

        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            _ = tokio::time::sleep(timeout) => Err(EngineError::EventTimeout {
                event: "DISCONNECTED".to_string(),
                timeout,
            }),
            _ = dialog.wait_terminated() => {
                self.emitter.action_log(
                    &node.id,
                    instance_id,
                    "DISCONNECTED event received",
                    LogLevel::Info,
                );
                Ok(())
            }
        }
    }

    /// The provisional response was already consumed during call setup, so
    /// the node completes immediately.
    fn ringing(&self, node: &GraphNode) -> Result<()> {
        self.emitter.action_log_sip(
            &node.id,
            &node.instance_id,
            "RINGING event (auto-completed in local mode)",
            LogLevel::Info,
            SipMessageInfo::new(SipDirection::Received, "RINGING").response_code(180),
        );
        Ok(())
    }

    async fn scripted_delay(
        &self,
        cancel: &CancellationToken,
        node: &GraphNode,
        timeout: Duration,
    ) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            _ = tokio::time::sleep(timeout) => {
                self.emitter.action_log(
                    &node.id,
                    &node.instance_id,
                    format!("TIMEOUT event completed after {timeout:?}"),
                    LogLevel::Info,
                );
                Ok(())
            }
        }
    }

    async fn wait_dtmf(
        &self,
        cancel: &CancellationToken,
        node: &GraphNode,
        spec: &EventSpec,
        timeout: Duration,
    ) -> Result<()> {
        let instance_id = &node.instance_id;
        let dialog = self.sessions.dialog(instance_id).await.ok_or_else(|| {
            self.emitter.action_log(
                &node.id,
                instance_id,
                "No active dialog for DTMFReceived (call must be answered first)",
                LogLevel::Error,
            );
            EngineError::NoActiveDialog(instance_id.clone())
        })?;
        let media = dialog
            .media()
            .ok_or(EngineError::Endpoint(crate::endpoint::EndpointError::NoMedia))?;

        match spec.expected_digit {
            Some(expected) => self.emitter.action_log(
                &node.id,
                instance_id,
                format!(
                    "Waiting for DTMF digit: {expected} (timeout: {}ms)",
                    timeout.as_millis()
                ),
                LogLevel::Info,
            ),
            None => self.emitter.action_log(
                &node.id,
                instance_id,
                format!("Waiting for any DTMF digit (timeout: {}ms)", timeout.as_millis()),
                LogLevel::Info,
            ),
        }

        let deadline = Instant::now() + timeout;
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    self.emitter.action_log(
                        &node.id,
                        instance_id,
                        "DTMF receive timeout",
                        LogLevel::Warn,
                    );
                    return Err(EngineError::EventTimeout {
                        event: "DTMFReceived".to_string(),
                        timeout,
                    });
                }
                result = media.recv_dtmf() => match result {
                    Ok(digit) => digit,
                    Err(err) => {
                        self.emitter.action_log(
                            &node.id,
                            instance_id,
                            format!("DTMF receive error: {err}"),
                            LogLevel::Error,
                        );
                        return Err(EngineError::DtmfReceive(err));
                    }
                },
            };

            if let Some(expected) = spec.expected_digit {
                if received != expected {
                    // Non-matching digits are ignored and the wait continues.
                    self.emitter.action_log(
                        &node.id,
                        instance_id,
                        format!("Received DTMF: {received} (waiting for {expected}, continuing)"),
                        LogLevel::Info,
                    );
                    continue;
                }
            }

            self.emitter.action_log(
                &node.id,
                instance_id,
                format!("Received DTMF: {received}"),
                LogLevel::Info,
            );
            return Ok(());
        }
    }

    async fn wait_sip_signal(
        &self,
        cancel: &CancellationToken,
        node: &GraphNode,
        signal: SipSignal,
        timeout: Duration,
    ) -> Result<()> {
        let instance_id = &node.instance_id;
        // Dropping the subscription at the end of this wait unsubscribes.
        let mut subscription = self.sessions.bus().subscribe(instance_id, signal);

        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            _ = tokio::time::sleep(timeout) => Err(EngineError::EventTimeout {
                event: signal.to_string(),
                timeout,
            }),
            _ = subscription.wait() => {
                self.emitter.action_log(
                    &node.id,
                    instance_id,
                    format!("{signal} event received"),
                    LogLevel::Info,
                );
                Ok(())
            }
        }
    }
}
