//! Command node execution.

use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{is_valid_dtmf, ChainExecutor};
use crate::endpoint::{AnswerHooks, MediaDirection, SipUri};
use crate::errors::{EngineError, Result};
use crate::events::{Emitter, LogLevel, SipDirection, SipMessageInfo};
use crate::graph::{CommandKind, CommandSpec, GraphNode, InstanceId, NodeId};
use crate::session::{SessionStore, SipSignal};

/// Bound on hangups issued by Release and BlindTransfer.
const HANGUP_TIMEOUT: Duration = Duration::from_secs(5);

impl ChainExecutor {
    pub(super) async fn execute_command(
        &self,
        cancel: &CancellationToken,
        node: &GraphNode,
        spec: &CommandSpec,
    ) -> Result<()> {
        match spec.kind {
            CommandKind::MakeCall => self.make_call(cancel, node, spec).await,
            CommandKind::Answer => self.answer(node).await,
            CommandKind::Release => self.release(node).await,
            CommandKind::PlayAudio => self.play_audio(cancel, node, spec).await,
            CommandKind::SendDtmf => self.send_dtmf(cancel, node, spec).await,
            CommandKind::Hold => self.hold(cancel, node).await,
            CommandKind::Retrieve => self.retrieve(cancel, node).await,
            CommandKind::BlindTransfer => self.blind_transfer(node, spec).await,
        }
    }

    async fn make_call(
        &self,
        cancel: &CancellationToken,
        node: &GraphNode,
        spec: &CommandSpec,
    ) -> Result<()> {
        let instance_id = &node.instance_id;
        self.emitter.action_log(
            &node.id,
            instance_id,
            format!("MakeCall to {}", spec.target_uri),
            LogLevel::Info,
        );

        if spec.target_uri.is_empty() {
            return Err(EngineError::MissingField {
                command: "MakeCall",
                field: "targetUri",
            });
        }
        if !spec.target_uri.starts_with("sip:") {
            return Err(EngineError::UriScheme);
        }
        let target: SipUri = spec
            .target_uri
            .parse()
            .map_err(|err: crate::endpoint::SipUriError| EngineError::InvalidUri {
                uri: spec.target_uri.clone(),
                reason: err.to_string(),
            })?;

        let instance = self.instances.get(instance_id)?;

        // An explicit timeout of zero falls back to the call-setup default.
        let timeout = if node.timeout.is_zero() {
            CommandKind::MakeCall.default_timeout()
        } else {
            node.timeout
        };

        let dialog = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            _ = tokio::time::sleep(timeout) => return Err(EngineError::CallSetupTimeout(timeout)),
            result = instance.endpoint().invite(&target, AnswerHooks::default()) => {
                result.map_err(EngineError::InviteFailed)?
            }
        };

        self.sessions.store_dialog(instance_id, dialog).await;

        self.emitter.action_log_sip(
            &node.id,
            instance_id,
            "MakeCall succeeded",
            LogLevel::Info,
            SipMessageInfo::new(SipDirection::Sent, "INVITE")
                .response_code(200)
                .from(instance.config().dn.clone())
                .to(target.user.clone()),
        );
        Ok(())
    }

    async fn answer(&self, node: &GraphNode) -> Result<()> {
        let instance_id = &node.instance_id;
        self.emitter
            .action_log(&node.id, instance_id, "Answer incoming call", LogLevel::Info);

        let session = self
            .sessions
            .take_pending(instance_id)
            .await
            .ok_or_else(|| EngineError::NoPendingCall(instance_id.clone()))?;
        let from_user = session.from_uri().user.clone();
        let to_user = session.to_uri().user.clone();

        let hooks = build_answer_hooks(
            self.emitter.clone(),
            std::sync::Arc::clone(&self.sessions),
            node.id.clone(),
            instance_id.clone(),
        );

        let dialog = match session.answer(hooks).await {
            Ok(dialog) => dialog,
            Err(err) => {
                let text = err.to_string().to_lowercase();
                if text.contains("codec") || text.contains("media") || text.contains("negotiat") {
                    if let Ok(instance) = self.instances.get(instance_id) {
                        self.emitter.action_log(
                            &node.id,
                            instance_id,
                            format!("Instance codecs: {:?}", instance.config().codecs),
                            LogLevel::Debug,
                        );
                    }
                    self.emitter.action_log(
                        &node.id,
                        instance_id,
                        format!("Codec negotiation failed (488 Not Acceptable): {err}"),
                        LogLevel::Error,
                    );
                    return Err(EngineError::CodecNegotiation(err));
                }
                return Err(EngineError::AnswerFailed(err));
            }
        };

        self.sessions.store_dialog(instance_id, dialog).await;

        self.emitter.action_log_sip(
            &node.id,
            instance_id,
            "Answer succeeded",
            LogLevel::Info,
            SipMessageInfo::new(SipDirection::Received, "INVITE")
                .response_code(200)
                .from(from_user)
                .to(to_user),
        );
        Ok(())
    }

    async fn release(&self, node: &GraphNode) -> Result<()> {
        let instance_id = &node.instance_id;
        self.emitter
            .action_log(&node.id, instance_id, "Release call", LogLevel::Info);

        let Some(dialog) = self.sessions.dialog(instance_id).await else {
            // Idempotent: releasing a finished call is not a failure.
            self.emitter.action_log(
                &node.id,
                instance_id,
                "No active dialog to release (already terminated)",
                LogLevel::Warn,
            );
            return Ok(());
        };

        match tokio::time::timeout(HANGUP_TIMEOUT, dialog.hangup()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.emitter.action_log(
                    &node.id,
                    instance_id,
                    format!("Hangup warning: {err}"),
                    LogLevel::Warn,
                );
            }
            Err(_) => {
                self.emitter.action_log(
                    &node.id,
                    instance_id,
                    format!("Hangup warning: timed out after {HANGUP_TIMEOUT:?}"),
                    LogLevel::Warn,
                );
            }
        }

        self.emitter.action_log_sip(
            &node.id,
            instance_id,
            "Release succeeded",
            LogLevel::Info,
            SipMessageInfo::new(SipDirection::Sent, "BYE").response_code(200),
        );
        Ok(())
    }

    async fn play_audio(
        &self,
        cancel: &CancellationToken,
        node: &GraphNode,
        spec: &CommandSpec,
    ) -> Result<()> {
        let instance_id = &node.instance_id;

        if spec.file_path.is_empty() {
            self.emitter.action_log(
                &node.id,
                instance_id,
                "PlayAudio requires filePath",
                LogLevel::Error,
            );
            return Err(EngineError::MissingField {
                command: "PlayAudio",
                field: "filePath",
            });
        }

        let path = Path::new(&spec.file_path);
        if let Err(err) = std::fs::metadata(path) {
            if err.kind() == std::io::ErrorKind::NotFound {
                self.emitter.action_log(
                    &node.id,
                    instance_id,
                    format!("Audio file not found: {}", spec.file_path),
                    LogLevel::Error,
                );
                return Err(EngineError::AudioFileNotFound(path.to_path_buf()));
            }
            return Err(EngineError::AudioFileAccess {
                path: path.to_path_buf(),
                source: err,
            });
        }

        let Some(dialog) = self.sessions.dialog(instance_id).await else {
            self.emitter.action_log(
                &node.id,
                instance_id,
                "No active dialog for PlayAudio (call must be answered first)",
                LogLevel::Error,
            );
            return Err(EngineError::NoActiveDialog(instance_id.clone()));
        };

        let media = dialog.media().ok_or_else(|| {
            self.emitter.action_log(
                &node.id,
                instance_id,
                "No media channel for PlayAudio",
                LogLevel::Error,
            );
            EngineError::Playback(crate::endpoint::EndpointError::NoMedia)
        })?;

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| spec.file_path.clone());
        self.emitter.action_log(
            &node.id,
            instance_id,
            format!("Playing audio file: {file_name}"),
            LogLevel::Info,
        );

        let bytes_played = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            result = media.play_file(path) => match result {
                Ok(bytes) => bytes,
                Err(err) => {
                    self.emitter.action_log(
                        &node.id,
                        instance_id,
                        format!("Playback failed: {err}"),
                        LogLevel::Error,
                    );
                    return Err(EngineError::Playback(err));
                }
            },
        };

        self.emitter.action_log(
            &node.id,
            instance_id,
            format!("Playback completed ({bytes_played} bytes)"),
            LogLevel::Info,
        );
        Ok(())
    }

    async fn send_dtmf(
        &self,
        cancel: &CancellationToken,
        node: &GraphNode,
        spec: &CommandSpec,
    ) -> Result<()> {
        let instance_id = &node.instance_id;

        if spec.digits.is_empty() {
            self.emitter.action_log(
                &node.id,
                instance_id,
                "SendDTMF requires digits",
                LogLevel::Error,
            );
            return Err(EngineError::MissingField {
                command: "SendDTMF",
                field: "digits",
            });
        }

        let interval = Duration::from_millis(spec.interval_ms);

        let Some(dialog) = self.sessions.dialog(instance_id).await else {
            self.emitter.action_log(
                &node.id,
                instance_id,
                "No active dialog for SendDTMF (call must be answered first)",
                LogLevel::Error,
            );
            return Err(EngineError::NoActiveDialog(instance_id.clone()));
        };
        let media = dialog
            .media()
            .ok_or(EngineError::Endpoint(crate::endpoint::EndpointError::NoMedia))?;

        self.emitter.action_log(
            &node.id,
            instance_id,
            format!(
                "Sending DTMF digits: {} (interval: {}ms)",
                spec.digits, spec.interval_ms
            ),
            LogLevel::Info,
        );

        let digits: Vec<char> = spec.digits.chars().collect();
        for (i, &digit) in digits.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            if !is_valid_dtmf(digit) {
                self.emitter.action_log(
                    &node.id,
                    instance_id,
                    format!("Invalid DTMF digit: {digit}"),
                    LogLevel::Error,
                );
                return Err(EngineError::InvalidDtmfDigit(digit));
            }

            if let Err(err) = media.send_dtmf(digit).await {
                self.emitter.action_log(
                    &node.id,
                    instance_id,
                    format!("Failed to send DTMF {digit}: {err}"),
                    LogLevel::Error,
                );
                return Err(EngineError::DtmfSend { digit, source: err });
            }

            self.emitter.action_log(
                &node.id,
                instance_id,
                format!("Sent DTMF: {digit}"),
                LogLevel::Info,
            );

            // No gap after the final digit.
            if i < digits.len() - 1 {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }

        self.emitter.action_log(
            &node.id,
            instance_id,
            format!("DTMF transmission completed ({} digits)", digits.len()),
            LogLevel::Info,
        );
        Ok(())
    }

    async fn hold(&self, cancel: &CancellationToken, node: &GraphNode) -> Result<()> {
        let instance_id = &node.instance_id;
        self.emitter.action_log(
            &node.id,
            instance_id,
            "Hold: sending Re-INVITE (sendonly)",
            LogLevel::Info,
        );

        let dialog = self
            .sessions
            .dialog(instance_id)
            .await
            .ok_or_else(|| EngineError::NoActiveDialog(instance_id.clone()))?;

        dialog.set_direction(MediaDirection::SendOnly);
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(crate::endpoint::EndpointError::Shutdown),
            result = dialog.reinvite() => result,
        };
        if let Err(err) = result {
            // Failed renegotiation leaves the leg active both ways.
            dialog.set_direction(MediaDirection::SendRecv);
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            return Err(EngineError::HoldFailed(err));
        }

        self.emitter.action_log_sip(
            &node.id,
            instance_id,
            "Hold succeeded",
            LogLevel::Info,
            SipMessageInfo::new(SipDirection::Sent, "INVITE")
                .response_code(200)
                .note("sendonly"),
        );
        Ok(())
    }

    async fn retrieve(&self, cancel: &CancellationToken, node: &GraphNode) -> Result<()> {
        let instance_id = &node.instance_id;
        self.emitter.action_log(
            &node.id,
            instance_id,
            "Retrieve: sending Re-INVITE (sendrecv)",
            LogLevel::Info,
        );

        let dialog = self
            .sessions
            .dialog(instance_id)
            .await
            .ok_or_else(|| EngineError::NoActiveDialog(instance_id.clone()))?;

        // Unlike Hold, failure does not restore the previous direction.
        dialog.set_direction(MediaDirection::SendRecv);
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            result = dialog.reinvite() => result,
        };
        result.map_err(EngineError::RetrieveFailed)?;

        self.emitter.action_log_sip(
            &node.id,
            instance_id,
            "Retrieve succeeded",
            LogLevel::Info,
            SipMessageInfo::new(SipDirection::Sent, "INVITE")
                .response_code(200)
                .note("sendrecv"),
        );
        Ok(())
    }

    async fn blind_transfer(&self, node: &GraphNode, spec: &CommandSpec) -> Result<()> {
        let instance_id = &node.instance_id;

        if spec.target_user.is_empty() {
            return Err(EngineError::MissingField {
                command: "BlindTransfer",
                field: "targetUser",
            });
        }
        if spec.target_host.is_empty() {
            return Err(EngineError::MissingField {
                command: "BlindTransfer",
                field: "targetHost",
            });
        }

        let dialog = self
            .sessions
            .dialog(instance_id)
            .await
            .ok_or_else(|| EngineError::NoActiveDialog(instance_id.clone()))?;

        let raw_uri = format!("sip:{}@{}", spec.target_user, spec.target_host);
        let refer_to: SipUri = raw_uri
            .parse()
            .map_err(|err: crate::endpoint::SipUriError| EngineError::InvalidUri {
                uri: raw_uri.clone(),
                reason: err.to_string(),
            })?;

        // Logged before the REFER so a failed attempt still shows up.
        self.emitter.action_log(
            &node.id,
            instance_id,
            format!("BlindTransfer: sending REFER to {raw_uri}"),
            LogLevel::Info,
        );

        dialog
            .refer(&refer_to)
            .await
            .map_err(EngineError::ReferFailed)?;

        self.emitter.action_log_sip(
            &node.id,
            instance_id,
            format!("BlindTransfer succeeded (Refer-To: {raw_uri})"),
            LogLevel::Info,
            SipMessageInfo::new(SipDirection::Sent, "REFER")
                .response_code(202)
                .to(raw_uri),
        );

        // The transferring leg drops out immediately after the REFER.
        match tokio::time::timeout(HANGUP_TIMEOUT, dialog.hangup()).await {
            Ok(Ok(())) => {
                self.emitter.action_log_sip(
                    &node.id,
                    instance_id,
                    "BlindTransfer: BYE sent",
                    LogLevel::Info,
                    SipMessageInfo::new(SipDirection::Sent, "BYE").response_code(200),
                );
            }
            Ok(Err(err)) => {
                self.emitter.action_log(
                    &node.id,
                    instance_id,
                    format!("BlindTransfer: BYE warning: {err}"),
                    LogLevel::Warn,
                );
            }
            Err(_) => {
                self.emitter.action_log(
                    &node.id,
                    instance_id,
                    format!("BlindTransfer: BYE warning: timed out after {HANGUP_TIMEOUT:?}"),
                    LogLevel::Warn,
                );
            }
        }

        Ok(())
    }
}

/// Hooks installed when answering: they translate the protocol layer's
/// media-update and REFER callbacks into bus signals and action logs.
///
/// Callback bodies run on spawned tasks. The protocol layer invokes these
/// while holding its per-dialog lock, so doing dialog work inline would
/// deadlock.
fn build_answer_hooks(
    emitter: Emitter,
    sessions: std::sync::Arc<SessionStore>,
    node_id: NodeId,
    instance_id: InstanceId,
) -> AnswerHooks {
    let media_emitter = emitter.clone();
    let media_sessions = std::sync::Arc::clone(&sessions);
    let media_node = node_id.clone();
    let media_instance = instance_id.clone();

    AnswerHooks {
        on_media_update: Some(Box::new(move |direction| {
            let emitter = media_emitter.clone();
            let sessions = std::sync::Arc::clone(&media_sessions);
            let node_id = media_node.clone();
            let instance_id = media_instance.clone();
            tokio::spawn(async move {
                match direction {
                    MediaDirection::RecvOnly => {
                        sessions.bus().emit(&instance_id, SipSignal::Held);
                        emitter.action_log_sip(
                            &node_id,
                            &instance_id,
                            "Call HELD by remote party",
                            LogLevel::Info,
                            SipMessageInfo::new(SipDirection::Received, "INVITE")
                                .response_code(200)
                                .note("recvonly"),
                        );
                    }
                    MediaDirection::SendRecv => {
                        sessions.bus().emit(&instance_id, SipSignal::Retrieved);
                        emitter.action_log_sip(
                            &node_id,
                            &instance_id,
                            "Call RETRIEVED by remote party",
                            LogLevel::Info,
                            SipMessageInfo::new(SipDirection::Received, "INVITE")
                                .response_code(200)
                                .note("sendrecv"),
                        );
                    }
                    _ => {}
                }
            });
        })),
        on_refer: Some(Box::new(move |_target| {
            let emitter = emitter.clone();
            let sessions = std::sync::Arc::clone(&sessions);
            let node_id = node_id.clone();
            let instance_id = instance_id.clone();
            tokio::spawn(async move {
                sessions.bus().emit(&instance_id, SipSignal::Transferred);
                emitter.action_log_sip(
                    &node_id,
                    &instance_id,
                    "REFER received (transfer)",
                    LogLevel::Info,
                    SipMessageInfo::new(SipDirection::Received, "REFER"),
                );
            });
        })),
    }
}
