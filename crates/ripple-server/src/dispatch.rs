//! Inbound frame dispatch.
//!
//! Decode, validate, rate-gate, then route each frame to its hub
//! operation. Every refusal becomes a frame back to the sender; only
//! bugs are allowed to escape as panics (the socket loop catches
//! those and closes 1011).

use crate::hub::{ClientEventOutcome, Hub};
use crate::metrics;
use ripple_protocol::{codec, ClientFrame, CodecError, ErrorKind, Inbound, ServerFrame};
use tracing::{debug, warn};

fn rate_key_channel(frame: &ClientFrame) -> Option<&str> {
    match frame {
        ClientFrame::Subscribe { channel, .. }
        | ClientFrame::Unsubscribe { channel }
        | ClientFrame::ClientEvent { channel, .. } => Some(channel.as_str()),
        ClientFrame::Heartbeat { channel } => channel.as_deref(),
        _ => None,
    }
}

/// Process one inbound text frame for a socket.
pub async fn dispatch_text(hub: &Hub, socket_id: &str, user_id: Option<&str>, text: &str) {
    metrics::record_message(text.len(), "inbound");

    let max_payload = hub.config().security.max_payload_size;
    let value = match codec::decode(text, max_payload) {
        Ok(value) => value,
        Err(CodecError::PayloadTooLarge { size, max }) => {
            warn!(socket = %socket_id, size, "Oversized frame");
            metrics::record_error("payload_too_large");
            hub.send_to_socket(
                socket_id,
                &ServerFrame::error(
                    ErrorKind::PayloadTooLarge,
                    format!("Frame size {size} exceeds maximum {max}"),
                ),
            );
            return;
        }
        Err(e) => {
            metrics::record_error("decode");
            hub.send_to_socket(
                socket_id,
                &ServerFrame::error(ErrorKind::ValidationError, e.to_string()),
            );
            return;
        }
    };

    if let Err(reason) = hub.validator().check(&value) {
        metrics::record_error("validation");
        hub.send_to_socket(
            socket_id,
            &ServerFrame::error(ErrorKind::ValidationError, reason),
        );
        return;
    }

    let inbound = match Inbound::from_value(&value) {
        Ok(inbound) => inbound,
        Err(e) => {
            metrics::record_error("validation");
            hub.send_to_socket(
                socket_id,
                &ServerFrame::error(ErrorKind::ValidationError, e.to_string()),
            );
            return;
        }
    };

    if let Some(retry_after) =
        hub.rate_gate(socket_id, user_id, rate_key_channel(&inbound.frame))
    {
        hub.send_to_socket(
            socket_id,
            &ServerFrame::Error {
                kind: ErrorKind::RateLimitExceeded,
                error: "Too many messages".to_string(),
                retry_after: Some(retry_after),
            },
        );
        return;
    }

    let Inbound {
        frame,
        message_id,
        wants_ack,
    } = inbound;

    match frame {
        ClientFrame::Subscribe {
            channel,
            channel_data,
            auth,
        } => {
            if let Err(refusal) = hub
                .subscribe_channel(
                    socket_id,
                    &channel,
                    channel_data.as_ref(),
                    auth.as_deref(),
                    true,
                )
                .await
            {
                hub.send_to_socket(
                    socket_id,
                    &ServerFrame::SubscriptionError {
                        channel,
                        kind: refusal.kind,
                        error: refusal.error,
                        status: refusal.status,
                    },
                );
            }
        }

        ClientFrame::Unsubscribe { channel } => {
            hub.unsubscribe_channel(socket_id, &channel).await;
        }

        ClientFrame::BatchSubscribe {
            channels,
            channel_data,
        } => {
            let Some(message_id) = message_id else {
                hub.send_to_socket(
                    socket_id,
                    &ServerFrame::error(
                        ErrorKind::ValidationError,
                        "batch_subscribe requires messageId",
                    ),
                );
                return;
            };
            let (succeeded, failed) = hub
                .batch_subscribe(socket_id, &channels, channel_data.as_ref())
                .await;
            hub.send_to_socket(
                socket_id,
                &ServerFrame::BatchSubscribeResult {
                    message_id,
                    succeeded,
                    failed,
                },
            );
        }

        ClientFrame::BatchUnsubscribe { channels } => {
            let Some(message_id) = message_id else {
                hub.send_to_socket(
                    socket_id,
                    &ServerFrame::error(
                        ErrorKind::ValidationError,
                        "batch_unsubscribe requires messageId",
                    ),
                );
                return;
            };
            let (succeeded, failed) = hub.batch_unsubscribe(socket_id, &channels).await;
            hub.send_to_socket(
                socket_id,
                &ServerFrame::BatchUnsubscribeResult {
                    message_id,
                    succeeded,
                    failed,
                },
            );
        }

        ClientFrame::Ping => {
            hub.send_to_socket(socket_id, &ServerFrame::Pong);
        }

        ClientFrame::Heartbeat { channel } => {
            hub.heartbeat(socket_id, channel.as_deref());
        }

        ClientFrame::Ack {
            message_id: acked_id,
        } => {
            if !hub.acknowledge(&acked_id) {
                debug!(socket = %socket_id, message_id = %acked_id, "Ack for unknown message");
            }
        }

        ClientFrame::ClientEvent {
            event,
            channel,
            data,
        } => {
            match hub
                .client_event(socket_id, &event, &channel, data, message_id.as_deref())
                .await
            {
                Ok(outcome) => {
                    if let ClientEventOutcome::Delivered(count) = outcome {
                        debug!(socket = %socket_id, channel = %channel, recipients = count, "Client event fanned out");
                    }
                    // Delivery receipt for senders that asked for one.
                    if wants_ack {
                        if let Some(message_id) = message_id {
                            hub.send_to_socket(socket_id, &ServerFrame::Ack { message_id });
                        }
                    }
                }
                Err(error_frame) => hub.send_to_socket(socket_id, &error_frame),
            }
        }

        ClientFrame::Unknown { event } => {
            // Unknown events still honor the acknowledgment envelope.
            if wants_ack {
                if let Some(message_id) = message_id {
                    hub.send_to_socket(socket_id, &ServerFrame::Ack { message_id });
                }
            }
            debug!(socket = %socket_id, event = %event, "Ignoring unknown event");
        }
    }
}
