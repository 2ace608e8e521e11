//! Peer identity handshake.
//!
//! The initiator opens with `EstablishConnection{id, password}`; the
//! responder verifies the password literally and answers with its own
//! `EstablishConnection{id, ""}`; the initiator confirms with `Ok`.
//! Either side failing verification sends `Error` and closes.

use scribe_wire::{Message, NodeId};
use tracing::debug;

use crate::stream::MessageStream;
use crate::{NetError, NetResult};

/// Runs the initiator side. Returns the responder's node ID.
pub fn initiate(stream: &mut MessageStream, id: NodeId, password: &str) -> NetResult<NodeId> {
    stream.write_message(&Message::EstablishConnection {
        id,
        text: password.to_string(),
    })?;

    let peer_id = match stream.read_message()? {
        Message::EstablishConnection { id: peer_id, .. } => peer_id,
        Message::Error { message } => {
            return Err(NetError::HandshakeRejected { reason: message });
        }
        other => {
            return Err(NetError::UnexpectedMessage {
                expected: "EstablishConnection",
                got: other.opcode(),
            });
        }
    };

    stream.write_message(&Message::Ok)?;
    debug!(peer = %peer_id, "handshake accepted");
    Ok(peer_id)
}

/// Runs the responder side. Returns the initiator's node ID.
pub fn respond(stream: &mut MessageStream, id: NodeId, password: &str) -> NetResult<NodeId> {
    let peer_id = match stream.read_message()? {
        Message::EstablishConnection { id: peer_id, text } => {
            if text != password {
                let reason = "invalid password".to_string();
                let _ = stream.write_message(&Message::Error {
                    message: reason.clone(),
                });
                return Err(NetError::HandshakeRejected { reason });
            }
            peer_id
        }
        Message::Error { message } => {
            return Err(NetError::HandshakeRejected { reason: message });
        }
        other => {
            let _ = stream.write_message(&Message::Error {
                message: "invalid opcode".to_string(),
            });
            return Err(NetError::UnexpectedMessage {
                expected: "EstablishConnection",
                got: other.opcode(),
            });
        }
    };

    stream.write_message(&Message::EstablishConnection {
        id,
        text: String::new(),
    })?;

    match stream.read_message()? {
        Message::Ok => {
            debug!(peer = %peer_id, "handshake verified");
            Ok(peer_id)
        }
        Message::Error { message } => Err(NetError::HandshakeRejected { reason: message }),
        other => Err(NetError::UnexpectedMessage {
            expected: "Ok",
            got: other.opcode(),
        }),
    }
}
