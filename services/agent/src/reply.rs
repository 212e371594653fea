//! Reply channel for forwarded API responses.
//!
//! A request that arrived with an `ack` id is answered through that callback;
//! otherwise the response is broadcast as a labeled `api-response` event.

use bridge_protocol::{BridgeMessage, ForwardedResponse, Frame, FrameError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyChannel {
    /// Per-call callback identified by the inbound frame's ack id.
    Callback(u64),
    /// `api-response` event carrying the request id.
    Broadcast,
}

impl ReplyChannel {
    pub fn from_ack(ack: Option<u64>) -> Self {
        match ack {
            Some(id) => ReplyChannel::Callback(id),
            None => ReplyChannel::Broadcast,
        }
    }

    /// The frame that delivers `response` on this channel.
    pub fn into_frame(self, response: ForwardedResponse) -> Result<Frame, FrameError> {
        match self {
            ReplyChannel::Callback(ack) => {
                let (_, reply) = response.into_reply();
                Frame::reply(ack, reply)
            }
            ReplyChannel::Broadcast => Frame::try_from(BridgeMessage::ApiResponse(response)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_protocol::{RequestId, events};

    #[test]
    fn ack_id_selects_callback() {
        assert_eq!(ReplyChannel::from_ack(Some(3)), ReplyChannel::Callback(3));
        assert_eq!(ReplyChannel::from_ack(None), ReplyChannel::Broadcast);
    }

    #[test]
    fn callback_frame_echoes_ack_and_drops_request_id() {
        let resp = ForwardedResponse::agent_error(RequestId::from("r"), "boom");
        let frame = ReplyChannel::Callback(11).into_frame(resp).unwrap();
        assert_eq!(frame.event, events::ACK);
        assert_eq!(frame.ack, Some(11));
        assert_eq!(frame.data["status"], 500);
        assert!(frame.data.get("requestId").is_none());
    }

    #[test]
    fn broadcast_frame_is_labeled_with_request_id() {
        let resp = ForwardedResponse::agent_error(RequestId::from("r"), "boom");
        let frame = ReplyChannel::Broadcast.into_frame(resp).unwrap();
        assert_eq!(frame.event, events::API_RESPONSE);
        assert_eq!(frame.ack, None);
        assert_eq!(frame.data["requestId"], "r");
    }
}
