use crate::connection::{ConnectionState, MessageConnection};
use crate::message::{ContentId, MessageId, NO_CONTENT_ID};
use crate::packet_id::PacketId;
use crate::ref_counted::Handle;
#[cfg(test)] use mockall::automock;

/// The application's side of the transport. All callbacks are invoked on the network's worker
///  thread without holding any connection lock, so implementations may call back into the
///  connection (e.g. to send a reply).
///
/// Callbacks for one connection are never invoked concurrently. They should return quickly
///  since they block processing of all connections of the network.
#[cfg_attr(test, automock)]
pub trait MessageHandler: Send + Sync + 'static {
    /// Called once for every message accepted by the receiving side, i.e. not for duplicates
    ///  and not for stale sequenced messages. Reliable in-order messages arrive here in the
    ///  order they were sent.
    fn handle_message(&self, source: &Handle<MessageConnection>, packet_id: PacketId, message_id: MessageId, data: &[u8]);

    /// Messages with the same message id and the same non-zero content id replace each other
    ///  while they are queued or in flight, so only the most recent one is delivered. The
    ///  default means 'no content id', i.e. no replacement.
    fn compute_content_id(&self, _message_id: MessageId, _data: &[u8]) -> ContentId {
        NO_CONTENT_ID
    }

    /// Inbound connections are reported with [ConnectionState::Open] when they are created.
    fn on_connection_state_changed(&self, _source: &Handle<MessageConnection>, _state: ConnectionState) {
    }
}
