//! Logical Link Control and Adaptation Protocol
//!
//! L2CAP multiplexes the higher host protocols over a connection and adapts their PDUs to the
//! transfer size of the interface. An outbound service data unit is framed with a basic header,
//! split into fragments no larger than the controller's data packet payload, and queued against
//! the controller's buffer credit. Inbound fragments are recombined per link and dispatched by
//! their channel identifier.
//!
//! The [`FlowManager`] is the stateful core of this crate. It is purely synchronous; it returns
//! the fragments that may be transmitted *right now* and the frames that completed recombination,
//! leaving the actual packet transfer to the layer driving it.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod cid;
mod flow;
mod frame;

pub use cid::{ChannelId, InvalidChannel};
pub use flow::{FlowManager, SendSduError, TxFragment};
pub use frame::{fragment, BasicFrame, BasicFrameError, Fragment};

use lazuli_core::ConnectionHandle;

/// An outbound service data unit
///
/// The unit of data a protocol above L2CAP submits for transfer over a connection. It is framed
/// and fragmented by the [`FlowManager`] on its way out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundSdu {
    pub handle: ConnectionHandle,
    pub channel_id: ChannelId,
    pub payload: Vec<u8>,
}
