//! Wire protocol between client and collectors.
//!
//! Layers, bottom up: [`codec`] packs typed fields, [`transport`] frames
//! them with a tag/id/size header, [`tags`] and [`messages`] give each
//! frame a typed meaning, and [`correlator`] matches replies to requests.

pub mod codec;
pub mod correlator;
#[cfg(unix)]
pub mod endpoint;
pub mod heartbeat;
pub mod messages;
pub mod tags;
pub mod transport;

pub use codec::{CodecError, Packer, Unpacker, Value};
pub use correlator::{Correlator, CorrelatorError};
#[cfg(unix)]
pub use endpoint::{Endpoint, EndpointListener};
pub use messages::{
    CollectorCommand, DataTarget, DbCommand, LocationSpec, ProcessScope, ProtocolError,
};
pub use tags::{Direction, Tag};
pub use transport::{
    open_channel, Channel, ChannelMode, Frame, MessageChannel, Received, ThreadedChannel,
    TransportError, WireStream, DEFAULT_MAX_FRAME_BYTES,
};
