mod forward;
mod ws;

pub use forward::{BidirForwardResult, forward_bidirectional};
pub use ws::{WsReadMsg, WsStream};
