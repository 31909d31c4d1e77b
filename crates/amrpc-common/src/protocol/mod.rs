pub mod correlation;
pub mod envelope;
pub mod error;
pub mod reply;


pub use correlation::CorrelationId;
pub use envelope::{Envelope, RpcArgs, RpcKwargs};
pub use error::{AmrpcError, Result};
pub use reply::{error_reply, ErrorReply, RpcResult, ENCODE_FAILURE_MESSAGE};
