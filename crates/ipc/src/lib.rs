mod error;
mod method;
mod protocol;
mod request;
mod response;
mod worker;

pub use error::IpcError;
pub use method::Method;
pub use protocol::{ProgressEvent, Request, Response, RpcError};
pub use request::*;
pub use response::*;
pub use worker::{WorkerReply, WorkerRequest};
