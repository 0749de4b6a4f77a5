//! Public types for the Skirnir API.

mod deadline;
mod message;
mod request;
mod response;

pub use deadline::Deadline;
pub(crate) use deadline::Bounded;
pub use message::{Message, Role};
pub use request::Request;
pub use response::Response;
