//! Types shared by every crate of the courrier workspace: public-key and
//! message identifiers, the application-level message payloads carried over
//! the protocol service, and the deep-link payload codec.

pub mod constants;
pub mod deeplink;
pub mod message;
pub mod types;
