//! Backend-neutral request and response values.
//!
//! Every backend variant translates its native request into an
//! [`ActiveRequest`] on the way in and a [`Response`] into its native
//! response on the way out; everything between those two points is shared.

pub mod request;
pub mod response;

pub use request::{parse_cookies, parse_query, ActiveRequest, RequestBuilder};
pub use response::{build_response, status_reason, to_json_response, Body, Response};
