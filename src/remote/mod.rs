/*
Everything related to the cloud backend this gateway reports to.

The client converts every backend interaction into a plain success/failure
at its boundary; transport errors, timeouts and rejection statuses never
leak into the provisioning or discovery control flow.
*/

mod client;
mod heartbeat;

pub use client::{Remote, RequestError};
pub use heartbeat::{start_heartbeat, HEARTBEAT_PERIOD};
