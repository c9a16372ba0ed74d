//! The user-facing inspection surface.
//!
//! An [`Inspector`] sees every exchange twice: once before the request goes
//! to the origin and once after the response body has been normalized,
//! before it is written back to the client. Both hooks may mutate the
//! message they are given. Handlers run one per connection thread, so an
//! inspector must tolerate concurrent calls.

use crate::proxy::logger::Logger;
use crate::proxy::request::{PreparedRequest, Response};

pub trait Inspector: Send + Sync {
    /// Called after the destination is known and before the request is
    /// serialized toward the origin. Header and body edits land on the wire.
    fn on_request(&self, _request: &mut PreparedRequest) {}

    /// Called after the origin response has been received and its body
    /// normalized, before it is written back to the client.
    fn on_response(&self, _response: &mut Response<'_>) {}
}

/// The default inspector: one console line per completed exchange.
pub struct LogInspector;

impl Inspector for LogInspector {
    fn on_response(&self, response: &mut Response<'_>) {
        Logger::log_exchange(response);
    }
}

/// An inspector that does nothing at all.
pub struct SilentInspector;

impl Inspector for SilentInspector {}
