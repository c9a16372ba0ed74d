//! An intercepting HTTP/HTTPS proxy library.
//!
//! Plain HTTP requests are parsed, rewritten, and relayed; HTTPS tunnels
//! requested via `CONNECT` are re-terminated with certificates forged on
//! demand under a local CA, exposing the plaintext exchange to user
//! callbacks before it is re-encrypted.

use crate::proxy::logger;

pub mod proxy;

pub static PROXY_LOGGER: logger::Logger = logger::Logger;
