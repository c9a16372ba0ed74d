//! Transfer- and content-encoding codecs.
//!
//! `chunked` de-framing plus a decoder registry for the three content
//! encodings the proxy normalizes away before handing a response to the
//! inspection callbacks: `gzip`, `deflate` (zlib-wrapped or raw), and `br`.
//! Unknown encodings pass through untouched.

use crate::proxy::errors::ProxyError;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use std::io::Read;

/// Decodes `content` according to a single `Content-Encoding` token.
pub fn decode(content: &[u8], encoding: &str) -> Result<Vec<u8>, ProxyError> {
    match encoding {
        "gzip" => decode_gzip(content),
        "deflate" => decode_deflate(content),
        "br" => decode_brotli(content),
        _ => Ok(content.to_vec()),
    }
}

fn decode_gzip(content: &[u8]) -> Result<Vec<u8>, ProxyError> {
    if content.is_empty() {
        return Ok(Vec::new());
    }
    let mut decoded = Vec::new();
    GzDecoder::new(content).read_to_end(&mut decoded)?;
    Ok(decoded)
}

/// Servers disagree on whether `deflate` means the zlib wrapping or the raw
/// stream; try zlib first and fall back to raw.
fn decode_deflate(content: &[u8]) -> Result<Vec<u8>, ProxyError> {
    if content.is_empty() {
        return Ok(Vec::new());
    }
    let mut decoded = Vec::new();
    match ZlibDecoder::new(content).read_to_end(&mut decoded) {
        Ok(_) => Ok(decoded),
        Err(_) => {
            let mut decoded = Vec::new();
            DeflateDecoder::new(content).read_to_end(&mut decoded)?;
            Ok(decoded)
        }
    }
}

fn decode_brotli(content: &[u8]) -> Result<Vec<u8>, ProxyError> {
    if content.is_empty() {
        return Ok(Vec::new());
    }
    let mut decoded = Vec::new();
    brotli::Decompressor::new(content, 4096).read_to_end(&mut decoded)?;
    Ok(decoded)
}

/// Strips chunked transfer framing: each chunk is `<hex-size>[;ext]\r\n`
/// followed by the data and a trailing CRLF, ending at the zero chunk.
/// Trailers after the zero chunk are discarded.
pub fn dechunk(raw_body: &[u8]) -> Vec<u8> {
    let mut decoded = Vec::new();
    let mut pos = 0;

    while pos < raw_body.len() {
        let Some(line_end) = find(&raw_body[pos..], b"\r\n").map(|i| pos + i) else {
            break;
        };
        let Some(size) = chunk_size(&raw_body[pos..line_end]) else {
            break;
        };
        if size == 0 {
            break;
        }

        let data_start = line_end + 2;
        let data_end = data_start + size;
        if data_end > raw_body.len() {
            break;
        }

        decoded.extend_from_slice(&raw_body[data_start..data_end]);
        pos = data_end + 2;
    }

    decoded
}

/// Length of the complete chunked body (terminating zero chunk and trailer
/// section included), or `None` when `body` does not yet hold a full frame.
/// Malformed framing counts everything received so far as the body.
pub(crate) fn chunked_body_end(body: &[u8]) -> Option<usize> {
    let mut pos = 0;

    loop {
        let line_end = find(&body[pos..], b"\r\n").map(|i| pos + i)?;
        let Some(size) = chunk_size(&body[pos..line_end]) else {
            return Some(body.len());
        };

        if size == 0 {
            // Trailer lines until the blank line ending the message.
            let mut trailer = line_end + 2;
            loop {
                let trailer_end = find(&body[trailer..], b"\r\n").map(|i| trailer + i)?;
                if trailer_end == trailer {
                    return Some(trailer_end + 2);
                }
                trailer = trailer_end + 2;
            }
        }

        let data_end = line_end + 2 + size;
        if body.len() < data_end + 2 {
            return None;
        }
        pos = data_end + 2;
    }
}

fn chunk_size(line: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(line).ok()?;
    let size = text.split(';').next()?.trim();
    usize::from_str_radix(size, 16).ok()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
