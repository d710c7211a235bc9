//! Content-encoding decompression for captured response bodies

use std::io::{self, Read};

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};

use super::wire::MAX_BODY_SIZE;

/// Decode `body` according to a `Content-Encoding` header value.
///
/// Returns `Ok(None)` when nothing needs decoding (no header, `identity`),
/// so callers can keep a single copy of the bytes. Encodings listed in the
/// header are undone in reverse order of application. Output larger than
/// the body size limit is an error; the wire bytes stay untouched.
pub fn decode_body(content_encoding: Option<&str>, body: &[u8]) -> io::Result<Option<Vec<u8>>> {
    decode_body_limited(content_encoding, body, MAX_BODY_SIZE)
}

fn decode_body_limited(content_encoding: Option<&str>, body: &[u8], limit: usize) -> io::Result<Option<Vec<u8>>> {
    let Some(header) = content_encoding else {
        return Ok(None);
    };

    let codings: Vec<String> = header
        .split(',')
        .map(|c| c.trim().to_ascii_lowercase())
        .filter(|c| !c.is_empty() && c != "identity")
        .collect();

    if codings.is_empty() || body.is_empty() {
        return Ok(None);
    }

    let mut data = body.to_vec();
    for coding in codings.iter().rev() {
        data = decode_one(coding, &data, limit)?;
    }
    Ok(Some(data))
}

fn decode_one(coding: &str, data: &[u8], limit: usize) -> io::Result<Vec<u8>> {
    match coding {
        "gzip" | "x-gzip" => read_capped(GzDecoder::new(data), limit),
        "deflate" => {
            // Servers disagree on whether deflate means zlib-wrapped or raw
            match read_capped(ZlibDecoder::new(data), limit) {
                Ok(out) => Ok(out),
                Err(e) if e.kind() == io::ErrorKind::OutOfMemory => Err(e),
                Err(_) => read_capped(DeflateDecoder::new(data), limit),
            }
        }
        "br" => read_capped(brotli::Decompressor::new(data, 4096), limit),
        "zstd" => read_capped(zstd::stream::read::Decoder::new(data)?, limit),
        other => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("unsupported content-encoding '{}'", other),
        )),
    }
}

/// Read at most `limit` bytes, failing if the stream has more
fn read_capped(reader: impl Read, limit: usize) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    reader.take(limit as u64 + 1).read_to_end(&mut out)?;
    if out.len() > limit {
        return Err(io::Error::new(
            io::ErrorKind::OutOfMemory,
            format!("decoded body exceeds {} bytes", limit),
        ));
    }
    Ok(out)
}
