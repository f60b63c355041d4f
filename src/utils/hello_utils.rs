#![forbid(unsafe_code)]

use std::error::Error;
use std::ops::Deref;

use poem::Request;

use log::{debug, LevelFilter};

use crate::utils::errors::Errors;

// ***************************************************************************
// GENERAL PUBLIC FUNCTIONS
// ***************************************************************************
// ---------------------------------------------------------------------------
// expand_path:
// ---------------------------------------------------------------------------
/** Replace tilde (~) and environment variable values in a path name.  On
 * error the original path is returned unchanged.
 */
pub fn expand_path(path: &str) -> String {
    match shellexpand::full(path) {
        Ok(x) => x.deref().to_owned(),
        Err(_) => path.to_owned(),
    }
}

// ---------------------------------------------------------------------------
// split_host_port:
// ---------------------------------------------------------------------------
/** Split a network address of the form "host:port", "[host]:port" or
 * "[ipv6%zone]:port" into its host and port parts.  A bare IPv6 address
 * without brackets is rejected because its port cannot be told apart from
 * the address.
 */
pub fn split_host_port(addr: &str) -> Result<(&str, &str), Errors> {
    let err = |why: &str| Errors::Address(format!("{}: {:?}", why, addr));

    let colon = match addr.rfind(':') {
        Some(i) => i,
        None => return Err(err("missing port in address")),
    };

    let host = if let Some(rest) = addr.strip_prefix('[') {
        let end = match rest.find(']') {
            Some(i) => i + 1,
            None => return Err(err("missing ']' in address")),
        };
        // The closing bracket must be immediately followed by the port colon.
        if end + 1 != colon {
            return Err(err(if end + 1 == addr.len() {
                "missing port in address"
            } else {
                "unexpected characters after ']' in address"
            }));
        }
        &addr[1..end]
    } else {
        let host = &addr[..colon];
        if host.contains(':') {
            return Err(err("too many colons in address"));
        }
        host
    };

    let port = &addr[colon + 1..];
    if host.contains('[') || host.contains(']') || port.contains('[') || port.contains(']') {
        return Err(err("unexpected bracket in address"));
    }
    Ok((host, port))
}

// ---------------------------------------------------------------------------
// first_label:
// ---------------------------------------------------------------------------
/** Return s up until the first period, if any. */
pub fn first_label(s: &str) -> &str {
    match s.find('.') {
        Some(i) => &s[..i],
        None => s,
    }
}

// ---------------------------------------------------------------------------
// truncate_chars:
// ---------------------------------------------------------------------------
/** Return at most the first max characters of s without splitting a
 * multi-byte character.
 */
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

// ---------------------------------------------------------------------------
// listen_addr:
// ---------------------------------------------------------------------------
/** Listen addresses may be given as ":port", meaning all interfaces of both
 * address families; "[::]" is dual-stack where the kernel allows it.  Empty
 * addresses disable a listener and yield None.
 */
pub fn listen_addr(addr: &str) -> Option<String> {
    let addr = addr.trim();
    if addr.is_empty() {
        None
    } else if addr.starts_with(':') {
        Some(format!("[::]{}", addr))
    } else {
        Some(addr.to_string())
    }
}

// ---------------------------------------------------------------------------
// error_chain:
// ---------------------------------------------------------------------------
/** Flatten an error and its sources into one line.  Template engines tend
 * to keep the useful part of the message in the innermost source.
 */
pub fn error_chain(e: &dyn Error) -> String {
    let mut s = e.to_string();
    let mut cur = e.source();
    while let Some(inner) = cur {
        s.push_str(": ");
        s.push_str(&inner.to_string());
        cur = inner.source();
    }
    s
}

// ---------------------------------------------------------------------------
// debug_request:
// ---------------------------------------------------------------------------
// Dump http request information to the log.
pub fn debug_request(http_req: &Request) {
    // Check that debug or higher logging is in effect.
    if log::max_level() < LevelFilter::Debug {
        return;
    }

    // Accumulate the output.
    let mut s = "\n".to_string();
    s += format!("  Remote: {:?}\n", http_req.remote_addr().as_socket_addr()).as_str();
    s += format!("  Scheme: {}\n", http_req.scheme()).as_str();
    s += format!("  URI: {:?}\n", http_req.original_uri()).as_str();
    for (name, value) in http_req.headers().iter() {
        s += format!("  Header: {} = {:?} \n", name, value).as_str();
    }

    // Write the single log record.
    debug!("{}", s);
}
