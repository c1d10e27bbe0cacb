//! HTTP CONNECT reply templates
//!
//! Opaque byte constants emitted during the connect phase of proxy-mode
//! listeners; this crate only decides when to send them.

pub const CONNECT_SUCCESS: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

pub const CONNECT_ERROR: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";
