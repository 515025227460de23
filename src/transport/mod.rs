//! Transports carrying `memhub/1` frames: trusted stdio and untrusted HTTP + SSE.

pub mod http;
pub mod stdio;
