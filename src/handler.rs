//! Mapping from profile types to worker handler protocols

use serde::Serialize;
use std::fmt;

/// Protocol a worker speaks on its listen address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerType {
    Socks5,
    Http,
    Tcp,
    Udp,
    Ss,
}

impl HandlerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerType::Socks5 => "socks5",
            HandlerType::Http => "http",
            HandlerType::Tcp => "tcp",
            HandlerType::Udp => "udp",
            HandlerType::Ss => "ss",
        }
    }

    /// Whether username/password apply to this handler
    pub fn supports_auth(&self) -> bool {
        matches!(self, HandlerType::Socks5 | HandlerType::Http)
    }
}

impl fmt::Display for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolve a profile type to its handler. Unknown types get socks5.
pub fn resolve_handler(profile_type: &str) -> HandlerType {
    match profile_type {
        "forward" => HandlerType::Socks5,
        "reverse" => HandlerType::Tcp,
        "http" => HandlerType::Http,
        "tcp" => HandlerType::Tcp,
        "udp" => HandlerType::Udp,
        "ss" => HandlerType::Ss,
        _ => HandlerType::Socks5,
    }
}
