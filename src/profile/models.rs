//! Egress profile model types.

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use super::mask::mask_credentials;
use crate::config::ConfigError;

/// The kind of egress path a profile describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProfileKind {
    Direct,
    HttpProxy,
    SocksProxy,
}

impl ProfileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileKind::Direct => "direct",
            ProfileKind::HttpProxy => "http-proxy",
            ProfileKind::SocksProxy => "socks-proxy",
        }
    }

    /// Infer the kind from a proxy URL scheme.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "http" => Some(ProfileKind::HttpProxy),
            "socks5" | "socks5h" => Some(ProfileKind::SocksProxy),
            _ => None,
        }
    }
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured egress path.
///
/// Deliberately not `Serialize`: the descriptor may carry credentials.
/// Use [`ProfileView`] for anything leaving the process.
#[derive(Clone, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ProfileKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub weight: i32,
    #[serde(default, alias = "url", alias = "connection_descriptor")]
    pub descriptor: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl fmt::Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Profile")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("enabled", &self.enabled)
            .field("weight", &self.weight)
            .field("descriptor", &self.masked_descriptor())
            .finish()
    }
}

impl Profile {
    pub fn direct(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ProfileKind::Direct,
            enabled: true,
            weight: 0,
            descriptor: None,
        }
    }

    pub fn proxy(name: &str, kind: ProfileKind, descriptor: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            enabled: true,
            weight: 0,
            descriptor: Some(descriptor.to_string()),
        }
    }

    #[cfg(test)]
    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    #[cfg(test)]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Resolve how traffic for this profile leaves the host.
    pub fn route(&self) -> Result<Route, ConfigError> {
        match (self.kind, self.descriptor.as_deref()) {
            (ProfileKind::Direct, None) => Ok(Route::Direct),
            (ProfileKind::Direct, Some(_)) => Err(ConfigError::InvalidDescriptor {
                profile: self.name.clone(),
                reason: "direct profiles take no descriptor".to_string(),
            }),
            (_, None) => Err(ConfigError::InvalidDescriptor {
                profile: self.name.clone(),
                reason: format!("{} profiles require a proxy URL", self.kind),
            }),
            (kind, Some(raw)) => {
                let endpoint = ProxyEndpoint::parse(raw).map_err(|reason| {
                    ConfigError::InvalidDescriptor {
                        profile: self.name.clone(),
                        reason,
                    }
                })?;
                match (kind, endpoint.scheme.as_str()) {
                    (ProfileKind::HttpProxy, "http") => Ok(Route::HttpProxy(endpoint)),
                    (ProfileKind::SocksProxy, "socks5" | "socks5h") => {
                        Ok(Route::Socks5(endpoint))
                    }
                    (kind, scheme) => Err(ConfigError::InvalidDescriptor {
                        profile: self.name.clone(),
                        reason: format!("scheme '{}' does not match kind {}", scheme, kind),
                    }),
                }
            }
        }
    }

    /// The descriptor with any credentials replaced by `***`.
    pub fn masked_descriptor(&self) -> Option<String> {
        self.descriptor.as_deref().map(mask_credentials)
    }
}

/// Proxy credentials taken from the descriptor's userinfo.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credentials(***)")
    }
}

/// A parsed proxy address.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
    /// Original descriptor, handed to reqwest when building routed clients.
    pub url: String,
}

impl fmt::Debug for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyEndpoint")
            .field("url", &mask_credentials(&self.url))
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

impl ProxyEndpoint {
    /// `socks5h` leaves target name resolution to the proxy.
    pub fn remote_dns(&self) -> bool {
        self.scheme == "socks5h"
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        let url = Url::parse(raw).map_err(|e| format!("invalid proxy URL: {}", e))?;
        let host = url
            .host_str()
            .ok_or_else(|| "proxy URL has no host".to_string())?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let scheme = url.scheme().to_string();
        let port = url.port().unwrap_or(match scheme.as_str() {
            "socks5" | "socks5h" => 1080,
            _ => 8080,
        });

        let credentials = if url.username().is_empty() {
            None
        } else {
            Some(Credentials {
                username: percent_decode(url.username()),
                password: percent_decode(url.password().unwrap_or("")),
            })
        };

        Ok(Self {
            scheme,
            host,
            port,
            credentials,
            url: raw.to_string(),
        })
    }
}

fn percent_decode(s: &str) -> String {
    url::form_urlencoded::parse(format!("v={}", s.replace('+', "%2B")).as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_default()
}

/// How a probe or client reaches the network for a profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Direct,
    HttpProxy(ProxyEndpoint),
    Socks5(ProxyEndpoint),
}

impl Route {
    pub fn proxy(&self) -> Option<&ProxyEndpoint> {
        match self {
            Route::Direct => None,
            Route::HttpProxy(p) | Route::Socks5(p) => Some(p),
        }
    }
}

/// Externally visible profile metadata with the descriptor masked.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileView {
    pub name: String,
    pub kind: ProfileKind,
    pub enabled: bool,
    pub weight: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<String>,
}

impl From<&Profile> for ProfileView {
    fn from(profile: &Profile) -> Self {
        Self {
            name: profile.name.clone(),
            kind: profile.kind,
            enabled: profile.enabled,
            weight: profile.weight,
            descriptor: profile.masked_descriptor(),
        }
    }
}
