//! Shared small types: downstream hosts and duration parsing.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use url::Url;

use crate::errors::Error;

/// A downstream node, identified by `(hostname, port)`.
///
/// The canonical URL form is `http://hostname:port/`. The port may be unknown
/// only transiently, while blocklist arguments are being resolved against the
/// known-host table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Host {
    hostname: String,
    port: Option<u16>,
}

impl Host {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Host {
            hostname: hostname.into(),
            port: Some(port),
        }
    }

    /// Parse `<hostname>`, `<hostname>:<port>` or a full `http://` URL.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let with_scheme = if raw.starts_with("http://") || raw.starts_with("https://") {
            raw.to_string()
        } else {
            format!("http://{raw}")
        };
        let url = Url::parse(&with_scheme)
            .map_err(|e| Error::invalid_usage(format!("Invalid host '{raw}': {e}")))?;
        let hostname = url
            .host_str()
            .ok_or_else(|| Error::invalid_usage(format!("Invalid host '{raw}': no hostname")))?
            .to_string();
        Ok(Host {
            hostname,
            port: url.port(),
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Canonical URL: `http://hostname:port/`.
    pub fn url(&self) -> String {
        match self.port {
            Some(port) => format!("http://{}:{}/", self.hostname, port),
            None => format!("http://{}/", self.hostname),
        }
    }

    /// URL for a given endpoint on this host.
    pub fn endpoint_url(&self, endpoint: &str) -> String {
        format!("{}{}", self.url(), endpoint)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.hostname, port),
            None => write!(f, "{}", self.hostname),
        }
    }
}

impl Serialize for Host {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Host {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Host::parse(&raw).map_err(de::Error::custom)
    }
}

/// Parse a duration given either as plain integer seconds or in the
/// `<N>h<N>m<N>s` form (`humantime` syntax).
pub fn parse_duration(raw: &str) -> Result<Duration, Error> {
    let raw = raw.trim();
    if let Ok(seconds) = raw.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }
    humantime::parse_duration(raw)
        .map_err(|e| Error::invalid_usage(format!("Invalid duration '{raw}': {e}")))
}

/// Serde adapter for duration fields that accept an integer number of seconds
/// or a `humantime` string (`"10s"`, `"1h30m"`). Serialises back to the
/// `humantime` form.
pub mod flex_duration {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        struct FlexVisitor;

        impl de::Visitor<'_> for FlexVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration (integer seconds or a string like \"1h30m\")")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
                Ok(Duration::from_secs(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
                u64::try_from(v)
                    .map(Duration::from_secs)
                    .map_err(|_| E::custom("duration must not be negative"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
                parse_duration(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(FlexVisitor)
    }

    /// Variant of [`deserialize`] for optional fields.
    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            d: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            super::deserialize(deserializer).map(Some)
        }
    }
}

/// Deserialiser for fields where an explicit `null` means something different
/// from leaving the key out: missing stays `None` (via `#[serde(default)]`),
/// while a present key (even `null`) becomes `Some(..)`.
pub fn deserialize_explicit<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// Config fields that take one entry or a list of entries.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

impl<T> From<OneOrMany<T>> for Vec<T> {
    fn from(v: OneOrMany<T>) -> Vec<T> {
        v.into_vec()
    }
}
