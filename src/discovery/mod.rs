//! Zero-configuration engine discovery over UDP broadcast
//!
//! Engines periodically broadcast a one-element XML announcement on a
//! well-known port; clients accumulate announcements into a live directory
//! and expire entries that stop refreshing. The textual announcement format
//! is deliberately separate from the binary control protocol: it is cheap
//! to inspect and to filter from foreign traffic.

pub mod announcer;
pub mod browser;

pub use announcer::Announcer;
pub use browser::ServiceBrowser;

use std::net::IpAddr;

use crate::error::DiscoveryError;

/// A discoverable engine instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    /// Unique instance id (uuid string)
    pub id: String,
    /// Human-readable description, shown to the user for target selection
    pub name: String,
    /// Address the control stream listens on
    pub host: IpAddr,
    /// Control stream TCP port
    pub port: u16,
    /// Protocol/type identifier, e.g. `crosspoint-matrix/1`
    pub type_uid: String,
}

impl Service {
    /// Render the announcement datagram payload
    pub fn to_announcement(&self) -> String {
        format!(
            "<service id=\"{}\" name=\"{}\" host=\"{}\" port=\"{}\" type=\"{}\"/>",
            escape(&self.id),
            escape(&self.name),
            self.host,
            self.port,
            escape(&self.type_uid),
        )
    }

    /// Parse an announcement datagram payload
    pub fn from_announcement(payload: &str) -> Result<Self, DiscoveryError> {
        let inner = payload
            .trim()
            .strip_prefix("<service")
            .and_then(|s| s.strip_suffix("/>"))
            .ok_or(DiscoveryError::MalformedAnnouncement)?;

        let mut id = None;
        let mut name = None;
        let mut host = None;
        let mut port = None;
        let mut type_uid = None;

        for (key, value) in attributes(inner) {
            match key {
                "id" => id = Some(unescape(value)),
                "name" => name = Some(unescape(value)),
                "host" => host = value.parse::<IpAddr>().ok(),
                "port" => port = value.parse::<u16>().ok(),
                "type" => type_uid = Some(unescape(value)),
                _ => {}
            }
        }

        match (id, name, host, port, type_uid) {
            (Some(id), Some(name), Some(host), Some(port), Some(type_uid)) => Ok(Service {
                id,
                name,
                host,
                port,
                type_uid,
            }),
            _ => Err(DiscoveryError::MalformedAnnouncement),
        }
    }
}

/// Iterate `key="value"` pairs inside the element
fn attributes(mut rest: &str) -> impl Iterator<Item = (&str, &str)> {
    std::iter::from_fn(move || {
        rest = rest.trim_start();
        let eq = rest.find("=\"")?;
        let key = &rest[..eq];
        let after = &rest[eq + 2..];
        let close = after.find('"')?;
        let value = &after[..close];
        rest = &after[close + 1..];
        Some((key, value))
    })
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn service() -> Service {
        Service {
            id: "9f2c".into(),
            name: "Studio-A".into(),
            host: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            port: 50000,
            type_uid: crate::constants::SERVICE_TYPE_UID.into(),
        }
    }

    #[test]
    fn test_announcement_roundtrip() {
        let service = service();
        let parsed = Service::from_announcement(&service.to_announcement()).unwrap();
        assert_eq!(parsed, service);
    }

    #[test]
    fn test_announcement_escapes_name() {
        let mut service = service();
        service.name = "Main <A> & \"B\"".into();
        let payload = service.to_announcement();
        assert!(!payload.contains("<A>"));
        let parsed = Service::from_announcement(&payload).unwrap();
        assert_eq!(parsed.name, "Main <A> & \"B\"");
    }

    #[test]
    fn test_malformed_announcements_rejected() {
        assert!(Service::from_announcement("").is_err());
        assert!(Service::from_announcement("<service id=\"x\"/>").is_err());
        assert!(Service::from_announcement("not xml at all").is_err());
        assert!(Service::from_announcement(
            "<service id=\"x\" name=\"y\" host=\"nonsense\" port=\"1\" type=\"t\"/>"
        )
        .is_err());
    }
}
