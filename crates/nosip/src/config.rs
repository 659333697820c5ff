use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

pub(crate) const DEFAULT_RTP_RANGE: (u16, u16) = (10000, 60000);

/// Plugin configuration, read from `nosip.cfg` in the configuration
/// directory. Every key lives under the `[general]` section:
///
/// ```text
/// [general]
/// local_ip = 192.0.2.10     ; address or interface name
/// rtp_port_range = 20000-40000
/// events = yes
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Address RTP/RTCP sockets bind to and the one advertised in SDP
    pub local_ip: IpAddr,

    /// Inclusive port range for RTP/RTCP allocation
    pub rtp_range: (u16, u16),

    /// Gate for notifications towards the host's event handlers
    pub events: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            local_ip: detect_local_ip(),
            rtp_range: DEFAULT_RTP_RANGE,
            events: true,
        }
    }
}

impl Config {
    /// Load `nosip.cfg` from `dir`. A missing directory or file simply
    /// yields the defaults, a present file overrides them key by key.
    pub fn load(dir: Option<&Path>) -> Config {
        let Some(path) = dir.map(|d| d.join("nosip.cfg")) else {
            return Config::default();
        };

        match fs::read_to_string(&path) {
            Ok(text) => {
                log::debug!("configuration file: {}", path.display());
                Config::parse(&text)
            }
            Err(e) => {
                log::debug!("no configuration file at {} ({e}), using defaults", path.display());
                Config::default()
            }
        }
    }

    pub(crate) fn parse(text: &str) -> Config {
        let mut local_ip = None;
        let mut rtp_range = DEFAULT_RTP_RANGE;
        let mut events = true;

        let mut in_general = true;

        for line in text.lines() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                in_general = section.eq_ignore_ascii_case("general");
                continue;
            }

            if !in_general {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                log::warn!("ignoring malformed configuration line {line:?}");
                continue;
            };
            let (key, value) = (key.trim(), value.trim());

            match key {
                "local_ip" => local_ip = resolve_local_ip(value),
                "rtp_port_range" => {
                    if let Some(range) = parse_port_range(value) {
                        rtp_range = range;
                    } else {
                        log::warn!("invalid rtp_port_range {value:?}, keeping {rtp_range:?}");
                    }
                }
                "events" => events = is_true(value),
                other => log::warn!("unknown configuration key {other:?}"),
            }
        }

        let local_ip = local_ip.unwrap_or_else(detect_local_ip);

        log::debug!("local IP {local_ip}, RTP port range {}-{}", rtp_range.0, rtp_range.1);

        Config {
            local_ip,
            rtp_range,
            events,
        }
    }
}

/// `min-max`, swapped when inverted; a zero max means 65535
fn parse_port_range(value: &str) -> Option<(u16, u16)> {
    let (min, max) = value.rsplit_once('-')?;

    let mut min: u16 = min.trim().parse().ok()?;
    let mut max: u16 = max.trim().parse().ok()?;

    if min > max {
        std::mem::swap(&mut min, &mut max);
    }

    if max == 0 {
        max = 65535;
    }

    Some((min, max))
}

fn is_true(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes") || value == "1"
}

/// An explicit address is taken as-is; anything else is treated as an
/// interface name and looked up on the system.
fn resolve_local_ip(value: &str) -> Option<IpAddr> {
    if let Ok(addr) = value.parse::<IpAddr>() {
        return Some(addr);
    }

    match local_ip_address::list_afinet_netifas() {
        Ok(netifas) => {
            let found = netifas
                .iter()
                .filter(|(name, _)| name.as_str() == value)
                .map(|(_, addr)| *addr)
                .max_by_key(|addr| addr.is_ipv4());

            if found.is_none() {
                log::warn!("no interface named {value:?}, falling back to detection");
            }

            found
        }
        Err(e) => {
            log::error!("unable to enumerate network interfaces: {e}");
            None
        }
    }
}

fn detect_local_ip() -> IpAddr {
    let detected = local_ip_address::list_afinet_netifas()
        .ok()
        .and_then(|netifas| {
            netifas
                .into_iter()
                .map(|(_, addr)| addr)
                .find(|addr| addr.is_ipv4() && !addr.is_loopback())
        });

    match detected {
        Some(addr) => addr,
        None => {
            log::warn!("couldn't detect a local IP address, using 127.0.0.1");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_file() {
        let config = Config::parse(
            "[general]\nlocal_ip = 192.0.2.10\nrtp_port_range = 20000-40000\nevents = no\n",
        );

        assert_eq!(config.local_ip, "192.0.2.10".parse::<IpAddr>().unwrap());
        assert_eq!(config.rtp_range, (20000, 40000));
        assert!(!config.events);
    }

    #[test]
    fn inverted_range_swapped() {
        assert_eq!(parse_port_range("40000-20000"), Some((20000, 40000)));
    }

    #[test]
    fn zero_max_means_full_range() {
        assert_eq!(parse_port_range("0-0"), Some((0, 65535)));
        // the swap runs first, so an inverted zero is a real bound
        assert_eq!(parse_port_range("1024-0"), Some((0, 1024)));
    }

    #[test]
    fn comments_and_other_sections_skipped() {
        let config = Config::parse(
            "; a comment\n[other]\nrtp_port_range = 1-2\n[general]\nrtp_port_range = 30000-31000\n",
        );

        assert_eq!(config.rtp_range, (30000, 31000));
    }

    #[test]
    fn truthy_values() {
        assert!(is_true("yes"));
        assert!(is_true("TRUE"));
        assert!(is_true("1"));
        assert!(!is_true("0"));
        assert!(!is_true("no"));
    }
}
