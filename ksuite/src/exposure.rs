use crate::config::ExposeApi;
use crate::error::{self, Result};
use snafu::{ensure, OptionExt, ResultExt};
use std::net::{IpAddr, Ipv4Addr, TcpListener};

/// The host port value that asks for any currently free port.
pub const RANDOM_PORT: &str = "random";

/// A resolved port exposure: `host_port` on `host_ip` forwards to `internal_port` inside the
/// cluster's server container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortExposure {
    pub host_ip: IpAddr,
    pub host_port: u16,
    pub internal_port: u16,
}

impl PortExposure {
    /// Parses `[HOST_IP:]HOST_PORT`. `HOST_PORT` may be `random`, in which case a free port is
    /// picked right away. Without a host IP the API is bound to `0.0.0.0`.
    pub fn parse(spec: &str, internal_port: u16) -> Result<Self> {
        ensure!(
            !spec.is_empty(),
            error::PortSpecSnafu {
                spec,
                reason: "empty spec",
            }
        );

        let (host_ip, port) = match spec.rsplit_once(':') {
            Some((ip, port)) => {
                let ip = ip.parse::<IpAddr>().ok().context(error::PortSpecSnafu {
                    spec,
                    reason: format!("'{}' is not an IP address", ip),
                })?;
                (ip, port)
            }
            None => (IpAddr::V4(Ipv4Addr::UNSPECIFIED), spec),
        };

        let host_port = if port == RANDOM_PORT {
            free_port()?
        } else {
            port.parse::<u16>().ok().context(error::PortSpecSnafu {
                spec,
                reason: format!("'{}' is not a valid port", port),
            })?
        };

        Ok(Self {
            host_ip,
            host_port,
            internal_port,
        })
    }
}

impl From<PortExposure> for ExposeApi {
    fn from(exposure: PortExposure) -> Self {
        ExposeApi {
            host: None,
            host_ip: Some(exposure.host_ip.to_string()),
            host_port: Some(exposure.host_port.to_string()),
        }
    }
}

/// Asks the OS for a free port by binding to port 0. The listener is dropped before returning,
/// so the port is only free at the time of the call.
pub fn free_port() -> Result<u16> {
    let listener =
        TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).context(error::PortResolutionSnafu)?;
    Ok(listener
        .local_addr()
        .context(error::PortResolutionSnafu)?
        .port())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::DEFAULT_API_PORT;

    #[test]
    fn random_port() {
        let exposure = PortExposure::parse(RANDOM_PORT, DEFAULT_API_PORT).unwrap();
        assert_ne!(exposure.host_port, 0);
        assert_eq!(exposure.host_ip, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(exposure.internal_port, DEFAULT_API_PORT);
    }

    #[test]
    fn ip_and_port() {
        let exposure = PortExposure::parse("127.0.0.1:6550", DEFAULT_API_PORT).unwrap();
        assert_eq!(exposure.host_ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(exposure.host_port, 6550);

        let expose: ExposeApi = exposure.into();
        assert!(expose.host.is_none());
        assert_eq!(expose.host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(expose.host_port.as_deref(), Some("6550"));
    }

    #[test]
    fn invalid_specs() {
        assert!(PortExposure::parse("", DEFAULT_API_PORT).is_err());
        assert!(PortExposure::parse("70000", DEFAULT_API_PORT).is_err());
        assert!(PortExposure::parse("not-an-ip:6550", DEFAULT_API_PORT).is_err());
        assert!(PortExposure::parse("127.0.0.1:", DEFAULT_API_PORT).is_err());
    }
}
