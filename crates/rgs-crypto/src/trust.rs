use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrustConfigError {
    #[error("invalid CIDR {0}: {1}")]
    InvalidCidr(String, String),
}

/// A ring of trusted CIDR blocks, computed once at startup (§4.H).
#[derive(Clone, Debug, Default)]
pub struct TrustedCidrs {
    nets: Vec<IpNet>,
}

impl TrustedCidrs {
    pub fn parse(cidrs: &[String]) -> Result<Self, TrustConfigError> {
        let nets = cidrs
            .iter()
            .map(|c| {
                IpNet::from_str(c).map_err(|e| TrustConfigError::InvalidCidr(c.clone(), e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { nets })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.nets.iter().any(|n| n.contains(ip))
    }

    /// Parse `source_ip` and check trust in one step. A malformed address
    /// is treated as untrusted.
    pub fn is_trusted(&self, source_ip: &str) -> bool {
        match IpAddr::from_str(source_ip) {
            Ok(ip) => self.contains(&ip),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_in_range_is_trusted() {
        let trust = TrustedCidrs::parse(&["10.0.0.0/8".to_string()]).unwrap();
        assert!(trust.is_trusted("10.0.0.5"));
    }

    #[test]
    fn ip_outside_range_is_untrusted() {
        let trust = TrustedCidrs::parse(&["10.0.0.0/8".to_string()]).unwrap();
        assert!(!trust.is_trusted("192.168.1.1"));
    }

    #[test]
    fn malformed_address_is_untrusted() {
        let trust = TrustedCidrs::parse(&["10.0.0.0/8".to_string()]).unwrap();
        assert!(!trust.is_trusted("not-an-ip"));
    }
}
