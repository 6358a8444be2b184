use anyhow::{Context, anyhow, bail};
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

/// An IPv4 address together with the prefix length of its subnet (e.g. 10.1.0.1/24)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    pub address: Ipv4Addr,
    pub network_prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(address: Ipv4Addr, network_prefix: u8) -> anyhow::Result<Self> {
        if network_prefix > 32 {
            bail!("network prefix cannot be higher than 32");
        }

        Ok(Self {
            address,
            network_prefix,
        })
    }

    pub fn mask(&self) -> Ipv4Addr {
        Ipv4Addr::from_bits(self.mask_bits())
    }

    fn mask_bits(&self) -> u32 {
        // A shift by 32 would overflow, a /0 matches everything
        u32::MAX
            .checked_shl(32 - self.network_prefix as u32)
            .unwrap_or(0)
    }

    /// The address with its host bits cleared
    pub fn network(&self) -> Ipv4Cidr {
        Ipv4Cidr {
            address: Ipv4Addr::from_bits(self.address.to_bits() & self.mask_bits()),
            network_prefix: self.network_prefix,
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = self.mask_bits();
        ip.to_bits() & mask == self.address.to_bits() & mask
    }
}

impl Display for Ipv4Cidr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.network_prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        let base_ip: IpAddr = parts
            .next()
            .ok_or(anyhow!("empty string"))?
            .parse()
            .context("invalid ip address in ip range")?;

        let IpAddr::V4(base_ip) = base_ip else {
            bail!("only IPv4 supported at the moment");
        };

        // A missing network prefix is interpreted as /32 (i.e. singleton ip range)
        let network_prefix: u8 = parts
            .next()
            .unwrap_or("32")
            .parse()
            .context("the provided network prefix is not a valid unsigned integer")?;

        if parts.next().is_some() {
            bail!("ip range contains trailing characters");
        }

        Ipv4Cidr::new(base_ip, network_prefix)
    }
}

#[test]
fn test_ipv4_cidr() {
    let cases = [
        ("10.0.0.0/24", "10.0.0.0", "255.255.255.0"),
        ("10.0.0.123/24", "10.0.0.0", "255.255.255.0"),
        ("10.0.0.0/8", "10.0.0.0", "255.0.0.0"),
        ("20.17.0.0/12", "20.16.0.0", "255.240.0.0"),
        ("0.0.0.0/0", "0.0.0.0", "0.0.0.0"),
        ("10.1.2.3", "10.1.2.3", "255.255.255.255"),
    ];

    for (input, network, mask) in cases {
        let cidr = Ipv4Cidr::from_str(input).unwrap();
        assert_eq!(cidr.network().address.to_string(), network);
        assert_eq!(cidr.mask().to_string(), mask);
    }

    assert!(Ipv4Cidr::from_str("10.0.0.0/33").is_err());
    assert!(Ipv4Cidr::from_str("10.0.0.0/24/1").is_err());
}

#[test]
fn test_ipv4_cidr_contains() {
    let subnet = Ipv4Cidr::from_str("10.2.1.0/24").unwrap();
    assert!(subnet.contains(Ipv4Addr::new(10, 2, 1, 200)));
    assert!(!subnet.contains(Ipv4Addr::new(10, 2, 2, 1)));

    let default = Ipv4Cidr::from_str("0.0.0.0/0").unwrap();
    assert!(default.contains(Ipv4Addr::new(192, 168, 0, 1)));
}
