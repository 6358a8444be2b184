use crate::network::ip::Ipv4Cidr;
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;

/// Identifies a route within the table of the node it was added to
///
/// Identifiers are never reused, so removing a route by id is unaffected by insertions and
/// removals of other routes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteId(u64);

#[derive(Clone, Debug, PartialEq)]
pub struct Route {
    /// The subnet this route forwards to (host bits are ignored)
    pub destination: Ipv4Cidr,
    pub gateway: Ipv4Addr,
    /// Index of the outgoing interface on the owning node
    pub interface: usize,
}

#[derive(Clone, Debug)]
pub struct RouteEntry {
    pub id: RouteId,
    pub route: Route,
}

#[derive(Clone, Debug, Default)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
    next_id: u64,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, route: Route) -> RouteId {
        let id = RouteId(self.next_id);
        self.next_id += 1;
        self.entries.push(RouteEntry { id, route });
        id
    }

    /// Removes the route with the provided id, returning it if it was present
    pub fn remove(&mut self, id: RouteId) -> Option<Route> {
        let index = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(index).route)
    }

    /// Entries in insertion order
    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Longest-prefix match, ties are won by the earliest inserted route
    pub fn lookup(&self, destination: Ipv4Addr) -> Option<&Route> {
        let mut best: Option<&Route> = None;
        for entry in &self.entries {
            let route = &entry.route;
            if !route.destination.contains(destination) {
                continue;
            }

            match best {
                Some(b) if b.destination.network_prefix >= route.destination.network_prefix => {}
                _ => best = Some(route),
            }
        }

        best
    }
}

impl Display for RouteTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{:<18}{:<16}{:<16}Iface", "Destination", "Gateway", "Genmask")?;
        for entry in &self.entries {
            let route = &entry.route;
            writeln!(
                f,
                "{:<18}{:<16}{:<16}{}",
                route.destination.network().address.to_string(),
                route.gateway.to_string(),
                route.destination.mask().to_string(),
                route.interface
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    fn route(destination: &str, interface: usize) -> Route {
        Route {
            destination: Ipv4Cidr::from_str(destination).unwrap(),
            gateway: Ipv4Addr::new(10, 0, 0, 1),
            interface,
        }
    }

    #[test]
    fn test_lookup_prefers_longest_prefix() {
        let mut table = RouteTable::new();
        table.add(route("0.0.0.0/0", 0));
        table.add(route("10.3.0.0/16", 1));
        table.add(route("10.3.1.0/24", 2));

        assert_eq!(table.lookup(Ipv4Addr::new(10, 3, 1, 1)).unwrap().interface, 2);
        assert_eq!(table.lookup(Ipv4Addr::new(10, 3, 7, 1)).unwrap().interface, 1);
        assert_eq!(table.lookup(Ipv4Addr::new(8, 8, 8, 8)).unwrap().interface, 0);
    }

    #[test]
    fn test_lookup_tie_goes_to_first_inserted() {
        let mut table = RouteTable::new();
        table.add(route("10.4.0.0/24", 3));
        table.add(route("10.4.0.0/24", 5));

        assert_eq!(table.lookup(Ipv4Addr::new(10, 4, 0, 2)).unwrap().interface, 3);
    }

    #[test]
    fn test_remove_by_id_is_independent_of_order() {
        let mut table = RouteTable::new();
        let a = table.add(route("10.1.0.0/24", 0));
        let b = table.add(route("10.2.0.0/24", 1));
        let c = table.add(route("10.3.0.0/24", 2));

        assert_eq!(table.remove(b).unwrap().interface, 1);
        assert!(table.remove(b).is_none());
        let d = table.add(route("10.2.0.0/24", 4));

        assert_ne!(d, b);
        let ids: Vec<_> = table.entries().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![a, c, d]);
        assert!(table.lookup(Ipv4Addr::new(10, 5, 0, 1)).is_none());
    }
}
