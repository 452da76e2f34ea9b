//! IP set matching.
//!
//! On the first packet of a flow the transport decoders ask an
//! [`IpSetLookup`] whether the destination or the source address belongs to
//! a known set. A matching set is attached to the flow, its callback runs,
//! and its regex manager (if any) replaces the default one for the flow.

use std::fmt;
use std::io::{self, Write};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ipnetwork::IpNetwork;

use crate::error::Result;
use crate::flow::Flow;

/// Opaque handle to a payload matching engine attached to flows.
pub trait RegexManager: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
}

/// Hook run when a flow's address matches a set.
pub type IpSetCallback = Arc<dyn Fn(&Flow) + Send + Sync>;

/// Anything able to map an address to a set.
pub trait IpSetLookup: Send + Sync {
    fn lookup_address(&self, address: IpAddr) -> Option<Arc<IpSet>>;

    fn statistics(&self, _out: &mut dyn Write) -> io::Result<()> {
        Ok(())
    }
}

/// Named group of networks.
pub struct IpSet {
    name: String,
    networks: Vec<IpNetwork>,
    regex_manager: Option<Arc<dyn RegexManager>>,
    callback: Option<IpSetCallback>,
    lookups: AtomicU64,
    hits: AtomicU64,
}

impl fmt::Debug for IpSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpSet")
            .field("name", &self.name)
            .field("networks", &self.networks)
            .field("regex_manager", &self.regex_manager)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl IpSet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            networks: Vec::new(),
            regex_manager: None,
            callback: None,
            lookups: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_network(&mut self, network: IpNetwork) {
        self.networks.push(network);
    }

    /// Add an address or CIDR block given as text ("10.0.0.0/8", "::1").
    pub fn add_address(&mut self, address: &str) -> Result<()> {
        let network = address.trim().parse::<IpNetwork>()?;
        self.networks.push(network);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    pub fn contains(&self, address: IpAddr) -> bool {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let found = self.networks.iter().any(|net| net.contains(address));
        if found {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    pub fn regex_manager(&self) -> Option<&Arc<dyn RegexManager>> {
        self.regex_manager.as_ref()
    }

    pub fn set_regex_manager(&mut self, manager: Arc<dyn RegexManager>) {
        self.regex_manager = Some(manager);
    }

    pub fn callback(&self) -> Option<&IpSetCallback> {
        self.callback.as_ref()
    }

    pub fn set_callback(&mut self, callback: IpSetCallback) {
        self.callback = Some(callback);
    }

    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
}

/// Ordered collection of sets; the first set containing the address wins.
#[derive(Debug, Default)]
pub struct IpSetManager {
    sets: Vec<Arc<IpSet>>,
}

impl IpSetManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_ip_set(&mut self, set: IpSet) -> Arc<IpSet> {
        let set = Arc::new(set);
        self.sets.push(Arc::clone(&set));
        set
    }

    pub fn sets(&self) -> &[Arc<IpSet>] {
        &self.sets
    }
}

impl IpSetLookup for IpSetManager {
    fn lookup_address(&self, address: IpAddr) -> Option<Arc<IpSet>> {
        self.sets.iter().find(|set| set.contains(address)).cloned()
    }

    fn statistics(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "IPSetManager statistics")?;
        for set in &self.sets {
            writeln!(
                out,
                "\t{}: networks {} lookups {} hits {}",
                set.name(),
                set.len(),
                set.lookups(),
                set.hits()
            )?;
        }
        Ok(())
    }
}

/// Look up a flow's destination, then its source, and attach the match.
///
/// Returns whether a set matched.
pub(crate) fn attach_ip_set(lookup: &dyn IpSetLookup, flow: &mut Flow) -> bool {
    let tuple = *flow.tuple();
    let Some(set) = lookup
        .lookup_address(tuple.destination)
        .or_else(|| lookup.lookup_address(tuple.source))
    else {
        return false;
    };

    if let Some(callback) = set.callback() {
        callback(flow);
    }
    if let Some(manager) = set.regex_manager() {
        flow.set_regex_manager(Some(Arc::clone(manager)));
    }
    flow.set_ipset(set);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FiveTuple;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct NamedManager(&'static str);

    impl RegexManager for NamedManager {
        fn name(&self) -> &str {
            self.0
        }
    }

    fn flow(src: &str, dst: &str) -> Flow {
        let mut flow = Flow::default();
        flow.init(
            1,
            FiveTuple::new(src.parse().unwrap(), 1234, 6, dst.parse().unwrap(), 80),
            None,
            0,
        );
        flow
    }

    #[test]
    fn test_contains_cidr_and_host() {
        let mut set = IpSet::new("blocked");
        set.add_address("192.168.0.0/16").unwrap();
        set.add_address("2001:db8::1").unwrap();

        assert!(set.contains("192.168.4.4".parse().unwrap()));
        assert!(set.contains("2001:db8::1".parse().unwrap()));
        assert!(!set.contains("10.0.0.1".parse().unwrap()));
        assert_eq!(set.lookups(), 3);
        assert_eq!(set.hits(), 2);
    }

    #[test]
    fn test_invalid_address_is_an_error() {
        let mut set = IpSet::new("broken");
        assert!(set.add_address("not-an-ip").is_err());
        assert!(set.is_empty());
    }

    #[test]
    fn test_attach_prefers_destination() {
        let mut manager = IpSetManager::new();
        let mut servers = IpSet::new("servers");
        servers.add_address("10.0.0.2").unwrap();
        let mut clients = IpSet::new("clients");
        clients.add_address("10.0.0.1").unwrap();
        manager.add_ip_set(clients);
        manager.add_ip_set(servers);

        let mut f = flow("10.0.0.1", "10.0.0.2");
        assert!(attach_ip_set(&manager, &mut f));
        assert_eq!(f.ipset().unwrap().name(), "servers");
    }

    #[test]
    fn test_attach_runs_callback_and_regex_manager() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);

        let mut set = IpSet::new("watched");
        set.add_address("172.16.0.0/12").unwrap();
        set.set_regex_manager(Arc::new(NamedManager("watched-regexs")));
        set.set_callback(Arc::new(move |_flow: &Flow| {
            seen.fetch_add(1, Ordering::Relaxed);
        }));

        let mut manager = IpSetManager::new();
        manager.add_ip_set(set);

        let mut f = flow("172.16.1.1", "8.8.8.8");
        assert!(attach_ip_set(&manager, &mut f));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(f.regex_manager().unwrap().name(), "watched-regexs");

        let mut other = flow("1.1.1.1", "8.8.8.8");
        assert!(!attach_ip_set(&manager, &mut other));
        assert!(other.ipset().is_none());
    }
}
