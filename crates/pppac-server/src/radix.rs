//! Longest-prefix-match table over IPv4 prefixes.
//!
//! The table is the single arbiter of what an address currently resolves
//! to: a static pool range, a dynamic pool range, or a live session. Each
//! key `(addr, prefix_len)` holds a small ordered record stack instead of
//! a single entry; a `Session` record always sits in front of the pool
//! record it shadows, so removing the session re-exposes the pool record
//! without any re-insertion. The stack shape makes that invariant
//! checkable on every mutation.

use crate::session::SessionId;
use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;

/// An IPv4 prefix key, base stored masked in host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Prefix {
    addr: u32,
    len: u8,
}

/// Network mask for a prefix length, host byte order.
pub fn mask(len: u8) -> u32 {
    match len {
        0 => 0,
        1..=31 => u32::MAX << (32 - len),
        _ => u32::MAX,
    }
}

impl Prefix {
    pub fn new(addr: u32, len: u8) -> Self {
        let len = len.min(32);
        Prefix {
            addr: addr & mask(len),
            len,
        }
    }

    pub fn host(addr: Ipv4Addr) -> Self {
        Prefix::new(u32::from(addr), 32)
    }

    pub fn addr(&self) -> u32 {
        self.addr
    }

    pub fn len(&self) -> u8 {
        self.len
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr & mask(self.len) == self.addr
    }

    /// Host bits of `addr` within this prefix.
    pub fn host_part(&self, addr: u32) -> u32 {
        addr & !mask(self.len)
    }

    /// True when `addr`'s host part is the all-zero or all-ones value of
    /// this prefix. Meaningless for /31 and /32, which have no such
    /// reserved host values.
    pub fn is_host_edge(&self, addr: u32) -> bool {
        if self.len >= 31 {
            return false;
        }
        let host = self.host_part(addr);
        host == 0 || host == !mask(self.len)
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.addr), self.len)
    }
}

/// One record in a key's stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteRecord {
    /// Static pool range owned by the named pool.
    Pool { pool: String },
    /// Dynamic pool range owned by the named pool.
    DynPool { pool: String },
    /// A live session holding this key.
    Session { session: SessionId },
}

impl RouteRecord {
    pub fn is_session(&self) -> bool {
        matches!(self, RouteRecord::Session { .. })
    }

    pub fn pool_label(&self) -> Option<&str> {
        match self {
            RouteRecord::Pool { pool } | RouteRecord::DynPool { pool } => Some(pool),
            RouteRecord::Session { .. } => None,
        }
    }

    pub fn is_dynamic_pool(&self) -> bool {
        matches!(self, RouteRecord::DynPool { .. })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RadixError {
    #[error("key {0} already holds a session record")]
    DuplicateSession(Prefix),

    #[error("key {0} already holds a pool record")]
    DuplicatePool(Prefix),

    #[error("no matching record at {0}")]
    NotFound(Prefix),
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Node {
    children: [Option<Box<Node>>; 2],
    records: Vec<RouteRecord>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.records.is_empty() && self.children.iter().all(Option::is_none)
    }
}

/// The LPM table. Structural equality (`PartialEq`) compares the full
/// trie including interior nodes, which is what the shadow/restore
/// round-trip tests rely on.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Ipv4RouteTable {
    root: Node,
    keys: usize,
}

fn bit(addr: u32, depth: u8) -> usize {
    ((addr >> (31 - depth)) & 1) as usize
}

impl Ipv4RouteTable {
    pub fn new() -> Self {
        Ipv4RouteTable::default()
    }

    /// Number of keys holding at least one record.
    pub fn len(&self) -> usize {
        self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys == 0
    }

    fn node(&self, prefix: Prefix) -> Option<&Node> {
        let mut node = &self.root;
        for depth in 0..prefix.len {
            node = node.children[bit(prefix.addr, depth)].as_deref()?;
        }
        Some(node)
    }

    fn node_mut(&mut self, prefix: Prefix) -> &mut Node {
        let mut node = &mut self.root;
        for depth in 0..prefix.len {
            node = node.children[bit(prefix.addr, depth)].get_or_insert_with(Box::default);
        }
        node
    }

    /// Record stack at an exact key.
    pub fn records_at(&self, prefix: Prefix) -> &[RouteRecord] {
        self.node(prefix).map(|n| n.records.as_slice()).unwrap_or(&[])
    }

    /// Longest-prefix match; returns the matched key and the top record
    /// of its stack.
    pub fn lookup_longest(&self, addr: Ipv4Addr) -> Option<(Prefix, &RouteRecord)> {
        let addr = u32::from(addr);
        let mut best: Option<(Prefix, &RouteRecord)> = None;
        let mut node = &self.root;
        let mut depth: u8 = 0;
        loop {
            if let Some(top) = node.records.first() {
                best = Some((Prefix::new(addr, depth), top));
            }
            if depth == 32 {
                break;
            }
            match node.children[bit(addr, depth)].as_deref() {
                Some(next) => {
                    node = next;
                    depth += 1;
                }
                None => break,
            }
        }
        best
    }

    /// Register a pool-kind record at `prefix`. At most one pool record
    /// may live at a key.
    pub fn insert_pool(&mut self, prefix: Prefix, record: RouteRecord) -> Result<(), RadixError> {
        debug_assert!(!record.is_session());
        let node = self.node_mut(prefix);
        if node.records.iter().any(|r| !r.is_session()) {
            return Err(RadixError::DuplicatePool(prefix));
        }
        let was_empty = node.records.is_empty();
        // Pool records sit behind any session record.
        node.records.push(record);
        if was_empty {
            self.keys += 1;
        }
        Ok(())
    }

    /// Install a session record at `prefix`, shadowing a pool record at
    /// the same key if one exists. At most one session per key.
    pub fn shadow_session(&mut self, prefix: Prefix, session: SessionId) -> Result<(), RadixError> {
        let node = self.node_mut(prefix);
        if node.records.iter().any(RouteRecord::is_session) {
            return Err(RadixError::DuplicateSession(prefix));
        }
        let was_empty = node.records.is_empty();
        node.records.insert(0, RouteRecord::Session { session });
        if was_empty {
            self.keys += 1;
        }
        Ok(())
    }

    /// Remove a session's record. Returns `true` when a shadowed pool
    /// record remains exposed at the key. Empty branches are pruned so
    /// the trie returns to its pre-insert shape.
    pub fn unshadow_session(
        &mut self,
        prefix: Prefix,
        session: SessionId,
    ) -> Result<bool, RadixError> {
        let node = match self.node(prefix) {
            Some(n) => n,
            None => return Err(RadixError::NotFound(prefix)),
        };
        let wanted = RouteRecord::Session { session };
        if node.records.first() != Some(&wanted) {
            return Err(RadixError::NotFound(prefix));
        }

        let node = self.node_mut(prefix);
        node.records.remove(0);
        let restored = !node.records.is_empty();
        if !restored {
            self.keys -= 1;
        }
        Self::prune(&mut self.root, prefix, 0);
        Ok(restored)
    }

    /// Remove every record at `prefix` (reload path).
    pub fn clear_key(&mut self, prefix: Prefix) {
        if let Some(node) = self.node(prefix) {
            if !node.records.is_empty() {
                self.keys -= 1;
            }
        }
        self.node_mut(prefix).records.clear();
        Self::prune(&mut self.root, prefix, 0);
    }

    fn prune(node: &mut Node, prefix: Prefix, depth: u8) {
        if depth < prefix.len {
            let idx = bit(prefix.addr, depth);
            if let Some(child) = node.children[idx].as_mut() {
                Self::prune(child, prefix, depth + 1);
                if child.is_empty() {
                    node.children[idx] = None;
                }
            }
        }
    }

    /// All keys and their stacks, in address order.
    pub fn entries(&self) -> Vec<(Prefix, Vec<RouteRecord>)> {
        let mut out = Vec::with_capacity(self.keys);
        Self::walk(&self.root, 0, 0, &mut out);
        out
    }

    fn walk(node: &Node, addr: u32, depth: u8, out: &mut Vec<(Prefix, Vec<RouteRecord>)>) {
        if !node.records.is_empty() {
            out.push((Prefix::new(addr, depth), node.records.clone()));
        }
        if depth == 32 {
            return;
        }
        if let Some(child) = node.children[0].as_deref() {
            Self::walk(child, addr, depth + 1, out);
        }
        if let Some(child) = node.children[1].as_deref() {
            Self::walk(child, addr | (1 << (31 - depth)), depth + 1, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix(s: &str, len: u8) -> Prefix {
        Prefix::new(u32::from(s.parse::<Ipv4Addr>().unwrap()), len)
    }

    fn pool(label: &str) -> RouteRecord {
        RouteRecord::Pool {
            pool: label.to_string(),
        }
    }

    #[test]
    fn prefix_normalizes_base() {
        let p = prefix("10.0.0.2", 30);
        assert_eq!(p.addr(), u32::from(Ipv4Addr::new(10, 0, 0, 0)));
        assert_eq!(p.to_string(), "10.0.0.0/30");
    }

    #[test]
    fn host_edge_detection() {
        let p = prefix("10.0.0.4", 30);
        assert!(p.is_host_edge(u32::from(Ipv4Addr::new(10, 0, 0, 4))));
        assert!(p.is_host_edge(u32::from(Ipv4Addr::new(10, 0, 0, 7))));
        assert!(!p.is_host_edge(u32::from(Ipv4Addr::new(10, 0, 0, 5))));
        // /31 and /32 have no reserved host values
        assert!(!prefix("10.0.0.4", 31).is_host_edge(u32::from(Ipv4Addr::new(10, 0, 0, 4))));
        assert!(!prefix("10.0.0.4", 32).is_host_edge(u32::from(Ipv4Addr::new(10, 0, 0, 4))));
    }

    #[test]
    fn longest_match_prefers_deeper_key() {
        let mut table = Ipv4RouteTable::new();
        table.insert_pool(prefix("10.0.0.0", 16), pool("outer")).unwrap();
        table.insert_pool(prefix("10.0.1.0", 24), pool("inner")).unwrap();

        let (p, rec) = table.lookup_longest(Ipv4Addr::new(10, 0, 1, 9)).unwrap();
        assert_eq!(p, prefix("10.0.1.0", 24));
        assert_eq!(rec.pool_label(), Some("inner"));

        let (p, _) = table.lookup_longest(Ipv4Addr::new(10, 0, 2, 1)).unwrap();
        assert_eq!(p, prefix("10.0.0.0", 16));

        assert!(table.lookup_longest(Ipv4Addr::new(192, 168, 0, 1)).is_none());
    }

    #[test]
    fn session_shadows_and_restores_pool_record() {
        let mut table = Ipv4RouteTable::new();
        let key = prefix("10.0.0.4", 30);
        table.insert_pool(key, pool("p")).unwrap();

        table.shadow_session(key, SessionId(7)).unwrap();
        let (_, top) = table.lookup_longest(Ipv4Addr::new(10, 0, 0, 5)).unwrap();
        assert_eq!(top, &RouteRecord::Session { session: SessionId(7) });

        let restored = table.unshadow_session(key, SessionId(7)).unwrap();
        assert!(restored);
        let (_, top) = table.lookup_longest(Ipv4Addr::new(10, 0, 0, 5)).unwrap();
        assert_eq!(top.pool_label(), Some("p"));
    }

    #[test]
    fn shadow_restore_round_trip_is_structurally_identical() {
        let mut table = Ipv4RouteTable::new();
        table.insert_pool(prefix("10.0.0.0", 24), pool("p")).unwrap();

        let mut reference = Ipv4RouteTable::new();
        reference.insert_pool(prefix("10.0.0.0", 24), pool("p")).unwrap();

        // A /32 session inside the /24 creates and must fully remove a
        // deeper branch.
        let key = Prefix::host(Ipv4Addr::new(10, 0, 0, 33));
        table.shadow_session(key, SessionId(1)).unwrap();
        assert_ne!(table, reference);
        assert!(!table.unshadow_session(key, SessionId(1)).unwrap());
        assert_eq!(table, reference);
    }

    #[test]
    fn duplicate_records_rejected() {
        let mut table = Ipv4RouteTable::new();
        let key = prefix("10.0.0.0", 24);
        table.insert_pool(key, pool("a")).unwrap();
        assert_eq!(
            table.insert_pool(key, pool("b")),
            Err(RadixError::DuplicatePool(key))
        );
        table.shadow_session(key, SessionId(1)).unwrap();
        assert_eq!(
            table.shadow_session(key, SessionId(2)),
            Err(RadixError::DuplicateSession(key))
        );
    }

    #[test]
    fn unshadow_of_absent_session_reports_not_found() {
        let mut table = Ipv4RouteTable::new();
        let key = prefix("10.0.0.0", 24);
        table.insert_pool(key, pool("a")).unwrap();
        assert_eq!(
            table.unshadow_session(key, SessionId(5)),
            Err(RadixError::NotFound(key))
        );
    }

    #[test]
    fn entries_walk_in_address_order() {
        let mut table = Ipv4RouteTable::new();
        table.insert_pool(prefix("172.16.0.0", 12), pool("b")).unwrap();
        table.insert_pool(prefix("10.0.0.0", 8), pool("a")).unwrap();
        table.shadow_session(Prefix::host(Ipv4Addr::new(10, 9, 9, 9)), SessionId(3)).unwrap();

        let entries = table.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].0, prefix("10.0.0.0", 8));
        assert_eq!(entries[1].0, Prefix::host(Ipv4Addr::new(10, 9, 9, 9)));
        assert_eq!(entries[2].0, prefix("172.16.0.0", 12));
        assert_eq!(table.len(), 3);
    }
}
