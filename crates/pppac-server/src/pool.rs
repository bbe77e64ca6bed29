//! Named IPv4 address pools and the allocation engine on top of the
//! LPM table.
//!
//! A pool owns static ranges (addresses handed out only when named by
//! configuration) and dynamic ranges (addresses handed out from a
//! shuffled free-list). All ranges of every pool are registered in one
//! shared [`Ipv4RouteTable`]; the table decides, for any address, whether
//! it is free, reserved for another pool, or busy under a live session.
//! Every mutation goes through [`PoolSet`] so the shadow-chain invariant
//! of the table holds at all times.

use crate::radix::{mask, Ipv4RouteTable, Prefix, RadixError, RouteRecord};
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionId};
use ipnetwork::Ipv4Network;
use rand::seq::SliceRandom;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Hard ceiling on the size of one pool's dynamic free-list.
pub const MAX_DYNAMIC_ADDRESSES: usize = 65536;

/// A CIDR-aligned address range; `base & !mask(prefix_len) == 0` always
/// holds, the parser masks stray host bits off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    base: u32,
    prefix_len: u8,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RangeParseError {
    #[error("'{0}' is not an IPv4 address, CIDR block or address range")]
    Malformed(String),

    #[error("prefix length {0} out of range")]
    PrefixLength(u8),

    #[error("range '{0}' runs backwards")]
    Backwards(String),
}

impl AddressRange {
    pub fn new(base: Ipv4Addr, prefix_len: u8) -> Result<Self, RangeParseError> {
        if prefix_len > 32 {
            return Err(RangeParseError::PrefixLength(prefix_len));
        }
        let raw = u32::from(base);
        let masked = raw & mask(prefix_len);
        if masked != raw {
            debug!(
                "range base {base} has host bits beyond /{prefix_len}, using {}",
                Ipv4Addr::from(masked)
            );
        }
        Ok(AddressRange {
            base: masked,
            prefix_len,
        })
    }

    /// Parse one range token: `a.b.c.d`, `a.b.c.d/len` or
    /// `a.b.c.d-e.f.g.h` (decomposed into maximal CIDR blocks).
    pub fn parse(token: &str) -> Result<Vec<Self>, RangeParseError> {
        let token = token.trim();
        if let Some((start, end)) = token.split_once('-') {
            let start = Ipv4Addr::from_str(start.trim())
                .map_err(|_| RangeParseError::Malformed(token.to_string()))?;
            let end = Ipv4Addr::from_str(end.trim())
                .map_err(|_| RangeParseError::Malformed(token.to_string()))?;
            if u32::from(start) > u32::from(end) {
                return Err(RangeParseError::Backwards(token.to_string()));
            }
            return Ok(decompose(u32::from(start), u32::from(end)));
        }
        if token.contains('/') {
            let net = Ipv4Network::from_str(token)
                .map_err(|_| RangeParseError::Malformed(token.to_string()))?;
            return Ok(vec![AddressRange::new(net.ip(), net.prefix())?]);
        }
        let addr = Ipv4Addr::from_str(token)
            .map_err(|_| RangeParseError::Malformed(token.to_string()))?;
        Ok(vec![AddressRange::new(addr, 32)?])
    }

    /// Parse a comma/whitespace separated list of range tokens.
    pub fn parse_list(spec: &str) -> Result<Vec<Self>, RangeParseError> {
        let mut out = Vec::new();
        for token in spec.split([',', ' ', '\t']).filter(|t| !t.is_empty()) {
            out.extend(AddressRange::parse(token)?);
        }
        Ok(out)
    }

    pub fn prefix(&self) -> Prefix {
        Prefix::new(self.base, self.prefix_len)
    }

    pub fn base(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.base)
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Number of addresses covered.
    pub fn size(&self) -> u64 {
        1u64 << (32 - self.prefix_len)
    }

    /// Leasable host addresses of the range: everything except the
    /// all-zero and all-ones host values, which exist only below /31.
    pub fn hosts(&self) -> impl Iterator<Item = u32> + '_ {
        let prefix = self.prefix();
        (self.base as u64..self.base as u64 + self.size())
            .map(|v| v as u32)
            .filter(move |addr| !prefix.is_host_edge(*addr))
    }
}

impl std::fmt::Display for AddressRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.base(), self.prefix_len)
    }
}

/// Greedy decomposition of an inclusive address range into maximal
/// CIDR-aligned blocks.
fn decompose(start: u32, end: u32) -> Vec<AddressRange> {
    let mut out = Vec::new();
    let mut cur = start as u64;
    let end = end as u64;
    while cur <= end {
        let by_alignment = if cur == 0 {
            32
        } else {
            (cur as u32).trailing_zeros().min(32)
        };
        let span = end - cur + 1;
        let by_span = 63 - span.leading_zeros(); // floor(log2(span))
        let block = by_alignment.min(by_span).min(32);
        out.push(AddressRange {
            base: cur as u32,
            prefix_len: (32 - block) as u8,
        });
        cur += 1u64 << block;
    }
    out
}

/// Answer of [`PoolSet::classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressState {
    /// Usable by the querying pool; `dynamic` tells which kind of range
    /// matched.
    Ok { dynamic: bool },
    /// Owned by another pool, or the address of a local interface.
    Reserved,
    /// Held by a live session.
    Busy(SessionId),
    /// No pool range covers the address.
    OutOfPool,
    /// The all-zero/all-ones host value of the matched range; never
    /// leased as a host address.
    Invalid,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("address {0} is out of the pool")]
    OutOfPool(Ipv4Addr),

    #[error("address {0} is reserved")]
    Reserved(Ipv4Addr),

    #[error("address {addr} is busy, held by session {holder}")]
    Busy { addr: Ipv4Addr, holder: SessionId },

    #[error("address {0} is invalid as a host address")]
    Invalid(Ipv4Addr),

    #[error("no free address in the pool")]
    Exhausted,

    #[error("no pool named '{0}'")]
    NoSuchPool(String),

    #[error("route table inconsistency: {0}")]
    Table(#[from] RadixError),
}

/// Errors building a pool set from configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolBuildError {
    #[error("pool '{label}' dynamic ranges cover {count} addresses, limit is {limit}")]
    TooManyDynamic {
        label: String,
        count: u64,
        limit: usize,
    },

    #[error("pool '{label}' range {range} collides with pool '{other}'")]
    Overlap {
        label: String,
        range: String,
        other: String,
    },

    #[error("duplicate pool label '{0}'")]
    DuplicateLabel(String),
}

#[derive(Debug)]
enum FreeEntry {
    Addr(u32),
    /// Drawing the sentinel reshuffles the list; drawing it twice in one
    /// scan with nothing yielded in between means exhaustion.
    Shuffle,
}

/// One named pool.
#[derive(Debug)]
pub struct AddressPool {
    label: String,
    static_ranges: Vec<AddressRange>,
    dynamic_ranges: Vec<AddressRange>,
    free: VecDeque<FreeEntry>,
}

impl AddressPool {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn static_ranges(&self) -> &[AddressRange] {
        &self.static_ranges
    }

    pub fn dynamic_ranges(&self) -> &[AddressRange] {
        &self.dynamic_ranges
    }

    /// Free-list length, the sentinel not counted.
    pub fn free_count(&self) -> usize {
        self.free
            .iter()
            .filter(|e| matches!(e, FreeEntry::Addr(_)))
            .count()
    }

    fn reshuffle(&mut self) {
        let mut addrs: Vec<u32> = self
            .free
            .drain(..)
            .filter_map(|e| match e {
                FreeEntry::Addr(a) => Some(a),
                FreeEntry::Shuffle => None,
            })
            .collect();
        addrs.shuffle(&mut rand::thread_rng());
        self.free = addrs.into_iter().map(FreeEntry::Addr).collect();
        self.free.push_back(FreeEntry::Shuffle);
    }
}

/// All pools of one configuration generation plus the shared route
/// table. Replaced wholesale on reload.
#[derive(Debug, Default)]
pub struct PoolSet {
    pools: Vec<AddressPool>,
    table: Ipv4RouteTable,
    /// Addresses of local interfaces; classifying one is always
    /// Reserved.
    local_addrs: Vec<Ipv4Addr>,
}

impl PoolSet {
    pub fn new() -> Self {
        PoolSet::default()
    }

    pub fn set_local_addrs(&mut self, addrs: Vec<Ipv4Addr>) {
        self.local_addrs = addrs;
    }

    pub fn table(&self) -> &Ipv4RouteTable {
        &self.table
    }

    pub fn pool_labels(&self) -> Vec<&str> {
        self.pools.iter().map(|p| p.label.as_str()).collect()
    }

    pub fn pool(&self, label: &str) -> Option<&AddressPool> {
        self.pools.iter().find(|p| p.label == label)
    }

    fn pool_mut(&mut self, label: &str) -> Option<&mut AddressPool> {
        self.pools.iter_mut().find(|p| p.label == label)
    }

    /// Register a pool with its ranges. Dynamic ranges take the key when
    /// a static spec covers the exact same block; a collision with a
    /// different pool is a configuration error.
    pub fn add_pool(
        &mut self,
        label: &str,
        static_ranges: Vec<AddressRange>,
        dynamic_ranges: Vec<AddressRange>,
    ) -> Result<(), PoolBuildError> {
        if self.pool(label).is_some() {
            return Err(PoolBuildError::DuplicateLabel(label.to_string()));
        }

        let dynamic_size: u64 = dynamic_ranges.iter().map(AddressRange::size).sum();
        if dynamic_size > MAX_DYNAMIC_ADDRESSES as u64 {
            return Err(PoolBuildError::TooManyDynamic {
                label: label.to_string(),
                count: dynamic_size,
                limit: MAX_DYNAMIC_ADDRESSES,
            });
        }

        let mut addrs: Vec<u32> = Vec::new();
        for range in &dynamic_ranges {
            addrs.extend(range.hosts());
            self.insert_range(label, range, true)?;
        }
        for range in &static_ranges {
            self.insert_range(label, range, false)?;
        }

        addrs.shuffle(&mut rand::thread_rng());
        let mut free: VecDeque<FreeEntry> = addrs.into_iter().map(FreeEntry::Addr).collect();
        free.push_back(FreeEntry::Shuffle);

        self.pools.push(AddressPool {
            label: label.to_string(),
            static_ranges,
            dynamic_ranges,
            free,
        });
        Ok(())
    }

    fn insert_range(
        &mut self,
        label: &str,
        range: &AddressRange,
        dynamic: bool,
    ) -> Result<(), PoolBuildError> {
        let record = if dynamic {
            RouteRecord::DynPool {
                pool: label.to_string(),
            }
        } else {
            RouteRecord::Pool {
                pool: label.to_string(),
            }
        };
        match self.table.insert_pool(range.prefix(), record) {
            Ok(()) => Ok(()),
            Err(RadixError::DuplicatePool(key)) => {
                let existing = self
                    .table
                    .records_at(key)
                    .iter()
                    .find_map(|r| r.pool_label().map(str::to_string))
                    .unwrap_or_default();
                if existing == label && !dynamic {
                    // Static spec repeating a dynamic block of the same
                    // pool; the dynamic record already covers it.
                    debug!("pool '{label}': static range {range} already covered dynamically");
                    Ok(())
                } else {
                    Err(PoolBuildError::Overlap {
                        label: label.to_string(),
                        range: range.to_string(),
                        other: existing,
                    })
                }
            }
            Err(_) => unreachable!("insert_pool only reports duplicate pools"),
        }
    }

    /// Longest-match classification of `addr` on behalf of pool
    /// `label`, for a request of width `req_prefix`.
    pub fn classify(&self, label: &str, addr: Ipv4Addr, req_prefix: u8) -> AddressState {
        classify_impl(&self.table, &self.local_addrs, label, addr, req_prefix)
    }

    /// Draw an address from the pool's shuffled free-list.
    ///
    /// Candidates that classify Reserved are dropped for good (the
    /// historical behavior; see the allocation-engine notes in
    /// DESIGN.md). A Busy candidate means a session from an earlier
    /// configuration generation still holds the address: that session is
    /// re-associated with this pool so its release feeds the current
    /// free-list, and the scan continues.
    pub fn allocate_dynamic(
        &mut self,
        label: &str,
        registry: &mut SessionRegistry,
    ) -> Result<Ipv4Addr, AllocationError> {
        let pool_idx = self
            .pools
            .iter()
            .position(|p| p.label == label)
            .ok_or_else(|| AllocationError::NoSuchPool(label.to_string()))?;

        let mut sentinel_draws = 0u8;
        loop {
            let entry = match self.pools[pool_idx].free.pop_front() {
                Some(entry) => entry,
                None => return Err(AllocationError::Exhausted),
            };
            match entry {
                FreeEntry::Shuffle => {
                    sentinel_draws += 1;
                    if sentinel_draws >= 2 {
                        self.pools[pool_idx].free.push_back(FreeEntry::Shuffle);
                        return Err(AllocationError::Exhausted);
                    }
                    self.pools[pool_idx].reshuffle();
                }
                FreeEntry::Addr(raw) => {
                    let addr = Ipv4Addr::from(raw);
                    match classify_impl(&self.table, &self.local_addrs, label, addr, 32) {
                        AddressState::Ok { .. } => return Ok(addr),
                        AddressState::Reserved => {
                            // Dropped, not re-enqueued.
                            info!("pool '{label}': dynamic candidate {addr} is reserved, dropped");
                        }
                        AddressState::Busy(holder) => {
                            if let Some(session) = registry.get_mut(holder) {
                                debug!(
                                    "pool '{label}': {addr} busy under session {holder}, \
                                     re-associating with current generation"
                                );
                                session.pool = Some(label.to_string());
                                session.dynamic_lease = true;
                            }
                        }
                        state => {
                            warn!("pool '{label}': dynamic candidate {addr} classified {state:?}, dropped");
                        }
                    }
                }
            }
        }
    }

    /// Install a session record at `(addr & mask, prefix)`. A pool
    /// record at the exact key is shadowed, not replaced.
    pub fn assign(
        &mut self,
        session: SessionId,
        addr: Ipv4Addr,
        req_prefix: u8,
    ) -> Result<(), AllocationError> {
        let key = Prefix::new(u32::from(addr), req_prefix);
        match self.table.shadow_session(key, session) {
            Ok(()) => Ok(()),
            Err(RadixError::DuplicateSession(_)) => {
                let holder = self
                    .table
                    .records_at(key)
                    .iter()
                    .find_map(|r| match r {
                        RouteRecord::Session { session } => Some(*session),
                        _ => None,
                    })
                    .unwrap_or(session);
                Err(AllocationError::Busy { addr, holder })
            }
            Err(e) => Err(AllocationError::Table(e)),
        }
    }

    /// Remove the session's record and, for a dynamic lease, hand the
    /// address back to the owning pool's free-list. Calling this twice
    /// for the same session is a no-op the second time.
    pub fn release(&mut self, session: &mut Session) {
        let addr = match session.framed_ip.take() {
            Some(addr) => addr,
            None => return,
        };
        let key = Prefix::new(u32::from(addr), session.framed_prefix);
        match self.table.unshadow_session(key, session.id) {
            Ok(restored) => {
                debug!(
                    "session {}: released {key}{}",
                    session.id,
                    if restored { ", pool record restored" } else { "" }
                );
            }
            Err(e) => warn!("session {}: release of {key} found no record: {e}", session.id),
        }
        if session.dynamic_lease {
            if let Some(label) = session.pool.as_deref() {
                if let Some(pool) = self.pool_mut(label) {
                    pool.free.push_back(FreeEntry::Addr(u32::from(addr)));
                }
            }
        }
        session.framed_prefix = 32;
        session.pool = None;
        session.dynamic_lease = false;
    }
}

fn classify_impl(
    table: &Ipv4RouteTable,
    local_addrs: &[Ipv4Addr],
    label: &str,
    addr: Ipv4Addr,
    req_prefix: u8,
) -> AddressState {
    let (key, record) = match table.lookup_longest(addr) {
        Some(hit) => hit,
        None => return AddressState::OutOfPool,
    };
    match record {
        RouteRecord::Session { session } => AddressState::Busy(*session),
        RouteRecord::Pool { pool } | RouteRecord::DynPool { pool } => {
            if local_addrs.contains(&addr) {
                return AddressState::Reserved;
            }
            if pool != label {
                return AddressState::Reserved;
            }
            if req_prefix == 32 && key.is_host_edge(u32::from(addr)) {
                return AddressState::Invalid;
            }
            AddressState::Ok {
                dynamic: record.is_dynamic_pool(),
            }
        }
    }
}
