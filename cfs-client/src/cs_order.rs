//! Chunk-server ranking for read dispatch and write-chain ordering.
//! Servers are sorted by preferred-label match, then by
//! [`ServerDescriptor::priority`] (lower first), then by running load (via
//! [`CsLoadTable`]), then by a stable per-server pseudorandom tie-break so
//! load spreads evenly across equivalent replicas.
//!
//! `CsLoadTable` tracks per-`(ip, port)` read/write counters under a
//! single mutex, mirroring the load bookkeeping a chunk-server client
//! keeps to spread requests across replicas (see DESIGN.md).

use std::collections::HashMap;
use std::hash::{BuildHasher, Hasher};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use siphasher::sip::SipHasher13;

use cfs_api_types::ServerDescriptor;

/// Process-stable tie-break keys, derived once from `RandomState`'s
/// per-process random seed so restarts reshuffle ties but a single
/// process's ranking of a given server stays stable across calls.
static TIE_BREAK_KEYS: Lazy<(u64, u64)> = Lazy::new(|| {
    let rs = std::collections::hash_map::RandomState::new();
    let mut h0 = rs.build_hasher();
    h0.write_u8(0);
    let mut h1 = rs.build_hasher();
    h1.write_u8(1);
    (h0.finish(), h1.finish())
});

fn tie_break(ip: u32, port: u16) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(TIE_BREAK_KEYS.0, TIE_BREAK_KEYS.1);
    hasher.write_u32(ip);
    hasher.write_u16(port);
    hasher.finish()
}

/// Per-`(ip, port)` running read/write load counters, incremented while a
/// worker is actively using that server and decremented on completion.
#[derive(Default)]
pub struct CsLoadTable {
    counters: Mutex<HashMap<(u32, u16), (u32, u32)>>,
}

impl CsLoadTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_inc(&self, ip: u32, port: u16) {
        self.counters.lock().entry((ip, port)).or_default().0 += 1;
    }

    pub fn read_dec(&self, ip: u32, port: u16) {
        if let Some(c) = self.counters.lock().get_mut(&(ip, port)) {
            c.0 = c.0.saturating_sub(1);
        }
    }

    pub fn write_inc(&self, ip: u32, port: u16) {
        self.counters.lock().entry((ip, port)).or_default().1 += 1;
    }

    pub fn write_dec(&self, ip: u32, port: u16) {
        if let Some(c) = self.counters.lock().get_mut(&(ip, port)) {
            c.1 = c.1.saturating_sub(1);
        }
    }

    fn load(&self, ip: u32, port: u16, write_flag: bool) -> u32 {
        let counters = self.counters.lock();
        match counters.get(&(ip, port)) {
            Some((reads, writes)) => {
                if write_flag {
                    *writes
                } else {
                    *reads
                }
            }
            None => 0,
        }
    }
}

/// A label expression to match against [`ServerDescriptor::label_mask`].
/// This engine treats `preferred_labels` as a required-bits mask, parsed
/// from either a `0x`-prefixed hex string or a decimal string (an
/// implementation-defined format, see DESIGN.md).
#[derive(Debug, Clone, Copy)]
pub struct LabelExpr {
    required_bits: u32,
}

impl LabelExpr {
    pub fn parse(spec: &str) -> Option<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return None;
        }
        let required_bits = if let Some(hex) = spec.strip_prefix("0x") {
            u32::from_str_radix(hex, 16).ok()?
        } else {
            spec.parse().ok()?
        };
        Some(Self { required_bits })
    }

    fn matches(&self, label_mask: u32) -> bool {
        label_mask & self.required_bits == self.required_bits
    }
}

/// Ranks candidate chunk servers for a read or orders the write chain.
pub struct CSServerOrder {
    preferred: Option<LabelExpr>,
    load: CsLoadTable,
}

impl CSServerOrder {
    pub fn new(preferred_labels: Option<&str>) -> Self {
        Self {
            preferred: preferred_labels.and_then(LabelExpr::parse),
            load: CsLoadTable::new(),
        }
    }

    pub fn load_table(&self) -> &CsLoadTable {
        &self.load
    }

    /// Sort `servers` in place: preferred-label matches first, then by
    /// ascending `priority`, then by ascending load, then by the stable
    /// tie-break. For writes, the resulting order *is* the chain
    /// (`servers[0]` is the head; the rest is forwarded to it for
    /// pipelining). Returns the number of servers ranked (always all of
    /// `servers`).
    pub fn sort(&self, servers: &mut [ServerDescriptor], write_flag: bool) -> usize {
        servers.sort_by(|a, b| {
            let a_pref = self.preferred.map(|p| p.matches(a.label_mask)).unwrap_or(false);
            let b_pref = self.preferred.map(|p| p.matches(b.label_mask)).unwrap_or(false);
            b_pref
                .cmp(&a_pref)
                .then_with(|| a.priority.cmp(&b.priority))
                .then_with(|| {
                    let a_load = self.load.load(a.ip, a.port, write_flag);
                    let b_load = self.load.load(b.ip, b.port, write_flag);
                    a_load.cmp(&b_load)
                })
                .then_with(|| tie_break(a.ip, a.port).cmp(&tie_break(b.ip, b.port)))
        });
        servers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(ip: u32, port: u16, label_mask: u32) -> ServerDescriptor {
        server_with_priority(ip, port, label_mask, 0)
    }

    fn server_with_priority(ip: u32, port: u16, label_mask: u32, priority: u32) -> ServerDescriptor {
        ServerDescriptor {
            ip,
            port,
            version: 0,
            label_mask,
            priority,
        }
    }

    #[test]
    fn preferred_label_matches_sort_first() {
        let order = CSServerOrder::new(Some("0x1"));
        let mut servers = vec![server(1, 1, 0), server(2, 2, 0x3)];
        order.sort(&mut servers, false);
        assert_eq!(servers[0].ip, 2);
    }

    #[test]
    fn lower_load_is_preferred_among_equal_labels() {
        let order = CSServerOrder::new(None);
        order.load_table().read_inc(1, 1);
        order.load_table().read_inc(1, 1);
        let mut servers = vec![server(1, 1, 0), server(2, 2, 0)];
        order.sort(&mut servers, false);
        assert_eq!(servers[0].ip, 2);
    }

    #[test]
    fn lower_priority_is_preferred_among_equal_labels() {
        let order = CSServerOrder::new(None);
        let mut servers = vec![server_with_priority(1, 1, 0, 5), server_with_priority(2, 2, 0, 1)];
        order.sort(&mut servers, false);
        assert_eq!(servers[0].ip, 2);
    }

    #[test]
    fn tie_break_is_stable_within_a_process() {
        let order = CSServerOrder::new(None);
        let mut a = vec![server(5, 5, 0), server(9, 9, 0)];
        let mut b = a.clone();
        order.sort(&mut a, false);
        order.sort(&mut b, false);
        assert_eq!(a.iter().map(|s| s.ip).collect::<Vec<_>>(), b.iter().map(|s| s.ip).collect::<Vec<_>>());
    }

    #[test]
    fn load_table_tracks_reads_and_writes_independently() {
        let table = CsLoadTable::new();
        table.read_inc(1, 1);
        table.write_inc(1, 1);
        table.write_inc(1, 1);
        assert_eq!(table.load(1, 1, false), 1);
        assert_eq!(table.load(1, 1, true), 2);
        table.write_dec(1, 1);
        assert_eq!(table.load(1, 1, true), 1);
    }
}
