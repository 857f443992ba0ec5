//! The station table.
//!
//! Stations are indexed by their MACID. The table lives behind its own lock, separate from the
//! device state, and every lookup hands out a copy. That way no reference into the table is ever
//! held across a register access.

use crate::rates::{PhyMode, RateIndex};

/// Capacity of the table. Chips with fewer MACIDs only use a prefix.
pub const MAX_NODES: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// The per station state.
pub struct NodeEntry {
    /// The MACID of the station.
    pub id: u8,
    /// The virtual interface the station belongs to.
    pub vap: u8,
    pub addr: [u8; 6],
    /// The RSSI of the last frame received from this station.
    pub last_rssi: i8,
    /// The moving average of the signal strength in percent, once initialized.
    pub avg_pwdb: Option<i32>,
}
impl NodeEntry {
    pub const fn new(id: u8, vap: u8, addr: [u8; 6]) -> Self {
        Self {
            id,
            vap,
            addr,
            last_rssi: 0,
            avg_pwdb: None,
        }
    }
    /// Record the RSSI of a received frame and update the moving average.
    pub fn update_rssi(&mut self, rssi: i8, rate: RateIndex) {
        self.last_rssi = rssi;
        let pwdb = signal_percentage(rssi, rate.phy_mode());
        self.avg_pwdb = Some(match self.avg_pwdb {
            None => pwdb,
            Some(avg) if avg < pwdb => (avg * 19 + pwdb) / 20 + 1,
            Some(avg) => (avg * 19 + pwdb) / 20,
        });
        trace!(
            "MACID {}, PWDB {}, EMA {}",
            self.id,
            pwdb,
            self.avg_pwdb.unwrap_or(pwdb)
        );
    }
}

/// Convert an RSSI in dBm to a signal percentage.
///
/// CCK gain is smaller than OFDM gain, so CCK values are corrected by a bucketed offset.
fn signal_percentage(rssi: i8, phy_mode: PhyMode) -> i32 {
    let mut pwdb = match rssi {
        ..=-100 | 20.. => 0,
        0.. => 100,
        _ => 100 + i32::from(rssi),
    };
    if phy_mode == PhyMode::Cck {
        pwdb = (pwdb + 6).min(100);
        pwdb -= match pwdb {
            ..=14 => 4,
            15..=26 => 8,
            27..=34 => 6,
            35..=42 => 2,
            _ => 0,
        };
    }
    pwdb
}

/// Stations indexed by MACID.
pub struct NodeTable {
    nodes: [Option<NodeEntry>; MAX_NODES],
    limit: usize,
    /// The RSSI of the last frame received from anyone.
    last_rssi: i8,
}
impl NodeTable {
    /// Create an empty table, accepting MACIDs below `limit`.
    pub const fn new(limit: usize) -> Self {
        Self {
            nodes: [None; MAX_NODES],
            limit: if limit > MAX_NODES { MAX_NODES } else { limit },
            last_rssi: 0,
        }
    }
    pub const fn limit(&self) -> usize {
        self.limit
    }
    /// Insert a station. Returns [false] if the MACID is out of range.
    pub fn insert(&mut self, entry: NodeEntry) -> bool {
        let Some(slot) = self.nodes[..self.limit].get_mut(entry.id as usize) else {
            warn!("MACID {} is too big, limit is {}.", entry.id, self.limit);
            return false;
        };
        *slot = Some(entry);
        true
    }
    pub fn remove(&mut self, macid: u8) -> Option<NodeEntry> {
        self.nodes[..self.limit].get_mut(macid as usize)?.take()
    }
    /// Look up a station by MACID.
    pub fn get(&self, macid: u8) -> Option<NodeEntry> {
        self.nodes[..self.limit].get(macid as usize).copied().flatten()
    }
    /// Look up a station by address.
    pub fn find(&self, addr: &[u8; 6]) -> Option<NodeEntry> {
        self.nodes[..self.limit]
            .iter()
            .flatten()
            .find(|node| node.addr == *addr)
            .copied()
    }
    /// Record a measured RSSI, optionally for a specific station.
    pub fn record_rssi(&mut self, macid: Option<u8>, rssi: i8, rate: RateIndex) {
        self.last_rssi = rssi;
        if let Some(node) = macid.and_then(|macid| {
            self.nodes[..self.limit]
                .get_mut(macid as usize)
                .and_then(Option::as_mut)
        }) {
            node.update_rssi(rssi, rate);
        }
    }
    /// The last RSSI of the station, or of the device if the station is unknown.
    pub fn last_rssi(&self, macid: Option<u8>) -> i8 {
        macid
            .and_then(|macid| self.get(macid))
            .map_or(self.last_rssi, |node| node.last_rssi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_macid_is_rejected() {
        let mut table = NodeTable::new(32);
        assert!(!table.insert(NodeEntry::new(32, 0, [0; 6])));
        assert!(table.insert(NodeEntry::new(31, 0, [1; 6])));
        assert_eq!(table.get(200), None);
        assert_eq!(table.find(&[1; 6]).map(|node| node.id), Some(31));
        assert_eq!(table.remove(31).map(|node| node.id), Some(31));
        assert_eq!(table.get(31), None);
    }
    #[test]
    fn signal_percentages() {
        assert_eq!(signal_percentage(-100, PhyMode::Ofdm), 0);
        assert_eq!(signal_percentage(25, PhyMode::Ofdm), 0);
        assert_eq!(signal_percentage(5, PhyMode::Ofdm), 100);
        assert_eq!(signal_percentage(-60, PhyMode::Ofdm), 40);
        // 40 + 6 is above every bucket.
        assert_eq!(signal_percentage(-60, PhyMode::Cck), 46);
        // 14 + 6 lands in the second bucket.
        assert_eq!(signal_percentage(-86, PhyMode::Cck), 12);
        assert_eq!(signal_percentage(-94, PhyMode::Cck), 8);
    }
    #[test]
    fn moving_average() {
        let mut node = NodeEntry::new(1, 0, [0; 6]);
        node.update_rssi(-60, RateIndex::OFDM6);
        assert_eq!(node.avg_pwdb, Some(40));
        // Rising values are rounded up.
        node.update_rssi(-40, RateIndex::OFDM6);
        assert_eq!(node.avg_pwdb, Some((40 * 19 + 60) / 20 + 1));
        node.update_rssi(-90, RateIndex::OFDM6);
        assert_eq!(node.avg_pwdb, Some((42 * 19 + 10) / 20));
        assert_eq!(node.last_rssi, -90);
    }
    #[test]
    fn last_rssi_fallback() {
        let mut table = NodeTable::new(32);
        table.insert(NodeEntry::new(3, 0, [3; 6]));
        table.record_rssi(Some(3), -50, RateIndex::OFDM6);
        table.record_rssi(None, -70, RateIndex::OFDM6);
        assert_eq!(table.last_rssi(Some(3)), -50);
        assert_eq!(table.last_rssi(Some(4)), -70);
        assert_eq!(table.last_rssi(None), -70);
    }
}
