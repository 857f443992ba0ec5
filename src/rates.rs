use macro_bits::serializable_enum;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Physical layer mode.
pub enum PhyMode {
    /// Complementary Code Keying (CCK)
    ///
    /// 1 and 2 Mbit/s DSSS as well as 5.5 and 11 Mbit/s CCK. The chip reports all of these with
    /// the same PHY status layout, so they aren't distinguished here.
    /// See IEEE 802.11-2020 Clause 15 and 16.
    Cck,
    /// Orthogonal Frequency Division Multiplexing (OFDM)
    ///
    /// 6, 9, 12, 18, 24, 36, 48 and 54 Mbit/s.
    /// See IEEE 802.11-2020 Clause 17.
    Ofdm,
    /// High Throughput (HT)
    ///
    /// MCS indices 0-15.
    /// See IEEE 802.11-2020 Clause 19.
    Ht,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// The hardware rate index (ridx).
///
/// Indices 0-3 are CCK, 4-11 are OFDM and 12-27 are MCS 0-15. This is what the hardware puts into
/// descriptors and rate bitmaps.
pub struct RateIndex(u8);
impl RateIndex {
    pub const CCK1: Self = Self(0);
    pub const CCK2: Self = Self(1);
    pub const CCK55: Self = Self(2);
    pub const CCK11: Self = Self(3);
    pub const OFDM6: Self = Self(4);
    pub const OFDM9: Self = Self(5);
    pub const OFDM12: Self = Self(6);
    pub const OFDM18: Self = Self(7);
    pub const OFDM24: Self = Self(8);
    pub const OFDM36: Self = Self(9);
    pub const OFDM48: Self = Self(10);
    pub const OFDM54: Self = Self(11);
    /// The highest MCS index we handle.
    pub const MAX_MCS: u8 = 15;

    /// Create a rate index from the raw hardware value.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }
    pub const fn into_bits(self) -> u8 {
        self.0
    }
    /// The rate index of an HT MCS.
    pub const fn mcs(mcs: u8) -> Option<Self> {
        if mcs <= Self::MAX_MCS {
            Some(Self(12 + mcs))
        } else {
            None
        }
    }
    #[inline]
    pub const fn is_cck(&self) -> bool {
        self.0 <= 3
    }
    #[inline]
    pub const fn is_ofdm(&self) -> bool {
        self.0 >= 4 && self.0 <= 11
    }
    #[inline]
    pub const fn is_ht(&self) -> bool {
        self.0 >= 12
    }
    /// Get the PHY mode of the rate.
    pub const fn phy_mode(&self) -> PhyMode {
        if self.is_cck() {
            PhyMode::Cck
        } else if self.is_ofdm() {
            PhyMode::Ofdm
        } else {
            PhyMode::Ht
        }
    }
    /// Convert a legacy rate in units of 500 kbit/s.
    ///
    /// Returns [None] for rates the hardware doesn't know.
    pub const fn from_legacy_rate(rate: u8) -> Option<Self> {
        let index = match rate {
            2 => 0,
            4 => 1,
            11 => 2,
            22 => 3,
            12 => 4,
            18 => 5,
            24 => 6,
            36 => 7,
            48 => 8,
            72 => 9,
            96 => 10,
            108 => 11,
            _ => return None,
        };
        Some(Self(index))
    }
}

/// Bit set in a legacy rate, if it's part of the basic rate set.
pub const RATE_BASIC: u8 = 0x80;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// The rates negotiated with a station.
pub struct RateSet<'a> {
    /// Legacy rates in units of 500 kbit/s, with [RATE_BASIC] set for basic rates.
    pub legacy: &'a [u8],
    /// HT MCS indices, if the station is HT capable.
    pub ht: Option<&'a [u8]>,
}
impl RateSet<'_> {
    /// Convert the rate set into a hardware rate bitmap.
    ///
    /// If `basic_only` is set, only basic legacy rates are included and HT rates are skipped.
    pub fn rate_mask(&self, basic_only: bool) -> RateMask {
        let mut mask = RateMask::default();
        self.legacy
            .iter()
            .filter(|rate| !basic_only || *rate & RATE_BASIC != 0)
            .filter_map(|rate| RateIndex::from_legacy_rate(rate & !RATE_BASIC))
            .for_each(|ridx| mask.insert(ridx));
        if let (Some(ht), false) = (self.ht, basic_only) {
            ht.iter()
                .filter_map(|mcs| RateIndex::mcs(mcs & 0x7f))
                .for_each(|ridx| mask.insert(ridx));
        }
        trace!("Rate mask {:#x}, max rate {}.", mask.rates, mask.max_rate.0);
        mask
    }
}

serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// Rate adaptation ID (RAID).
    ///
    /// Selects the rate table the hardware falls back through, based on the PHY modes the
    /// receiver supports.
    pub enum RateAdaptationId: u8 {
        Bgn => 0,
        Gn => 1,
        Bn => 2,
        N => 3,
        #[default]
        Bg => 4,
        G => 5,
        B => 6
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// A bitmap of rate indices, as used by the rate adaptation hardware.
pub struct RateMask {
    pub rates: u32,
    /// The highest rate in the bitmap. This is [RateIndex::CCK1] for an empty bitmap.
    pub max_rate: RateIndex,
}
impl RateMask {
    /// Add a rate to the bitmap.
    pub fn insert(&mut self, ridx: RateIndex) {
        self.rates |= 1 << ridx.0;
        if ridx > self.max_rate {
            self.max_rate = ridx;
        }
    }
    #[inline]
    pub const fn contains(&self, ridx: RateIndex) -> bool {
        self.rates & (1 << ridx.0) != 0
    }
    pub const fn has_cck(&self) -> bool {
        self.rates & 0x0000_000f != 0
    }
    pub const fn has_ofdm(&self) -> bool {
        self.rates & 0x0000_0ff0 != 0
    }
    pub const fn has_ht(&self) -> bool {
        self.rates & 0xffff_f000 != 0
    }
    pub const fn is_empty(&self) -> bool {
        self.rates == 0
    }
    /// The rate table matching the PHY modes in the bitmap.
    ///
    /// An empty bitmap gets [RateAdaptationId::Bg].
    pub const fn raid(&self) -> RateAdaptationId {
        match (self.has_cck(), self.has_ofdm(), self.has_ht()) {
            (true, true, true) => RateAdaptationId::Bgn,
            (false, true, true) => RateAdaptationId::Gn,
            (true, false, true) => RateAdaptationId::Bn,
            (false, false, true) => RateAdaptationId::N,
            (false, true, false) => RateAdaptationId::G,
            (true, false, false) => RateAdaptationId::B,
            (_, _, false) => RateAdaptationId::Bg,
        }
    }
    /// Limit `rate` to the highest rate in the bitmap.
    ///
    /// An empty bitmap doesn't limit anything.
    pub fn clamp(&self, rate: RateIndex) -> RateIndex {
        if self.is_empty() {
            rate
        } else {
            rate.min(self.max_rate)
        }
    }
}
