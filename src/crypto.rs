use macro_bits::serializable_enum;

/// Length of the key material stored in one CAM slot.
pub const CAM_KEY_LENGTH: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// A WEP key, which is either 40 or 104 bits long.
pub enum WepKey<'a> {
    Wep40(&'a [u8; 5]),
    Wep104(&'a [u8; 13]),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Whether a key protects unicast or group addressed traffic.
pub enum KeyType {
    Pairwise,
    Group,
}

serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// The algorithm code stored in a CAM entry.
    pub enum CamAlgorithm: u8 {
        #[default]
        None => 0,
        Wep40 => 1,
        Tkip => 2,
        Aes => 4,
        Wep104 => 5
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// A key, that may be offloaded to the key cache.
pub enum CipherParameters<'a> {
    /// WEP keys protect pairwise and group addressed traffic alike.
    Wep(WepKey<'a>),
    /// Only the temporal key is programmed, the MIC keys stay with the host.
    Tkip(&'a [u8; 16], KeyType),
    /// AES-128 CCMP.
    Ccmp(&'a [u8; 16], KeyType),
}
impl CipherParameters<'_> {
    /// The key type, which WEP doesn't have.
    pub const fn key_type(&self) -> Option<KeyType> {
        match self {
            Self::Wep(_) => None,
            Self::Tkip(_, key_type) | Self::Ccmp(_, key_type) => Some(*key_type),
        }
    }
    pub const fn key(&self) -> &[u8] {
        match self {
            Self::Wep(WepKey::Wep40(key)) => key.as_slice(),
            Self::Wep(WepKey::Wep104(key)) => key.as_slice(),
            Self::Tkip(key, _) | Self::Ccmp(key, _) => key.as_slice(),
        }
    }
    pub fn is_pairwise(&self) -> bool {
        self.key_type()
            .is_none_or(|key_type| key_type == KeyType::Pairwise)
    }
    pub fn is_group(&self) -> bool {
        self.key_type()
            .is_none_or(|key_type| key_type == KeyType::Group)
    }
    /// The hardware algorithm code.
    pub const fn algorithm(&self) -> CamAlgorithm {
        match self {
            Self::Wep(WepKey::Wep40(_)) => CamAlgorithm::Wep40,
            Self::Wep(WepKey::Wep104(_)) => CamAlgorithm::Wep104,
            Self::Tkip(..) => CamAlgorithm::Tkip,
            Self::Ccmp(..) => CamAlgorithm::Aes,
        }
    }
    /// The key material, zero padded to the size of a CAM slot.
    pub fn padded_key(&self) -> [u8; CAM_KEY_LENGTH] {
        let mut padded = [0u8; CAM_KEY_LENGTH];
        let key = self.key();
        padded[..key.len()].copy_from_slice(key);
        padded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algorithm_codes() {
        let wep40 = CipherParameters::Wep(WepKey::Wep40(&[1; 5]));
        let wep104 = CipherParameters::Wep(WepKey::Wep104(&[1; 13]));
        assert_eq!(wep40.algorithm().into_bits(), 1);
        assert_eq!(wep104.algorithm().into_bits(), 5);
        assert_eq!(
            CipherParameters::Tkip(&[0; 16], KeyType::Pairwise)
                .algorithm()
                .into_bits(),
            2
        );
        assert_eq!(
            CipherParameters::Ccmp(&[0; 16], KeyType::Group)
                .algorithm()
                .into_bits(),
            4
        );
    }
    #[test]
    fn wep_is_pairwise_and_group() {
        let wep = CipherParameters::Wep(WepKey::Wep40(&[0xaa; 5]));
        assert!(wep.is_pairwise() && wep.is_group());
        let padded = wep.padded_key();
        assert_eq!(&padded[..5], &[0xaa; 5]);
        assert_eq!(&padded[5..], &[0; 11]);

        let ccmp = CipherParameters::Ccmp(&[0; 16], KeyType::Group);
        assert!(!ccmp.is_pairwise() && ccmp.is_group());
    }
}
