use core::fmt;

/// Maximum UID length this driver accepts (triple-size NFCID1).
pub const MAX_UID_LEN: usize = 10;

/// Bit in SAK (Select Acknowledge) that signals ISO/IEC 14443-4 (APDU) support.
const SAK_ISO14443_4_BIT: u8 = 0x20;

/// Information about a currently or previously detected tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagInfo {
    uid: [u8; MAX_UID_LEN],
    uid_len: u8,
    sak: u8,
    target_number: u8,
}

impl TagInfo {
    /// Build from a detected target's fields. Returns `None` if `uid` is too long to fit.
    pub(crate) fn new(target_number: u8, sak: u8, uid: &[u8]) -> Option<Self> {
        if uid.len() > MAX_UID_LEN {
            return None;
        }
        let mut buf = [0u8; MAX_UID_LEN];
        buf[..uid.len()].copy_from_slice(uid);
        Some(Self {
            uid: buf,
            uid_len: uid.len() as u8,
            sak,
            target_number,
        })
    }

    /// Tag UID bytes (4, 7 or 10 bytes for single/double/triple-size NFCID1).
    pub fn uid(&self) -> &[u8] {
        &self.uid[..self.uid_len as usize]
    }

    /// Select Acknowledge byte from ISO/IEC 14443-3 anticollision.
    pub fn sak(&self) -> u8 {
        self.sak
    }

    /// PN532-local target index (`Tg`), used to address `InDataExchange`/`InRelease`.
    pub fn target_number(&self) -> u8 {
        self.target_number
    }

    /// Whether the tag announced ISO/IEC 14443-4 (APDU) support in its SAK.
    pub fn supports_iso14443_4(&self) -> bool {
        self.sak & SAK_ISO14443_4_BIT != 0
    }
}

impl fmt::Display for TagInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.uid() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supports_iso14443_4_reads_sak_bit_5() {
        let plain = TagInfo::new(1, 0x08, &[1, 2, 3, 4]).unwrap();
        assert!(!plain.supports_iso14443_4());

        let dep_capable = TagInfo::new(1, 0x20, &[1, 2, 3, 4]).unwrap();
        assert!(dep_capable.supports_iso14443_4());
    }

    #[test]
    fn rejects_oversized_uid() {
        assert!(TagInfo::new(1, 0x00, &[0u8; MAX_UID_LEN + 1]).is_none());
    }

    #[test]
    fn display_is_lowercase_hex() {
        let tag = TagInfo::new(1, 0x20, &[0x01, 0x02, 0x03, 0x04]).unwrap();
        extern crate std;
        assert_eq!(std::format!("{tag}"), "01020304");
    }
}
