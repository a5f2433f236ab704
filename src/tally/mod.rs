use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub mod router;
pub mod umd;

/// Highest tally index (exclusive) handled by the UMD listener and the
/// command port. Device indices and UMD display indices share this range.
pub const MAX_TALLY: u16 = 32;

/// Tally lamp color as carried by a UMD control word.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TallyColor {
    #[default]
    Off,
    Red,
    Green,
    Amber,
}

impl TallyColor {
    pub fn from_wire(bits: u16) -> Self {
        match bits & 0x03 {
            1 => TallyColor::Red,
            2 => TallyColor::Green,
            3 => TallyColor::Amber,
            _ => TallyColor::Off,
        }
    }

    pub fn is_on(&self) -> bool {
        *self != TallyColor::Off
    }
}

impl fmt::Display for TallyColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TallyColor::Off => "off",
            TallyColor::Red => "red",
            TallyColor::Green => "green",
            TallyColor::Amber => "amber",
        };
        write!(f, "{}", s)
    }
}

/// Which field of a UMD display entry a tally source reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TallyType {
    #[serde(rename = "rh_tally")]
    Rh,
    #[serde(rename = "txt_tally")]
    Txt,
    #[serde(rename = "lh_tally")]
    Lh,
}

impl fmt::Display for TallyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TallyType::Rh => "rh_tally",
            TallyType::Txt => "txt_tally",
            TallyType::Lh => "lh_tally",
        };
        write!(f, "{}", s)
    }
}

/// Address of one UMD display entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TallyKey {
    pub screen: u16,
    pub index: u16,
}

impl fmt::Display for TallyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.screen, self.index)
    }
}

/// The decoded fields of one UMD display entry.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UmdFields {
    pub rh: TallyColor,
    pub txt: TallyColor,
    pub lh: TallyColor,
    pub text: String,
}

impl UmdFields {
    /// Translate one field to a boolean per the source's tally type.
    /// Text tallies count as on when the color is lit or text is present.
    pub fn is_on(&self, tally_type: TallyType) -> bool {
        match tally_type {
            TallyType::Rh => self.rh.is_on(),
            TallyType::Lh => self.lh.is_on(),
            TallyType::Txt => self.txt.is_on() || !self.text.is_empty(),
        }
    }
}

/// One subscription: a UMD display entry plus the field to read from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TallySource {
    pub key: TallyKey,
    pub tally_type: TallyType,
}

/// Per-device mapping from UMD sources to the Program and Preview lamps.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TallyMap {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program_source: Option<TallySource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_source: Option<TallySource>,
}

#[derive(Error, Debug, PartialEq)]
pub enum TallyMapError {
    #[error("Device index {0} does not resolve to a known device")]
    UnknownDevice(u32),
    #[error("Tally index {0} is outside the UMD range 0..{1}")]
    IndexOutOfRange(u16, u16),
    #[error("Program and preview sources are identical")]
    IdenticalSources,
}

impl TallyMap {
    /// Validate the map for a given device index.
    ///
    /// A map is valid iff the device index resolves to a known device, each
    /// source's tally index is within the UMD listener's declared range, and
    /// the program and preview sources differ when both are set.
    pub fn check_valid(&self, device_index: u32, device_known: bool) -> Result<(), TallyMapError> {
        if !device_known {
            return Err(TallyMapError::UnknownDevice(device_index));
        }
        for source in [self.program_source, self.preview_source].into_iter().flatten() {
            if source.key.index >= MAX_TALLY {
                return Err(TallyMapError::IndexOutOfRange(source.key.index, MAX_TALLY));
            }
        }
        if let (Some(pgm), Some(pvw)) = (self.program_source, self.preview_source) {
            if pgm == pvw {
                return Err(TallyMapError::IdenticalSources);
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.program_source.is_none() && self.preview_source.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(screen: u16, index: u16, tally_type: TallyType) -> TallySource {
        TallySource {
            key: TallyKey { screen, index },
            tally_type,
        }
    }

    #[test]
    fn color_from_wire() {
        assert_eq!(TallyColor::from_wire(0), TallyColor::Off);
        assert_eq!(TallyColor::from_wire(1), TallyColor::Red);
        assert_eq!(TallyColor::from_wire(2), TallyColor::Green);
        assert_eq!(TallyColor::from_wire(3), TallyColor::Amber);
        // Only the low two bits count
        assert_eq!(TallyColor::from_wire(0x0D), TallyColor::Red);
    }

    #[test]
    fn txt_tally_counts_text() {
        let mut fields = UmdFields::default();
        assert!(!fields.is_on(TallyType::Txt));
        fields.text = "CAM 1".to_string();
        assert!(fields.is_on(TallyType::Txt));
        assert!(!fields.is_on(TallyType::Rh));
    }

    #[test]
    fn map_validation() {
        let mut map = TallyMap::default();
        map.program_source = Some(source(0, 3, TallyType::Rh));

        assert!(map.check_valid(0, true).is_ok());
        assert_eq!(
            map.check_valid(5, false),
            Err(TallyMapError::UnknownDevice(5))
        );

        map.preview_source = Some(source(0, 3, TallyType::Rh));
        assert_eq!(
            map.check_valid(0, true),
            Err(TallyMapError::IdenticalSources)
        );

        // Same key, different field: allowed
        map.preview_source = Some(source(0, 3, TallyType::Lh));
        assert!(map.check_valid(0, true).is_ok());

        map.preview_source = Some(source(0, MAX_TALLY, TallyType::Lh));
        assert_eq!(
            map.check_valid(0, true),
            Err(TallyMapError::IndexOutOfRange(MAX_TALLY, MAX_TALLY))
        );
    }

    #[test]
    fn map_serialization_round_trip() {
        let map = TallyMap {
            program_source: Some(source(1, 2, TallyType::Rh)),
            preview_source: Some(source(1, 3, TallyType::Txt)),
        };
        let json = serde_json::to_string(&map).unwrap();
        assert!(json.contains("rh_tally"));
        let back: TallyMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }
}
