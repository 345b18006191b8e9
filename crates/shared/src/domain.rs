use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! text_id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

text_id_newtype!(VoterId);
text_id_newtype!(PollingStationId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One verification modality a voter has to pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorKind {
    IdentityLookup,
    Face,
    Fingerprint,
}

impl FactorKind {
    pub const ALL: [FactorKind; 3] = [
        FactorKind::IdentityLookup,
        FactorKind::Face,
        FactorKind::Fingerprint,
    ];

    /// Capture hardware the factor needs, if any. Identity lookup works on the
    /// typed voter id alone.
    pub fn device_kind(self) -> Option<DeviceKind> {
        match self {
            FactorKind::IdentityLookup => None,
            FactorKind::Face => Some(DeviceKind::Camera),
            FactorKind::Fingerprint => Some(DeviceKind::FingerprintScanner),
        }
    }

    /// Path segment used by the station verification endpoint.
    pub fn path_segment(self) -> &'static str {
        match self {
            FactorKind::IdentityLookup => "identity",
            FactorKind::Face => "face",
            FactorKind::Fingerprint => "fingerprint",
        }
    }

    pub fn from_path_segment(segment: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.path_segment().eq_ignore_ascii_case(segment.trim()))
    }
}

impl fmt::Display for FactorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path_segment())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Camera,
    FingerprintScanner,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Camera => f.write_str("camera"),
            DeviceKind::FingerprintScanner => f.write_str("fingerprint scanner"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScannerStatus {
    #[default]
    Unknown,
    Connected,
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factor_path_segments_round_trip_case_insensitively() {
        assert_eq!(
            FactorKind::from_path_segment("Fingerprint"),
            Some(FactorKind::Fingerprint)
        );
        assert_eq!(
            FactorKind::from_path_segment("identity"),
            Some(FactorKind::IdentityLookup)
        );
        assert_eq!(FactorKind::from_path_segment("iris"), None);
    }

    #[test]
    fn blank_ids_are_detected() {
        assert!(VoterId::new("   ").is_blank());
        assert!(!PollingStationId::new("PS-12").is_blank());
    }
}
