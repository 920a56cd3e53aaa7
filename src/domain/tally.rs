use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Color of a single tally indicator as carried by the UMD protocol.
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
    /// Decode the two-bit wire encoding.
    pub fn from_wire(bits: u16) -> Self {
        match bits & 0b11 {
            1 => TallyColor::Red,
            2 => TallyColor::Green,
            3 => TallyColor::Amber,
            _ => TallyColor::Off,
        }
    }

    pub fn is_lit(self) -> bool {
        self != TallyColor::Off
    }
}

/// Which of the three per-display indicators a tally map reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TallyType {
    RhTally,
    TxtTally,
    LhTally,
}

impl Display for TallyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TallyType::RhTally => "rh_tally",
            TallyType::TxtTally => "txt_tally",
            TallyType::LhTally => "lh_tally",
        };
        write!(f, "{}", name)
    }
}

/// Address of one tally display: UMD screen index plus display index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TallyKey {
    pub screen: u16,
    pub index: u16,
}

impl TallyKey {
    pub fn new(screen: u16, index: u16) -> Self {
        TallyKey { screen, index }
    }
}

impl Display for TallyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.screen, self.index)
    }
}

/// One side of a tally mapping: which display indicator feeds a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallySource {
    pub key: TallyKey,
    pub tally_type: TallyType,
}

/// Per-device mapping from UMD sources to program and preview. Two devices
/// may subscribe to the same source; within one map the two sides must
/// differ (validated by the router).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyMap {
    pub program: Option<TallySource>,
    pub preview: Option<TallySource>,
}

/// Program/preview state applied to a device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TallyState {
    pub program: bool,
    pub preview: bool,
}

impl TallyState {
    /// The camera api expresses tally as a single indication; program wins
    /// over preview when both are set.
    pub fn indication(self) -> &'static str {
        if self.program {
            "Program"
        } else if self.preview {
            "Preview"
        } else {
            "Off"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case(0, TallyColor::Off)]
    #[case(1, TallyColor::Red)]
    #[case(2, TallyColor::Green)]
    #[case(3, TallyColor::Amber)]
    #[case(0b111, TallyColor::Amber)]
    fn decodes_the_two_bit_wire_encoding(#[case] bits: u16, #[case] expected: TallyColor) {
        assert_eq!(TallyColor::from_wire(bits), expected);
    }

    #[rstest]
    #[case(TallyState { program: true, preview: false }, "Program")]
    #[case(TallyState { program: true, preview: true }, "Program")]
    #[case(TallyState { program: false, preview: true }, "Preview")]
    #[case(TallyState { program: false, preview: false }, "Off")]
    fn program_wins_over_preview(#[case] state: TallyState, #[case] expected: &str) {
        assert_eq!(state.indication(), expected);
    }
}
