//! Component phase state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Phase of a component record.
///
/// State transitions:
/// - Init -> Init (import / hook / emit / require accumulate declarations)
/// - Init -> Prepare (run: logic supplied, exactly once)
/// - Prepare -> Building (only from the scheduler's current build pass)
/// - Building -> Built (logic completed, terminal)
/// - Building -> Prepare (logic failed, the unit stays eligible for a later pass)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Init,
    Prepare,
    Building,
    Built,
}

impl Phase {
    /// Central transition table; every phase change goes through here.
    pub fn can_transition_to(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Init, Phase::Init)
                | (Phase::Init, Phase::Prepare)
                | (Phase::Prepare, Phase::Building)
                | (Phase::Building, Phase::Built)
                | (Phase::Building, Phase::Prepare)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Built)
    }

    /// Declaration methods are only valid here.
    pub fn accepts_declarations(self) -> bool {
        matches!(self, Phase::Init)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Init => "INIT",
            Phase::Prepare => "PREPARE",
            Phase::Building => "BUILDING",
            Phase::Built => "BUILT",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::declare(Phase::Init, Phase::Init, true)]
    #[case::run(Phase::Init, Phase::Prepare, true)]
    #[case::build(Phase::Prepare, Phase::Building, true)]
    #[case::built(Phase::Building, Phase::Built, true)]
    #[case::revert(Phase::Building, Phase::Prepare, true)]
    #[case::skip_prepare(Phase::Init, Phase::Building, false)]
    #[case::skip_building(Phase::Prepare, Phase::Built, false)]
    #[case::back_to_init(Phase::Prepare, Phase::Init, false)]
    #[case::leave_built(Phase::Built, Phase::Prepare, false)]
    #[case::rebuild(Phase::Built, Phase::Building, false)]
    fn transition_table(#[case] from: Phase, #[case] to: Phase, #[case] allowed: bool) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn only_built_is_terminal() {
        assert!(Phase::Built.is_terminal());
        assert!(!Phase::Building.is_terminal());
        assert!(!Phase::Prepare.is_terminal());
        assert!(!Phase::Init.is_terminal());
    }

    #[test]
    fn serializes_upper_case() {
        assert_eq!(serde_json::to_string(&Phase::Prepare).unwrap(), "\"PREPARE\"");
    }
}
