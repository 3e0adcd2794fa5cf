use super::source::InhibitSource;
use super::value_object::StateUpdate;
use std::fmt;

/// Aggregate outcome of one arbitration pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Decision {
    pub inhibiting: bool,
    pub inhibited_by: Vec<String>,
    pub overridden: bool,
    pub overridden_by: Vec<String>,
}

impl Decision {
    pub fn to_update(&self) -> StateUpdate {
        StateUpdate {
            inhibiting: Some(self.inhibiting),
            inhibited_by: Some(self.inhibited_by.clone()),
            overridden: Some(self.overridden),
            overridden_by: Some(self.overridden_by.clone()),
            ..StateUpdate::default()
        }
    }
}

/// Computes the aggregate decision over sources in priority order.
///
/// The first source flagged as override decides alone. Otherwise the result
/// is the OR of every vote and `inhibited_by` lists each source voting true.
pub fn arbitrate<'a, I>(sources: I) -> Decision
where
    I: IntoIterator<Item = &'a InhibitSource>,
{
    let mut decision = Decision::default();
    for source in sources {
        let vote = source.vote();
        if vote.is_override {
            let label = vec![source.label().to_string()];
            return Decision {
                inhibiting: vote.should_inhibit,
                inhibited_by: label.clone(),
                overridden: true,
                overridden_by: label,
            };
        }
        if vote.should_inhibit {
            decision.inhibiting = true;
            decision.inhibited_by.push(source.label().to_string());
        }
    }
    decision
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ArbiterPhase {
    #[default]
    NotInhibiting,
    Inhibiting,
}

impl ArbiterPhase {
    pub fn is_inhibiting(self) -> bool {
        matches!(self, ArbiterPhase::Inhibiting)
    }
}

impl fmt::Display for ArbiterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArbiterPhase::NotInhibiting => write!(f, "not_inhibiting"),
            ArbiterPhase::Inhibiting => write!(f, "inhibiting"),
        }
    }
}

/// Action to take on the throttle target after a phase edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Enforcement {
    Engage,
    Release,
}

impl Enforcement {
    pub fn rate_limited(self) -> bool {
        matches!(self, Enforcement::Engage)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Enforcement::Engage => "engage",
            Enforcement::Release => "release",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub republish: bool,
    pub enforcement: Option<Enforcement>,
}

/// Two-state machine tracking what was last published and enforced.
#[derive(Debug, Default)]
pub struct Arbiter {
    phase: ArbiterPhase,
    last_published: Option<Decision>,
}

impl Arbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> ArbiterPhase {
        self.phase
    }

    pub fn last_published(&self) -> Option<&Decision> {
        self.last_published.as_ref()
    }

    /// Feeds one decision. Republish is requested only when the decision
    /// differs from the last published one; enforcement fires only on a
    /// phase edge.
    pub fn observe(&mut self, decision: &Decision) -> TickOutcome {
        let republish = self.last_published.as_ref() != Some(decision);
        if republish {
            self.last_published = Some(decision.clone());
        }

        let enforcement = match (self.phase, decision.inhibiting) {
            (ArbiterPhase::NotInhibiting, true) => {
                self.phase = ArbiterPhase::Inhibiting;
                Some(Enforcement::Engage)
            }
            (ArbiterPhase::Inhibiting, false) => {
                self.phase = ArbiterPhase::NotInhibiting;
                Some(Enforcement::Release)
            }
            _ => None,
        };

        TickOutcome {
            republish,
            enforcement,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::inhibit::SourceRole;
    use proptest::prelude::*;

    fn voter(name: &str, should_inhibit: bool, is_override: bool) -> InhibitSource {
        let source = InhibitSource::with_name(SourceRole::Media, name);
        source.apply_command(should_inhibit, is_override);
        source
    }

    #[test]
    fn override_short_circuits_later_votes() {
        let plex = voter("Plex", true, false);
        let net = voter("Net", false, false);
        let api = voter("API", false, false);

        let decision = arbitrate([&api, &plex, &net]);
        assert!(decision.inhibiting);
        assert_eq!(decision.inhibited_by, vec!["Plex"]);
        assert!(!decision.overridden);

        api.apply_command(false, true);
        let decision = arbitrate([&api, &plex, &net]);
        assert!(!decision.inhibiting);
        assert_eq!(decision.inhibited_by, vec!["API"]);
        assert_eq!(decision.overridden_by, vec!["API"]);
        assert!(decision.overridden);
    }

    #[test]
    fn first_override_wins_when_several_disagree() {
        let first = voter("first", true, true);
        let second = voter("second", false, true);
        let decision = arbitrate([&first, &second]);
        assert!(decision.inhibiting);
        assert_eq!(decision.inhibited_by, vec!["first"]);
    }

    #[test]
    fn empty_holder_does_not_inhibit() {
        let decision = arbitrate(std::iter::empty::<&InhibitSource>());
        assert_eq!(decision, Decision::default());
    }

    #[test]
    fn enforcement_fires_once_per_edge() {
        let mut arbiter = Arbiter::new();
        let on = Decision {
            inhibiting: true,
            inhibited_by: vec!["Plex".into()],
            ..Decision::default()
        };
        let off = Decision::default();

        let mut fired = Vec::new();
        for decision in [&off, &on, &on, &on, &off, &off, &on] {
            if let Some(action) = arbiter.observe(decision).enforcement {
                fired.push(action);
            }
        }
        assert_eq!(
            fired,
            vec![Enforcement::Engage, Enforcement::Release, Enforcement::Engage]
        );
        assert_eq!(arbiter.phase(), ArbiterPhase::Inhibiting);
    }

    #[test]
    fn republish_only_on_change() {
        let mut arbiter = Arbiter::new();
        let plex = Decision {
            inhibiting: true,
            inhibited_by: vec!["Plex".into()],
            ..Decision::default()
        };
        let both = Decision {
            inhibiting: true,
            inhibited_by: vec!["Plex".into(), "Net".into()],
            ..Decision::default()
        };
        assert!(arbiter.observe(&Decision::default()).republish);
        assert!(!arbiter.observe(&Decision::default()).republish);
        let outcome = arbiter.observe(&plex);
        assert!(outcome.republish);
        assert_eq!(outcome.enforcement, Some(Enforcement::Engage));
        let outcome = arbiter.observe(&both);
        assert!(outcome.republish);
        assert_eq!(outcome.enforcement, None);
        assert!(!arbiter.observe(&both).republish);
    }

    proptest! {
        #[test]
        fn without_override_decision_is_or_of_votes(votes in prop::collection::vec(any::<bool>(), 0..8)) {
            let sources: Vec<_> = votes
                .iter()
                .enumerate()
                .map(|(idx, vote)| voter(&format!("s{idx}"), *vote, false))
                .collect();
            let decision = arbitrate(sources.iter());
            prop_assert_eq!(decision.inhibiting, votes.iter().any(|v| *v));
            let expected: Vec<String> = votes
                .iter()
                .enumerate()
                .filter(|(_, vote)| **vote)
                .map(|(idx, _)| format!("s{idx}"))
                .collect();
            prop_assert_eq!(decision.inhibited_by, expected);
            prop_assert!(!decision.overridden);
        }

        #[test]
        fn first_override_decides_alone(
            votes in prop::collection::vec((any::<bool>(), any::<bool>()), 1..8),
        ) {
            let sources: Vec<_> = votes
                .iter()
                .enumerate()
                .map(|(idx, (vote, ovr))| voter(&format!("s{idx}"), *vote, *ovr))
                .collect();
            let decision = arbitrate(sources.iter());
            match votes.iter().position(|(_, ovr)| *ovr) {
                Some(idx) => {
                    prop_assert_eq!(decision.inhibiting, votes[idx].0);
                    prop_assert_eq!(decision.inhibited_by, vec![format!("s{idx}")]);
                    prop_assert!(decision.overridden);
                }
                None => {
                    prop_assert_eq!(decision.inhibiting, votes.iter().any(|(v, _)| *v));
                    prop_assert!(!decision.overridden);
                }
            }
        }
    }
}
