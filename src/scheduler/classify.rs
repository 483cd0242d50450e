//! Mapping packets to CBQ classes.

use tracing::trace;

use super::cbq::ClassId;
use crate::Pkt;

/// Maps an arriving packet to the class it should be queued in.
///
/// `None` means no rule matched; the scheduler then uses its fallback class.
pub trait Classifier: Send {
    fn classify(&self, p: &Pkt) -> Option<ClassId>;
}

impl<F> Classifier for F
where
    F: Fn(&Pkt) -> Option<ClassId> + Send,
{
    fn classify(&self, p: &Pkt) -> Option<ClassId> {
        (self)(p)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Match {
    Dport(u16),
    DstIp(u32),
}

impl Match {
    fn matches(&self, p: &Pkt) -> bool {
        match self {
            Match::Dport(port) => p.dport() == *port,
            Match::DstIp(ip) => u32::from_be_bytes(p.hdr().destination) == *ip,
        }
    }
}

/// First-match rule list.
#[derive(Clone, Debug, Default)]
pub struct RuleClassifier {
    rules: Vec<(Match, ClassId)>,
}

impl RuleClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, m: Match, class: ClassId) {
        self.rules.push((m, class));
    }

    pub fn with_rule(mut self, m: Match, class: ClassId) -> Self {
        self.add_rule(m, class);
        self
    }

    /// Drop every rule pointing at `class`.
    pub fn remove_class(&mut self, class: ClassId) {
        self.rules.retain(|&(_, c)| c != class);
    }

    pub fn rules(&self) -> &[(Match, ClassId)] {
        &self.rules
    }
}

impl Classifier for RuleClassifier {
    fn classify(&self, p: &Pkt) -> Option<ClassId> {
        let found = self
            .rules
            .iter()
            .find(|(m, _)| m.matches(p))
            .map(|&(_, c)| c);
        if found.is_none() {
            trace!(dport = p.dport(), dst = ?p.hdr().destination, "no classifier rule matched");
        }

        found
    }
}

#[cfg(test)]
mod t {
    use super::{Classifier, Match, RuleClassifier};
    use crate::scheduler::cbq::ClassId;
    use crate::t::{init, pkt, pkt_to};

    #[test]
    fn first_match_wins() {
        init();
        let a = ClassId::new(1, 0);
        let b = ClassId::new(2, 0);
        let c = RuleClassifier::new()
            .with_rule(Match::Dport(22), a)
            .with_rule(Match::DstIp(u32::from_be_bytes([10, 0, 0, 2])), b)
            .with_rule(Match::Dport(80), b);

        assert_eq!(c.classify(&pkt(22, 100)), Some(a));
        assert_eq!(c.classify(&pkt(80, 100)), Some(b));
        assert_eq!(c.classify(&pkt_to([10, 0, 0, 2], 22, 100)), Some(a));
        assert_eq!(c.classify(&pkt_to([10, 0, 0, 2], 9, 100)), Some(b));
        assert_eq!(c.classify(&pkt(443, 100)), None);
    }

    #[test]
    fn remove_class_rules() {
        init();
        let a = ClassId::new(1, 0);
        let mut c = RuleClassifier::new().with_rule(Match::Dport(22), a);
        c.remove_class(a);
        assert!(c.rules().is_empty());
        assert_eq!(c.classify(&pkt(22, 100)), None);
    }

    #[test]
    fn closure_classifier() {
        init();
        let a = ClassId::new(3, 1);
        let f = move |p: &crate::Pkt| (p.len() > 500).then_some(a);
        assert_eq!(f.classify(&pkt(1, 1000)), Some(a));
        assert_eq!(f.classify(&pkt(1, 100)), None);
    }
}
