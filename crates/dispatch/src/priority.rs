//! Which envelopes skip ahead in their session's queue.

use courier_common::Envelope;

pub trait PriorityRule: Send + Sync {
    fn is_priority(&self, envelope: &Envelope) -> bool;
}

impl<F> PriorityRule for F
where
    F: Fn(&Envelope) -> bool + Send + Sync,
{
    fn is_priority(&self, envelope: &Envelope) -> bool {
        self(envelope)
    }
}

/// Text envelopes starting with one of the configured prefixes (administrative
/// commands such as `#reset`) are priority.
#[derive(Debug, Clone, Default)]
pub struct PrefixPriority {
    prefixes: Vec<String>,
}

impl PrefixPriority {
    pub fn new(prefixes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(Into::into)
                .filter(|prefix: &String| !prefix.is_empty())
                .collect(),
        }
    }
}

impl PriorityRule for PrefixPriority {
    fn is_priority(&self, envelope: &Envelope) -> bool {
        envelope.text_payload().is_some_and(|text| {
            let text = text.trim_start();
            self.prefixes.iter().any(|prefix| text.starts_with(prefix.as_str()))
        })
    }
}

#[cfg(test)]
mod tests {
    use {super::*, courier_common::EnvelopeKind, rstest::rstest};

    #[rstest]
    #[case("#reset", true)]
    #[case("  #help", true)]
    #[case("hello #reset", false)]
    #[case("!stop", true)]
    #[case("", false)]
    fn prefix_rule(#[case] text: &str, #[case] expected: bool) {
        let rule = PrefixPriority::new(["#", "!"]);
        assert_eq!(rule.is_priority(&Envelope::text(text)), expected);
    }

    #[test]
    fn non_text_never_priority() {
        let rule = PrefixPriority::new(["#"]);
        let image = Envelope::new(
            EnvelopeKind::Image,
            courier_common::Payload::Path("/tmp/#1.png".into()),
        );
        assert!(!rule.is_priority(&image));
    }

    #[test]
    fn empty_prefixes_ignored() {
        let rule = PrefixPriority::new([""]);
        assert!(!rule.is_priority(&Envelope::text("anything")));
    }

    #[test]
    fn closures_are_rules() {
        let rule = |envelope: &Envelope| envelope.kind() == EnvelopeKind::System;
        assert!(rule.is_priority(&Envelope::new(EnvelopeKind::System, "restart")));
    }
}
