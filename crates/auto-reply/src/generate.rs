//! Generate stage: kind-keyed registry of reply back ends.

use std::{collections::HashMap, panic::AssertUnwindSafe, sync::Arc};

use {
    async_trait::async_trait,
    courier_common::{Envelope, EnvelopeKind, Reply, panic_message},
    futures::FutureExt,
    tracing::{debug, error, info, warn},
};

#[cfg(feature = "metrics")]
use courier_metrics::{counter, labels, pipeline as pipeline_metrics};

use crate::{Error, Result};

/// A reply back end (LLM completion, speech-to-text, friend-request policy).
///
/// Implementations own their retry and timeout policy.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    fn name(&self) -> &str;

    /// Envelope kinds this generator handles.
    fn kinds(&self) -> &[EnvelopeKind];

    /// Produce a reply, or `None` to stay silent.
    async fn generate(&self, envelope: &Envelope) -> anyhow::Result<Option<Reply>>;
}

/// Generators keyed by the envelope kind they handle. Built once at startup.
#[derive(Default)]
pub struct GeneratorRegistry {
    by_kind: HashMap<EnvelopeKind, Arc<dyn ReplyGenerator>>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a generator for every kind it declares. A kind can only have
    /// one generator.
    pub fn register(&mut self, generator: Arc<dyn ReplyGenerator>) -> Result<()> {
        for kind in generator.kinds() {
            if let Some(existing) = self.by_kind.get(kind) {
                return Err(Error::DuplicateGenerator {
                    kind: *kind,
                    existing: existing.name().to_string(),
                });
            }
        }
        for kind in generator.kinds() {
            self.by_kind.insert(*kind, Arc::clone(&generator));
        }
        info!(
            generator = generator.name(),
            kinds = ?generator.kinds(),
            "reply generator registered"
        );
        Ok(())
    }

    pub fn get(&self, kind: EnvelopeKind) -> Option<&Arc<dyn ReplyGenerator>> {
        self.by_kind.get(&kind)
    }

    /// Run the generator for the envelope's kind.
    ///
    /// Back-end failures and panics come back as ERROR replies so the sender
    /// sees something instead of silence.
    pub async fn generate(&self, envelope: &Envelope) -> Option<Reply> {
        let Some(generator) = self.get(envelope.kind()) else {
            debug!(
                envelope_id = %envelope.id(),
                kind = %envelope.kind(),
                "no generator for envelope kind"
            );
            return None;
        };

        match AssertUnwindSafe(generator.generate(envelope))
            .catch_unwind()
            .await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                warn!(
                    generator = generator.name(),
                    envelope_id = %envelope.id(),
                    error = %e,
                    "reply generation failed"
                );
                #[cfg(feature = "metrics")]
                counter!(pipeline_metrics::GENERATOR_ERRORS_TOTAL, labels::KIND => envelope.kind().as_str()).increment(1);
                Some(Reply::error(e.to_string()))
            },
            Err(panic) => {
                let detail = panic_message(panic.as_ref());
                error!(
                    generator = generator.name(),
                    envelope_id = %envelope.id(),
                    panic = %detail,
                    "reply generator panicked"
                );
                #[cfg(feature = "metrics")]
                counter!(pipeline_metrics::GENERATOR_ERRORS_TOTAL, labels::KIND => envelope.kind().as_str()).increment(1);
                Some(Reply::error("internal error while generating a reply"))
            },
        }
    }
}
