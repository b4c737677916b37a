//! The four-stage pipeline run for one admitted envelope.

use std::{sync::Arc, time::Instant};

use {
    courier_channels::ChannelRegistry,
    courier_common::{
        Envelope, EnvelopeKind, Reply, ReplyKind,
        hooks::{HookContext, HookFlow, HookPoint, HookRegistry},
        types::attr,
    },
    courier_config::CourierConfig,
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info},
};

#[cfg(feature = "metrics")]
use courier_metrics::{counter, histogram, labels, pipeline as pipeline_metrics};

use crate::{
    Error,
    compose::{Composer, DropReason},
    decorate::{Decorator, SpeechSynthesizer},
    deliver::{Deliverer, DeliveryReport},
    generate::GeneratorRegistry,
};

/// Terminal state of one pipeline run.
#[derive(Debug)]
pub enum PipelineOutcome {
    /// Vetoed before generation. Silent.
    Dropped(DropReason),
    /// The generator (or a hook) produced nothing to send.
    NoReply,
    Delivered(DeliveryReport),
    /// The reply could not be routed; logged and swallowed.
    Failed(Error),
    /// The session was cancelled before anything was sent.
    Cancelled,
}

pub struct Pipeline {
    composer: Composer,
    generators: GeneratorRegistry,
    decorator: Decorator,
    deliverer: Deliverer,
    hooks: Arc<HookRegistry>,
    channels: Arc<ChannelRegistry>,
}

impl Pipeline {
    pub fn new(
        config: &CourierConfig,
        channels: Arc<ChannelRegistry>,
        generators: GeneratorRegistry,
    ) -> Self {
        Self {
            composer: Composer::new(config.compose.clone()),
            generators,
            decorator: Decorator::new(config.decorate.clone()),
            deliverer: Deliverer::new(config.delivery.clone()),
            hooks: Arc::new(config.hooks.registry()),
            channels,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        self.decorator = self.decorator.with_synthesizer(synthesizer);
        self
    }

    /// Run every stage for `envelope`. `cancel` is observed between stages,
    /// while waiting on the generator, and before each delivered segment.
    pub async fn run(&self, envelope: Envelope, cancel: CancellationToken) -> PipelineOutcome {
        let envelope_id = envelope.id();
        let outcome = self.run_stages(envelope, &cancel).await;

        match &outcome {
            PipelineOutcome::Dropped(reason) => {
                debug!(envelope_id = %envelope_id, reason = %reason, "envelope dropped");
                #[cfg(feature = "metrics")]
                counter!(pipeline_metrics::ENVELOPES_DROPPED_TOTAL, labels::REASON => reason.as_str())
                    .increment(1);
            },
            PipelineOutcome::NoReply => {
                debug!(envelope_id = %envelope_id, "no reply produced");
                #[cfg(feature = "metrics")]
                counter!(pipeline_metrics::NO_REPLY_TOTAL).increment(1);
            },
            PipelineOutcome::Delivered(report) => {
                debug!(
                    envelope_id = %envelope_id,
                    sent = report.sent,
                    failed = report.failed,
                    skipped = report.skipped,
                    "reply delivered"
                );
            },
            PipelineOutcome::Failed(e) => {
                error!(envelope_id = %envelope_id, error = %e, "pipeline failed");
            },
            PipelineOutcome::Cancelled => {
                info!(envelope_id = %envelope_id, "pipeline run cancelled");
                #[cfg(feature = "metrics")]
                counter!(pipeline_metrics::RUNS_CANCELLED_TOTAL).increment(1);
            },
        }
        outcome
    }

    async fn run_stages(&self, envelope: Envelope, cancel: &CancellationToken) -> PipelineOutcome {
        // on_receive + compose
        let mut ctx = HookContext::new(HookPoint::OnReceive, envelope, None);
        if self.hooks.dispatch(&mut ctx).await == HookFlow::Stop {
            return PipelineOutcome::Dropped(DropReason::HookStopped);
        }
        let envelope = match timed("compose", || self.composer.compose(ctx.envelope)) {
            Ok(envelope) => envelope,
            Err(reason) => return PipelineOutcome::Dropped(reason),
        };

        // on_generate + generate
        let (envelope, reply) = match self.generate(envelope, cancel).await {
            Generated::Reply(envelope, reply) => (envelope, reply),
            Generated::Nothing => return PipelineOutcome::NoReply,
            Generated::Dropped(reason) => return PipelineOutcome::Dropped(reason),
            Generated::Cancelled => return PipelineOutcome::Cancelled,
        };
        if cancel.is_cancelled() {
            return PipelineOutcome::Cancelled;
        }

        let Some(outbound) = self.channels.resolve(&envelope) else {
            return PipelineOutcome::Failed(Error::no_transport(
                envelope.id(),
                envelope.attr_str(attr::CHANNEL),
            ));
        };
        let receiver = match envelope.require_str(attr::RECEIVER) {
            Ok(receiver) => receiver.to_string(),
            Err(e) => return PipelineOutcome::Failed(e.into()),
        };

        // on_decorate + decorate
        let mut ctx = HookContext::new(HookPoint::OnDecorate, envelope, Some(reply));
        let flow = self.hooks.dispatch(&mut ctx).await;
        let envelope = ctx.envelope;
        let Some(reply) = ctx.reply else {
            return PipelineOutcome::NoReply;
        };
        let segments = if flow == HookFlow::Stop {
            vec![reply]
        } else {
            let start = Instant::now();
            let segments = self
                .decorator
                .decorate(&envelope, reply, outbound.as_ref())
                .await;
            record_stage("decorate", start);
            segments
        };

        // on_deliver + deliver
        let start = Instant::now();
        let report = self
            .deliverer
            .deliver(
                outbound.as_ref(),
                &receiver,
                &envelope,
                segments,
                &self.hooks,
                cancel,
            )
            .await;
        record_stage("deliver", start);

        if report.cancelled && report.sent == 0 {
            PipelineOutcome::Cancelled
        } else {
            PipelineOutcome::Delivered(report)
        }
    }

    /// Generate a reply. A VOICE envelope whose generator returns a TEXT
    /// transcript is re-run through compose and generate as a derived TEXT
    /// envelope with its own identity.
    async fn generate(&self, envelope: Envelope, cancel: &CancellationToken) -> Generated {
        let (envelope, reply) = match self.generate_once(envelope, cancel).await {
            Generated::Reply(envelope, reply) => (envelope, reply),
            other => return other,
        };

        if envelope.kind() != EnvelopeKind::Voice || reply.kind != ReplyKind::Text {
            return Generated::Reply(envelope, reply);
        }

        let transcript = reply.as_text().unwrap_or_default();
        let derived = envelope.derive(EnvelopeKind::Text, transcript);
        debug!(
            envelope_id = %envelope.id(),
            derived_id = %derived.id(),
            "voice transcribed, generating reply for text"
        );
        let derived = match self.composer.compose(derived) {
            Ok(derived) => derived,
            Err(reason) => return Generated::Dropped(reason),
        };
        self.generate_once(derived, cancel).await
    }

    async fn generate_once(&self, envelope: Envelope, cancel: &CancellationToken) -> Generated {
        if cancel.is_cancelled() {
            return Generated::Cancelled;
        }

        let mut ctx = HookContext::new(HookPoint::OnGenerate, envelope, None);
        if self.hooks.dispatch(&mut ctx).await == HookFlow::Stop {
            return match ctx.reply {
                Some(reply) => Generated::Reply(ctx.envelope, reply),
                None => Generated::Nothing,
            };
        }
        let envelope = ctx.envelope;

        let start = Instant::now();
        let reply = tokio::select! {
            () = cancel.cancelled() => return Generated::Cancelled,
            reply = self.generators.generate(&envelope) => reply,
        };
        record_stage("generate", start);

        match reply {
            Some(reply) => Generated::Reply(envelope, reply),
            None => Generated::Nothing,
        }
    }
}

enum Generated {
    Reply(Envelope, Reply),
    Nothing,
    Dropped(DropReason),
    Cancelled,
}

fn timed<T>(stage: &'static str, f: impl FnOnce() -> T) -> T {
    let start = Instant::now();
    let out = f();
    record_stage(stage, start);
    out
}

#[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
fn record_stage(stage: &'static str, start: Instant) {
    #[cfg(feature = "metrics")]
    histogram!(pipeline_metrics::STAGE_DURATION_SECONDS, labels::STAGE => stage)
        .record(start.elapsed().as_secs_f64());
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::generate::ReplyGenerator,
        async_trait::async_trait,
        courier_channels::{ChannelOutbound, gating::GroupPolicy},
        courier_common::hooks::HookHandler,
        std::sync::Mutex,
    };

    /// Records `(transport, to, text)` for every send.
    struct Recorder {
        id: &'static str,
        sent: Arc<Mutex<Vec<(String, String, String)>>>,
    }

    #[async_trait]
    impl ChannelOutbound for Recorder {
        fn id(&self) -> &str {
            self.id
        }

        async fn send(&self, to: &str, reply: &Reply, _envelope: &Envelope) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push((
                self.id.to_string(),
                to.to_string(),
                reply.as_text().unwrap_or_default().to_string(),
            ));
            Ok(())
        }
    }

    /// Echoes text back; transcribes voice to a fixed string.
    struct Scripted;

    #[async_trait]
    impl ReplyGenerator for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn kinds(&self) -> &[EnvelopeKind] {
            &[EnvelopeKind::Text, EnvelopeKind::Voice]
        }

        async fn generate(&self, envelope: &Envelope) -> anyhow::Result<Option<Reply>> {
            match envelope.kind() {
                EnvelopeKind::Voice => Ok(Some(Reply::text("what time is it"))),
                _ => match envelope.text_payload() {
                    Some("fail") => anyhow::bail!("model unavailable"),
                    Some("quiet") => Ok(None),
                    Some("what time is it") => Ok(Some(Reply::text("noon"))),
                    Some(text) => Ok(Some(Reply::text(text))),
                    None => Ok(None),
                },
            }
        }
    }

    struct Harness {
        pipeline: Pipeline,
        sent: Arc<Mutex<Vec<(String, String, String)>>>,
    }

    impl Harness {
        fn new(config: CourierConfig, hooks: HookRegistry) -> Self {
            let sent = Arc::new(Mutex::new(Vec::new()));
            let mut channels = ChannelRegistry::new();
            for id in ["console", "side"] {
                channels
                    .register(Arc::new(Recorder {
                        id,
                        sent: Arc::clone(&sent),
                    }))
                    .unwrap();
            }
            let mut generators = GeneratorRegistry::new();
            generators.register(Arc::new(Scripted)).unwrap();
            let pipeline = Pipeline::new(&config, Arc::new(channels), generators)
                .with_hooks(Arc::new(hooks));
            Self { pipeline, sent }
        }

        fn texts(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(_, _, text)| text.clone())
                .collect()
        }

        async fn run(&self, envelope: Envelope) -> PipelineOutcome {
            self.pipeline.run(envelope, CancellationToken::new()).await
        }
    }

    fn direct(text: &str) -> Envelope {
        Envelope::text(text)
            .with_attribute(attr::SESSION_ID, "u1")
            .with_attribute(attr::RECEIVER, "u1")
            .with_attribute(attr::SENDER_ID, "u1")
    }

    #[tokio::test]
    async fn segmented_reply_delivered_in_order() {
        let harness = Harness::new(CourierConfig::default(), HookRegistry::new());
        let outcome = harness.run(direct("seg1/$seg2/$seg3")).await;
        assert!(matches!(outcome, PipelineOutcome::Delivered(DeliveryReport { sent: 3, .. })));
        assert_eq!(harness.texts(), vec!["seg1", "seg2", "seg3"]);
    }

    #[tokio::test]
    async fn vetoed_group_sends_nothing() {
        let mut config = CourierConfig::default();
        config.compose.group_policy = GroupPolicy::Allowlist;
        config.compose.group_allowlist = vec!["ops".into()];
        let harness = Harness::new(config, HookRegistry::new());
        let envelope = direct("hello")
            .with_attribute(attr::IS_GROUP, true)
            .with_attribute(attr::GROUP_ID, "family")
            .with_attribute(attr::MENTIONED, true);
        let outcome = harness.run(envelope).await;
        assert!(matches!(
            outcome,
            PipelineOutcome::Dropped(DropReason::GroupNotAllowed)
        ));
        assert!(harness.texts().is_empty());
    }

    #[tokio::test]
    async fn voice_is_transcribed_then_answered() {
        let harness = Harness::new(CourierConfig::default(), HookRegistry::new());
        let voice = Envelope::new(EnvelopeKind::Voice, courier_common::Payload::Path("/tmp/v.ogg".into()))
            .with_attribute(attr::SESSION_ID, "u1")
            .with_attribute(attr::RECEIVER, "u1");
        harness.run(voice).await;
        assert_eq!(harness.texts(), vec!["noon"]);
    }

    #[tokio::test]
    async fn voice_is_answered_when_direct_prefix_required() {
        let mut config = CourierConfig::default();
        config.compose.direct_prefixes = vec!["bot ".into()];
        let harness = Harness::new(config, HookRegistry::new());
        let voice = Envelope::new(EnvelopeKind::Voice, courier_common::Payload::Path("/tmp/v.ogg".into()))
            .with_attribute(attr::SESSION_ID, "u1")
            .with_attribute(attr::RECEIVER, "u1")
            .with_attribute(attr::SENDER_ID, "u1");
        let outcome = harness.run(voice).await;
        assert!(matches!(outcome, PipelineOutcome::Delivered(DeliveryReport { sent: 1, .. })));
        assert_eq!(harness.texts(), vec!["noon"]);

        // Typed text still needs the prefix.
        assert!(matches!(
            harness.run(direct("what time is it")).await,
            PipelineOutcome::Dropped(DropReason::MissingPrefix)
        ));
    }

    #[tokio::test]
    async fn generator_failure_reaches_sender_as_error() {
        let harness = Harness::new(CourierConfig::default(), HookRegistry::new());
        harness.run(direct("fail")).await;
        assert_eq!(harness.texts(), vec!["[ERROR]\nmodel unavailable"]);
    }

    #[tokio::test]
    async fn silent_generator_is_no_reply() {
        let harness = Harness::new(CourierConfig::default(), HookRegistry::new());
        assert!(matches!(
            harness.run(direct("quiet")).await,
            PipelineOutcome::NoReply
        ));
        assert!(harness.texts().is_empty());
    }

    #[tokio::test]
    async fn channel_attribute_selects_transport() {
        let harness = Harness::new(CourierConfig::default(), HookRegistry::new());
        harness
            .run(direct("hi").with_attribute(attr::CHANNEL, "side"))
            .await;
        harness.run(direct("hi")).await;
        let transports: Vec<String> = harness
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|(id, ..)| id.clone())
            .collect();
        assert_eq!(transports, vec!["side", "console"]);
    }

    #[tokio::test]
    async fn missing_receiver_fails_without_sending() {
        let harness = Harness::new(CourierConfig::default(), HookRegistry::new());
        let envelope = Envelope::text("hi").with_attribute(attr::SESSION_ID, "u1");
        assert!(matches!(
            harness.run(envelope).await,
            PipelineOutcome::Failed(_)
        ));
        assert!(harness.texts().is_empty());
    }

    #[tokio::test]
    async fn cancelled_run_sends_nothing() {
        let harness = Harness::new(CourierConfig::default(), HookRegistry::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = harness.pipeline.run(direct("hello"), cancel).await;
        assert!(matches!(outcome, PipelineOutcome::Cancelled));
        assert!(harness.texts().is_empty());
    }

    /// Stops at its point, optionally injecting a reply.
    struct StopAt {
        point: [HookPoint; 1],
        reply: Option<&'static str>,
    }

    #[async_trait]
    impl HookHandler for StopAt {
        fn name(&self) -> &str {
            "stop-at"
        }

        fn points(&self) -> &[HookPoint] {
            &self.point
        }

        async fn handle(&self, ctx: &mut HookContext) -> anyhow::Result<HookFlow> {
            if let Some(text) = self.reply {
                ctx.reply = Some(Reply::text(text));
            }
            Ok(HookFlow::Stop)
        }
    }

    fn hooks(point: HookPoint, reply: Option<&'static str>) -> HookRegistry {
        let mut registry = HookRegistry::new();
        registry.register(Arc::new(StopAt {
            point: [point],
            reply,
        }));
        registry
    }

    #[tokio::test]
    async fn receive_hook_can_drop() {
        let harness = Harness::new(
            CourierConfig::default(),
            hooks(HookPoint::OnReceive, None),
        );
        assert!(matches!(
            harness.run(direct("hello")).await,
            PipelineOutcome::Dropped(DropReason::HookStopped)
        ));
        assert!(harness.texts().is_empty());
    }

    #[tokio::test]
    async fn generate_hook_replaces_generator() {
        let harness = Harness::new(
            CourierConfig::default(),
            hooks(HookPoint::OnGenerate, Some("from hook")),
        );
        harness.run(direct("fail")).await;
        assert_eq!(harness.texts(), vec!["from hook"]);
    }

    #[tokio::test]
    async fn decorate_hook_skips_decoration() {
        let harness = Harness::new(
            CourierConfig::default(),
            hooks(HookPoint::OnDecorate, None),
        );
        harness.run(direct("a/$b")).await;
        assert_eq!(harness.texts(), vec!["a/$b"]);
    }

    struct PanicsAt(HookPoint);

    #[async_trait]
    impl HookHandler for PanicsAt {
        fn name(&self) -> &str {
            "panics"
        }

        fn points(&self) -> &[HookPoint] {
            std::slice::from_ref(&self.0)
        }

        async fn handle(&self, ctx: &mut HookContext) -> anyhow::Result<HookFlow> {
            ctx.reply = None;
            panic!("hook bug");
        }
    }

    #[tokio::test]
    async fn panicking_hook_does_not_lose_the_reply() {
        for point in [HookPoint::OnDecorate, HookPoint::OnDeliver] {
            let mut registry = HookRegistry::new();
            registry.register(Arc::new(PanicsAt(point)));
            let harness = Harness::new(CourierConfig::default(), registry);
            let outcome = harness.run(direct("hi")).await;
            assert!(
                matches!(outcome, PipelineOutcome::Delivered(DeliveryReport { sent: 1, .. })),
                "{point}: {outcome:?}"
            );
            assert_eq!(harness.texts(), vec!["hi"]);
        }
    }

    #[tokio::test]
    async fn configured_breaker_disables_panicking_hook() {
        let mut config = CourierConfig::default();
        config.hooks.circuit_breaker_threshold = 1;
        let mut registry = config.hooks.registry();
        registry.register(Arc::new(PanicsAt(HookPoint::OnDecorate)));
        let harness = Harness::new(config, registry);

        for _ in 0..3 {
            harness.run(direct("hi")).await;
        }
        assert_eq!(harness.texts(), vec!["hi", "hi", "hi"]);

        let stats = harness.pipeline.hooks.handler_stats("panics").unwrap();
        assert_eq!(stats.call_count.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert!(stats.disabled.load(std::sync::atomic::Ordering::Relaxed));
    }
}
