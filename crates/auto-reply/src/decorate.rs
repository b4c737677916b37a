//! Decorate stage: presentation transforms applied before delivery.

use std::{panic::AssertUnwindSafe, sync::Arc};

use {
    async_trait::async_trait,
    courier_channels::{ChannelOutbound, Error as ChannelError},
    courier_common::{Envelope, Reply, ReplyContent, ReplyKind, panic_message, types::attr},
    courier_config::DecorateConfig,
    futures::FutureExt,
    tracing::{debug, error, warn},
};

/// Text-to-speech back end used when a voice reply is wanted.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Returns a VOICE reply carrying the synthesized audio.
    async fn synthesize(&self, text: &str) -> anyhow::Result<Reply>;
}

pub struct Decorator {
    config: DecorateConfig,
    synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
}

impl Decorator {
    pub fn new(config: DecorateConfig) -> Self {
        Self {
            config,
            synthesizer: None,
        }
    }

    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    fn is_unsupported(&self, kind: ReplyKind, outbound: &dyn ChannelOutbound) -> bool {
        self.config.unsupported_reply_kinds.contains(&kind)
            || outbound.unsupported_reply_kinds().contains(&kind)
    }

    /// Turn one reply into the ordered segments to deliver.
    pub async fn decorate(
        &self,
        envelope: &Envelope,
        reply: Reply,
        outbound: &dyn ChannelOutbound,
    ) -> Vec<Reply> {
        let reply = if reply.kind != ReplyKind::Error && self.is_unsupported(reply.kind, outbound) {
            debug!(
                envelope_id = %envelope.id(),
                channel = outbound.id(),
                kind = %reply.kind,
                "reply kind unsupported by transport"
            );
            Reply::error(
                ChannelError::UnsupportedReply {
                    channel_id: outbound.id().to_string(),
                    kind: reply.kind,
                }
                .to_string(),
            )
        } else {
            reply
        };

        match reply.kind {
            ReplyKind::Error | ReplyKind::Info => {
                let tag = if reply.kind == ReplyKind::Error {
                    "[ERROR]"
                } else {
                    "[INFO]"
                };
                let body = reply.as_text().unwrap_or_default();
                let content = ReplyContent::Text(format!("{tag}\n{body}"));
                vec![Reply::new(reply.kind, content)]
            },
            ReplyKind::Text => self.decorate_text(envelope, reply, outbound).await,
            _ => vec![reply],
        }
    }

    async fn decorate_text(
        &self,
        envelope: &Envelope,
        reply: Reply,
        outbound: &dyn ChannelOutbound,
    ) -> Vec<Reply> {
        let text = reply.as_text().unwrap_or_default().trim().to_string();

        if envelope.desired_reply_kind() == Some(ReplyKind::Voice)
            && !self.is_unsupported(ReplyKind::Voice, outbound)
            && let Some(synthesizer) = &self.synthesizer
        {
            match AssertUnwindSafe(synthesizer.synthesize(&text))
                .catch_unwind()
                .await
            {
                Ok(Ok(voice)) => return vec![voice],
                Ok(Err(e)) => {
                    warn!(
                        envelope_id = %envelope.id(),
                        error = %e,
                        "speech synthesis failed, replying with text"
                    );
                },
                Err(panic) => {
                    error!(
                        envelope_id = %envelope.id(),
                        panic = %panic_message(panic.as_ref()),
                        "speech synthesizer panicked, replying with text"
                    );
                },
            }
        }

        let cfg = &self.config;
        let wrapped = if envelope.is_group() {
            let mention = match envelope.attr_str(attr::SENDER_NAME) {
                Some(name)
                    if cfg.mention_sender
                        && !name.is_empty()
                        && !envelope.attr_bool(attr::NO_MENTION) =>
                {
                    format!("@{name}\n")
                },
                _ => String::new(),
            };
            format!(
                "{}{mention}{text}{}",
                cfg.group_reply_prefix, cfg.group_reply_suffix
            )
        } else {
            format!(
                "{}{text}{}",
                cfg.direct_reply_prefix, cfg.direct_reply_suffix
            )
        };

        split_segments(&wrapped, &cfg.segment_delimiter)
    }
}

/// Split a text body into TEXT segments on `delimiter`, dropping blank pieces.
pub fn split_segments(text: &str, delimiter: &str) -> Vec<Reply> {
    if delimiter.is_empty() {
        return vec![Reply::text(text)];
    }
    let segments: Vec<Reply> = text
        .split(delimiter)
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(Reply::text)
        .collect();
    if segments.is_empty() {
        vec![Reply::text(text)]
    } else {
        segments
    }
}
