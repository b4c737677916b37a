//! Compose stage: routing and filtering derived from the raw envelope.
//!
//! Pure function of the envelope and [`ComposeConfig`]; no I/O.

use std::fmt;

use {
    courier_channels::gating::{self, MentionMode},
    courier_common::{Envelope, EnvelopeKind, ReplyKind, types::attr},
    courier_config::ComposeConfig,
    tracing::debug,
};

/// Why an envelope was dropped before a reply was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Sent by the bot itself.
    FromSelf,
    BlockedSender,
    GroupNotAllowed,
    /// Group message that does not address the bot.
    NotAddressed,
    DirectNotAllowed,
    /// Direct message without a required prefix.
    MissingPrefix,
    EmptyText,
    /// An on_receive hook stopped the pipeline.
    HookStopped,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FromSelf => "from_self",
            Self::BlockedSender => "blocked_sender",
            Self::GroupNotAllowed => "group_not_allowed",
            Self::NotAddressed => "not_addressed",
            Self::DirectNotAllowed => "direct_not_allowed",
            Self::MissingPrefix => "missing_prefix",
            Self::EmptyText => "empty_text",
            Self::HookStopped => "hook_stopped",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Composer {
    config: ComposeConfig,
}

impl Composer {
    pub fn new(config: ComposeConfig) -> Self {
        Self { config }
    }

    /// Apply access policies and strip routing prefixes. Returns the
    /// envelope to process, or why it was vetoed.
    pub fn compose(&self, mut envelope: Envelope) -> Result<Envelope, DropReason> {
        let cfg = &self.config;

        if envelope.attr_bool(attr::FROM_SELF) {
            return Err(DropReason::FromSelf);
        }

        let sender = envelope
            .attr_str(attr::SENDER_ID)
            .or_else(|| envelope.receiver())
            .unwrap_or_default()
            .to_string();
        if !sender.is_empty() && gating::matches_any(&sender, &cfg.sender_blocklist) {
            return Err(DropReason::BlockedSender);
        }

        let text = envelope.text_payload().map(str::to_string);

        let text = if envelope.is_group() {
            self.compose_group(&mut envelope, text)?
        } else {
            let transcript = envelope.is_derived_from(EnvelopeKind::Voice);
            self.compose_direct(&sender, text, transcript)?
        };

        if let Some(text) = text {
            let text = text.trim();
            if text.is_empty() {
                return Err(DropReason::EmptyText);
            }
            envelope = match strip_any_prefix(text, &cfg.image_create_prefixes) {
                Some(prompt) if !prompt.trim().is_empty() => {
                    envelope.rewrite(EnvelopeKind::ImageCreate, prompt.trim())
                },
                Some(_) => return Err(DropReason::EmptyText),
                None => {
                    let kind = envelope.kind();
                    envelope.rewrite(kind, text)
                },
            };
        }

        if envelope.desired_reply_kind().is_none() {
            let wants_voice = match envelope.kind() {
                EnvelopeKind::Voice => cfg.voice_reply_to_voice,
                EnvelopeKind::Text => cfg.text_reply_as_voice,
                _ => false,
            };
            if wants_voice {
                envelope.set_attribute(attr::DESIRED_REPLY_KIND, ReplyKind::Voice.as_str());
            }
        }

        debug!(
            envelope_id = %envelope.id(),
            kind = %envelope.kind(),
            group = envelope.is_group(),
            "envelope composed"
        );
        Ok(envelope)
    }

    fn compose_group(
        &self,
        envelope: &mut Envelope,
        text: Option<String>,
    ) -> Result<Option<String>, DropReason> {
        let cfg = &self.config;
        let group_id = envelope
            .attr_str(attr::GROUP_ID)
            .or_else(|| envelope.session_id())
            .unwrap_or_default();
        let group_name = envelope.attr_str(attr::GROUP_NAME);
        if !cfg
            .group_policy
            .admits(group_id, group_name, &cfg.group_allowlist)
        {
            return Err(DropReason::GroupNotAllowed);
        }

        let mut mentioned = envelope.attr_bool(attr::MENTIONED);
        let Some(mut text) = text else {
            // Non-text group content only reaches the bot when addressed.
            return match cfg.mention_mode {
                MentionMode::Always => Ok(None),
                MentionMode::Mention if mentioned => Ok(None),
                _ => Err(DropReason::NotAddressed),
            };
        };

        if let Some(bot) = cfg.bot_name.as_deref().filter(|name| !name.is_empty()) {
            let tag = format!("@{bot}");
            if text.contains(&tag) {
                text = text.replacen(&tag, "", 1);
                mentioned = true;
            }
        }

        match cfg.mention_mode {
            MentionMode::None => Err(DropReason::NotAddressed),
            MentionMode::Always => Ok(Some(
                strip_any_prefix(text.trim_start(), &cfg.group_prefixes)
                    .map_or(text.clone(), str::to_string),
            )),
            MentionMode::Mention => {
                if let Some(rest) = strip_any_prefix(text.trim_start(), &cfg.group_prefixes) {
                    return Ok(Some(rest.to_string()));
                }
                if mentioned {
                    envelope.set_attribute(attr::MENTIONED, true);
                    return Ok(Some(text));
                }
                let lowered = text.to_lowercase();
                if cfg
                    .group_keywords
                    .iter()
                    .any(|kw| !kw.is_empty() && lowered.contains(&kw.to_lowercase()))
                {
                    return Ok(Some(text));
                }
                Err(DropReason::NotAddressed)
            },
        }
    }

    /// Voice transcripts skip the prefix requirement; nobody speaks it.
    fn compose_direct(
        &self,
        sender: &str,
        text: Option<String>,
        transcript: bool,
    ) -> Result<Option<String>, DropReason> {
        let cfg = &self.config;
        if !cfg.dm_policy.admits(sender, &cfg.dm_allowlist) {
            return Err(DropReason::DirectNotAllowed);
        }
        match text {
            Some(text) if !cfg.direct_prefixes.is_empty() && !transcript => {
                strip_any_prefix(text.trim_start(), &cfg.direct_prefixes)
                    .map(|rest| Some(rest.to_string()))
                    .ok_or(DropReason::MissingPrefix)
            },
            other => Ok(other),
        }
    }
}

fn strip_any_prefix<'a>(text: &'a str, prefixes: &[String]) -> Option<&'a str> {
    prefixes
        .iter()
        .filter(|prefix| !prefix.is_empty())
        .find_map(|prefix| text.strip_prefix(prefix.as_str()))
}
