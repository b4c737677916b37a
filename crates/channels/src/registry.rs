use std::{collections::HashMap, sync::Arc};

use {
    courier_common::{Envelope, types::attr},
    tracing::{debug, info},
};

#[cfg(feature = "metrics")]
use courier_metrics::{channels as ch_metrics, gauge};

use crate::{Error, Result, outbound::ChannelOutbound};

/// Registry of outbound transports, keyed by transport id.
///
/// The first registered transport becomes the default unless another one is
/// selected with [`ChannelRegistry::set_default`].
#[derive(Default)]
pub struct ChannelRegistry {
    outbounds: HashMap<String, Arc<dyn ChannelOutbound>>,
    default_id: Option<String>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, outbound: Arc<dyn ChannelOutbound>) -> Result<()> {
        let id = outbound.id().to_string();
        if self.outbounds.contains_key(&id) {
            return Err(Error::invalid_input(format!(
                "transport `{id}` is already registered"
            )));
        }
        if self.default_id.is_none() {
            self.default_id = Some(id.clone());
        }
        info!(channel = %id, "channel transport registered");
        self.outbounds.insert(id, outbound);
        #[cfg(feature = "metrics")]
        gauge!(ch_metrics::ACTIVE).set(self.outbounds.len() as f64);
        Ok(())
    }

    pub fn set_default(&mut self, id: &str) -> Result<()> {
        if !self.outbounds.contains_key(id) {
            return Err(Error::unknown_transport(id));
        }
        self.default_id = Some(id.to_string());
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ChannelOutbound>> {
        self.outbounds.get(id).map(Arc::clone)
    }

    pub fn default_outbound(&self) -> Option<Arc<dyn ChannelOutbound>> {
        self.default_id.as_deref().and_then(|id| self.get(id))
    }

    /// Transport that should carry the reply to `envelope`: the one named by
    /// its `channel` attribute when registered, otherwise the default.
    pub fn resolve(&self, envelope: &Envelope) -> Option<Arc<dyn ChannelOutbound>> {
        if let Some(id) = envelope.attr_str(attr::CHANNEL) {
            if let Some(outbound) = self.get(id) {
                return Some(outbound);
            }
            debug!(channel = id, "originating transport not registered, using default");
        }
        self.default_outbound()
    }

    pub fn list(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.outbounds.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}
