//! PMode storage
//!
//! Configured PModes are loaded once and handed out as shared immutable
//! snapshots.

use hashbrown::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::config::PModeConfig;
use crate::errors::{MshError, MshResult, ResolutionError};
use crate::pmode::{ReceivingPMode, ReplyPattern, SendingPMode};
use crate::types::Mep;

/// Source of configured PModes
pub trait PModeProvider: Send + Sync {
    /// All receiving PModes, in configuration order
    fn receiving_pmodes(&self) -> Vec<Arc<ReceivingPMode>>;

    /// Sending PMode with the given id
    fn sending_pmode(&self, id: &str) -> Option<Arc<SendingPMode>>;

    /// All sending PModes
    fn sending_pmodes(&self) -> Vec<Arc<SendingPMode>>;

    /// Sending PMode with the given id, or a configuration error
    fn require_sending_pmode(&self, id: &str) -> MshResult<Arc<SendingPMode>> {
        self.sending_pmode(id).ok_or_else(|| {
            MshError::from(ResolutionError::UnknownPModeId {
                pmode_id: id.to_string(),
            })
        })
    }
}

/// PMode store held entirely in memory
#[derive(Debug, Default)]
pub struct InMemoryPModeStore {
    receiving: Vec<Arc<ReceivingPMode>>,
    sending: HashMap<String, Arc<SendingPMode>>,
}

impl InMemoryPModeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from configuration, rejecting inconsistent PModes
    pub fn from_config(config: &PModeConfig) -> MshResult<Self> {
        let mut store = Self::new();
        for pmode in &config.receiving {
            store.add_receiving(pmode.clone())?;
        }
        for pmode in &config.sending {
            store.add_sending(pmode.clone())?;
        }
        store.validate_references()?;
        info!(
            receiving = store.receiving.len(),
            sending = store.sending.len(),
            "PMode store loaded"
        );
        Ok(store)
    }

    pub fn add_receiving(&mut self, pmode: ReceivingPMode) -> MshResult<()> {
        if pmode.id.is_empty() {
            return Err(MshError::config_error("Receiving PMode without id"));
        }
        if self.receiving.iter().any(|existing| existing.id == pmode.id) {
            return Err(MshError::config_error(format!(
                "Duplicate receiving PMode id {}",
                pmode.id
            )));
        }
        self.receiving.push(Arc::new(pmode));
        Ok(())
    }

    pub fn add_sending(&mut self, pmode: SendingPMode) -> MshResult<()> {
        if pmode.id.is_empty() {
            return Err(MshError::config_error("Sending PMode without id"));
        }
        if pmode.mep == Mep::Push && pmode.push_url().is_none() && pmode.dynamic_discovery.is_none() {
            return Err(MshError::config_error(format!(
                "Push sending PMode {} has neither a url nor dynamic discovery",
                pmode.id
            )));
        }
        if self.sending.contains_key(&pmode.id) {
            return Err(MshError::config_error(format!(
                "Duplicate sending PMode id {}",
                pmode.id
            )));
        }
        self.sending.insert(pmode.id.clone(), Arc::new(pmode));
        Ok(())
    }

    /// Callback reply patterns must point at an existing sending PMode
    fn validate_references(&self) -> MshResult<()> {
        for pmode in &self.receiving {
            let reply = &pmode.reply_handling;
            if reply.reply_pattern == ReplyPattern::Callback && reply.sending_pmode_id.is_none() {
                return Err(MshError::config_error(format!(
                    "Receiving PMode {} uses the Callback reply pattern without a sending PMode",
                    pmode.id
                )));
            }
            if let Some(id) = &reply.sending_pmode_id {
                if !self.sending.contains_key(id) {
                    return Err(MshError::config_error(format!(
                        "Receiving PMode {} references unknown sending PMode {}",
                        pmode.id, id
                    )));
                }
            }
        }
        Ok(())
    }
}

impl PModeProvider for InMemoryPModeStore {
    fn receiving_pmodes(&self) -> Vec<Arc<ReceivingPMode>> {
        self.receiving.clone()
    }

    fn sending_pmode(&self, id: &str) -> Option<Arc<SendingPMode>> {
        self.sending.get(id).cloned()
    }

    fn sending_pmodes(&self) -> Vec<Arc<SendingPMode>> {
        let mut pmodes: Vec<Arc<SendingPMode>> = self.sending.values().cloned().collect();
        pmodes.sort_by(|a, b| a.id.cmp(&b.id));
        pmodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmode::PushConfiguration;

    fn push_pmode(id: &str) -> SendingPMode {
        let mut pmode = SendingPMode::new(id);
        pmode.push_configuration = Some(PushConfiguration {
            url: "http://partner/as4".into(),
            ..PushConfiguration::default()
        });
        pmode
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let config = PModeConfig {
            receiving: vec![ReceivingPMode::new("r"), ReceivingPMode::new("r")],
            sending: vec![],
        };
        assert!(InMemoryPModeStore::from_config(&config).is_err());
    }

    #[test]
    fn test_push_without_destination_is_rejected() {
        let mut store = InMemoryPModeStore::new();
        assert!(store.add_sending(SendingPMode::new("s")).is_err());
        assert!(store.add_sending(push_pmode("s")).is_ok());
        assert!(store.require_sending_pmode("s").is_ok());
        assert!(store.require_sending_pmode("missing").is_err());
    }

    #[test]
    fn test_dangling_reply_reference_is_rejected() {
        let mut receiving = ReceivingPMode::new("r");
        receiving.reply_handling.sending_pmode_id = Some("callback".into());
        let config = PModeConfig {
            receiving: vec![receiving],
            sending: vec![push_pmode("other")],
        };
        assert!(InMemoryPModeStore::from_config(&config).is_err());
    }

    #[test]
    fn test_callback_without_sending_pmode_is_rejected() {
        let mut receiving = ReceivingPMode::new("r");
        receiving.reply_handling.reply_pattern = ReplyPattern::Callback;
        let config = PModeConfig {
            receiving: vec![receiving.clone()],
            sending: vec![push_pmode("callback")],
        };
        assert!(InMemoryPModeStore::from_config(&config).is_err());

        receiving.reply_handling.sending_pmode_id = Some("callback".into());
        let config = PModeConfig {
            receiving: vec![receiving],
            sending: vec![push_pmode("callback")],
        };
        assert!(InMemoryPModeStore::from_config(&config).is_ok());
    }
}
