//! Settings slice: node connection preferences, persisted on their own
//! namespace. Written once at account creation, read at bootstrap.

use crate::state::{NodeConfig, SettingsState};

#[derive(Debug, Clone)]
pub enum SettingsEvent {
    NodeConfigSet(NodeConfig),
}

pub(crate) fn reduce(state: &mut SettingsState, event: &SettingsEvent) {
    match event {
        SettingsEvent::NodeConfigSet(config) => state.node_config = Some(config.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_config_overwrites() {
        let mut state = SettingsState::default();
        reduce(&mut state, &SettingsEvent::NodeConfigSet(NodeConfig::Embedded));
        assert_eq!(state.node_config, Some(NodeConfig::Embedded));

        reduce(
            &mut state,
            &SettingsEvent::NodeConfigSet(NodeConfig::External {
                address: "127.0.0.1:9091".into(),
            }),
        );
        assert_eq!(
            state.node_config,
            Some(NodeConfig::External {
                address: "127.0.0.1:9091".into()
            })
        );
    }
}
