use crate::network::core::Transport;
use crate::network::modules::redirect::{ListenerLookup, ListenerRegistry};
use crate::settings::{DiverterSettings, SettingsError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A simulated protocol listener bound on this host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerSettings {
    /// Listener name referenced by `default_tcp_listener`/`default_udp_listener`
    pub name: String,
    /// Transport the listener is bound to
    pub protocol: Transport,
    /// Local port the listener is bound to
    pub port: u16,
}

/// Listener registry built from the configured listeners.
#[derive(Debug, Clone, Default)]
pub struct ListenerTable {
    bound: HashSet<(Transport, u16)>,
    defaults: HashMap<Transport, u16>,
    blacklist: HashSet<(Transport, u16)>,
    redirect_all_traffic: bool,
}

impl ListenerTable {
    /// Builds the table, resolving default listener names to ports.
    pub fn from_settings(settings: &DiverterSettings) -> Result<Self, SettingsError> {
        settings.validate()?;

        let bound = settings
            .listeners
            .iter()
            .map(|l| (l.protocol, l.port))
            .collect();

        let mut defaults = HashMap::new();
        for transport in [Transport::Tcp, Transport::Udp] {
            let Some(name) = settings.default_listener(transport) else {
                continue;
            };
            let listener = settings
                .listeners
                .iter()
                .find(|l| l.name == name)
                .ok_or_else(|| SettingsError::UnknownListener(name.to_string()))?;
            defaults.insert(transport, listener.port);
        }

        let blacklist = [Transport::Tcp, Transport::Udp]
            .into_iter()
            .flat_map(|t| settings.blacklisted_ports(t).iter().map(move |p| (t, *p)))
            .collect();

        Ok(Self {
            bound,
            defaults,
            blacklist,
            redirect_all_traffic: settings.redirect_all_traffic,
        })
    }
}

impl ListenerRegistry for ListenerTable {
    fn lookup(&self, transport: Transport, port: u16) -> ListenerLookup {
        if self.bound.contains(&(transport, port)) {
            return ListenerLookup::Bound;
        }
        if !self.redirect_all_traffic || self.blacklist.contains(&(transport, port)) {
            return ListenerLookup::Unhandled;
        }
        match self.defaults.get(&transport) {
            Some(port) => ListenerLookup::RedirectTo(*port),
            None => ListenerLookup::Unhandled,
        }
    }
}
