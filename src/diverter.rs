//! The diversion engine.
//!
//! [`Diverter`] wires the settings, platform and callback state together:
//! it starts one queue per hook of the configured mode, installs the extra
//! redirect rules the mode needs, and on stop tears all of it down in
//! reverse order, releasing the capture sink last.

use crate::error::{DivertError, Result};
use crate::network::firewall::{RuleLedger, RuleSpec};
use crate::network::modules::{
    DiversionStatistics, HookKind, NonlocalTrafficMonitor, RedirectionPolicy,
};
use crate::network::processing::{CaptureSink, HookPipeline, HookSpec, QueueLifecycleManager};
use crate::platform::Platform;
use crate::settings::{DiverterSettings, ListenerTable};
use crate::utils::log_statistics;
use log::{error, info, warn};
use std::sync::Arc;

pub struct Diverter {
    settings: DiverterSettings,
    platform: Arc<dyn Platform>,
    ledger: Arc<RuleLedger>,
    manager: QueueLifecycleManager,
    stats: Arc<DiversionStatistics>,
    sink: Option<Arc<dyn CaptureSink>>,
    saved_rules: Option<String>,
    started: bool,
}

impl Diverter {
    /// Creates a stopped diverter.
    ///
    /// # Arguments
    ///
    /// * `settings` - Validated before anything is installed
    /// * `platform` - Kernel facilities, usually [`LinuxPlatform`](crate::platform::LinuxPlatform)
    pub fn new(settings: DiverterSettings, platform: Arc<dyn Platform>) -> Result<Self> {
        settings.validate()?;

        let ledger = Arc::new(RuleLedger::new());
        let manager = QueueLifecycleManager::new(Arc::clone(&platform), Arc::clone(&ledger));

        Ok(Self {
            settings,
            platform,
            ledger,
            manager,
            stats: Arc::new(DiversionStatistics::new()),
            sink: None,
            saved_rules: None,
            started: false,
        })
    }

    /// Mirrors every captured packet into `sink`.
    pub fn with_capture_sink(mut self, sink: Arc<dyn CaptureSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn settings(&self) -> &DiverterSettings {
        &self.settings
    }

    pub fn statistics(&self) -> Arc<DiversionStatistics> {
        Arc::clone(&self.stats)
    }

    pub fn ledger(&self) -> &RuleLedger {
        &self.ledger
    }

    pub fn queues(&self) -> &QueueLifecycleManager {
        &self.manager
    }

    pub fn is_running(&self) -> bool {
        self.started
    }

    /// Hooks for the configured mode, with the interface restriction applied
    /// to the optional ones.
    pub fn hook_specs(&self) -> Vec<HookSpec> {
        let interface = self.settings.effective_interface();
        HookKind::for_mode(self.settings.network_mode)
            .into_iter()
            .map(|hook| HookSpec::new(hook).with_interface(interface))
            .collect()
    }

    /// Starts diverting traffic.
    ///
    /// On failure everything installed so far has been removed again.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(DivertError::Startup("diverter is already running".to_string()));
        }
        if !self.platform.is_privileged() {
            return Err(DivertError::Privilege(
                "root is required to install firewall rules and bind netfilter queues".to_string(),
            ));
        }

        info!("Starting diverter in {} mode", self.settings.network_mode);
        self.prepare_firewall()?;

        if let Err(e) = self.start_queues() {
            self.restore_firewall();
            return Err(e);
        }
        self.started = true;

        if let Err(e) = self.install_redirect_rules() {
            error!("Failed to install redirect rules: {}", e);
            self.stop();
            return Err(e);
        }

        info!(
            "Diverter running with {} queues and {} firewall rules",
            self.manager.running_count(),
            self.ledger.len()
        );
        Ok(())
    }

    fn prepare_firewall(&mut self) -> Result<()> {
        if !self.settings.flush_iptables {
            warn!("iptables is not flushed; existing rules may interfere with diversion");
            return Ok(());
        }

        self.saved_rules = Some(self.platform.snapshot_rules()?);
        if let Err(e) = self.platform.flush_rules() {
            // A partial flush may already have dropped rules
            self.restore_firewall();
            return Err(e);
        }
        Ok(())
    }

    fn restore_firewall(&mut self) {
        if let Some(snapshot) = self.saved_rules.take() {
            if let Err(e) = self.platform.restore_rules(&snapshot) {
                error!("Failed to restore saved firewall rules: {}", e);
            }
        }
    }

    fn start_queues(&mut self) -> Result<()> {
        let local_addresses = Arc::new(self.platform.local_addresses()?);
        info!("Local addresses: {}", local_addresses);

        let registry = Arc::new(ListenerTable::from_settings(&self.settings)?);
        let monitor = Arc::new(NonlocalTrafficMonitor::new(
            Arc::clone(&local_addresses),
            !self.settings.log_nonlocal_only_once,
        ));
        let policy = Arc::new(RedirectionPolicy::new(registry, local_addresses));

        let mut pipeline = HookPipeline::new(
            self.settings.network_mode,
            monitor,
            policy,
            Arc::clone(&self.stats),
        );
        if let Some(sink) = &self.sink {
            pipeline = pipeline.with_sink(Arc::clone(sink));
        }

        let specs = self.hook_specs();
        self.manager.start(&specs, Arc::new(pipeline))
    }

    /// Installs the NAT redirects the mode needs, ledgering each one as soon
    /// as it is in place.
    fn install_redirect_rules(&mut self) -> Result<()> {
        let mut rules = Vec::new();

        if self.settings.network_mode.is_single_host() && self.settings.redirect_icmp {
            rules.push(RuleSpec::icmp_redirect());
        }

        let interfaces = match self.settings.effective_interface() {
            Some(iface) => vec![iface.to_string()],
            None => self.platform.interfaces()?,
        };
        rules.extend(interfaces.iter().map(|iface| RuleSpec::interface_redirect(iface)));

        for spec in &rules {
            let record = self.platform.install(spec)?;
            self.ledger.record(record);
        }
        Ok(())
    }

    /// Stops every queue, removes every installed rule and closes the
    /// capture sink. Calling it on a stopped diverter does nothing.
    pub fn stop(&mut self) {
        if !self.started && self.ledger.is_empty() {
            return;
        }

        info!("Stopping diverter");
        let summary = self.manager.stop();
        if !summary.is_clean() {
            warn!("Some firewall rules could not be removed ({})", summary);
        }

        // Only safe once no worker can write to it any more
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.close() {
                error!("Failed to close capture sink: {}", e);
            }
        }

        self.restore_firewall();
        self.started = false;
        log_statistics(&self.stats.snapshot());
        info!("Diverter stopped");
    }
}

impl Drop for Diverter {
    fn drop(&mut self) {
        self.stop();
    }
}
