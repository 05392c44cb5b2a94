#![allow(dead_code)]

use netdivert::error::Result;
use netdivert::network::core::{LocalAddresses, PacketContext};
use netdivert::network::firewall::{FirewallError, RuleInstaller, RuleRecord, RuleRemoval, RuleSpec};
use netdivert::network::modules::{DiversionStatistics, NonlocalTrafficMonitor, RedirectionPolicy};
use netdivert::network::processing::HookPipeline;
use netdivert::network::queue::{CaptureHandle, QueueBinder, QueueError, Verdict};
use netdivert::platform::Platform;
use netdivert::settings::{DiverterSettings, ListenerTable};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

/// Packets scripted into one queue and the verdicts issued for them.
#[derive(Default)]
pub struct FakeQueue {
    inbox: Mutex<VecDeque<Vec<u8>>>,
    verdicts: Mutex<Vec<(Verdict, Vec<u8>)>>,
}

impl FakeQueue {
    pub fn inject(&self, octets: Vec<u8>) {
        self.inbox.lock().unwrap().push_back(octets);
    }

    /// Waits until `count` verdicts were issued and returns them.
    pub fn wait_for_verdicts(&self, count: usize) -> Vec<(Verdict, Vec<u8>)> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let verdicts = self.verdicts.lock().unwrap().clone();
            if verdicts.len() >= count || Instant::now() > deadline {
                return verdicts;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Injects one packet and returns the bytes the kernel would forward.
    pub fn roundtrip(&self, octets: Vec<u8>) -> PacketContext {
        let before = self.verdicts.lock().unwrap().len();
        self.inject(octets);
        let verdicts = self.wait_for_verdicts(before + 1);
        assert_eq!(verdicts.len(), before + 1, "no verdict issued");
        let (verdict, bytes) = verdicts[before].clone();
        assert_eq!(verdict, Verdict::Accept);
        PacketContext::parse("forwarded", bytes)
    }
}

struct FakeHandle {
    number: u16,
    queue: Arc<FakeQueue>,
    bound: Arc<AtomicUsize>,
    current: Option<Vec<u8>>,
    closed: bool,
}

impl CaptureHandle for FakeHandle {
    fn recv(&mut self) -> std::result::Result<Option<Vec<u8>>, QueueError> {
        let next = self.queue.inbox.lock().unwrap().pop_front();
        match next {
            Some(octets) => {
                self.current = Some(octets.clone());
                Ok(Some(octets))
            }
            None => {
                thread::sleep(Duration::from_millis(1));
                Ok(None)
            }
        }
    }

    fn issue_verdict(
        &mut self,
        verdict: Verdict,
        replacement: Option<Vec<u8>>,
    ) -> std::result::Result<(), QueueError> {
        let original = self
            .current
            .take()
            .ok_or(QueueError::NoPendingPacket(self.number))?;
        self.queue
            .verdicts
            .lock()
            .unwrap()
            .push((verdict, replacement.unwrap_or(original)));
        Ok(())
    }

    fn close(&mut self) -> std::result::Result<(), QueueError> {
        if !self.closed {
            self.closed = true;
            self.bound.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// In-memory platform recording every rule and queue operation.
pub struct FakePlatform {
    pub privileged: bool,
    pub queue_numbers: Vec<u16>,
    pub local: Vec<IpAddr>,
    pub interfaces: Vec<String>,
    pub fail_bind: Mutex<HashSet<u16>>,
    /// Installing a rule whose text contains this fails
    pub fail_install: Mutex<Option<String>>,
    pub installed: Mutex<Vec<RuleSpec>>,
    pub install_log: Mutex<Vec<RuleSpec>>,
    pub removal_log: Mutex<Vec<RuleSpec>>,
    pub queues: Mutex<HashMap<u16, Arc<FakeQueue>>>,
    pub bound: Arc<AtomicUsize>,
    pub firewall_log: Mutex<Vec<&'static str>>,
    pub fail_flush: bool,
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self {
            privileged: true,
            queue_numbers: vec![0, 1, 2],
            local: vec![ip("10.0.0.5"), ip("fe80::5")],
            interfaces: vec!["eth0".to_string()],
            fail_bind: Mutex::new(HashSet::new()),
            fail_install: Mutex::new(None),
            installed: Mutex::new(Vec::new()),
            install_log: Mutex::new(Vec::new()),
            removal_log: Mutex::new(Vec::new()),
            queues: Mutex::new(HashMap::new()),
            bound: Arc::new(AtomicUsize::new(0)),
            firewall_log: Mutex::new(Vec::new()),
            fail_flush: false,
        }
    }
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, number: u16) -> Arc<FakeQueue> {
        Arc::clone(self.queues.lock().unwrap().entry(number).or_default())
    }

    pub fn installed(&self) -> Vec<RuleSpec> {
        self.installed.lock().unwrap().clone()
    }

    pub fn install_log(&self) -> Vec<RuleSpec> {
        self.install_log.lock().unwrap().clone()
    }

    pub fn removal_log(&self) -> Vec<RuleSpec> {
        self.removal_log.lock().unwrap().clone()
    }

    pub fn firewall_log(&self) -> Vec<&'static str> {
        self.firewall_log.lock().unwrap().clone()
    }

    /// Removes a rule behind the diverter's back.
    pub fn remove_externally(&self, spec: &RuleSpec) {
        self.installed.lock().unwrap().retain(|s| s != spec);
    }

    pub fn bound_count(&self) -> usize {
        self.bound.load(Ordering::SeqCst)
    }

    pub fn bound_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.bound)
    }
}

impl RuleInstaller for FakePlatform {
    fn install(&self, spec: &RuleSpec) -> std::result::Result<RuleRecord, FirewallError> {
        if let Some(pattern) = self.fail_install.lock().unwrap().as_deref() {
            if spec.to_string().contains(pattern) {
                return Err(FirewallError::Failed {
                    command: format!("iptables {}", spec),
                    status: "exit status: 1".to_string(),
                    stderr: "scripted failure".to_string(),
                });
            }
        }
        self.installed.lock().unwrap().push(spec.clone());
        self.install_log.lock().unwrap().push(spec.clone());
        Ok(RuleRecord::new(spec.clone()))
    }

    fn remove(&self, rule: &RuleRecord) -> std::result::Result<RuleRemoval, FirewallError> {
        self.removal_log.lock().unwrap().push(rule.spec().clone());
        let mut installed = self.installed.lock().unwrap();
        match installed.iter().position(|s| s == rule.spec()) {
            Some(index) => {
                installed.remove(index);
                Ok(RuleRemoval::Removed)
            }
            None => Ok(RuleRemoval::AlreadyAbsent),
        }
    }
}

impl QueueBinder for FakePlatform {
    fn bind(&self, queue_number: u16) -> std::result::Result<Box<dyn CaptureHandle>, QueueError> {
        if self.fail_bind.lock().unwrap().contains(&queue_number) {
            return Err(QueueError::Bind {
                queue: queue_number,
                source: std::io::Error::new(std::io::ErrorKind::Other, "scripted failure"),
            });
        }
        self.bound.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeHandle {
            number: queue_number,
            queue: self.queue(queue_number),
            bound: Arc::clone(&self.bound),
            current: None,
            closed: false,
        }))
    }
}

impl Platform for FakePlatform {
    fn is_privileged(&self) -> bool {
        self.privileged
    }

    fn next_queue_numbers(&self, count: usize) -> Result<Vec<u16>> {
        Ok(self.queue_numbers.iter().take(count).copied().collect())
    }

    fn local_addresses(&self) -> Result<LocalAddresses> {
        Ok(self.local.iter().copied().collect())
    }

    fn interfaces(&self) -> Result<Vec<String>> {
        Ok(self.interfaces.clone())
    }

    fn snapshot_rules(&self) -> Result<String> {
        self.firewall_log.lock().unwrap().push("save");
        Ok("*filter\nCOMMIT\n".to_string())
    }

    fn flush_rules(&self) -> Result<()> {
        self.firewall_log.lock().unwrap().push("flush");
        if self.fail_flush {
            return Err(FirewallError::Failed {
                command: "iptables -F".to_string(),
                status: "exit status: 4".to_string(),
                stderr: "scripted failure".to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn restore_rules(&self, _snapshot: &str) -> Result<()> {
        self.firewall_log.lock().unwrap().push("restore");
        Ok(())
    }
}

/// Pipeline over the fake platform's local addresses.
pub fn pipeline(platform: &FakePlatform, settings: &DiverterSettings) -> Arc<HookPipeline> {
    let local = Arc::new(platform.local_addresses().unwrap());
    let registry = Arc::new(ListenerTable::from_settings(settings).unwrap());
    Arc::new(HookPipeline::new(
        settings.network_mode,
        Arc::new(NonlocalTrafficMonitor::new(Arc::clone(&local), false)),
        Arc::new(RedirectionPolicy::new(registry, local)),
        Arc::new(DiversionStatistics::new()),
    ))
}
