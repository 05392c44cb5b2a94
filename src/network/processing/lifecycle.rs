//! Queue lifecycle management.
//!
//! Each hook moves through uninstalled -> rule-installed -> queue-bound ->
//! running -> stopping -> stopped. The firewall rule is installed (and
//! ledgered) before the worker binds its queue; rules carry
//! `--queue-bypass`, so traffic flows unmodified during that window.

use crate::error::{DivertError, Result};
use crate::network::firewall::{RemovalSummary, RuleLedger, RuleSpec};
use crate::network::modules::HookKind;
use crate::network::processing::pipeline::HookPipeline;
use crate::network::processing::worker::run_capture;
use crate::platform::Platform;
use log::{debug, error, info};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

/// Lifecycle state of one hook's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Uninstalled,
    RuleInstalled,
    QueueBound,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueueState::Uninstalled => "uninstalled",
            QueueState::RuleInstalled => "rule-installed",
            QueueState::QueueBound => "queue-bound",
            QueueState::Running => "running",
            QueueState::Stopping => "stopping",
            QueueState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// A hook to start, with its optional interface restriction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookSpec {
    pub hook: HookKind,
    pub interface: Option<String>,
}

impl HookSpec {
    pub fn new(hook: HookKind) -> Self {
        Self {
            hook,
            interface: None,
        }
    }

    /// Restricts the hook to `interface` unless every mode depends on it.
    pub fn with_interface(mut self, interface: Option<&str>) -> Self {
        if !self.hook.is_mode_mandatory() {
            self.interface = interface.map(str::to_string);
        }
        self
    }

    pub fn rule(&self, queue_number: u16) -> RuleSpec {
        RuleSpec::nfqueue(
            self.hook.chain(),
            self.hook.table(),
            self.interface.as_deref(),
            queue_number,
        )
    }
}

/// A kernel queue serving one hook.
pub struct QueueDescriptor {
    number: u16,
    spec: HookSpec,
    state: QueueState,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl QueueDescriptor {
    fn new(number: u16, spec: HookSpec) -> Self {
        Self {
            number,
            spec,
            state: QueueState::Uninstalled,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn hook(&self) -> HookKind {
        self.spec.hook
    }

    pub fn chain(&self) -> &'static str {
        self.spec.hook.chain()
    }

    pub fn table(&self) -> &'static str {
        self.spec.hook.table()
    }

    pub fn interface(&self) -> Option<&str> {
        self.spec.interface.as_deref()
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Signals the worker to stop without waiting for it.
    fn stop_nonblocking(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if matches!(self.state, QueueState::QueueBound | QueueState::Running) {
            self.state = QueueState::Stopping;
        }
    }

    /// Signals the worker and waits for it to unbind the queue.
    fn stop(&mut self) {
        self.stop_nonblocking();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Capture worker for queue {} panicked", self.number);
            }
        }
        self.state = QueueState::Stopped;
        debug!("Queue {} for {} stopped", self.number, self.spec.hook.label());
    }
}

impl fmt::Display for QueueDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue {} -> {}", self.number, self.spec.hook)?;
        if let Some(iface) = self.interface() {
            write!(f, " on {}", iface)?;
        }
        write!(f, " [{}]", self.state)
    }
}

/// Starts and stops the queues of every hook.
///
/// Startup is all-or-nothing: if any hook fails, everything started so far
/// is stopped and every ledgered rule removed before the error is returned.
pub struct QueueLifecycleManager {
    platform: Arc<dyn Platform>,
    ledger: Arc<RuleLedger>,
    queues: Vec<QueueDescriptor>,
}

impl QueueLifecycleManager {
    pub fn new(platform: Arc<dyn Platform>, ledger: Arc<RuleLedger>) -> Self {
        Self {
            platform,
            ledger,
            queues: Vec::new(),
        }
    }

    pub fn queues(&self) -> &[QueueDescriptor] {
        &self.queues
    }

    /// Queue serving `hook`, if started.
    pub fn queue_for(&self, hook: HookKind) -> Option<&QueueDescriptor> {
        self.queues.iter().find(|q| q.hook() == hook)
    }

    pub fn running_count(&self) -> usize {
        self.queues
            .iter()
            .filter(|q| q.state == QueueState::Running)
            .count()
    }

    /// Starts one queue per hook spec, in order.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - Every hook is running
    /// * `Err(DivertError)` - Nothing is left running and no rule remains installed
    pub fn start(&mut self, specs: &[HookSpec], pipeline: Arc<HookPipeline>) -> Result<()> {
        if !self.queues.is_empty() {
            return Err(DivertError::Startup("queues are already started".to_string()));
        }

        let numbers = self.platform.next_queue_numbers(specs.len())?;
        if numbers.len() < specs.len() {
            return Err(DivertError::QueueNumbers {
                requested: specs.len(),
                available: numbers.len(),
            });
        }

        for (number, spec) in numbers.into_iter().zip(specs) {
            if let Err(e) = self.start_queue(number, spec.clone(), &pipeline) {
                error!(
                    "Failed to start {} on queue {}: {}",
                    spec.hook.label(),
                    number,
                    e
                );
                let summary = self.stop();
                info!("Rolled back startup ({})", summary);
                return Err(e);
            }
        }

        Ok(())
    }

    fn start_queue(&mut self, number: u16, spec: HookSpec, pipeline: &Arc<HookPipeline>) -> Result<()> {
        let rule = self.platform.install(&spec.rule(number))?;
        self.ledger.record(rule);

        let mut queue = QueueDescriptor::new(number, spec);
        queue.state = QueueState::RuleInstalled;
        queue.running.store(true, Ordering::SeqCst);

        let (ready_tx, ready_rx) = mpsc::channel();
        let platform = Arc::clone(&self.platform);
        let pipeline = Arc::clone(pipeline);
        let running = Arc::clone(&queue.running);
        let hook = queue.hook();

        let spawned = thread::Builder::new()
            .name(format!("nfqueue-{}", number))
            .spawn(move || run_capture(platform, number, hook, pipeline, running, ready_tx));

        // Keep the descriptor even on failure so rollback stops its worker
        match spawned {
            Ok(worker) => queue.worker = Some(worker),
            Err(e) => {
                queue.running.store(false, Ordering::SeqCst);
                self.queues.push(queue);
                return Err(DivertError::Io(e));
            }
        }
        let index = self.queues.len();
        self.queues.push(queue);
        let queue = &mut self.queues[index];

        match ready_rx.recv() {
            Ok(Ok(())) => {
                queue.state = QueueState::QueueBound;
                debug!("Worker bound queue {}", number);
                queue.state = QueueState::Running;
                info!("Started {}", queue);
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(DivertError::Startup(format!(
                "capture worker for queue {} exited before binding",
                number
            ))),
        }
    }

    /// Stops every queue and removes every ledgered rule.
    ///
    /// Workers are signalled first, rules removed while they drain, then
    /// each worker is joined. Safe to call more than once.
    pub fn stop(&mut self) -> RemovalSummary {
        for queue in &mut self.queues {
            queue.stop_nonblocking();
        }

        let summary = self.ledger.remove_all(self.platform.as_ref());

        for queue in &mut self.queues {
            queue.stop();
        }
        self.queues.clear();

        summary
    }
}

impl Drop for QueueLifecycleManager {
    fn drop(&mut self) {
        if !self.queues.is_empty() || !self.ledger.is_empty() {
            debug!("Stopping queues on drop");
            self.stop();
        }
    }
}
