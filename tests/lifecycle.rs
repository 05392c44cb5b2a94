mod common;

use common::FakePlatform;
use netdivert::error::DivertError;
use netdivert::network::firewall::{RuleLedger, RuleSpec};
use netdivert::network::modules::HookKind;
use netdivert::network::processing::{HookSpec, QueueLifecycleManager, QueueState};
use netdivert::network::queue::QueueError;
use netdivert::platform::Platform;
use netdivert::settings::{DiverterSettings, NetworkMode, SettingsBuilder};
use std::sync::Arc;

fn multi_host() -> DiverterSettings {
    SettingsBuilder::new().mode(NetworkMode::MultiHost).build()
}

fn specs(interface: Option<&str>) -> Vec<HookSpec> {
    HookKind::for_mode(NetworkMode::MultiHost)
        .into_iter()
        .map(|hook| HookSpec::new(hook).with_interface(interface))
        .collect()
}

fn manager(platform: &Arc<FakePlatform>) -> (QueueLifecycleManager, Arc<RuleLedger>) {
    let ledger = Arc::new(RuleLedger::new());
    let dyn_platform: Arc<dyn Platform> = platform.clone();
    (
        QueueLifecycleManager::new(dyn_platform, Arc::clone(&ledger)),
        ledger,
    )
}

#[test]
fn test_start_installs_rule_per_hook() {
    let platform = Arc::new(FakePlatform::new());
    let (mut manager, ledger) = manager(&platform);
    let pipeline = common::pipeline(&platform, &multi_host());

    manager.start(&specs(None), pipeline).unwrap();

    assert_eq!(manager.running_count(), 3);
    assert_eq!(platform.bound_count(), 3);
    assert_eq!(ledger.len(), 3);
    assert_eq!(
        platform.installed(),
        vec![
            RuleSpec::nfqueue("PREROUTING", "raw", None, 0),
            RuleSpec::nfqueue("INPUT", "mangle", None, 1),
            RuleSpec::nfqueue("OUTPUT", "raw", None, 2),
        ]
    );

    let outgoing = manager.queue_for(HookKind::Outgoing).unwrap();
    assert_eq!(outgoing.number(), 2);
    assert_eq!(outgoing.state(), QueueState::Running);
    assert!(outgoing.is_running());

    manager.stop();
}

#[test]
fn test_stop_removes_rules_in_reverse_order() {
    let platform = Arc::new(FakePlatform::new());
    let (mut manager, ledger) = manager(&platform);
    manager
        .start(&specs(None), common::pipeline(&platform, &multi_host()))
        .unwrap();
    let installed = platform.installed();

    let summary = manager.stop();

    assert_eq!(summary.removed, 3);
    assert!(ledger.is_empty());
    assert!(platform.installed().is_empty());
    assert_eq!(platform.bound_count(), 0);
    assert!(manager.queues().is_empty());
    assert_eq!(
        platform.removal_log(),
        installed.into_iter().rev().collect::<Vec<_>>()
    );
}

#[test]
fn test_bind_failure_rolls_back_everything() {
    let platform = Arc::new(FakePlatform::new());
    platform.fail_bind.lock().unwrap().insert(1);
    let (mut manager, ledger) = manager(&platform);

    let result = manager.start(&specs(None), common::pipeline(&platform, &multi_host()));

    assert!(matches!(
        result,
        Err(DivertError::Queue(QueueError::Bind { queue: 1, .. }))
    ));
    // The first hook was fully started and the second had its rule in place
    assert_eq!(platform.install_log().len(), 2);
    assert!(platform.installed().is_empty());
    assert!(ledger.is_empty());
    assert_eq!(platform.bound_count(), 0);
    assert!(manager.queues().is_empty());
}

#[test]
fn test_install_failure_rolls_back_everything() {
    let platform = Arc::new(FakePlatform::new());
    *platform.fail_install.lock().unwrap() = Some("OUTPUT".to_string());
    let (mut manager, ledger) = manager(&platform);

    let result = manager.start(&specs(None), common::pipeline(&platform, &multi_host()));

    assert!(matches!(result, Err(DivertError::Firewall(_))));
    assert!(platform.installed().is_empty());
    assert!(ledger.is_empty());
    assert_eq!(platform.bound_count(), 0);
}

#[test]
fn test_too_few_queue_numbers() {
    let platform = Arc::new(FakePlatform {
        queue_numbers: vec![7],
        ..FakePlatform::default()
    });
    let (mut manager, _) = manager(&platform);

    let result = manager.start(&specs(None), common::pipeline(&platform, &multi_host()));

    assert!(matches!(
        result,
        Err(DivertError::QueueNumbers {
            requested: 3,
            available: 1
        })
    ));
    assert!(platform.install_log().is_empty());
}

#[test]
fn test_stop_is_idempotent_and_tolerates_missing_rules() {
    let platform = Arc::new(FakePlatform::new());
    let (mut manager, _) = manager(&platform);
    manager
        .start(&specs(None), common::pipeline(&platform, &multi_host()))
        .unwrap();
    platform.remove_externally(&RuleSpec::nfqueue("INPUT", "mangle", None, 1));

    let first = manager.stop();
    let second = manager.stop();

    assert_eq!(first.removed, 2);
    assert_eq!(first.already_absent, 1);
    assert!(first.is_clean());
    assert_eq!(second.removed + second.already_absent + second.failed, 0);
}

#[test]
fn test_interface_restricts_only_nonlocal_hook() {
    let platform = Arc::new(FakePlatform::new());
    let (mut manager, _) = manager(&platform);

    manager
        .start(&specs(Some("eth1")), common::pipeline(&platform, &multi_host()))
        .unwrap();

    let installed = platform.installed();
    assert_eq!(installed[0], RuleSpec::nfqueue("PREROUTING", "raw", Some("eth1"), 0));
    assert_eq!(installed[1], RuleSpec::nfqueue("INPUT", "mangle", None, 1));
    assert_eq!(installed[2], RuleSpec::nfqueue("OUTPUT", "raw", None, 2));
    assert_eq!(
        manager.queue_for(HookKind::Nonlocal).unwrap().interface(),
        Some("eth1")
    );

    manager.stop();
}

#[test]
fn test_double_start_is_rejected() {
    let platform = Arc::new(FakePlatform::new());
    let (mut manager, _) = manager(&platform);
    let pipeline = common::pipeline(&platform, &multi_host());
    manager.start(&specs(None), Arc::clone(&pipeline)).unwrap();

    let result = manager.start(&specs(None), pipeline);

    assert!(matches!(result, Err(DivertError::Startup(_))));
    assert_eq!(manager.running_count(), 3);
    manager.stop();
}
