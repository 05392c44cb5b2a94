//! Capture worker.
//!
//! One worker thread per hook binds its netfilter queue, then receives
//! packets, runs them through the pipeline and issues their verdicts until
//! the running flag is cleared.

use crate::network::modules::HookKind;
use crate::network::processing::pipeline::HookPipeline;
use crate::network::queue::{CaptureHandle, QueueError};
use crate::platform::Platform;
use log::{debug, error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Pause after a receive error so a broken socket does not spin the CPU.
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Runs the capture loop for one hook.
///
/// # Arguments
///
/// * `platform` - Binds the queue inside this thread
/// * `queue_number` - Netfilter queue fed by the hook's rule
/// * `hook` - Hook whose callback chains process the packets
/// * `pipeline` - Shared callback pipeline
/// * `running` - Cleared by the lifecycle manager to stop the loop
/// * `ready` - Receives the bind result before any packet is processed
pub fn run_capture(
    platform: Arc<dyn Platform>,
    queue_number: u16,
    hook: HookKind,
    pipeline: Arc<HookPipeline>,
    running: Arc<AtomicBool>,
    ready: mpsc::Sender<Result<(), QueueError>>,
) {
    let mut handle = match platform.bind(queue_number) {
        Ok(handle) => {
            // The manager may have given up waiting; the loop still honours `running`
            let _ = ready.send(Ok(()));
            handle
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    drop(ready);

    info!("Capturing {} on queue {}", hook, queue_number);
    let mut handled: u64 = 0;

    while running.load(Ordering::SeqCst) {
        match handle.recv() {
            Ok(Some(octets)) => {
                let result = pipeline.handle(hook, octets);
                if let Err(e) = handle.issue_verdict(result.verdict, result.replacement) {
                    error!("{}: {}", hook.label(), e);
                }
                handled += 1;
            }
            Ok(None) => {}
            Err(e) => {
                if should_shutdown(&running) {
                    break;
                }
                error!("{}: {}", hook.label(), e);
                thread::sleep(RECV_ERROR_BACKOFF);
            }
        }
    }

    close_handle(handle.as_mut(), queue_number);
    debug!(
        "Capture worker for {} exiting after {} packets",
        hook.label(),
        handled
    );
}

fn close_handle(handle: &mut dyn CaptureHandle, queue_number: u16) {
    if let Err(e) = handle.close() {
        error!("Failed to close queue {}: {}", queue_number, e);
    }
}

/// Checks if the thread should shut down.
fn should_shutdown(running: &Arc<AtomicBool>) -> bool {
    if !running.load(Ordering::SeqCst) {
        debug!("Capture worker exiting due to shutdown signal.");
        return true;
    }
    false
}
