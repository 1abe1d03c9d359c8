use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{error, info};

use super::{CancellationToken, ServerComponent};

/// Pause after a failed cycle before the component runs again.
const FAILURE_BACKOFF: Duration = Duration::from_secs(5);

/// Handle to stop and join a running component.
#[derive(Debug)]
pub struct ComponentHandle {
    name: String,
    cancel: CancellationToken,
    join: Option<thread::JoinHandle<()>>,
}

impl ComponentHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancel the component and wait for its current cycle to end.
    pub fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Runs server components on dedicated threads.
#[derive(Debug)]
pub struct ComponentRunner;

impl ComponentRunner {
    /// Run `component` repeatedly on a named thread until `cancel` fires.
    ///
    /// A failed cycle is logged and retried after a short backoff.
    pub fn spawn(
        component: Arc<dyn ServerComponent>,
        cancel: CancellationToken,
    ) -> io::Result<ComponentHandle> {
        let name = component.name().to_string();
        let token = cancel.clone();

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_loop(component, token))?;

        Ok(ComponentHandle {
            name,
            cancel,
            join: Some(join),
        })
    }
}

fn run_loop(component: Arc<dyn ServerComponent>, cancel: CancellationToken) {
    info!(component = component.name(), "server component started");

    while !cancel.is_cancelled() {
        if let Err(e) = component.execute(&cancel) {
            error!(component = component.name(), error = %e, "server component cycle failed");
            if cancel.wait(FAILURE_BACKOFF) {
                break;
            }
        }
    }

    info!(component = component.name(), "server component stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::ComponentError;
    use crate::store::StoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Ticker {
        cycles: AtomicUsize,
        fail: bool,
    }

    impl ServerComponent for Ticker {
        fn name(&self) -> &str {
            "ticker"
        }

        fn execute(&self, cancel: &CancellationToken) -> Result<(), ComponentError> {
            self.cycles.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(StoreError::Backend("down".to_string()).into());
            }
            cancel.wait(Duration::from_millis(20));
            Ok(())
        }
    }

    #[test]
    fn runs_cycles_until_shutdown() {
        let ticker = Arc::new(Ticker {
            cycles: AtomicUsize::new(0),
            fail: false,
        });
        let handle = ComponentRunner::spawn(ticker.clone(), CancellationToken::new()).unwrap();
        assert_eq!(handle.name(), "ticker");

        thread::sleep(Duration::from_millis(200));
        handle.shutdown();

        let cycles = ticker.cycles.load(Ordering::SeqCst);
        assert!(cycles >= 2, "only {cycles} cycles");
        thread::sleep(Duration::from_millis(60));
        assert_eq!(ticker.cycles.load(Ordering::SeqCst), cycles);
    }

    #[test]
    fn failing_cycles_back_off_and_still_shut_down_promptly() {
        let ticker = Arc::new(Ticker {
            cycles: AtomicUsize::new(0),
            fail: true,
        });
        let handle = ComponentRunner::spawn(ticker.clone(), CancellationToken::new()).unwrap();

        thread::sleep(Duration::from_millis(200));
        let started = std::time::Instant::now();
        handle.shutdown();

        assert_eq!(ticker.cycles.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
