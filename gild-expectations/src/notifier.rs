use gild_types::ExpectationId;
use std::sync::{Arc, Mutex};

/// Whether change callbacks run inline on the snapshot listener task (in
/// delivery order) or are each dispatched to their own task (and may
/// observe reordered events). Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Synchronous,
    Asynchronous,
}

type Callback = Arc<dyn Fn(&ExpectationId) + Send + Sync>;

/// Fan-out point for "this pair's label changed" events. The store
/// guarantees callbacks fire after its caches reflect the change, so a
/// callback reading expectations sees at least the state that triggered
/// it.
pub struct ChangeNotifier {
    mode: DispatchMode,
    listeners: Mutex<Vec<Callback>>,
}

impl ChangeNotifier {
    pub fn new(mode: DispatchMode) -> Self {
        Self {
            mode,
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&ExpectationId) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .expect("notifier lock poisoned")
            .push(Arc::new(callback));
    }

    pub fn notify(&self, id: ExpectationId) {
        let listeners = self.listeners.lock().expect("notifier lock poisoned").clone();
        match self.mode {
            DispatchMode::Synchronous => {
                for listener in listeners {
                    listener(&id);
                }
            }
            DispatchMode::Asynchronous => {
                for listener in listeners {
                    let id = id.clone();
                    tokio::spawn(async move {
                        listener(&id);
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn synchronous_dispatch_runs_inline_and_in_order() {
        let notifier = ChangeNotifier::new(DispatchMode::Synchronous);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_for_callback = seen.clone();
        notifier.subscribe(move |id| {
            seen_for_callback
                .lock()
                .unwrap()
                .push(id.digest.clone());
        });

        notifier.notify(ExpectationId::new("alpha_test", "aaaa"));
        notifier.notify(ExpectationId::new("alpha_test", "bbbb"));

        assert_eq!(*seen.lock().unwrap(), vec!["aaaa", "bbbb"]);
    }

    #[test]
    fn every_subscriber_is_called() {
        let notifier = ChangeNotifier::new(DispatchMode::Synchronous);
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = calls.clone();
            notifier.subscribe(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        notifier.notify(ExpectationId::new("alpha_test", "aaaa"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn asynchronous_dispatch_eventually_delivers() {
        let notifier = ChangeNotifier::new(DispatchMode::Asynchronous);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_for_callback = calls.clone();
        notifier.subscribe(move |_| {
            calls_for_callback.fetch_add(1, Ordering::SeqCst);
        });

        notifier.notify(ExpectationId::new("alpha_test", "aaaa"));
        for _ in 0..100 {
            if calls.load(Ordering::SeqCst) == 1 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("async notification never arrived");
    }
}
