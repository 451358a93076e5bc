use std::sync::{Arc, Mutex};
use std::time::Duration;

use sessionkeeper::host::{Configuration, Host, HostSpec};
use sessionkeeper::messaging::Mailbox;
use sessionkeeper::types::{EndReason, SessionKey, StateMap, Value};

use super::channel::LoopbackChannel;
use super::mem_store::MemStore;

pub(crate) type TestHost = Host<MemStore, LoopbackChannel>;

/// A test configuration with timeouts shrunk so that failure paths resolve within milliseconds
/// instead of the production defaults.
pub(crate) fn fast_configuration() -> Configuration {
    Configuration::builder()
        .save_confirm_timeout(Duration::from_millis(50))
        .drain_timeout(Duration::from_millis(500))
        .log_events(true)
        .build()
}

/// Record of `SessionEnded` notifications observed through the event bus, for asserting on
/// teardown counts and recorded reasons.
#[derive(Clone)]
pub(crate) struct EndedRecorder {
    ended: Arc<Mutex<Vec<(SessionKey, EndReason)>>>,
}

impl EndedRecorder {
    pub(crate) fn new() -> EndedRecorder {
        EndedRecorder {
            ended: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn record(&self, key: SessionKey, reason: EndReason) {
        self.ended.lock().unwrap().push((key, reason));
    }

    pub(crate) fn entries(&self) -> Vec<(SessionKey, EndReason)> {
        self.ended.lock().unwrap().clone()
    }

    /// Poll until at least `count` notifications have arrived through the event bus, or the
    /// deadline passes.
    pub(crate) fn wait_for(&self, count: usize, deadline: Duration) -> Vec<(SessionKey, EndReason)> {
        let start = std::time::Instant::now();
        while start.elapsed() < deadline {
            let entries = self.entries();
            if entries.len() >= count {
                return entries;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        self.entries()
    }
}

/// Start a host over `store` with an `EndedRecorder` attached.
pub(crate) fn start_host(store: MemStore, configuration: Configuration) -> (TestHost, EndedRecorder) {
    let mailbox = Mailbox::new();
    let recorder = EndedRecorder::new();
    let recorder_in_handler = recorder.clone();
    let host = HostSpec::builder()
        .store(store)
        .messages(LoopbackChannel::new(mailbox.clone()))
        .configuration(configuration)
        .mailbox(mailbox)
        .on_session_ended(move |event| recorder_in_handler.record(event.key, event.reason))
        .build()
        .start();
    (host, recorder)
}

/// The template of defaults used across the test suite: `{Cash: 0}`.
pub(crate) fn cash_template() -> StateMap {
    let mut template = StateMap::new();
    template.insert("Cash".to_string(), Value::Int(0));
    template
}
