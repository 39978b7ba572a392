//! Scripted device and slow sink for driving the pipeline from tests

use readout_rs::device::format::LAST_BUFFER_BIT;
use readout_rs::output::MemorySink;
use readout_rs::{
    ModuleConfig, OutputRecord, ReadStatus, ReadoutDevice, ReadoutError, RecordSink, Result,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct Script {
    /// Returned by reads while acquiring
    pending: VecDeque<Vec<u16>>,
    /// Held back until the device is stopped, then returned before the marker
    in_flight: VecDeque<Vec<u16>>,
    calls: Vec<&'static str>,
    fail_start: bool,
    /// Time `start_autonomous` takes
    start_delay: Duration,
    /// Time `stop_autonomous` takes
    stop_delay: Duration,
}

/// Test-side handle to a [`ScriptedDevice`]
#[derive(Debug, Clone, Default)]
pub struct DeviceScript {
    inner: Arc<Mutex<Script>>,
}

impl DeviceScript {
    /// Queue a buffer for the next read while acquiring
    pub fn push(&self, words: Vec<u16>) {
        self.inner.lock().unwrap().pending.push_back(words);
    }

    /// Queue a buffer only returned while draining
    pub fn push_in_flight(&self, words: Vec<u16>) {
        self.inner.lock().unwrap().in_flight.push_back(words);
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    /// Device calls in order
    pub fn calls(&self) -> Vec<&'static str> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn fail_start(&self, fail: bool) {
        self.inner.lock().unwrap().fail_start = fail;
    }

    pub fn start_delay(&self, delay: Duration) {
        self.inner.lock().unwrap().start_delay = delay;
    }

    pub fn stop_delay(&self, delay: Duration) {
        self.inner.lock().unwrap().stop_delay = delay;
    }
}

/// Device whose reads come from a script
pub struct ScriptedDevice {
    script: DeviceScript,
    acquiring: bool,
    draining: bool,
}

impl ScriptedDevice {
    pub fn new() -> (Self, DeviceScript) {
        let script = DeviceScript::default();
        (
            Self {
                script: script.clone(),
                acquiring: false,
                draining: false,
            },
            script,
        )
    }

    fn record(&self, call: &'static str) {
        self.script.inner.lock().unwrap().calls.push(call);
    }
}

fn copy_into(dest: &mut [u16], words: &[u16]) -> Result<ReadStatus> {
    if words.len() > dest.len() {
        return Err(ReadoutError::BufferOverflow {
            needed: words.len(),
            capacity: dest.len(),
        });
    }
    dest[..words.len()].copy_from_slice(words);
    Ok(ReadStatus::Data(words.len()))
}

impl ReadoutDevice for ScriptedDevice {
    fn initialize(&mut self) -> Result<()> {
        self.record("initialize");
        Ok(())
    }

    fn configure_and_load(&mut self, _modules: &[ModuleConfig]) -> Result<()> {
        self.record("load");
        Ok(())
    }

    fn start_autonomous(&mut self) -> Result<()> {
        self.record("start");
        let (fail, delay) = {
            let script = self.script.inner.lock().unwrap();
            (script.fail_start, script.start_delay)
        };
        std::thread::sleep(delay);
        if fail {
            return Err(ReadoutError::Device("start refused".to_string()));
        }
        self.acquiring = true;
        self.draining = false;
        Ok(())
    }

    fn stop_autonomous(&mut self) -> Result<()> {
        self.record("stop");
        let delay = self.script.inner.lock().unwrap().stop_delay;
        std::thread::sleep(delay);
        if self.acquiring {
            self.acquiring = false;
            self.draining = true;
        }
        Ok(())
    }

    fn block_read(&mut self, dest: &mut [u16], timeout: Duration) -> Result<ReadStatus> {
        if self.acquiring {
            let next = self.script.inner.lock().unwrap().pending.pop_front();
            if let Some(words) = next {
                return copy_into(dest, &words);
            }
        } else if self.draining {
            let next = self.script.inner.lock().unwrap().in_flight.pop_front();
            return match next {
                Some(words) => copy_into(dest, &words),
                None => {
                    self.draining = false;
                    copy_into(dest, &[LAST_BUFFER_BIT])
                }
            };
        }
        std::thread::sleep(timeout);
        Ok(ReadStatus::Timeout)
    }

    fn reset(&mut self) -> Result<()> {
        self.record("reset");
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Record sink that takes `delay` to accept each record
pub struct SlowSink {
    inner: MemorySink,
    delay: Duration,
}

impl SlowSink {
    pub fn new(delay: Duration) -> (Self, MemorySink) {
        let inner = MemorySink::new();
        (
            Self {
                inner: inner.clone(),
                delay,
            },
            inner,
        )
    }
}

impl RecordSink for SlowSink {
    fn commit(&mut self, record: &OutputRecord) -> Result<()> {
        std::thread::sleep(self.delay);
        self.inner.commit(record)
    }
}
