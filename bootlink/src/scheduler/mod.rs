//! Command scheduler.
//!
//! A FIFO queue of [`CommandItem`]s. Each run pops one item at a time, hands
//! it to the transport's send-and-await primitive, and dispatches on the
//! item's response policy: continue, re-enqueue for a schedule-level retry,
//! stop the queue, or skip. All terminal conditions collapse into a
//! [`CommandResult`]; the run entry point never propagates them as errors.

use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::event::{EventSink, UpdaterEvent};
use crate::protocol::frame::{CommandKind, DeviceInfo, Frame};
use crate::transport::{TransferConfig, Transport};

/// Default schedule-level retry budget for an item.
pub const DEFAULT_SCHEDULE_RETRIES: u32 = 3;

/// What a response policy decided about a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseAction {
    /// Record the frame and move on.
    Continue,
    /// Re-enqueue the command at the tail, consuming one unit of its
    /// schedule-retry budget.
    Retry,
    /// Terminate the run with failure.
    Stop,
    /// Move on without recording the frame.
    Skip,
}

/// Pure function from received frame to [`ResponseAction`].
pub type ResponsePolicy = Arc<dyn Fn(&Frame) -> ResponseAction + Send + Sync>;

/// One scheduled send-and-wait step.
#[derive(Clone)]
pub struct CommandItem {
    kind: CommandKind,
    payload: Vec<u8>,
    expect: CommandKind,
    label: String,
    timeout: Option<Duration>,
    transport_retries: Option<u32>,
    schedule_retries: u32,
    policy: Option<ResponsePolicy>,
}

impl CommandItem {
    /// Create an item with default retry budget and no policy (responses
    /// default to [`ResponseAction::Continue`]).
    pub fn new(
        kind: CommandKind,
        payload: Vec<u8>,
        expect: CommandKind,
        label: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            payload,
            expect,
            label: label.into(),
            timeout: None,
            transport_retries: None,
            schedule_retries: DEFAULT_SCHEDULE_RETRIES,
            policy: None,
        }
    }

    /// Override the transport timeout for this item only.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the transport attempt count for this item only.
    #[must_use]
    pub fn with_transport_retries(mut self, retries: u32) -> Self {
        self.transport_retries = Some(retries);
        self
    }

    /// Set the schedule-level retry budget.
    #[must_use]
    pub fn with_schedule_retries(mut self, retries: u32) -> Self {
        self.schedule_retries = retries;
        self
    }

    /// Attach a response policy.
    #[must_use]
    pub fn with_policy<F>(mut self, policy: F) -> Self
    where
        F: Fn(&Frame) -> ResponseAction + Send + Sync + 'static,
    {
        self.policy = Some(Arc::new(policy));
        self
    }

    /// Descriptive label of this item.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Copy for a schedule-level retry: same command, expectation, and
    /// overrides, budget decremented, label marked.
    fn retry_copy(&self) -> Self {
        let mut copy = self.clone();
        copy.schedule_retries = self.schedule_retries - 1;
        if !copy.label.ends_with(" (retry)") {
            copy.label.push_str(" (retry)");
        }
        copy
    }
}

impl std::fmt::Debug for CommandItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandItem")
            .field("kind", &self.kind)
            .field("expect", &self.expect)
            .field("label", &self.label)
            .field("schedule_retries", &self.schedule_retries)
            .finish()
    }
}

/// Outcome of one scheduler run.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Whether every dispatched command was accepted.
    pub success: bool,
    /// Human-readable failure summary, empty on success.
    pub error: String,
    /// Recorded response frames, in dispatch order.
    pub responses: Vec<Frame>,
    /// Commands dispatched (every pop counts, including retries).
    pub executed: usize,
    /// Total commands in the run; grows when retries enqueue new items.
    pub total: usize,
}

impl CommandResult {
    fn new(total: usize) -> Self {
        Self {
            success: true,
            error: String::new(),
            responses: Vec::new(),
            executed: 0,
            total,
        }
    }
}

struct RunState {
    queue: VecDeque<CommandItem>,
    running: bool,
    stop_requested: bool,
}

/// FIFO command scheduler bound to one transport.
pub struct Scheduler {
    state: Mutex<RunState>,
    transport: Arc<Transport>,
    events: Arc<dyn EventSink>,
}

impl Scheduler {
    /// Create a scheduler dispatching over `transport`.
    pub fn new(transport: Arc<Transport>, events: Arc<dyn EventSink>) -> Self {
        Self {
            state: Mutex::new(RunState {
                queue: VecDeque::new(),
                running: false,
                stop_requested: false,
            }),
            transport,
            events,
        }
    }

    /// Queue one command. Fails while a run is in progress.
    pub fn submit(&self, item: CommandItem) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.running {
            return Err(Error::QueueBusy);
        }
        state.queue.push_back(item);
        Ok(())
    }

    /// Queue a batch of commands. Fails while a run is in progress.
    pub fn submit_all(&self, items: impl IntoIterator<Item = CommandItem>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.running {
            return Err(Error::QueueBusy);
        }
        state.queue.extend(items);
        Ok(())
    }

    /// Number of queued commands.
    pub fn queue_len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    /// Request a stop: the queue is cleared immediately, and the run loop
    /// terminates after the in-flight command returns. Best-effort for the
    /// command already handed to the transport.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.queue.clear();
        if state.running {
            state.stop_requested = true;
        }
    }

    /// Run the queue to completion.
    ///
    /// Returns [`Error::QueueBusy`] if a run is already in progress; every
    /// other outcome, including failure, is reported in the returned
    /// [`CommandResult`].
    pub fn run(&self) -> Result<CommandResult> {
        {
            let mut state = self.state.lock().unwrap();
            if state.running {
                return Err(Error::QueueBusy);
            }
            state.running = true;
            state.stop_requested = false;
        }

        let result = self.run_loop();

        let mut state = self.state.lock().unwrap();
        state.running = false;
        state.stop_requested = false;
        Ok(result)
    }

    fn run_loop(&self) -> CommandResult {
        let mut result = CommandResult::new(self.queue_len());
        let mut index = 0usize;

        loop {
            let item = {
                let mut state = self.state.lock().unwrap();
                if state.stop_requested {
                    state.queue.clear();
                    return stopped(result);
                }
                match state.queue.pop_front() {
                    Some(item) => item,
                    None => return result,
                }
            };
            index += 1;

            #[allow(clippy::cast_possible_truncation)]
            let percent = (index * 100 / result.total.max(1)).min(100) as u8;
            self.events.on_event(&UpdaterEvent::Progress {
                current: index,
                total: result.total,
                label: item.label.clone(),
                percent,
            });
            debug!("Dispatching [{index}/{}] {}", result.total, item.label);

            let frame = match Frame::new(item.kind, item.payload.clone()) {
                Ok(frame) => frame,
                Err(e) => {
                    result.success = false;
                    result.error = format!("cannot build {} frame: {e}", item.kind);
                    self.clear_queue();
                    return result;
                }
            };

            let config = self.effective_config(&item);
            let response = match self.transport.send_and_await_with(&frame, item.expect, &config) {
                Ok(response) => response,
                Err(e) => {
                    warn!("No reply for {}: {e}", item.label);
                    result.success = false;
                    result.error = format!("communication lost: {e}");
                    self.clear_queue();
                    return result;
                }
            };
            result.executed += 1;

            let action = match &item.policy {
                Some(policy) => policy(&response),
                None => ResponseAction::Continue,
            };
            match action {
                ResponseAction::Continue => {
                    if response.kind() == CommandKind::EnterBoot {
                        self.log_device_info(&response);
                    }
                    result.responses.push(response);
                }
                ResponseAction::Retry => {
                    if item.schedule_retries > 0 {
                        let retry = item.retry_copy();
                        debug!(
                            "Re-enqueueing {} ({} retries left)",
                            retry.label, retry.schedule_retries
                        );
                        self.state.lock().unwrap().queue.push_back(retry);
                        result.total += 1;
                    } else {
                        warn!("Retry budget exhausted for {}, skipping", item.label);
                        self.events.on_event(&UpdaterEvent::Log(format!(
                            "retry budget exhausted for {}",
                            item.label
                        )));
                    }
                }
                ResponseAction::Stop => {
                    result.error = if response.kind() == CommandKind::ErrorResponse {
                        self.transport
                            .last_device_error()
                            .unwrap_or_else(|| "device reported an error".into())
                    } else {
                        format!("stopped on {} reply to {}", response.kind(), item.label)
                    };
                    result.responses.push(response);
                    result.success = false;
                    self.clear_queue();
                    return result;
                }
                ResponseAction::Skip => {}
            }

            if self.state.lock().unwrap().stop_requested {
                self.clear_queue();
                return stopped(result);
            }
        }
    }

    fn effective_config(&self, item: &CommandItem) -> TransferConfig {
        let mut config = self.transport.config().clone();
        if let Some(timeout) = item.timeout {
            config.timeout = timeout;
        }
        if let Some(retries) = item.transport_retries {
            config.retry_count = retries;
        }
        config
    }

    fn log_device_info(&self, response: &Frame) {
        match DeviceInfo::decode(response.payload()) {
            Ok(info) => {
                debug!("Device info: {info}");
                self.events
                    .on_event(&UpdaterEvent::Log(format!("device: {info}")));
            }
            Err(e) => warn!("Cannot parse device info: {e}"),
        }
    }

    fn clear_queue(&self) {
        self.state.lock().unwrap().queue.clear();
    }
}

fn stopped(mut result: CommandResult) -> CommandResult {
    result.success = false;
    result.error = "run stopped by request".into();
    result
}
