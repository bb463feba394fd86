//! Command queue worker and fences
//!
//! Each queue owns a worker thread standing in for the GPU. Submissions,
//! fence signals and presents travel over one channel, so the worker sees
//! them in exactly the order the CPU enqueued them.

use std::any::Any;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::render::api::{CommandList, CommandQueue, GpuFence, GraphicsError, GraphicsResult, ResourceState};

use super::command_list::{execute_commands, HeadlessCommandList, Submission};
use super::device::DeviceShared;
use super::resources::ResourceInner;
use super::PresentRecord;

/// Completed value of one fence plus the condition waiters block on
pub(crate) struct FenceState {
    value: Mutex<u64>,
    signaled: Condvar,
}

impl FenceState {
    fn new(initial_value: u64) -> Self {
        Self { value: Mutex::new(initial_value), signaled: Condvar::new() }
    }

    pub fn completed(&self) -> u64 {
        *self.value.lock()
    }

    /// Raise the completed value; lower values are ignored
    pub fn complete(&self, value: u64) {
        let mut current = self.value.lock();
        if value > *current {
            *current = value;
            self.signaled.notify_all();
        }
    }

    fn wait(&self, value: u64) {
        let mut current = self.value.lock();
        while *current < value {
            self.signaled.wait(&mut current);
        }
    }
}

/// Fence of the headless device
pub struct HeadlessFence {
    state: Arc<FenceState>,
}

impl HeadlessFence {
    pub(crate) fn new(device: &DeviceShared, initial_value: u64) -> Self {
        let state = Arc::new(FenceState::new(initial_value));
        device.register_fence(&state);
        Self { state }
    }
}

impl GpuFence for HeadlessFence {
    fn completed_value(&self) -> u64 {
        self.state.completed()
    }

    fn wait_for_value(&self, value: u64) -> GraphicsResult<()> {
        self.state.wait(value);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Work item consumed by the queue worker
pub(crate) enum QueueItem {
    Execute(Vec<Submission>),
    Signal { fence: Arc<FenceState>, value: u64 },
    Present { back_buffer: Weak<ResourceInner>, record: PresentRecord },
    Shutdown,
}

/// Direct queue of the headless device
pub struct HeadlessQueue {
    sender: Sender<QueueItem>,
    worker: Option<JoinHandle<()>>,
    device: Arc<DeviceShared>,
}

impl HeadlessQueue {
    pub(crate) fn new(device: Arc<DeviceShared>, latency: Duration) -> GraphicsResult<Self> {
        let (sender, receiver) = unbounded();
        let worker_device = Arc::clone(&device);
        let worker = thread::Builder::new()
            .name(format!("headless-gpu-{}", device.serial))
            .spawn(move || run_worker(&receiver, &worker_device, latency))
            .map_err(|e| GraphicsError::Api { call: "spawn queue worker", code: e.to_string() })?;

        log::debug!("Created headless queue (latency {:?})", latency);
        Ok(Self { sender, worker: Some(worker), device })
    }

    pub(crate) fn sender(&self) -> Sender<QueueItem> {
        self.sender.clone()
    }

    fn send(&self, item: QueueItem) -> GraphicsResult<()> {
        self.sender
            .send(item)
            .map_err(|_| GraphicsError::Api { call: "queue submit", code: "queue worker stopped".to_string() })
    }
}

impl CommandQueue for HeadlessQueue {
    fn execute_command_lists(&self, lists: &[&dyn CommandList]) -> GraphicsResult<()> {
        let mut batch = Vec::with_capacity(lists.len());
        for list in lists {
            let list = list
                .as_any()
                .downcast_ref::<HeadlessCommandList>()
                .ok_or_else(|| GraphicsError::invalid(format!("'{}' belongs to another backend", list.name())))?;
            if list.is_recording() {
                return Err(GraphicsError::invalid(format!("'{}' was submitted while still recording", list.name())));
            }
            batch.push(list.submission());
        }

        // A removed device silently drops work, like a real queue after a TDR
        if self.device.is_removed() {
            for submission in &batch {
                submission.retire();
            }
            return Ok(());
        }
        self.send(QueueItem::Execute(batch))
    }

    fn signal(&self, fence: &dyn GpuFence, value: u64) -> GraphicsResult<()> {
        let fence = fence
            .as_any()
            .downcast_ref::<HeadlessFence>()
            .ok_or_else(|| GraphicsError::invalid("fence belongs to another backend"))?;
        if self.device.is_removed() {
            fence.state.complete(u64::MAX);
            return Ok(());
        }
        self.send(QueueItem::Signal { fence: Arc::clone(&fence.state), value })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for HeadlessQueue {
    fn drop(&mut self) {
        let _ = self.sender.send(QueueItem::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Headless queue worker panicked");
            }
        }
    }
}

fn run_worker(receiver: &Receiver<QueueItem>, device: &DeviceShared, latency: Duration) {
    for item in receiver.iter() {
        match item {
            QueueItem::Execute(batch) => {
                if !latency.is_zero() {
                    thread::sleep(latency);
                }
                for submission in batch {
                    if !device.is_removed() {
                        execute_commands(device, &submission.name, &submission.commands);
                        device.control.update_stats(|stats| stats.executed_lists += 1);
                    }
                    submission.retire();
                }
            }
            QueueItem::Signal { fence, value } => fence.complete(value),
            QueueItem::Present { back_buffer, record } => {
                if let Some(buffer) = back_buffer.upgrade() {
                    let state = *buffer.state.lock();
                    if state != ResourceState::Present {
                        device.control.report_validation_error(format!(
                            "presented back buffer {} is in {:?} instead of Present",
                            record.buffer_index, state
                        ));
                    }
                }
            }
            QueueItem::Shutdown => break,
        }
    }
    log::trace!("Headless queue worker of device {} stopped", device.serial);
}

impl Submission {
    fn retire(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
