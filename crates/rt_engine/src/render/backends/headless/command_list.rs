//! Command recording and execution on the simulated GPU
//!
//! Commands are recorded into a plain vector and frozen into an `Arc` on
//! close, so a closed list can be submitted any number of times. Resources are
//! referenced weakly: a list never keeps a resource alive, and executing a
//! list whose resources are gone is reported as a validation error.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::render::api::{
    AccelerationStructureInputs, BuildAccelerationStructureDesc, BuildFlags, CommandList, DescriptorHeap,
    DescriptorHeapKind, DispatchRaysDesc, GpuResource, GraphicsError, GraphicsResult, PipelineHandle, Rect,
    ResourceBarrier, ResourceDimension, ResourceId, ResourceState, RayTracingPipeline,
};

use super::acceleration;
use super::device::DeviceShared;
use super::pipeline::{validate_dispatch, HeadlessPipeline, PipelineInner};
use super::resources::{HeadlessResource, ResourceInner};

pub(crate) enum BarrierRecord {
    Transition { resource: Weak<ResourceInner>, before: ResourceState, after: ResourceState },
    Uav { resource: Weak<ResourceInner>, id: ResourceId },
}

pub(crate) struct BuildCommand {
    pub inputs: AccelerationStructureInputs,
    pub dest: Weak<ResourceInner>,
    pub source: Option<Weak<ResourceInner>>,
    pub scratch: Weak<ResourceInner>,
}

pub(crate) enum Command {
    SetPipelineState(PipelineHandle),
    Barrier(Vec<BarrierRecord>),
    SetDescriptorHeap(DescriptorHeapKind),
    ClearRenderTarget { target: Weak<ResourceInner>, color: [f32; 4] },
    CopyResource { dst: Weak<ResourceInner>, src: Weak<ResourceInner> },
    BlitScaled { dst: Weak<ResourceInner>, rect: Rect, src: Weak<ResourceInner> },
    BuildAccelerationStructure(BuildCommand),
    SetRayTracingPipeline(Arc<PipelineInner>),
    DispatchRays(DispatchRaysDesc),
}

/// A closed list handed to the queue worker
pub(crate) struct Submission {
    pub name: String,
    pub commands: Arc<Vec<Command>>,
    pub in_flight: Arc<AtomicU64>,
}

/// Command list (with its allocator) of the headless device
pub struct HeadlessCommandList {
    name: String,
    device: Arc<DeviceShared>,
    recording: bool,
    commands: Vec<Command>,
    recorded: Arc<Vec<Command>>,
    errors: Vec<String>,
    pipeline_bound: bool,
    in_flight: Arc<AtomicU64>,
}

impl HeadlessCommandList {
    pub(crate) fn new(name: &str, device: Arc<DeviceShared>) -> Self {
        Self {
            name: name.to_string(),
            device,
            recording: true,
            commands: Vec::new(),
            recorded: Arc::new(Vec::new()),
            errors: Vec::new(),
            pipeline_bound: false,
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Submissions of this list the GPU has not finished
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Commands frozen by the last close
    pub fn recorded_command_count(&self) -> usize {
        self.recorded.len()
    }

    pub(crate) fn submission(&self) -> Submission {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Submission {
            name: self.name.clone(),
            commands: Arc::clone(&self.recorded),
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    fn record(&mut self, command: Command) {
        if self.recording {
            self.commands.push(command);
        } else {
            self.errors.push("command recorded on a closed list".to_string());
        }
    }

    fn weak(&mut self, resource: &dyn GpuResource) -> Weak<ResourceInner> {
        match resource.as_any().downcast_ref::<HeadlessResource>() {
            Some(resource) => Arc::downgrade(&resource.inner),
            None => {
                self.errors.push(format!("'{}' belongs to another backend", resource.name()));
                Weak::new()
            }
        }
    }

    fn follows_uav_barrier(&self, id: ResourceId) -> bool {
        match self.commands.last() {
            Some(Command::Barrier(barriers)) => barriers
                .iter()
                .any(|barrier| matches!(barrier, BarrierRecord::Uav { id: barrier_id, .. } if *barrier_id == id)),
            _ => false,
        }
    }
}

impl CommandList for HeadlessCommandList {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_recording(&self) -> bool {
        self.recording
    }

    fn reset(&mut self, initial_pipeline: Option<PipelineHandle>) -> GraphicsResult<()> {
        let in_flight = self.in_flight();
        if in_flight > 0 {
            return Err(GraphicsError::invalid(format!(
                "'{}' reset while {} submission(s) are still executing",
                self.name, in_flight
            )));
        }
        self.recording = true;
        self.commands.clear();
        self.errors.clear();
        self.pipeline_bound = false;
        if let Some(pipeline) = initial_pipeline {
            self.commands.push(Command::SetPipelineState(pipeline));
        }
        Ok(())
    }

    fn close(&mut self) -> GraphicsResult<()> {
        if !self.recording {
            return Err(GraphicsError::invalid(format!("'{}' closed twice", self.name)));
        }
        self.recording = false;
        self.recorded = Arc::new(std::mem::take(&mut self.commands));
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(GraphicsError::invalid(format!("'{}': {}", self.name, self.errors.join("; "))))
        }
    }

    fn resource_barrier(&mut self, barriers: &[ResourceBarrier<'_>]) {
        let records = barriers
            .iter()
            .map(|barrier| match barrier {
                ResourceBarrier::Transition { resource, before, after } => {
                    BarrierRecord::Transition { resource: self.weak(*resource), before: *before, after: *after }
                }
                ResourceBarrier::Uav { resource } => {
                    BarrierRecord::Uav { resource: self.weak(*resource), id: resource.id() }
                }
            })
            .collect();
        self.record(Command::Barrier(records));
    }

    fn set_descriptor_heap(&mut self, heap: &dyn DescriptorHeap) {
        if heap.gpu_start().is_none() {
            self.errors.push(format!("bound {:?} heap is not shader visible", heap.kind()));
        }
        self.record(Command::SetDescriptorHeap(heap.kind()));
    }

    fn clear_render_target(&mut self, target: &dyn GpuResource, color: [f32; 4]) {
        let target = self.weak(target);
        self.record(Command::ClearRenderTarget { target, color });
    }

    fn copy_resource(&mut self, dst: &dyn GpuResource, src: &dyn GpuResource) {
        if dst.dimension() != src.dimension() {
            self.errors.push(format!("copy between '{}' and '{}' of different shapes", dst.name(), src.name()));
        }
        let (dst, src) = (self.weak(dst), self.weak(src));
        self.record(Command::CopyResource { dst, src });
    }

    fn blit_scaled(&mut self, dst: &dyn GpuResource, dst_rect: Rect, src: &dyn GpuResource) {
        if let ResourceDimension::Texture2D { width, height, .. } = dst.dimension() {
            let inside = dst_rect.left >= 0
                && dst_rect.top >= 0
                && dst_rect.right <= width as i32
                && dst_rect.bottom <= height as i32
                && dst_rect.width() > 0
                && dst_rect.height() > 0;
            if !inside {
                self.errors.push(format!(
                    "blit rectangle {:?} outside '{}' ({}x{})",
                    dst_rect,
                    dst.name(),
                    width,
                    height
                ));
            }
        } else {
            self.errors.push(format!("blit into buffer '{}'", dst.name()));
        }
        let (dst, src) = (self.weak(dst), self.weak(src));
        self.record(Command::BlitScaled { dst, rect: dst_rect, src });
    }

    fn build_acceleration_structure(&mut self, desc: &BuildAccelerationStructureDesc<'_>) {
        if desc.inputs.flags().contains(BuildFlags::PERFORM_UPDATE) {
            if desc.source.is_none() {
                self.errors.push(format!("refit of '{}' without a source structure", desc.dest.name()));
            }
            if !self.follows_uav_barrier(desc.dest.id()) {
                self.errors.push(format!("refit of '{}' is not preceded by a UAV barrier on it", desc.dest.name()));
            }
        }
        let command = BuildCommand {
            inputs: desc.inputs.clone(),
            dest: self.weak(desc.dest),
            source: desc.source.map(|source| self.weak(source)),
            scratch: self.weak(desc.scratch),
        };
        self.record(Command::BuildAccelerationStructure(command));
    }

    fn set_ray_tracing_pipeline(&mut self, pipeline: &dyn RayTracingPipeline) {
        match pipeline.as_any().downcast_ref::<HeadlessPipeline>() {
            Some(pipeline) => {
                self.pipeline_bound = true;
                self.record(Command::SetRayTracingPipeline(Arc::clone(&pipeline.inner)));
            }
            None => self.errors.push("ray tracing pipeline belongs to another backend".to_string()),
        }
    }

    fn dispatch_rays(&mut self, desc: &DispatchRaysDesc) {
        if !self.pipeline_bound {
            self.errors.push("dispatch without a bound ray tracing pipeline".to_string());
        }
        self.record(Command::DispatchRays(*desc));
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Execute one list on the worker thread
pub(crate) fn execute_commands(device: &DeviceShared, list: &str, commands: &[Command]) {
    let report = |message: String| device.control.report_validation_error(format!("{}: {}", list, message));
    let mut pipeline: Option<&Arc<PipelineInner>> = None;

    for command in commands {
        match command {
            Command::SetPipelineState(_) | Command::SetDescriptorHeap(_) => {}
            Command::Barrier(barriers) => {
                for barrier in barriers {
                    match barrier {
                        BarrierRecord::Transition { resource, before, after } => {
                            let Some(resource) = live(resource, &report) else { continue };
                            let mut state = resource.state.lock();
                            if *state != *before {
                                report(format!(
                                    "'{}' transitioned {:?} -> {:?} but is in {:?}",
                                    resource.name, before, after, *state
                                ));
                            }
                            *state = *after;
                        }
                        BarrierRecord::Uav { resource, .. } => {
                            live(resource, &report);
                        }
                    }
                }
            }
            Command::ClearRenderTarget { target, color } => {
                let Some(target) = live(target, &report) else { continue };
                expect_state(&target, &[ResourceState::RenderTarget], &report);
                *target.clear_color.lock() = Some(*color);
            }
            Command::CopyResource { dst, src } => {
                let (Some(dst), Some(src)) = (live(dst, &report), live(src, &report)) else { continue };
                expect_state(&dst, &[ResourceState::CopyDest], &report);
                expect_state(&src, &[ResourceState::CopySource], &report);
                if dst.dimension != src.dimension {
                    report(format!("copy between '{}' and '{}' of different shapes", dst.name, src.name));
                } else if matches!(dst.dimension, ResourceDimension::Buffer { .. }) {
                    let data = src.bytes.lock().clone();
                    dst.bytes.lock().copy_from_slice(&data);
                } else {
                    let color = *src.clear_color.lock();
                    *dst.clear_color.lock() = color;
                }
            }
            Command::BlitScaled { dst, src, .. } => {
                let (Some(dst), Some(src)) = (live(dst, &report), live(src, &report)) else { continue };
                expect_state(&dst, &[ResourceState::RenderTarget, ResourceState::CopyDest], &report);
                expect_state(&src, &[ResourceState::CopySource, ResourceState::PixelShaderResource], &report);
            }
            Command::BuildAccelerationStructure(build) => match acceleration::execute_build(device, build) {
                Ok(refit) => device.control.update_stats(|stats| {
                    if refit {
                        stats.acceleration_structure_refits += 1;
                    } else {
                        stats.acceleration_structure_builds += 1;
                    }
                }),
                Err(fault) => {
                    device.mark_removed(format!("GPU fault in '{}': {}", list, fault));
                    return;
                }
            },
            Command::SetRayTracingPipeline(bound) => pipeline = Some(bound),
            Command::DispatchRays(desc) => {
                match pipeline {
                    Some(bound) => {
                        for message in validate_dispatch(device, bound, desc) {
                            report(message);
                        }
                    }
                    None => report("dispatch without a bound pipeline".to_string()),
                }
                device.control.update_stats(|stats| stats.dispatches += 1);
            }
        }
    }
}

fn live(resource: &Weak<ResourceInner>, report: &impl Fn(String)) -> Option<Arc<ResourceInner>> {
    let resource = resource.upgrade();
    if resource.is_none() {
        report("referenced resource was destroyed before execution".to_string());
    }
    resource
}

fn expect_state(resource: &ResourceInner, allowed: &[ResourceState], report: &impl Fn(String)) {
    let state = *resource.state.lock();
    if !allowed.contains(&state) {
        report(format!("'{}' used in {:?}, expected one of {:?}", resource.name, state, allowed));
    }
}
