//! Frame graph baking
//!
//! Turns a [`FrameGraph`] into queue submissions with their semaphore waits and
//! signals, and remembers which fences each frame slot submitted so the slot
//! can be waited on before it is reused.

use ash::{vk, Device};
use std::collections::HashSet;

use super::frame_graph::{wait_stage, FrameGraph, Queue, Waitable};
use super::sync::{wait_for_fences, Semaphore};
use crate::render::backends::vulkan::{VulkanContext, VulkanError, VulkanResult};

/// A semaphore wait attached to a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreWait {
    /// Semaphore to wait on
    pub semaphore: vk::Semaphore,
    /// Stage that blocks until the semaphore is signalled
    pub stage: vk::PipelineStageFlags,
}

/// One concrete queue submission produced from a graph element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedSubmission {
    /// Queue to submit on
    pub queue: Queue,
    /// Command buffer to execute
    pub command_buffer: vk::CommandBuffer,
    /// Semaphores that must all be signalled before execution starts
    pub waits: Vec<SemaphoreWait>,
    /// Completion semaphore, present only when something consumes it
    pub signal: Option<vk::Semaphore>,
    /// Fence signalled on completion
    pub fence: vk::Fence,
}

/// Result of baking a frame graph
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BakedFrame {
    /// Submissions in the order they were issued
    pub submissions: Vec<PlannedSubmission>,
    /// Semaphore presentation has to wait on
    pub present_wait: Option<vk::Semaphore>,
}

/// Issues planned submissions to the device
pub trait QueueSubmitter {
    /// Submit one planned submission
    fn submit(&self, submission: &PlannedSubmission) -> VulkanResult<()>;
}

/// Blocks the host on submitted work
pub trait FenceWaiter {
    /// Wait until every fence in `fences` is signalled
    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: u64) -> VulkanResult<()>;
}

impl QueueSubmitter for VulkanContext {
    fn submit(&self, submission: &PlannedSubmission) -> VulkanResult<()> {
        let device = &self.device().device;

        let wait_semaphores: Vec<vk::Semaphore> = submission.waits.iter().map(|w| w.semaphore).collect();
        let wait_stages: Vec<vk::PipelineStageFlags> = submission.waits.iter().map(|w| w.stage).collect();
        let command_buffers = [submission.command_buffer];
        let signal_semaphores: Vec<vk::Semaphore> = submission.signal.into_iter().collect();

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        // The fence may still guard an earlier submission of the same buffer.
        wait_for_fences(device, &[submission.fence], u64::MAX)?;

        unsafe {
            device.reset_fences(&[submission.fence])
                .map_err(VulkanError::Api)?;
            device.queue_submit(self.queue(submission.queue), &[submit_info], submission.fence)
                .map_err(VulkanError::Api)
        }
    }
}

/// Translate `graph` into submissions for frame slot `slot`
///
/// `image_available` is the semaphore signalled by this frame's image
/// acquisition. When no element waits on it explicitly the first element does.
pub fn plan_submissions(
    graph: &FrameGraph<'_>,
    slot: usize,
    image_available: Option<vk::Semaphore>,
) -> VulkanResult<Vec<PlannedSubmission>> {
    let elements = graph.elements();
    let explicit_acquire = elements
        .iter()
        .flat_map(|element| element.wait_on.iter())
        .filter(|waitable| matches!(waitable, Waitable::AcquireImage { .. }))
        .count();

    if explicit_acquire > 1 {
        return Err(VulkanError::InvalidOperation {
            reason: "acquired image can only be waited on once per frame".to_string(),
        });
    }
    if explicit_acquire == 1 && image_available.is_none() {
        return Err(VulkanError::InvalidOperation {
            reason: "frame graph waits on an image that was not acquired".to_string(),
        });
    }

    let mut submissions: Vec<PlannedSubmission> = Vec::with_capacity(elements.len());
    let mut consumed: HashSet<vk::Semaphore> = HashSet::new();

    for (index, element) in elements.iter().enumerate() {
        let mut waits: Vec<SemaphoreWait> = Vec::new();
        let mut add_wait = |semaphore: vk::Semaphore, stage: vk::PipelineStageFlags| {
            match waits.iter_mut().find(|w| w.semaphore == semaphore) {
                Some(existing) => existing.stage |= stage,
                None => waits.push(SemaphoreWait { semaphore, stage }),
            }
        };

        if index == 0 && explicit_acquire == 0 {
            if let Some(semaphore) = image_available {
                add_wait(semaphore, wait_stage(element.queue, true));
            }
        }

        if index > 0 && element.policy.waits_for_previous() {
            let semaphore = elements[index - 1].command.completion_semaphore(slot);
            add_wait(semaphore, wait_stage(element.queue, false));
        }

        for waitable in &element.wait_on {
            match waitable {
                Waitable::AcquireImage { .. } => {
                    if let Some(semaphore) = image_available {
                        add_wait(semaphore, waitable.stage());
                    }
                }
                Waitable::CommandBuffer { command, .. } => {
                    let target = command.command_buffer(slot);
                    if !submissions.iter().any(|s| s.command_buffer == target) {
                        return Err(VulkanError::InvalidOperation {
                            reason: format!(
                                "element {index} waits on command buffer {target:?} not submitted earlier in the frame"
                            ),
                        });
                    }
                    add_wait(command.completion_semaphore(slot), waitable.stage());
                }
            }
        }

        for wait in &waits {
            if Some(wait.semaphore) != image_available && !consumed.insert(wait.semaphore) {
                return Err(VulkanError::InvalidOperation {
                    reason: format!(
                        "element {index} waits on semaphore {:?} already consumed by an earlier element",
                        wait.semaphore
                    ),
                });
            }
        }

        submissions.push(PlannedSubmission {
            queue: element.queue,
            command_buffer: element.command.command_buffer(slot),
            waits,
            signal: None,
            fence: element.command.in_flight_fence(slot),
        });
    }

    let last = submissions.len().saturating_sub(1);
    for (index, (submission, element)) in submissions.iter_mut().zip(elements).enumerate() {
        let semaphore = element.command.completion_semaphore(slot);
        if index == last || consumed.contains(&semaphore) {
            submission.signal = Some(semaphore);
        }
    }

    Ok(submissions)
}

/// Submit the plan for `graph` and return what presentation has to wait on
///
/// Every fence is tracked in `fences` as soon as its submission is accepted, so
/// work already queued before a failing submit is still waited on.
pub fn bake<S: QueueSubmitter + ?Sized>(
    graph: &FrameGraph<'_>,
    slot: usize,
    image_available: Option<vk::Semaphore>,
    submitter: &S,
    fences: &mut SlotFences,
) -> VulkanResult<BakedFrame> {
    let submissions = plan_submissions(graph, slot, image_available)?;
    for (index, submission) in submissions.iter().enumerate() {
        log::trace!(
            "Submitting {:?} on {:?} ({} wait(s), signal {:?})",
            submission.command_buffer, submission.queue, submission.waits.len(), submission.signal
        );
        if let Err(e) = submitter.submit(submission) {
            log::error!("Submission {} of {} for slot {} failed: {}", index + 1, submissions.len(), slot, e);
            return Err(e);
        }
        fences.track(slot, submission.fence);
    }

    let present_wait = submissions.last().and_then(|s| s.signal);
    Ok(BakedFrame { submissions, present_wait })
}

/// Fences submitted per frame slot and not yet waited on
#[derive(Debug, Default)]
pub struct SlotFences {
    slots: Vec<Vec<vk::Fence>>,
}

impl SlotFences {
    /// Create empty tracking for `frames_in_flight` slots
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            slots: vec![Vec::new(); frames_in_flight.max(1)],
        }
    }

    /// Remember a fence submitted in `slot`
    pub fn track(&mut self, slot: usize, fence: vk::Fence) {
        let count = self.slots.len();
        let fences = &mut self.slots[slot % count];
        if !fences.contains(&fence) {
            fences.push(fence);
        }
    }

    /// Fences outstanding for `slot`
    pub fn pending(&self, slot: usize) -> &[vk::Fence] {
        &self.slots[slot % self.slots.len()]
    }

    /// Forget the fences of `slot` after they were waited on
    pub fn clear(&mut self, slot: usize) {
        let count = self.slots.len();
        self.slots[slot % count].clear();
    }

    /// Forget every tracked fence
    pub fn clear_all(&mut self) {
        self.slots.iter_mut().for_each(Vec::clear);
    }
}

/// Per-slot image semaphores and fence tracking for the frame loop
pub struct Synchronizer {
    image_available: Vec<vk::Semaphore>,
    fences: SlotFences,
    current_slot: usize,
    device: Option<Device>,
}

impl Synchronizer {
    /// Create synchronization state for `frames_in_flight` slots
    pub fn new(device: Device, frames_in_flight: usize) -> VulkanResult<Self> {
        let frames_in_flight = frames_in_flight.max(1);
        let semaphores = (0..frames_in_flight)
            .map(|_| Semaphore::new(device.clone()))
            .collect::<VulkanResult<Vec<_>>>()?;

        Ok(Self {
            image_available: semaphores.into_iter().map(Semaphore::into_raw).collect(),
            fences: SlotFences::new(frames_in_flight),
            current_slot: 0,
            device: Some(device),
        })
    }

    /// Use existing image-available semaphores without taking ownership of them
    #[cfg(test)]
    pub(crate) fn from_raw(image_available: Vec<vk::Semaphore>) -> Self {
        let frames_in_flight = image_available.len();
        Self {
            image_available,
            fences: SlotFences::new(frames_in_flight),
            current_slot: 0,
            device: None,
        }
    }

    /// Semaphore that image acquisition signals in `slot`
    pub fn image_available(&self, slot: usize) -> vk::Semaphore {
        self.image_available[slot % self.image_available.len()]
    }

    /// Fences submitted in `slot` that have not been waited on
    pub fn pending_fences(&self, slot: usize) -> &[vk::Fence] {
        self.fences.pending(slot)
    }

    /// Slot used by [`Self::bake_current_frame_graph`]
    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    /// Make `slot` the current slot
    pub fn set_current_slot(&mut self, slot: usize) {
        self.current_slot = slot % self.image_available.len();
    }

    /// Block until every submission made in `slot` has completed
    ///
    /// The fences stay tracked when the wait fails.
    pub fn wait_for_slot<W: FenceWaiter + ?Sized>(&mut self, slot: usize, timeout: u64, waiter: &W) -> VulkanResult<()> {
        let pending = self.fences.pending(slot);
        if !pending.is_empty() {
            log::trace!("Waiting on {} fence(s) for slot {}", pending.len(), slot);
            waiter.wait_for_fences(pending, timeout)?;
        }
        self.fences.clear(slot);
        Ok(())
    }

    /// Bake `graph` for `slot`, waiting on the slot's acquired image when `acquired` is set
    pub fn bake_frame_graph<S: QueueSubmitter + ?Sized>(
        &mut self,
        graph: &FrameGraph<'_>,
        slot: usize,
        acquired: bool,
        submitter: &S,
    ) -> VulkanResult<BakedFrame> {
        let image_available = acquired.then(|| self.image_available(slot));
        bake(graph, slot, image_available, submitter, &mut self.fences)
    }

    /// Bake `graph` for the current slot
    pub fn bake_current_frame_graph<S: QueueSubmitter + ?Sized>(
        &mut self,
        graph: &FrameGraph<'_>,
        acquired: bool,
        submitter: &S,
    ) -> VulkanResult<BakedFrame> {
        self.bake_frame_graph(graph, self.current_slot, acquired, submitter)
    }

    /// Forget outstanding fences once the device is idle
    pub fn reset_after_idle(&mut self) {
        self.fences.clear_all();
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        let Some(device) = self.device.take() else {
            return;
        };
        for semaphore in self.image_available.drain(..) {
            unsafe { device.destroy_semaphore(semaphore, None) };
        }
    }
}
