//! Declarative per-frame submission plan
//!
//! A [`FrameGraph`] lists the command buffers of one frame in submission order,
//! each with the queue it runs on and the work it has to wait for. It is built
//! fresh every frame and consumed by the
//! [`Synchronizer`](super::synchronizer::Synchronizer).

use ash::vk;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::render::backends::vulkan::rendering::commands::CommandView;

/// Logical queue a submission targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Queue {
    /// Graphics queue
    Graphics,
    /// Presentation queue
    Present,
    /// Compute queue
    Compute,
}

bitflags! {
    /// How an element is ordered against the element before it
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExecutionPolicy: u32 {
        /// Wait for the previous element's completion
        const IN_ORDER = 1 << 0;
        /// No implicit wait on the previous element; the frame fences still cover it
        const PARALLEL = 1 << 1;
        /// Suppress the wait on the previous element even when `IN_ORDER` is set
        const NO_WAITING = 1 << 2;
    }
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self::IN_ORDER
    }
}

impl ExecutionPolicy {
    /// Whether this policy adds the implicit edge to the previous element
    pub fn waits_for_previous(self) -> bool {
        self.contains(Self::IN_ORDER) && !self.intersects(Self::PARALLEL | Self::NO_WAITING)
    }
}

/// Pipeline stage at which work on `queue` blocks for a dependency
pub fn wait_stage(queue: Queue, image_acquire: bool) -> vk::PipelineStageFlags {
    match (queue, image_acquire) {
        (Queue::Compute, _) => vk::PipelineStageFlags::COMPUTE_SHADER,
        (_, true) => vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        (_, false) => vk::PipelineStageFlags::ALL_COMMANDS,
    }
}

/// Something a graph element waits on
#[derive(Clone, Copy)]
pub enum Waitable<'a> {
    /// The presentable image acquired for this frame
    AcquireImage {
        /// Queue on which the wait happens
        queue: Queue,
    },
    /// Completion of a command buffer submitted earlier in the same frame
    CommandBuffer {
        /// The command buffer to wait for
        command: CommandView<'a>,
        /// Queue on which the wait happens
        queue: Queue,
    },
}

impl<'a> Waitable<'a> {
    /// Wait for the acquired image on `queue`
    pub fn acquire_image(queue: Queue) -> Self {
        Self::AcquireImage { queue }
    }

    /// Wait for `command` to complete, blocking work on `queue`
    pub fn command(command: impl Into<CommandView<'a>>, queue: Queue) -> Self {
        Self::CommandBuffer {
            command: command.into(),
            queue,
        }
    }

    /// Queue on which the wait happens
    pub fn queue(&self) -> Queue {
        match self {
            Self::AcquireImage { queue } | Self::CommandBuffer { queue, .. } => *queue,
        }
    }

    /// Pipeline stage that blocks until this dependency is satisfied
    pub fn stage(&self) -> vk::PipelineStageFlags {
        wait_stage(self.queue(), matches!(self, Self::AcquireImage { .. }))
    }
}

/// One submission in a frame graph
#[derive(Clone)]
pub struct GraphElement<'a> {
    /// Commands to submit
    pub command: CommandView<'a>,
    /// Queue to submit on
    pub queue: Queue,
    /// Explicit dependencies; all must complete before the commands start
    pub wait_on: Vec<Waitable<'a>>,
    /// Ordering against the previous element
    pub policy: ExecutionPolicy,
}

impl<'a> GraphElement<'a> {
    /// Element with no explicit dependencies and the default in-order policy
    pub fn new(command: impl Into<CommandView<'a>>, queue: Queue) -> Self {
        Self {
            command: command.into(),
            queue,
            wait_on: Vec::new(),
            policy: ExecutionPolicy::default(),
        }
    }

    /// Add a dependency
    pub fn wait_on(mut self, waitable: Waitable<'a>) -> Self {
        self.wait_on.push(waitable);
        self
    }

    /// Set the execution policy
    pub fn with_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Ordered submission plan for one frame
///
/// By convention the first element consumes the acquired image and the last
/// element's completion gates presentation.
#[derive(Clone, Default)]
pub struct FrameGraph<'a> {
    elements: Vec<GraphElement<'a>>,
}

impl<'a> FrameGraph<'a> {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an element
    pub fn push(&mut self, element: GraphElement<'a>) -> &mut Self {
        self.elements.push(element);
        self
    }

    /// Append an element, builder style
    #[must_use]
    pub fn then(mut self, element: GraphElement<'a>) -> Self {
        self.elements.push(element);
        self
    }

    /// Elements in submission order
    pub fn elements(&self) -> &[GraphElement<'a>] {
        &self.elements
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the graph has no elements
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_waits_for_previous() {
        assert!(ExecutionPolicy::default().waits_for_previous());
    }

    #[test]
    fn test_parallel_and_no_waiting_suppress_edge() {
        assert!(!ExecutionPolicy::PARALLEL.waits_for_previous());
        assert!(!(ExecutionPolicy::IN_ORDER | ExecutionPolicy::NO_WAITING).waits_for_previous());
        assert!(!(ExecutionPolicy::IN_ORDER | ExecutionPolicy::PARALLEL).waits_for_previous());
        assert!(!ExecutionPolicy::empty().waits_for_previous());
    }

    #[test]
    fn test_wait_stages() {
        assert_eq!(Waitable::acquire_image(Queue::Graphics).stage(), vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(Waitable::acquire_image(Queue::Compute).stage(), vk::PipelineStageFlags::COMPUTE_SHADER);
        assert_eq!(wait_stage(Queue::Graphics, false), vk::PipelineStageFlags::ALL_COMMANDS);
    }
}
