//! Frame pacing and queue synchronization.
//!
//! Every back-buffer slot owns a command allocator that may only be reset once
//! the GPU has finished the work recorded into it. The fence value signaled at
//! the slot's last submission is kept here, and [`FramePacer::prepare`] blocks
//! until the GPU has reached it.
//!
//! Cross-queue ordering is expressed with [`hand_off`]: the producer queue
//! signals its timeline and the consumer queue waits for that value on the GPU.
//! There is no implicit dependency tracking between queues.

use crate::error::Result;

/// The frame currently being recorded.
///
/// Passed to every per-frame allocator call instead of being kept as ambient
/// state, so the slot dependency shows up in signatures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameContext {
    pub slot: usize,
    pub number: u64,
}

impl FrameContext {
    pub fn new(slot: usize, number: u64) -> Self {
        Self { slot, number }
    }
}

/// A GPU/CPU synchronization primitive with a monotonically increasing value.
pub trait Fence {
    fn completed_value(&self) -> u64;

    /// Blocks the calling thread until the fence reaches `value`. No timeout.
    fn wait_for_value(&self, value: u64) -> Result<()>;
}

/// A hardware queue that can signal and wait on fences.
pub trait CommandQueue {
    type Fence: Fence;

    /// Enqueues a signal of `value` after all previously submitted work.
    fn signal(&self, fence: &Self::Fence, value: u64) -> Result<()>;

    /// Enqueues a GPU-side wait; later submissions on this queue start only
    /// once `fence` reaches `value`.
    fn wait(&self, fence: &Self::Fence, value: u64) -> Result<()>;
}

/// A queue paired with its fence and signal counter.
pub struct Timeline<Q: CommandQueue> {
    name: &'static str,
    queue: Q,
    fence: Q::Fence,
    last_signaled: u64,
}

impl<Q: CommandQueue> Timeline<Q> {
    pub fn new(name: &'static str, queue: Q, fence: Q::Fence) -> Self {
        Self {
            name,
            queue,
            fence,
            last_signaled: 0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn fence(&self) -> &Q::Fence {
        &self.fence
    }

    pub fn last_signaled(&self) -> u64 {
        self.last_signaled
    }

    pub fn completed_value(&self) -> u64 {
        self.fence.completed_value()
    }

    pub fn is_complete(&self, value: u64) -> bool {
        self.fence.completed_value() >= value
    }

    /// Signals the next value on the queue and returns it.
    pub fn signal(&mut self) -> Result<u64> {
        let value = self.last_signaled + 1;
        self.queue.signal(&self.fence, value)?;
        self.last_signaled = value;
        log::trace!("{} signaled {}", self.name, value);
        Ok(value)
    }

    /// Blocks the CPU until the GPU reaches `value` on this timeline.
    pub fn wait_cpu(&self, value: u64) -> Result<()> {
        debug_assert!(
            value <= self.last_signaled,
            "{} waits for {} which was never signaled (last {})",
            self.name,
            value,
            self.last_signaled
        );
        if self.fence.completed_value() < value {
            log::trace!("{} blocking until {}", self.name, value);
            self.fence.wait_for_value(value)?;
        }
        Ok(())
    }

    /// Signals and blocks until everything submitted so far has completed.
    pub fn wait_idle(&mut self) -> Result<u64> {
        let value = self.signal()?;
        self.wait_cpu(value)?;
        Ok(value)
    }

    /// Makes this queue wait on the GPU until `other` reaches `value`.
    pub fn wait_on(&self, other: &Timeline<Q>, value: u64) -> Result<()> {
        log::trace!("{} waits for {} {}", self.name, other.name, value);
        self.queue.wait(&other.fence, value)
    }
}

/// Signals `producer` and makes `consumer` wait for that value on the GPU.
///
/// Returns the value the consumer waits on.
pub fn hand_off<Q: CommandQueue>(producer: &mut Timeline<Q>, consumer: &Timeline<Q>) -> Result<u64> {
    let value = producer.signal()?;
    consumer.wait_on(producer, value)?;
    Ok(value)
}

/// Lifecycle of one back-buffer slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Recording,
    Submitted,
    Complete,
}

/// The fence value recorded at each slot's last submission.
#[derive(Debug, Clone)]
pub struct SlotFences {
    values: Vec<u64>,
}

impl SlotFences {
    pub fn new(slots: usize) -> Self {
        Self { values: vec![0; slots] }
    }

    pub fn value(&self, slot: usize) -> u64 {
        self.values[slot]
    }

    pub fn record(&mut self, slot: usize, value: u64) {
        debug_assert!(value >= self.values[slot]);
        self.values[slot] = value;
    }

    /// Blocks until the work last submitted from `slot` has completed.
    pub fn wait<Q: CommandQueue>(&self, slot: usize, timeline: &Timeline<Q>) -> Result<()> {
        timeline.wait_cpu(self.values[slot])
    }

    pub fn clear(&mut self) {
        self.values.iter_mut().for_each(|v| *v = 0);
    }
}

/// Per-slot fence bookkeeping for the graphics queue.
#[derive(Debug, Clone)]
pub struct FramePacer {
    fences: SlotFences,
    states: Vec<SlotState>,
    slot: usize,
    number: u64,
}

impl FramePacer {
    pub fn new(slot_count: usize, first_slot: usize) -> Self {
        assert!(first_slot < slot_count);
        Self {
            fences: SlotFences::new(slot_count),
            states: vec![SlotState::Idle; slot_count],
            slot: first_slot,
            number: 0,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.states.len()
    }

    pub fn context(&self) -> FrameContext {
        FrameContext::new(self.slot, self.number)
    }

    pub fn state(&self, slot: usize) -> SlotState {
        self.states[slot]
    }

    pub fn fence_value(&self, slot: usize) -> u64 {
        self.fences.value(slot)
    }

    /// Waits until the current slot's previous submission has retired and
    /// marks it as recording. The allocator may be reset afterwards.
    pub fn prepare<Q: CommandQueue>(&mut self, timeline: &Timeline<Q>) -> Result<FrameContext> {
        debug_assert_ne!(self.states[self.slot], SlotState::Recording);
        self.fences.wait(self.slot, timeline)?;
        self.states[self.slot] = SlotState::Recording;
        Ok(self.context())
    }

    /// Signals the end of the current slot's work and records the value.
    pub fn submit<Q: CommandQueue>(&mut self, timeline: &mut Timeline<Q>) -> Result<u64> {
        debug_assert_eq!(self.states[self.slot], SlotState::Recording);
        let value = timeline.signal()?;
        self.fences.record(self.slot, value);
        self.states[self.slot] = SlotState::Submitted;
        Ok(value)
    }

    /// Adopts the swap chain's next back-buffer index.
    pub fn move_to_next_frame(&mut self, next_slot: usize) {
        assert!(next_slot < self.states.len());
        self.slot = next_slot;
        self.number += 1;
    }

    /// Marks submitted slots whose work has retired as complete.
    pub fn refresh<Q: CommandQueue>(&mut self, timeline: &Timeline<Q>) {
        for (slot, state) in self.states.iter_mut().enumerate() {
            if *state == SlotState::Submitted && timeline.is_complete(self.fences.value(slot)) {
                *state = SlotState::Complete;
            }
        }
    }

    /// Blocks until the GPU has drained all work on `timeline`.
    pub fn wait_for_gpu<Q: CommandQueue>(&mut self, timeline: &mut Timeline<Q>) -> Result<()> {
        timeline.wait_idle()?;
        for state in &mut self.states {
            if *state == SlotState::Submitted {
                *state = SlotState::Complete;
            }
        }
        Ok(())
    }

    /// Restarts slot tracking after the swap chain was recreated. The GPU must
    /// be idle.
    pub fn restart(&mut self, first_slot: usize) {
        assert!(first_slot < self.states.len());
        self.fences.clear();
        self.states.iter_mut().for_each(|s| *s = SlotState::Idle);
        self.slot = first_slot;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::RenderError;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Event {
        Signal(&'static str, u64),
        Wait { queue: &'static str, fence: &'static str, value: u64 },
        CpuWait(&'static str, u64),
    }

    pub type Log = Rc<RefCell<Vec<Event>>>;

    /// A fence whose GPU side finishes work only when asked to.
    pub struct FakeFence {
        name: &'static str,
        signaled: Cell<u64>,
        completed: Cell<u64>,
        failing: Cell<bool>,
        log: Log,
    }

    impl FakeFence {
        /// Lets the GPU retire everything signaled up to `value`.
        pub fn retire(&self, value: u64) {
            let value = value.min(self.signaled.get());
            self.completed.set(self.completed.get().max(value));
        }
    }

    impl Fence for FakeFence {
        fn completed_value(&self) -> u64 {
            self.completed.get()
        }

        fn wait_for_value(&self, value: u64) -> Result<()> {
            if self.failing.get() {
                return Err(RenderError::Gpu {
                    call: "wait_for_value",
                    message: format!("{} wait failed", self.name),
                });
            }
            if value > self.signaled.get() {
                return Err(RenderError::Gpu {
                    call: "wait_for_value",
                    message: format!("{} would block forever on {}", self.name, value),
                });
            }
            self.log.borrow_mut().push(Event::CpuWait(self.name, value));
            self.retire(value);
            Ok(())
        }
    }

    pub struct FakeQueue {
        name: &'static str,
        log: Log,
    }

    impl CommandQueue for FakeQueue {
        type Fence = FakeFence;

        fn signal(&self, fence: &FakeFence, value: u64) -> Result<()> {
            fence.signaled.set(fence.signaled.get().max(value));
            self.log.borrow_mut().push(Event::Signal(self.name, value));
            Ok(())
        }

        fn wait(&self, fence: &FakeFence, value: u64) -> Result<()> {
            self.log.borrow_mut().push(Event::Wait {
                queue: self.name,
                fence: fence.name,
                value,
            });
            Ok(())
        }
    }

    pub fn timeline(name: &'static str, log: &Log) -> Timeline<FakeQueue> {
        Timeline::new(
            name,
            FakeQueue { name, log: log.clone() },
            FakeFence {
                name,
                signaled: Cell::new(0),
                completed: Cell::new(0),
                failing: Cell::new(false),
                log: log.clone(),
            },
        )
    }

    fn cpu_waits(log: &Log) -> usize {
        log.borrow().iter().filter(|e| matches!(e, Event::CpuWait(..))).count()
    }

    #[test]
    fn first_use_of_a_slot_never_blocks() {
        let log = Log::default();
        let graphics = timeline("graphics", &log);
        let mut pacer = FramePacer::new(2, 0);

        let frame = pacer.prepare(&graphics).unwrap();
        assert_eq!(frame, FrameContext::new(0, 0));
        assert_eq!(pacer.state(0), SlotState::Recording);
        assert_eq!(cpu_waits(&log), 0);
    }

    #[test]
    fn slot_reuse_waits_for_its_previous_submission() {
        let log = Log::default();
        let mut graphics = timeline("graphics", &log);
        let mut pacer = FramePacer::new(2, 0);

        pacer.prepare(&graphics).unwrap();
        let first = pacer.submit(&mut graphics).unwrap();
        pacer.move_to_next_frame(1);

        pacer.prepare(&graphics).unwrap();
        pacer.submit(&mut graphics).unwrap();
        pacer.move_to_next_frame(0);

        assert!(!graphics.is_complete(first));
        let frame = pacer.prepare(&graphics).unwrap();
        assert_eq!(frame, FrameContext::new(0, 2));
        assert!(graphics.completed_value() >= first);
        assert_eq!(log.borrow().last(), Some(&Event::CpuWait("graphics", first)));
    }

    #[test]
    fn retired_slot_is_reused_without_blocking() {
        let log = Log::default();
        let mut graphics = timeline("graphics", &log);
        let mut pacer = FramePacer::new(2, 0);

        pacer.prepare(&graphics).unwrap();
        let value = pacer.submit(&mut graphics).unwrap();
        pacer.move_to_next_frame(1);
        graphics.fence().retire(value);

        pacer.refresh(&graphics);
        assert_eq!(pacer.state(0), SlotState::Complete);

        pacer.move_to_next_frame(0);
        pacer.prepare(&graphics).unwrap();
        assert_eq!(cpu_waits(&log), 0);
    }

    #[test]
    fn allocator_is_never_reused_before_its_fence() {
        let log = Log::default();
        let mut graphics = timeline("graphics", &log);
        let mut pacer = FramePacer::new(3, 0);

        for frame in 0..20u64 {
            let slot = (frame % 3) as usize;
            let recorded = pacer.fence_value(slot);
            pacer.prepare(&graphics).unwrap();
            assert!(graphics.completed_value() >= recorded);
            pacer.submit(&mut graphics).unwrap();
            // The GPU lags one frame behind.
            graphics.fence().retire(graphics.last_signaled().saturating_sub(1));
            pacer.move_to_next_frame((slot + 1) % 3);
        }
    }

    #[test]
    fn failed_cpu_wait_keeps_the_slot_submitted() {
        let log = Log::default();
        let mut graphics = timeline("graphics", &log);
        let mut pacer = FramePacer::new(2, 0);

        pacer.prepare(&graphics).unwrap();
        pacer.submit(&mut graphics).unwrap();
        pacer.move_to_next_frame(1);
        pacer.prepare(&graphics).unwrap();
        pacer.submit(&mut graphics).unwrap();
        pacer.move_to_next_frame(0);

        graphics.fence().failing.set(true);
        let result = pacer.prepare(&graphics);
        assert!(matches!(result, Err(RenderError::Gpu { call: "wait_for_value", .. })));
        assert_eq!(pacer.state(0), SlotState::Submitted);
    }

    #[test]
    fn wait_for_gpu_drains_everything() {
        let log = Log::default();
        let mut graphics = timeline("graphics", &log);
        let mut pacer = FramePacer::new(2, 0);

        pacer.prepare(&graphics).unwrap();
        pacer.submit(&mut graphics).unwrap();
        pacer.move_to_next_frame(1);
        pacer.prepare(&graphics).unwrap();
        pacer.submit(&mut graphics).unwrap();

        pacer.wait_for_gpu(&mut graphics).unwrap();
        assert_eq!(graphics.completed_value(), graphics.last_signaled());
        assert_eq!(pacer.state(0), SlotState::Complete);
        assert_eq!(pacer.state(1), SlotState::Complete);
    }

    #[test]
    fn hand_off_orders_consumer_after_producer() {
        let log = Log::default();
        let mut graphics = timeline("graphics", &log);
        let mut compute = timeline("compute", &log);

        let g = hand_off(&mut graphics, &compute).unwrap();
        let c = hand_off(&mut compute, &graphics).unwrap();

        assert_eq!(
            *log.borrow(),
            vec![
                Event::Signal("graphics", g),
                Event::Wait { queue: "compute", fence: "graphics", value: g },
                Event::Signal("compute", c),
                Event::Wait { queue: "graphics", fence: "compute", value: c },
            ]
        );
    }

    #[test]
    fn restart_forgets_old_fence_values() {
        let log = Log::default();
        let mut graphics = timeline("graphics", &log);
        let mut pacer = FramePacer::new(2, 0);

        pacer.prepare(&graphics).unwrap();
        pacer.submit(&mut graphics).unwrap();
        pacer.wait_for_gpu(&mut graphics).unwrap();
        pacer.restart(1);

        assert_eq!(pacer.context().slot, 1);
        assert_eq!(pacer.fence_value(0), 0);
        assert_eq!(pacer.state(0), SlotState::Idle);
    }
}
