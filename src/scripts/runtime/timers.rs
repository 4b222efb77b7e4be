use std::time::{Duration, Instant};

use slotmap::SlotMap;

use crate::scripts::{ScriptValue, TimerHandle};

#[derive(Debug)]
struct Timer {
    action: ScriptValue,
    interval: Option<Duration>,
    deadline: Instant,
    /// Insertion order, breaks ties between timers with the same deadline
    seq: u64,
}

/// Pending timers of a script
#[derive(Debug, Default)]
pub struct TimerQueue {
    timers: SlotMap<TimerHandle, Timer>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `action` to run after `delay`, then every `interval` if given
    pub fn schedule(
        &mut self,
        action: ScriptValue,
        delay: Duration,
        interval: Option<Duration>,
        now: Instant,
    ) -> TimerHandle {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.timers.insert(Timer {
            action,
            interval,
            deadline: now + delay,
            seq,
        })
    }

    /// Returns `true` if the timer was pending
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.timers.remove(handle).is_some()
    }

    pub fn clear(&mut self) {
        self.timers.clear();
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.values().map(|timer| timer.deadline).min()
    }

    /// Take the earliest timer due at `now`. Periodic timers are rescheduled, one-shot timers
    /// are removed.
    pub fn pop_due(&mut self, now: Instant) -> Option<ScriptValue> {
        let (handle, _) = self
            .timers
            .iter()
            .filter(|(_, timer)| timer.deadline <= now)
            .min_by_key(|(_, timer)| (timer.deadline, timer.seq))?;

        let timer = &mut self.timers[handle];
        match timer.interval {
            Some(interval) => {
                // Skip missed periods instead of running them in a burst
                let mut deadline = timer.deadline + interval;
                if deadline <= now {
                    deadline = now + interval;
                }

                timer.deadline = deadline;
                timer.seq = self.next_seq;
                self.next_seq += 1;

                Some(timer.action.clone())
            }
            None => self.timers.remove(handle).map(|timer| timer.action),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(id: u32) -> ScriptValue {
        ScriptValue::new(id)
    }

    fn id(action: Option<ScriptValue>) -> Option<u32> {
        action.and_then(|action| action.downcast_ref::<u32>().copied())
    }

    #[test]
    fn test_one_shot() {
        let now = Instant::now();
        let mut queue = TimerQueue::new();
        queue.schedule(action(1), Duration::from_millis(10), None, now);

        assert_eq!(queue.next_deadline(), Some(now + Duration::from_millis(10)));
        assert_eq!(id(queue.pop_due(now)), None);
        assert_eq!(id(queue.pop_due(now + Duration::from_millis(10))), Some(1));
        assert!(queue.is_empty());
        assert_eq!(queue.next_deadline(), None);
    }

    #[test]
    fn test_order() {
        let now = Instant::now();
        let mut queue = TimerQueue::new();
        queue.schedule(action(1), Duration::from_millis(20), None, now);
        queue.schedule(action(2), Duration::from_millis(10), None, now);
        queue.schedule(action(3), Duration::from_millis(10), None, now);

        let later = now + Duration::from_millis(30);
        assert_eq!(id(queue.pop_due(later)), Some(2));
        assert_eq!(id(queue.pop_due(later)), Some(3));
        assert_eq!(id(queue.pop_due(later)), Some(1));
        assert_eq!(id(queue.pop_due(later)), None);
    }

    #[test]
    fn test_periodic() {
        let now = Instant::now();
        let period = Duration::from_millis(10);
        let mut queue = TimerQueue::new();
        queue.schedule(action(1), period, Some(period), now);

        assert_eq!(id(queue.pop_due(now + period)), Some(1));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_deadline(), Some(now + 2 * period));

        // Far behind: the next run is one period from now
        let late = now + 10 * period;
        assert_eq!(id(queue.pop_due(late)), Some(1));
        assert_eq!(queue.next_deadline(), Some(late + period));
        assert_eq!(id(queue.pop_due(late)), None);
    }

    #[test]
    fn test_cancel() {
        let now = Instant::now();
        let mut queue = TimerQueue::new();
        let handle = queue.schedule(action(1), Duration::ZERO, Some(Duration::from_millis(1)), now);

        assert!(queue.cancel(handle));
        assert!(!queue.cancel(handle));
        assert_eq!(id(queue.pop_due(now + Duration::from_secs(1))), None);
    }
}
