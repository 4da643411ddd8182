//! C4 — Reservation & Wait Registry.
//!
//! `reserved` and `queues` share one `Mutex`; the blocking `wait` itself
//! never holds that lock — it clones an `Arc<ControllerQueue>` under the
//! lock and then polls the queue's own, separate `Mutex` with a short inner
//! timeout, per spec.md §5 ("no suspension may be held with the reservation
//! lock acquired").

use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mavlink::ardupilotmega::MavMessage;

pub type ControllerId = u64;

/// A queued frame tagged with the `source_system` it arrived from, so
/// `wait` can apply spec.md §4.4's `(source_system, command_code)`
/// predicate instead of matching on type name alone.
type QueueItem = (&'static str, u8, MavMessage);

/// One mailbox per controller id, created lazily. Bounded per
/// `LinkConfig::controller_queue_bound`; a full queue silently drops the
/// newest frame (see spec.md §4.3) rather than blocking the router.
pub struct ControllerQueue {
    sender: SyncSender<QueueItem>,
    receiver: Mutex<Receiver<QueueItem>>,
}

impl ControllerQueue {
    fn new(bound: usize) -> Arc<Self> {
        let (sender, receiver) = sync_channel(bound.max(1));
        Arc::new(Self {
            sender,
            receiver: Mutex::new(receiver),
        })
    }

    /// Called by the router; never blocks.
    pub fn try_put(&self, type_name: &'static str, system_id: u8, frame: MavMessage) {
        let _ = self.sender.try_send((type_name, system_id, frame));
    }
}

pub struct ReservationRegistry {
    inner: Mutex<Inner>,
    queue_bound: usize,
}

struct Inner {
    reserved: HashSet<&'static str>,
    queues: HashMap<ControllerId, Arc<ControllerQueue>>,
}

impl ReservationRegistry {
    pub fn new(queue_bound: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                reserved: HashSet::new(),
                queues: HashMap::new(),
            }),
            queue_bound,
        }
    }

    /// If `type_name` is already reserved, returns `false`. Otherwise claims
    /// it and ensures `controller_id` has a queue.
    pub fn reserve(&self, type_name: &'static str, controller_id: ControllerId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.reserved.contains(type_name) {
            return false;
        }
        inner.reserved.insert(type_name);
        inner
            .queues
            .entry(controller_id)
            .or_insert_with(|| ControllerQueue::new(self.queue_bound));
        true
    }

    /// Unclaims `type_name` and replaces the controller's queue with a fresh
    /// one, discarding anything left in it (spec.md §4.4: "acceptable
    /// because reservations are always released at the end of the command").
    pub fn release(&self, type_name: &'static str, controller_id: ControllerId) {
        let mut inner = self.inner.lock().unwrap();
        inner.reserved.remove(type_name);
        inner
            .queues
            .insert(controller_id, ControllerQueue::new(self.queue_bound));
    }

    /// Returns `true` if the router should fan `type_name` out to reserved
    /// controller queues this cycle.
    pub fn is_reserved(&self, type_name: &str) -> bool {
        self.inner.lock().unwrap().reserved.contains(type_name)
    }

    /// Delivers `frame` (tagged with its `source_system`) to every
    /// controller's queue (full fan-out, per spec.md §4.3 — "in practice
    /// there is one controller at a time").
    pub fn dispatch(&self, type_name: &'static str, system_id: u8, frame: &MavMessage) {
        let inner = self.inner.lock().unwrap();
        for queue in inner.queues.values() {
            queue.try_put(type_name, system_id, frame.clone());
        }
    }

    fn queue_for(&self, controller_id: ControllerId) -> Arc<ControllerQueue> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .queues
            .entry(controller_id)
            .or_insert_with(|| ControllerQueue::new(self.queue_bound))
            .clone()
    }

    /// Polls `controller_id`'s queue for a frame of `type_name` from
    /// `expected_system_id` satisfying `predicate`, for up to `timeout`.
    /// Inner pop timeout is capped at 100ms so the overall budget is still
    /// honored even if a burst of non-matching frames keeps arriving.
    ///
    /// Implements spec.md §4.4's canonical COMMAND_ACK filter: `frame.type
    /// == type_name AND frame.source_system == expected_system_id AND
    /// predicate(frame)` (the predicate supplies the command-code check).
    pub fn wait(
        &self,
        type_name: &'static str,
        controller_id: ControllerId,
        timeout: Duration,
        expected_system_id: u8,
        predicate: impl Fn(&MavMessage) -> bool,
    ) -> Option<MavMessage> {
        let queue = self.queue_for(controller_id);
        let deadline = Instant::now() + timeout;
        let inner_poll = Duration::from_millis(100);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let tick = remaining.min(inner_poll);

            let received = {
                let receiver = queue.receiver.lock().unwrap();
                receiver.recv_timeout(tick)
            };

            match received {
                Ok((name, system_id, frame)) => {
                    if name == type_name && system_id == expected_system_id && predicate(&frame) {
                        return Some(frame);
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavlink::ardupilotmega::COMMAND_ACK_DATA;
    use num_traits::FromPrimitive;

    fn ack(command: u32, result: u32) -> MavMessage {
        MavMessage::COMMAND_ACK(COMMAND_ACK_DATA {
            command: mavlink::ardupilotmega::MavCmd::from_u32(command).unwrap(),
            result: mavlink::ardupilotmega::MavResult::from_u32(result).unwrap(),
            ..Default::default()
        })
    }

    #[test]
    fn second_reserve_of_same_type_fails_until_released() {
        let reg = ReservationRegistry::new(8);
        assert!(reg.reserve("COMMAND_ACK", 1));
        assert!(!reg.reserve("COMMAND_ACK", 2));
        reg.release("COMMAND_ACK", 1);
        assert!(reg.reserve("COMMAND_ACK", 2));
    }

    #[test]
    fn reserve_release_reserve_succeeds_both_times() {
        let reg = ReservationRegistry::new(8);
        assert!(reg.reserve("COMMAND_ACK", 1));
        reg.release("COMMAND_ACK", 1);
        assert!(reg.reserve("COMMAND_ACK", 1));
    }

    #[test]
    fn wait_times_out_with_no_matching_frame() {
        let reg = ReservationRegistry::new(8);
        reg.reserve("COMMAND_ACK", 1);
        let got = reg.wait("COMMAND_ACK", 1, Duration::from_millis(150), 1, |_| true);
        assert!(got.is_none());
    }

    #[test]
    fn wait_filters_by_predicate_and_type() {
        let reg = ReservationRegistry::new(8);
        reg.reserve("COMMAND_ACK", 1);
        reg.dispatch("VFR_HUD", 1, &ack(400, 0));
        reg.dispatch("COMMAND_ACK", 1, &ack(400, 4));
        reg.dispatch("COMMAND_ACK", 1, &ack(400, 0));

        let got = reg.wait("COMMAND_ACK", 1, Duration::from_millis(500), 1, |frame| {
            matches!(frame, MavMessage::COMMAND_ACK(d) if d.result as u32 == 0)
        });
        assert!(got.is_some());
    }

    #[test]
    fn wait_rejects_ack_from_the_wrong_system_id() {
        let reg = ReservationRegistry::new(8);
        reg.reserve("COMMAND_ACK", 1);
        // Vehicle 2's ACK matches type and command but not the expected
        // system id (1); vehicle 1's matching ACK arrives after.
        reg.dispatch("COMMAND_ACK", 2, &ack(400, 0));

        let got = reg.wait("COMMAND_ACK", 1, Duration::from_millis(150), 1, |_| true);
        assert!(got.is_none());
    }

    #[test]
    fn release_discards_queued_frames() {
        let reg = ReservationRegistry::new(8);
        reg.reserve("COMMAND_ACK", 1);
        reg.dispatch("COMMAND_ACK", 1, &ack(400, 0));
        reg.release("COMMAND_ACK", 1);
        reg.reserve("COMMAND_ACK", 1);
        let got = reg.wait("COMMAND_ACK", 1, Duration::from_millis(150), 1, |_| true);
        assert!(got.is_none());
    }
}
