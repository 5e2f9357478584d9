use davis_types::PacketContainer;

/// Bounded producer/consumer queue of packet containers.
///
/// The queue's internal atomics order the producer's writes to a container
/// before the consumer can observe its handle, so a popped container is
/// always fully published.
pub struct Buffer {
    queue: crossbeam_queue::ArrayQueue<PacketContainer>,
}

impl Buffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: crossbeam_queue::ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Non-blocking insert. Returns the container back when the queue is
    /// full so the caller can decide whether to drop or retry it.
    pub fn put(&self, container: PacketContainer) -> Result<(), PacketContainer> {
        self.queue.push(container)
    }

    pub fn get(&self) -> Option<PacketContainer> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container_with_special(t: u32) -> PacketContainer {
        PacketContainer {
            special: Some(vec![davis_types::SpecialEvent {
                t,
                kind: davis_types::SpecialEventKind::ExternalInputPulse,
                data: 0,
            }]),
            ..Default::default()
        }
    }

    #[test]
    fn fifo_order() {
        let buffer = Buffer::new(4);
        for t in 0..3 {
            assert!(buffer.put(container_with_special(t)).is_ok());
        }
        for t in 0..3 {
            let container = buffer.get().unwrap();
            assert_eq!(container.special.unwrap()[0].t, t);
        }
        assert!(buffer.get().is_none());
    }

    #[test]
    fn full_returns_container() {
        let buffer = Buffer::new(1);
        assert!(buffer.put(container_with_special(0)).is_ok());
        let rejected = buffer.put(container_with_special(1)).unwrap_err();
        assert_eq!(rejected.special.unwrap()[0].t, 1);
        assert_eq!(buffer.len(), 1);
    }
}
