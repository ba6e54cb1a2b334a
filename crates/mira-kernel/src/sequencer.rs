// Message identity. One owner per pipeline; ids come out strictly increasing.
use mira_common::{Message, MessageId};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SequencerError {
    #[error("message id space exhausted")]
    Exhausted,
    #[error("system clock reads before the id reference epoch")]
    ClockBeforeEpoch,
    #[error("generator returned the unassigned id")]
    Unassigned,
    #[error("generator went backwards (last {last}, next {next})")]
    OutOfOrder { last: MessageId, next: MessageId },
}

/// Source of fresh message ids.
///
/// Takes `&mut self`: a generator has exactly one owner, which is what keeps
/// id order equal to processing order.
pub trait MessageIdGenerator: Send {
    fn next_message_id(&mut self) -> Result<MessageId, SequencerError>;
}

/// Counter starting at a fixed value. Single node and tests.
#[derive(Debug, Clone)]
pub struct SequentialIdGenerator {
    next: u64,
}

impl SequentialIdGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: first.max(1),
        }
    }
}

impl Default for SequentialIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageIdGenerator for SequentialIdGenerator {
    fn next_message_id(&mut self) -> Result<MessageId, SequencerError> {
        let id = self.next;
        self.next = id.checked_add(1).ok_or(SequencerError::Exhausted)?;
        Ok(MessageId::new(id))
    }
}

// 2020-01-01T00:00:00Z.
const REFERENCE_EPOCH_MILLIS: u64 = 1_577_836_800_000;
const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_NODE_SLOT: u64 = (1 << NODE_BITS) - 1;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;
const MAX_TIMESTAMP: u64 = (1 << (64 - NODE_BITS - SEQUENCE_BITS)) - 1;

fn system_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

/// Cluster-unique ids: `millis since epoch | node slot | per-millisecond sequence`.
///
/// When the sequence for a millisecond runs out, or the wall clock steps
/// back, the generator keeps counting forward from its last id instead of
/// reusing one.
pub struct ClockIdGenerator {
    node_slot: u64,
    clock: Box<dyn FnMut() -> u64 + Send>,
    // (millis since reference epoch, sequence) of the last issued id.
    last: Option<(u64, u64)>,
}

impl ClockIdGenerator {
    pub fn new(node_slot: u16) -> Self {
        Self::with_clock(node_slot, system_millis)
    }

    /// `clock` returns milliseconds since the Unix epoch.
    pub fn with_clock(node_slot: u16, clock: impl FnMut() -> u64 + Send + 'static) -> Self {
        Self {
            node_slot: u64::from(node_slot) & MAX_NODE_SLOT,
            clock: Box::new(clock),
            last: None,
        }
    }
}

impl std::fmt::Debug for ClockIdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockIdGenerator")
            .field("node_slot", &self.node_slot)
            .field("last", &self.last)
            .finish()
    }
}

impl MessageIdGenerator for ClockIdGenerator {
    fn next_message_id(&mut self) -> Result<MessageId, SequencerError> {
        let now = (self.clock)()
            .checked_sub(REFERENCE_EPOCH_MILLIS)
            .ok_or(SequencerError::ClockBeforeEpoch)?;
        let (millis, sequence) = match self.last {
            Some((last_millis, last_sequence)) if now <= last_millis => {
                if last_sequence < MAX_SEQUENCE {
                    (last_millis, last_sequence + 1)
                } else {
                    // Borrow the next millisecond.
                    (last_millis + 1, 0)
                }
            }
            _ => (now, 0),
        };
        if millis > MAX_TIMESTAMP {
            return Err(SequencerError::Exhausted);
        }
        self.last = Some((millis, sequence));
        let id = (millis << (NODE_BITS + SEQUENCE_BITS)) | (self.node_slot << SEQUENCE_BITS) | sequence;
        Ok(MessageId::new(id))
    }
}

/// Owns the generator and stamps ids onto messages.
pub struct Sequencer {
    generator: Box<dyn MessageIdGenerator>,
    last: MessageId,
}

impl Sequencer {
    pub fn new(generator: Box<dyn MessageIdGenerator>) -> Self {
        Self {
            generator,
            last: MessageId::UNASSIGNED,
        }
    }

    /// Next id, refusing anything that would break strict ordering.
    pub fn next_id(&mut self) -> Result<MessageId, SequencerError> {
        let next = self.generator.next_message_id()?;
        if !next.is_assigned() {
            return Err(SequencerError::Unassigned);
        }
        if next <= self.last {
            return Err(SequencerError::OutOfOrder {
                last: self.last,
                next,
            });
        }
        self.last = next;
        Ok(next)
    }

    /// Write a fresh id into the metadata and every content part.
    pub fn assign_identity(&mut self, message: &mut Message) -> Result<MessageId, SequencerError> {
        let id = self.next_id()?;
        message.set_message_id(id);
        Ok(id)
    }
}

impl std::fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequencer").field("last", &self.last).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mira_common::MessageMetadata;

    struct FixedGenerator(Vec<u64>);

    impl MessageIdGenerator for FixedGenerator {
        fn next_message_id(&mut self) -> Result<MessageId, SequencerError> {
            if self.0.is_empty() {
                return Err(SequencerError::Exhausted);
            }
            Ok(MessageId::new(self.0.remove(0)))
        }
    }

    #[test]
    fn sequential_ids_start_at_one() {
        let mut generator = SequentialIdGenerator::new();
        assert_eq!(generator.next_message_id(), Ok(MessageId::new(1)));
        assert_eq!(generator.next_message_id(), Ok(MessageId::new(2)));
    }

    #[test]
    fn sequential_generator_reports_exhaustion() {
        let mut generator = SequentialIdGenerator::starting_at(u64::MAX);
        assert_eq!(generator.next_message_id(), Err(SequencerError::Exhausted));
    }

    #[test]
    fn clock_ids_are_strictly_increasing_within_one_millisecond() {
        let mut generator = ClockIdGenerator::with_clock(3, || REFERENCE_EPOCH_MILLIS + 1_000);
        let mut last = MessageId::UNASSIGNED;
        for _ in 0..10_000 {
            let id = generator.next_message_id().expect("id");
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn clock_ids_survive_a_backwards_clock() {
        let mut readings = vec![REFERENCE_EPOCH_MILLIS + 500, REFERENCE_EPOCH_MILLIS + 100].into_iter();
        let mut generator = ClockIdGenerator::with_clock(1, move || {
            readings.next().unwrap_or(REFERENCE_EPOCH_MILLIS + 100)
        });
        let first = generator.next_message_id().expect("first");
        let second = generator.next_message_id().expect("second");
        assert!(second > first);
    }

    #[test]
    fn clock_ids_encode_the_node_slot() {
        let mut a = ClockIdGenerator::with_clock(1, || REFERENCE_EPOCH_MILLIS + 42);
        let mut b = ClockIdGenerator::with_clock(2, || REFERENCE_EPOCH_MILLIS + 42);
        assert_ne!(a.next_message_id(), b.next_message_id());
    }

    #[test]
    fn clock_before_epoch_is_an_error() {
        let mut generator = ClockIdGenerator::with_clock(0, || 0);
        assert_eq!(
            generator.next_message_id(),
            Err(SequencerError::ClockBeforeEpoch)
        );
    }

    #[test]
    fn sequencer_rejects_duplicate_and_zero_ids() {
        let mut sequencer = Sequencer::new(Box::new(FixedGenerator(vec![5, 5])));
        assert_eq!(sequencer.next_id(), Ok(MessageId::new(5)));
        assert!(matches!(
            sequencer.next_id(),
            Err(SequencerError::OutOfOrder { .. })
        ));

        let mut sequencer = Sequencer::new(Box::new(FixedGenerator(vec![0])));
        assert_eq!(sequencer.next_id(), Err(SequencerError::Unassigned));
    }

    #[test]
    fn assign_identity_stamps_metadata_and_parts() {
        let mut sequencer = Sequencer::new(Box::new(SequentialIdGenerator::starting_at(100)));
        let mut message = Message::from_payload(
            MessageMetadata::queue("orders"),
            Bytes::from_static(b"0123456789"),
            4,
        );
        let id = sequencer.assign_identity(&mut message).expect("id");
        assert_eq!(id, MessageId::new(100));
        assert_eq!(message.id(), id);
        assert!(message.parts().iter().all(|part| part.message_id == id));
        message.validate().expect("valid");
    }
}
