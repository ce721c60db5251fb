#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::{InstanceId, MessageId};

/// Millisecond wall-clock source, injectable for tests.
pub trait Clock: Send + Sync {
	fn now_ms(&self) -> u64;
}

/// Wall clock backed by `SystemTime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now_ms(&self) -> u64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or_default()
			.as_millis() as u64
	}
}

#[derive(Debug)]
struct State {
	last_timestamp: u64,
	sequence: u16,
}

/// Single-writer snowflake generator.
///
/// Ids are strictly increasing per instance even when the wall clock moves
/// backward: a regressed reading is clamped to `last_timestamp`, trading
/// sequence-exhaustion pressure for monotonicity. Concurrent callers are
/// serialized through the state mutex; the sequence invariant does not
/// survive two unsynchronized writers.
pub struct IdGenerator {
	instance: InstanceId,
	clock: Arc<dyn Clock>,
	state: Mutex<State>,
}

impl IdGenerator {
	pub fn new(instance: InstanceId) -> Self {
		Self::with_clock(instance, Arc::new(SystemClock))
	}

	pub fn with_clock(instance: InstanceId, clock: Arc<dyn Clock>) -> Self {
		Self {
			instance,
			clock,
			state: Mutex::new(State {
				last_timestamp: 0,
				sequence: 0,
			}),
		}
	}

	pub fn instance(&self) -> InstanceId {
		self.instance
	}

	/// Allocate the next id. Non-blocking except when a single millisecond
	/// produces more than 4096 ids, in which case it spins until the clock
	/// advances (bounded by the 1ms tick, not a sleep).
	pub fn generate(&self) -> MessageId {
		let mut state = self.state.lock();

		let mut timestamp = self.clock.now_ms();
		if timestamp < state.last_timestamp {
			timestamp = state.last_timestamp;
		}

		if timestamp == state.last_timestamp {
			state.sequence = (state.sequence + 1) & 0x0fff;
			if state.sequence == 0 {
				timestamp = self.wait_next_ms(state.last_timestamp);
			}
		} else {
			state.sequence = 0;
		}

		state.last_timestamp = timestamp;
		MessageId::from_parts(timestamp, self.instance, state.sequence)
	}

	fn wait_next_ms(&self, last_timestamp: u64) -> u64 {
		let mut timestamp = self.clock.now_ms();
		while timestamp <= last_timestamp {
			std::hint::spin_loop();
			timestamp = self.clock.now_ms();
		}
		timestamp
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicU64, Ordering};

	use super::*;

	/// Clock that replays a scripted sequence of readings, repeating the
	/// final one forever.
	struct ScriptedClock {
		readings: Vec<u64>,
		cursor: AtomicU64,
	}

	impl ScriptedClock {
		fn new(readings: Vec<u64>) -> Self {
			Self {
				readings,
				cursor: AtomicU64::new(0),
			}
		}
	}

	impl Clock for ScriptedClock {
		fn now_ms(&self) -> u64 {
			let idx = self.cursor.fetch_add(1, Ordering::Relaxed) as usize;
			let idx = idx.min(self.readings.len() - 1);
			self.readings[idx]
		}
	}

	fn generator(readings: Vec<u64>) -> IdGenerator {
		IdGenerator::with_clock(InstanceId::new(1).unwrap(), Arc::new(ScriptedClock::new(readings)))
	}

	#[test]
	fn ids_strictly_increase() {
		let generator = generator(vec![100, 100, 100, 101, 102]);
		let mut prev = generator.generate();
		for _ in 0..4 {
			let next = generator.generate();
			assert!(next > prev, "expected {next} > {prev}");
			prev = next;
		}
	}

	#[test]
	fn clock_regression_clamps_and_stays_monotonic() {
		// Clock jumps back from 200 to 150; ids must keep increasing.
		let generator = generator(vec![200, 150, 150, 150]);
		let first = generator.generate();
		let second = generator.generate();
		let third = generator.generate();
		assert!(second > first);
		assert!(third > second);
		assert_eq!(second.timestamp_ms(), 200);
		assert_eq!(third.timestamp_ms(), 200);
	}

	#[test]
	fn sequence_wrap_waits_for_next_millisecond() {
		// Enough same-ms readings to exhaust the 12-bit sequence, then the
		// clock finally advances.
		let mut readings = vec![500u64; 4100];
		readings.push(501);
		let generator = generator(readings);

		let mut last = generator.generate();
		for _ in 0..4095 {
			let next = generator.generate();
			assert!(next > last);
			last = next;
		}
		assert_eq!(last.sequence(), 4095);
		assert_eq!(last.timestamp_ms(), 500);

		// 4097th id in the same millisecond: sequence wrapped, so the
		// generator must have spun until the clock reached 501.
		let rolled = generator.generate();
		assert!(rolled > last);
		assert_eq!(rolled.timestamp_ms(), 501);
		assert_eq!(rolled.sequence(), 0);
	}

	#[test]
	fn distinct_ids_within_one_millisecond() {
		let generator = generator(vec![700; 200]);
		let mut seen = std::collections::HashSet::new();
		for _ in 0..128 {
			assert!(seen.insert(generator.generate()));
		}
	}

	#[test]
	fn system_clock_generator_produces_increasing_ids() {
		let generator = IdGenerator::new(InstanceId::new(42).unwrap());
		let mut prev = generator.generate();
		for _ in 0..10_000 {
			let next = generator.generate();
			assert!(next > prev);
			prev = next;
		}
	}
}
