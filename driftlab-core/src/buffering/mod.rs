//! Sample buffering.
//!
//! Two kinds of buffer live here:
//! - the lock-free SPSC metering ring (`ringbuf::HeapRb<f32>`) that carries
//!   raw metering values from the capture thread to the pipeline thread;
//!   `push_slice` is wait-free and safe to call from an audio callback.
//! - [`BoundedSampleBuffer`], the fixed-capacity history every detector
//!   reads through.

pub mod bounded;
pub mod chunk;

pub use bounded::BoundedSampleBuffer;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Producer half, held by the metering source.
pub type MeteringProducer = ringbuf::HeapProd<f32>;

/// Consumer half, held by the pipeline thread.
pub type MeteringConsumer = ringbuf::HeapCons<f32>;

/// Ring capacity: 2^12 = 4096 metering values ≈ 6.8 min at 10 Hz.
/// Covers any pipeline stall well beyond one rotation interval.
pub const RING_CAPACITY: usize = 1 << 12;

/// Create a matched producer/consumer pair backed by a heap-allocated ring buffer.
pub fn create_metering_ring() -> (MeteringProducer, MeteringConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}

/// Raw mono PCM from an audio callback to the thread that records it.
pub fn create_pcm_ring(capacity: usize) -> (MeteringProducer, MeteringConsumer) {
    HeapRb::<f32>::new(capacity.max(1)).split()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_round_trips_metering_values_in_order() {
        let (mut producer, mut consumer) = create_metering_ring();
        assert_eq!(producer.push_slice(&[31.0, 32.5, 40.0]), 3);

        let mut out = [0f32; 8];
        let n = consumer.pop_slice(&mut out);
        assert_eq!(&out[..n], &[31.0, 32.5, 40.0]);
        assert!(consumer.is_empty());
    }
}
