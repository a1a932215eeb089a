pub mod bounded_buffer;
pub mod counter_ring;
pub mod token_ring;
