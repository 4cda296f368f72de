pub mod fixed_buffer;
pub mod reassembly;
pub mod slot_pool;
