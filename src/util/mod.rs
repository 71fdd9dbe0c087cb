pub mod blocking_queue;
pub mod int_conv;
pub mod observers;
