pub mod block;
pub mod offset;
