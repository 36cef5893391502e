pub mod bridge;

pub use bridge::{dispatch, WORKER_TASK_TIMEOUT};
