mod image;
mod queue;
mod task;

pub use image::{
    FlipAxis, ImageOperation, ImagePayload, PayloadError, MAX_IMAGE_DIMENSION, MAX_OUTPUT_PIXELS,
};
pub use queue::QueueReference;
pub use task::{
    FailureOutcome, OwnerId, Priority, Task, TaskId, TaskStatus, IMAGE_PROCESSING,
};
