pub mod common;
pub mod completions;
pub mod conflicts;
pub mod device_id;
pub mod new_id;
pub mod queue;
pub mod save;
pub mod show;
pub mod status;
pub mod sync;
