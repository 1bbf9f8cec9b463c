pub mod fs_atomic;
pub mod logging;
pub mod time;

pub use fs_atomic::atomic_write_file;
pub use logging::{append_engine_log_line, engine_log_path};
pub use time::now_secs;
