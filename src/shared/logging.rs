use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn engine_log_path(data_dir: &Path) -> PathBuf {
    data_dir.join("logs/shop.log")
}

pub fn append_engine_log_line(data_dir: &Path, line: &str) -> std::io::Result<()> {
    let path = engine_log_path(data_dir);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    writeln!(file, "{line}")
}
