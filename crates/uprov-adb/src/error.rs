use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum AdbError {
    #[error("adb not found (set ADB_PATH or ANDROID_SDK_ROOT)")]
    NotFound,

    #[error("adb: {0}")]
    Io(String),

    #[error("adb exited with status {status}: {detail}")]
    Exit { status: i32, detail: String },

    #[error("adb command timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected adb output: {0}")]
    Parse(String),
}
