mod maps;

pub use maps::{MemoryMapping, MemoryMaps};

/// Short name of the running executable, used to name dump files.
pub fn invocation_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "heapcheck".to_string())
}

pub fn pid() -> u32 {
    nix::unistd::getpid().as_raw() as u32
}
