//! Platform-specific forced thread termination.
//!
//! The concrete implementation is selected at compile time depending on the
//! target operating system. Every implementation exposes
//! `sys_terminate(&JoinHandle<()>) -> io::Result<()>`.

#[cfg(unix)]
mod unix;

#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub(crate) use unix::sys_terminate;

#[cfg(windows)]
pub(crate) use windows::sys_terminate;

#[cfg(not(any(unix, windows)))]
pub(crate) unsafe fn sys_terminate(_handle: &std::thread::JoinHandle<()>) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "forced thread termination is not supported on this platform",
    ))
}
