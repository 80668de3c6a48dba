use windows_sys::Win32::System::Threading::TerminateThread;

use std::io;
use std::os::windows::io::AsRawHandle;
use std::thread::JoinHandle;

/// Exit code reported by a thread stopped with `TerminateThread`.
const FORCED_EXIT_CODE: u32 = 1;

/// Stops the thread behind `handle` immediately with `TerminateThread`.
///
/// # Safety
///
/// See [`Worker::force_terminate`](crate::runtime::worker::Worker).
pub(crate) unsafe fn sys_terminate(handle: &JoinHandle<()>) -> io::Result<()> {
    let ok = unsafe { TerminateThread(handle.as_raw_handle(), FORCED_EXIT_CODE) };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}
