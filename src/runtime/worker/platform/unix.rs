use libc::pthread_cancel;

use std::io;
use std::os::unix::thread::JoinHandleExt;
use std::thread::JoinHandle;

/// Requests cancellation of the thread behind `handle` with
/// `pthread_cancel(3)`.
///
/// The thread stops at its next cancellation point; a thread spinning
/// without reaching one keeps running.
///
/// # Safety
///
/// See [`Worker::force_terminate`](crate::runtime::worker::Worker).
pub(crate) unsafe fn sys_terminate(handle: &JoinHandle<()>) -> io::Result<()> {
    let rc = unsafe { pthread_cancel(handle.as_pthread_t() as libc::pthread_t) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }

    Ok(())
}
