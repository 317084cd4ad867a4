//! ENet-style channels used by `spawn`/`&port <- expr`. A channel is a
//! `pipe(2)` pair plus a registry entry keyed by a handle id; sending and
//! receiving are plain 8-byte `write`/`read` of one raw `f64`, so message
//! passing survives `fork()` for free (both ends of the pipe are
//! inherited by a child exactly like any other open file descriptor).
//!
//! `expr <- => &port` (bare-arrow "send to the channel I'm inside")
//! resolves the channel implicitly rather than taking an explicit
//! handle argument, so `channel_new` pushes its id onto a process-wide
//! "current channel" stack and `channel_send_self` peeks it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

struct ChannelEnds {
    read_fd: i32,
    write_fd: i32,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static REGISTRY: Mutex<Option<HashMap<u64, ChannelEnds>>> = Mutex::new(None);
static CURRENT: Mutex<Vec<u64>> = Mutex::new(Vec::new());

fn with_registry<R>(f: impl FnOnce(&mut HashMap<u64, ChannelEnds>) -> R) -> R {
    let mut guard = REGISTRY.lock().unwrap();
    let map = guard.get_or_insert_with(HashMap::new);
    f(map)
}

/// # Safety
/// Called only by compiler-generated code at a `spawn`/channel literal
/// site.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn channel_new(_unused: f64) -> f64 {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc != 0 {
        return crate::value::error_value(crate::value::IO_ERROR);
    }
    let id = NEXT_ID.fetch_add(1, Ordering::SeqCst);
    with_registry(|reg| reg.insert(id, ChannelEnds { read_fd: fds[0], write_fd: fds[1] }));
    CURRENT.lock().unwrap().push(id);
    id as f64
}

fn write_message(write_fd: i32, value: f64) -> f64 {
    let bytes = value.to_bits().to_ne_bytes();
    let n = unsafe { libc::write(write_fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
    if n as usize != bytes.len() {
        return crate::value::error_value(crate::value::IO_ERROR);
    }
    0.0
}

fn read_message(read_fd: i32) -> f64 {
    let mut bytes = [0u8; 8];
    let mut filled = 0;
    while filled < bytes.len() {
        let n = unsafe { libc::read(read_fd, bytes[filled..].as_mut_ptr() as *mut libc::c_void, bytes.len() - filled) };
        if n <= 0 {
            return crate::value::error_value(crate::value::IO_ERROR);
        }
        filled += n as usize;
    }
    f64::from_bits(u64::from_ne_bytes(bytes))
}

/// # Safety
/// `handle` must be an id returned by [`channel_new`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn channel_send(handle: f64, value: f64) -> f64 {
    let id = handle as u64;
    let write_fd = with_registry(|reg| reg.get(&id).map(|c| c.write_fd));
    match write_fd {
        Some(fd) => write_message(fd, value),
        None => crate::value::error_value(crate::value::BAD_ARGUMENT),
    }
}

/// # Safety
/// `handle` must be an id returned by [`channel_new`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn channel_recv(handle: f64) -> f64 {
    let id = handle as u64;
    let read_fd = with_registry(|reg| reg.get(&id).map(|c| c.read_fd));
    let mut current = CURRENT.lock().unwrap();
    if current.last() == Some(&id) {
        current.pop();
    }
    drop(current);
    match read_fd {
        Some(fd) => read_message(fd),
        None => crate::value::error_value(crate::value::BAD_ARGUMENT),
    }
}

/// Sends on whichever channel this worker's enclosing `spawn` opened
/// (spec §5 "`expr <- => &port`").
///
/// # Safety
/// Called only from within a worker body started by `spawn`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn channel_send_self(value: f64) -> f64 {
    let id = match CURRENT.lock().unwrap().last().copied() {
        Some(id) => id,
        None => return crate::value::error_value(crate::value::BAD_ARGUMENT),
    };
    channel_send(id as f64, value)
}
