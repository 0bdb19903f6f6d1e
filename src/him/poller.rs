//! HIM Socket Poller: one detached thread per active subchannel, raising
//! a channel attention when data arrives (spec.md §4.9).
//!
//! Grounded on `tape/autoloader.rs`'s `spawn_waiter` -- the same
//! `std::thread::spawn` + cooperative `Arc<AtomicBool>` shutdown shape,
//! reused here for the poller's `watch_sock`/`rnr` flags (spec.md §5
//! "Background poller": "no shared mutex is needed because the poller
//! only reads primitive fields and signals an attention event").

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Spawn the poller for one HIM subchannel (spec.md §4.9). `raise_attn`
/// raises a channel attention with `ATTN` and is expected to also tally
/// the poll return code into the caller's `attn_rc` bucket.
///
/// Termination: the engine clears `watch_sock` (e.g. on RNR) to make the
/// loop exit at its next iteration; there is no forced cancellation
/// (spec.md §5 "Closing a HIM control block clears `watch_sock`").
pub fn spawn(
    fd: RawFd,
    rnr: Arc<AtomicBool>,
    watch_sock: Arc<AtomicBool>,
    attn_rc: Arc<Mutex<[u32; 4]>>,
    raise_attn: impl Fn() + Send + 'static,
) -> JoinHandle<()> {
    watch_sock.store(true, Ordering::Release);
    thread::spawn(move || loop {
        if !watch_sock.load(Ordering::Acquire) {
            return;
        }
        if rnr.load(Ordering::Acquire) {
            thread::sleep(POLL_INTERVAL);
            continue;
        }
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, POLL_INTERVAL.as_millis() as i32) {
            Ok(rc) if rc > 0 => {
                let idx = (rc as usize).min(3);
                if let Ok(mut counters) = attn_rc.lock() {
                    counters[idx] += 1;
                }
                watch_sock.store(false, Ordering::Release);
                raise_attn();
                return;
            }
            Ok(_) => thread::sleep(POLL_INTERVAL),
            Err(_) => thread::sleep(POLL_INTERVAL),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::os::unix::net::UnixStream;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn poller_raises_attention_once_data_is_readable() {
        let (a, b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let rnr = Arc::new(AtomicBool::new(false));
        let watch_sock = Arc::new(AtomicBool::new(false));
        let attn_rc = Arc::new(Mutex::new([0u32; 4]));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();

        let handle = spawn(fd, rnr, watch_sock.clone(), attn_rc.clone(), move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        use std::io::Write;
        let mut b = b;
        b.write_all(b"x").unwrap();

        handle.join().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!watch_sock.load(Ordering::Acquire));
        assert!(attn_rc.lock().unwrap().iter().sum::<u32>() >= 1);
    }

    #[test]
    fn poller_exits_when_watch_sock_cleared() {
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let rnr = Arc::new(AtomicBool::new(false));
        let watch_sock = Arc::new(AtomicBool::new(false));
        let attn_rc = Arc::new(Mutex::new([0u32; 4]));

        let handle = spawn(fd, rnr, watch_sock.clone(), attn_rc, || {});
        watch_sock.store(false, Ordering::Release);
        handle.join().unwrap();
    }
}
