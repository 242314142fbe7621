//! Futex-backed state word.
//!
//! The executor sleeps on the channel's state word until the driver changes
//! it; the driver only ever wakes. On Linux the wait is a `FUTEX_WAIT` on the
//! word itself, so the shared region stays two `u32`s. Elsewhere the
//! sleeping thread parks and the waker unparks it. Waking never takes a
//! lock on any platform.
//!
//! # Usage
//!
//! ```ignore
//! // Executor: sleep until the word is no longer `IDLE`.
//! word.wait_while_eq(IDLE);
//!
//! // Driver: publish, then wake (never blocks).
//! word.compare_exchange(IDLE, REQUEST)?;
//! word.wake_all();
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// An atomic `u32` that a thread may block on until its value changes.
pub struct Futex {
    word: AtomicU32,
    #[cfg(not(target_os = "linux"))]
    parker: fallback::Parker,
}

impl Futex {
    pub fn new(value: u32) -> Self {
        Self {
            word: AtomicU32::new(value),
            #[cfg(not(target_os = "linux"))]
            parker: fallback::Parker::default(),
        }
    }

    #[inline]
    pub fn load(&self) -> u32 {
        self.word.load(Ordering::SeqCst)
    }

    /// Replace `current` with `new`, returning the observed value on failure.
    #[inline]
    pub fn compare_exchange(&self, current: u32, new: u32) -> Result<u32, u32> {
        self.word
            .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
    }

    /// Unconditionally replace the value. Returns the previous value.
    #[inline]
    pub fn swap(&self, new: u32) -> u32 {
        self.word.swap(new, Ordering::SeqCst)
    }

    /// Block the calling thread while the word still equals `expected`.
    ///
    /// Returns the first value observed that differs from `expected`.
    /// Must not be called from a thread that is forbidden to block.
    pub fn wait_while_eq(&self, expected: u32) -> u32 {
        loop {
            let current = self.load();
            if current != expected {
                return current;
            }
            self.wait_once(expected);
        }
    }

    /// Wake every thread blocked in [`wait_while_eq`](Self::wait_while_eq).
    ///
    /// Never blocks, so the polling side may call it.
    pub fn wake_all(&self) {
        #[cfg(target_os = "linux")]
        linux::wake_all(&self.word);
        #[cfg(not(target_os = "linux"))]
        self.parker.wake_all();
    }

    fn wait_once(&self, expected: u32) {
        #[cfg(target_os = "linux")]
        linux::wait(&self.word, expected);
        #[cfg(not(target_os = "linux"))]
        self.parker.wait(&self.word, expected);
    }
}

impl fmt::Debug for Futex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Futex").field(&self.load()).finish()
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::io::{self, ErrorKind};
    use std::sync::atomic::AtomicU32;

    /// One `FUTEX_WAIT`; spurious returns are handled by the caller's loop.
    pub(super) fn wait(word: &AtomicU32, expected: u32) {
        // SAFETY: `word` is a live, aligned u32 for the duration of the call
        // and a null timeout means "wait indefinitely".
        let ret = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                expected,
                std::ptr::null::<libc::timespec>(),
            )
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            // EAGAIN: the word already changed. EINTR: signal, re-check.
            if err.kind() != ErrorKind::WouldBlock && err.kind() != ErrorKind::Interrupted {
                tracing::warn!("futex wait failed: {}", err);
                std::thread::yield_now();
            }
        }
    }

    pub(super) fn wake_all(word: &AtomicU32) {
        // SAFETY: `word` is a live, aligned u32; FUTEX_WAKE never dereferences
        // anything else.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                i32::MAX,
            )
        };

        if ret < 0 {
            tracing::warn!("futex wake failed: {}", io::Error::last_os_error());
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod fallback {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::OnceLock;
    use std::thread::{self, Thread};

    /// Thread park/unpark standing in for futex wait/wake.
    ///
    /// The first thread to wait becomes the sleeper; waking only unparks it
    /// and never takes a lock.
    #[derive(Default)]
    pub(super) struct Parker {
        sleeper: OnceLock<Thread>,
    }

    impl Parker {
        pub(super) fn wait(&self, word: &AtomicU32, expected: u32) {
            let current = thread::current();
            let sleeper = self.sleeper.get_or_init(|| current.clone());

            if sleeper.id() != current.id() {
                // Not the registered sleeper: fall back to polling.
                thread::yield_now();
                return;
            }

            // An unpark issued after this load leaves a token, so park
            // returns immediately instead of missing the wake.
            if word.load(Ordering::SeqCst) == expected {
                thread::park();
            }
        }

        pub(super) fn wake_all(&self) {
            if let Some(sleeper) = self.sleeper.get() {
                sleeper.unpark();
            }
        }
    }
}
