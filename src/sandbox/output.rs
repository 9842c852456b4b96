//! Capped capture of a snippet's stdout and stderr.
//!
//! Writers never fail and never wait on a reader: bytes past the cap are
//! counted and dropped. The buffers are shared between the worker thread
//! and the executor, which reads whatever was captured even when the run
//! timed out.

use parking_lot::Mutex;

#[derive(Debug)]
struct StreamBuffer {
    cap: usize,
    data: Vec<u8>,
    total: u64,
    truncated: bool,
}

impl StreamBuffer {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            data: Vec::new(),
            total: 0,
            truncated: false,
        }
    }

    fn write(&mut self, bytes: &[u8]) {
        self.total += bytes.len() as u64;
        let room = self.cap.saturating_sub(self.data.len());
        if bytes.len() > room {
            self.truncated = true;
        }
        self.data.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    fn snapshot(&self) -> StreamSnapshot {
        StreamSnapshot {
            text: String::from_utf8_lossy(&self.data).into_owned(),
            total_bytes: self.total,
            truncated: self.truncated,
        }
    }
}

/// What one stream captured.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamSnapshot {
    /// Retained prefix, decoded leniently (a cut may split a UTF-8 sequence).
    pub text: String,
    /// Everything the snippet attempted to write, kept or not.
    pub total_bytes: u64,
    pub truncated: bool,
}

#[derive(Debug)]
pub struct OutputCapture {
    stdout: Mutex<StreamBuffer>,
    stderr: Mutex<StreamBuffer>,
}

impl OutputCapture {
    /// `cap` applies to each stream separately.
    pub fn new(cap: usize) -> Self {
        Self {
            stdout: Mutex::new(StreamBuffer::new(cap)),
            stderr: Mutex::new(StreamBuffer::new(cap)),
        }
    }

    pub fn write_stdout(&self, text: &str) {
        self.stdout.lock().write(text.as_bytes());
    }

    pub fn write_stderr(&self, text: &str) {
        self.stderr.lock().write(text.as_bytes());
    }

    pub fn stdout(&self) -> StreamSnapshot {
        self.stdout.lock().snapshot()
    }

    pub fn stderr(&self) -> StreamSnapshot {
        self.stderr.lock().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_under_cap_keeps_everything() {
        let capture = OutputCapture::new(16);
        capture.write_stdout("hello\n");
        let out = capture.stdout();
        assert_eq!(out.text, "hello\n");
        assert_eq!(out.total_bytes, 6);
        assert!(!out.truncated);
    }

    #[test]
    fn test_exactly_at_cap_is_not_truncated() {
        let capture = OutputCapture::new(4);
        capture.write_stdout("ab");
        capture.write_stdout("cd");
        let out = capture.stdout();
        assert_eq!(out.text, "abcd");
        assert!(!out.truncated);
    }

    #[test]
    fn test_keeps_first_bytes_and_counts_the_rest() {
        let capture = OutputCapture::new(5);
        capture.write_stdout("abc");
        capture.write_stdout("defgh");
        capture.write_stdout("ijk");
        let out = capture.stdout();
        assert_eq!(out.text, "abcde");
        assert_eq!(out.total_bytes, 11);
        assert!(out.truncated);
    }

    #[test]
    fn test_streams_are_independent() {
        let capture = OutputCapture::new(3);
        capture.write_stdout("abcdef");
        capture.write_stderr("x");
        assert!(capture.stdout().truncated);
        let err = capture.stderr();
        assert_eq!(err.text, "x");
        assert!(!err.truncated);
    }

    #[test]
    fn test_split_multibyte_is_decoded_lossily() {
        let capture = OutputCapture::new(1);
        capture.write_stdout("é");
        let out = capture.stdout();
        assert_eq!(out.text, "\u{FFFD}");
        assert_eq!(out.total_bytes, 2);
    }

    #[test]
    fn test_zero_cap() {
        let capture = OutputCapture::new(0);
        capture.write_stdout("x");
        let out = capture.stdout();
        assert!(out.text.is_empty());
        assert!(out.truncated);
    }

    #[test]
    fn test_concurrent_writers() {
        let capture = std::sync::Arc::new(OutputCapture::new(1 << 20));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let capture = capture.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        capture.write_stdout("0123456789");
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(capture.stdout().total_bytes, 4000);
    }
}
