//! Fixed-capacity sample window.

/// Circular buffer holding the most recent `capacity` mono samples.
///
/// `push` is the only mutator. Samples always leave in the order they were
/// pushed; once full, each push evicts the oldest samples first.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    buf: Vec<f32>,
    head: usize, // next write position
    len: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be greater than 0");
        Self {
            buf: vec![0.0; capacity],
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.buf.len()
    }

    pub fn push(&mut self, samples: &[f32]) {
        let cap = self.buf.len();
        // Only the newest `cap` samples can survive this push.
        let samples = &samples[samples.len().saturating_sub(cap)..];

        let first = (cap - self.head).min(samples.len());
        self.buf[self.head..self.head + first].copy_from_slice(&samples[..first]);
        let rest = samples.len() - first;
        self.buf[..rest].copy_from_slice(&samples[first..]);

        self.head = (self.head + samples.len()) % cap;
        self.len = (self.len + samples.len()).min(cap);
    }

    /// The current window as two chronological slices (older part first).
    pub fn as_slices(&self) -> (&[f32], &[f32]) {
        let cap = self.buf.len();
        let start = (self.head + cap - self.len) % cap;

        if start + self.len <= cap {
            (&self.buf[start..start + self.len], &[])
        } else {
            (&self.buf[start..], &self.buf[..self.len - (cap - start)])
        }
    }

    /// Contiguous copy of the current window, oldest sample first.
    pub fn snapshot(&self) -> Vec<f32> {
        let (older, newer) = self.as_slices();
        let mut out = Vec::with_capacity(self.len);
        out.extend_from_slice(older);
        out.extend_from_slice(newer);
        out
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }
}
