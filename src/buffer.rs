use std::marker::PhantomData;
use std::ptr::NonNull;

/// Native sample type. Chosen at build time, never mixed within one build.
#[cfg(not(feature = "double-samples"))]
pub type Sample = f32;
#[cfg(feature = "double-samples")]
pub type Sample = f64;

/// Python `struct` format code matching [`Sample`].
#[cfg(not(feature = "double-samples"))]
pub const SAMPLE_FORMAT: &str = "f";
#[cfg(feature = "double-samples")]
pub const SAMPLE_FORMAT: &str = "d";

/// A non-owning view over interleaved sample memory (`frames × channels`).
///
/// The memory belongs to the audio driver and is only guaranteed to be
/// valid for the duration of one callback; the lifetime `'a` stands for that
/// window. The buffer never allocates or frees the region it points to.
pub struct AudioBuffer<'a> {
    ptr: NonNull<Sample>,
    frames: usize,
    channels: usize,
    _marker: PhantomData<&'a mut [Sample]>,
}

// The region is exclusively borrowed for 'a.
unsafe impl Send for AudioBuffer<'_> {}

impl<'a> AudioBuffer<'a> {
    /// Wrap a raw driver buffer.
    ///
    /// Returns `None` if `frames × channels` overflows, or if `ptr` is null
    /// while the buffer is not empty. A null pointer with zero length gives
    /// an empty buffer.
    ///
    /// # Safety
    ///
    /// For `'a`, `ptr` must point to `frames × channels` initialized samples
    /// that nothing else reads or writes while the buffer is alive.
    pub unsafe fn from_raw_parts(ptr: *mut Sample, frames: usize, channels: usize) -> Option<Self> {
        let len = frames.checked_mul(channels)?;
        len.checked_mul(std::mem::size_of::<Sample>())
            .filter(|bytes| *bytes <= isize::MAX as usize)?;
        let ptr = match NonNull::new(ptr) {
            Some(ptr) => ptr,
            None if len == 0 => NonNull::dangling(),
            None => return None,
        };
        Some(AudioBuffer {
            ptr,
            frames,
            channels,
            _marker: PhantomData,
        })
    }

    /// Borrow owned storage as an audio buffer. Trailing samples that do not
    /// make up a whole frame are left out.
    pub fn from_slice(samples: &'a mut [Sample], channels: usize) -> Self {
        let frames = if channels == 0 { 0 } else { samples.len() / channels };
        AudioBuffer {
            ptr: NonNull::from(samples).cast(),
            frames,
            channels,
            _marker: PhantomData,
        }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Number of samples, `frames × channels`.
    pub fn len(&self) -> usize {
        self.frames * self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_len(&self) -> usize {
        self.len() * std::mem::size_of::<Sample>()
    }

    pub fn as_ptr(&self) -> *const Sample {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut Sample {
        self.ptr.as_ptr()
    }

    pub fn as_slice(&self) -> &[Sample] {
        // SAFETY: guaranteed by the constructors.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [Sample] {
        // SAFETY: guaranteed by the constructors; `&mut self` is unique.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len()) }
    }

    /// Samples of one interleaved frame.
    pub fn frame(&self, index: usize) -> Option<&[Sample]> {
        if index >= self.frames {
            return None;
        }
        let start = index * self.channels;
        Some(&self.as_slice()[start..start + self.channels])
    }

    pub fn frames_iter(&self) -> impl Iterator<Item = &[Sample]> {
        self.as_slice().chunks_exact(self.channels.max(1))
    }

    pub fn fill(&mut self, value: Sample) {
        self.as_mut_slice().fill(value);
    }
}

impl std::fmt::Debug for AudioBuffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioBuffer")
            .field("ptr", &self.ptr)
            .field("frames", &self.frames)
            .field("channels", &self.channels)
            .finish()
    }
}
