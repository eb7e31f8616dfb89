//! Call-site capture at allocation time, and symbol lookup at report time.

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub mod frame_pointer;
pub mod symbol;

/// Most frames we keep per allocation
pub const MAX_STACK_DEPTH: usize = 32;

/// Return addresses for one allocation. Filled slots come first, oldest
/// caller first; everything after them is `0`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CallFrames {
    frames: [usize; MAX_STACK_DEPTH],
    len: usize,
}

impl CallFrames {
    pub const fn new() -> Self {
        Self {
            frames: [0; MAX_STACK_DEPTH],
            len: 0,
        }
    }

    /// Build from a list of addresses, oldest caller first. Extra addresses
    /// are dropped and so are null ones.
    pub fn from_addresses(addresses: &[usize]) -> Self {
        let mut frames = Self::new();
        for &address in addresses {
            if !frames.push(address) {
                break;
            }
        }
        frames
    }

    /// Append a frame. Returns `false` if the buffer is full. Null addresses
    /// are the padding sentinel, so they are ignored.
    pub fn push(&mut self, address: usize) -> bool {
        if self.len == MAX_STACK_DEPTH {
            return false;
        }
        if address != 0 {
            self.frames[self.len] = address;
            self.len += 1;
        }
        true
    }

    /// Walkers see the innermost frame first; flip what they found so the
    /// oldest caller leads.
    pub fn reverse(&mut self) {
        self.frames[..self.len].reverse();
    }

    /// Keep only the `depth` innermost frames.
    pub fn truncate_innermost(&mut self, depth: usize) {
        if depth >= self.len {
            return;
        }
        let skip = self.len - depth;
        self.frames.copy_within(skip..self.len, 0);
        self.frames[depth..].fill(0);
        self.len = depth;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The filled slots, oldest caller first
    pub fn as_slice(&self) -> &[usize] {
        &self.frames[..self.len]
    }

    /// All slots, including the null padding
    pub fn raw(&self) -> &[usize; MAX_STACK_DEPTH] {
        &self.frames
    }
}

impl Default for CallFrames {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CallFrames {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.as_slice().iter().map(|a| format!("{a:#x}")))
            .finish()
    }
}

/// Something that can record where an allocation came from.
///
/// Implementations run in the middle of `allocate()`, so they must not call
/// back into the allocator that owns them, and should avoid allocating at
/// all.
pub trait StackCapture {
    /// Fill `frames` with return addresses, oldest caller first.
    fn capture(&self, frames: &mut CallFrames);
}

/// Records nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCapture;

impl StackCapture for NoCapture {
    fn capture(&self, _: &mut CallFrames) {}
}

/// The best walker this target has.
pub fn platform_capture() -> Box<dyn StackCapture + Send> {
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    {
        Box::new(frame_pointer::FramePointerCapture)
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        Box::new(NoCapture)
    }
}
