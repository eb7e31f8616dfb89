use std::{env, str::FromStr};

use log::warn;

use crate::stack::{platform_capture, NoCapture, StackCapture, MAX_STACK_DEPTH};

pub const ENV_CAPTURE: &str = "PAGETRACE_CAPTURE";
pub const ENV_STACK_DEPTH: &str = "PAGETRACE_STACK_DEPTH";
pub const ENV_INITIAL_PAGES: &str = "PAGETRACE_INITIAL_PAGES";

/// Knobs for a [`PageAlloc`](crate::alloc::tracing::PageAlloc).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Record call frames for every allocation
    pub capture_stacks: bool,
    /// Keep at most this many innermost frames (capped at
    /// [`MAX_STACK_DEPTH`])
    pub stack_depth: usize,
    /// Pages reserved up front. At least one is always reserved.
    pub initial_pages: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture_stacks: true,
            stack_depth: MAX_STACK_DEPTH,
            initial_pages: 1,
        }
    }
}

fn parse_var<T>(name: &str, set: impl FnOnce(T))
where
    T: FromStr,
{
    let Ok(raw) = env::var(name) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => set(value),
        Err(_) => warn!("ignoring {name}={raw:?}: not a valid value"),
    }
}

impl Config {
    /// Defaults, overridden by `PAGETRACE_CAPTURE` (`0`/`1`),
    /// `PAGETRACE_STACK_DEPTH` and `PAGETRACE_INITIAL_PAGES` where set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        parse_var::<u8>(ENV_CAPTURE, |v| config.capture_stacks = v != 0);
        parse_var::<usize>(ENV_STACK_DEPTH, |v| config.stack_depth = v);
        parse_var::<usize>(ENV_INITIAL_PAGES, |v| config.initial_pages = v);
        config.normalized()
    }

    pub fn capture_stacks(mut self, capture_stacks: bool) -> Self {
        self.capture_stacks = capture_stacks;
        self
    }

    pub fn stack_depth(mut self, stack_depth: usize) -> Self {
        self.stack_depth = stack_depth;
        self.normalized()
    }

    pub fn initial_pages(mut self, initial_pages: usize) -> Self {
        self.initial_pages = initial_pages;
        self.normalized()
    }

    fn normalized(mut self) -> Self {
        self.stack_depth = self.stack_depth.min(MAX_STACK_DEPTH);
        self.initial_pages = self.initial_pages.max(1);
        self
    }

    /// The walker this configuration asks for
    pub fn stack_capture(&self) -> Box<dyn StackCapture + Send> {
        if self.capture_stacks && self.stack_depth > 0 {
            platform_capture()
        } else {
            Box::new(NoCapture)
        }
    }
}
