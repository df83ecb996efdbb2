//! # Loader Configuration
//!
//! What to do after a fault and how to charge fragmentation. Both parse from
//! the spellings the command line uses.

use core::fmt;
use core::str::FromStr;

/// What the controller does after the interceptor has serviced a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Stop after the first serviced fault. Measures the cost of one fault.
    SingleShot,
    /// Call the entry point again after every serviced fault until it
    /// returns. Each replay restarts the guest from its entry point.
    #[default]
    Replay,
}

/// How internal fragmentation is charged on each fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FragmentationModel {
    /// Charge the unused bytes of the page holding the segment's end, once:
    /// `page_end - (vaddr + memsz)`.
    #[default]
    TailPage,
    /// Charge `page_size - memsz` on every fault into a segment smaller than
    /// one page.
    PerFault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoaderConfig {
    pub mode: RunMode,
    pub fragmentation: FragmentationModel,
}

impl LoaderConfig {
    #[must_use]
    pub const fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub const fn with_fragmentation(mut self, fragmentation: FragmentationModel) -> Self {
        self.fragmentation = fragmentation;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} `{value}` (expected one of: {expected})")]
pub struct ParseConfigError {
    pub kind: &'static str,
    pub value: String,
    pub expected: &'static str,
}

impl RunMode {
    const NAMES: &'static str = "replay, single-shot";

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SingleShot => "single-shot",
            Self::Replay => "replay",
        }
    }
}

impl FragmentationModel {
    const NAMES: &'static str = "tail-page, per-fault";

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TailPage => "tail-page",
            Self::PerFault => "per-fault",
        }
    }
}

impl FromStr for RunMode {
    type Err = ParseConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "replay" => Ok(Self::Replay),
            "single-shot" | "single" => Ok(Self::SingleShot),
            _ => Err(ParseConfigError {
                kind: "run mode",
                value: s.to_owned(),
                expected: Self::NAMES,
            }),
        }
    }
}

impl FromStr for FragmentationModel {
    type Err = ParseConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tail-page" => Ok(Self::TailPage),
            "per-fault" => Ok(Self::PerFault),
            _ => Err(ParseConfigError {
                kind: "fragmentation model",
                value: s.to_owned(),
                expected: Self::NAMES,
            }),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for FragmentationModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
