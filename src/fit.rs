//! Fit modes, and the candidate selection shared by the list-scanning
//! strategies.

/// Policy for choosing among several free blocks that can hold a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FitMode {
    /// Take the first block that fits, in the strategy's natural scan order.
    #[default]
    FirstFit,
    /// Take the block leaving the least space over.
    BestFit,
    /// Take the block leaving the most space over.
    WorstFit,
}

impl FitMode {
    /// Encode for storage in the arena header.
    pub(crate) fn to_word(self) -> usize {
        match self {
            FitMode::FirstFit => 0,
            FitMode::BestFit => 1,
            FitMode::WorstFit => 2,
        }
    }

    /// Decode from the arena header. Unknown values fall back to first fit,
    /// but the header is only ever written through `to_word`.
    pub(crate) fn from_word(word: usize) -> Self {
        match word {
            1 => FitMode::BestFit,
            2 => FitMode::WorstFit,
            _ => FitMode::FirstFit,
        }
    }
}

/// Tracks the preferred candidate while a strategy walks its free space.
///
/// `C` is whatever the strategy needs to act on the chosen block later
/// (typically its offset and the offset of its predecessor).
pub(crate) struct FitSelector<C> {
    mode: FitMode,
    needed: usize,
    chosen: Option<(C, usize)>,
}

impl<C> FitSelector<C> {
    pub fn new(mode: FitMode, needed: usize) -> Self {
        FitSelector {
            mode,
            needed,
            chosen: None,
        }
    }

    /// Consider a free region of `size` bytes.
    ///
    /// Returns `true` once the scan can stop, i.e. first fit found a match.
    pub fn offer(&mut self, candidate: C, size: usize) -> bool {
        if size < self.needed {
            return false;
        }

        let better = match (&self.chosen, self.mode) {
            (None, _) => true,
            (Some(_), FitMode::FirstFit) => false,
            (Some((_, current)), FitMode::BestFit) => size < *current,
            (Some((_, current)), FitMode::WorstFit) => size > *current,
        };
        if better {
            self.chosen = Some((candidate, size));
        }

        self.is_done()
    }

    /// Whether further candidates can no longer change the outcome.
    pub fn is_done(&self) -> bool {
        self.mode == FitMode::FirstFit && self.chosen.is_some()
    }

    /// The chosen candidate and its size, if any region was large enough.
    pub fn finish(self) -> Option<(C, usize)> {
        self.chosen
    }
}
