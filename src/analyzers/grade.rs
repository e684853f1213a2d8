use serde::{Deserialize, Serialize};
use std::fmt;

/// Letter grade attached to component and composite scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        };
        f.write_str(letter)
    }
}

/// Converts a 0–100 score into a letter grade.
///
/// | Range   | Grade |
/// |---------|-------|
/// | >= 90   | A     |
/// | >= 80   | B     |
/// | >= 70   | C     |
/// | >= 60   | D     |
/// | < 60    | F     |
pub fn grade(score: f64) -> Grade {
    match score {
        s if s >= 90.0 => Grade::A,
        s if s >= 80.0 => Grade::B,
        s if s >= 70.0 => Grade::C,
        s if s >= 60.0 => Grade::D,
        _ => Grade::F,
    }
}
