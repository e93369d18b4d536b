//! Musical keys: parsing, Camelot wheel placement and harmonic distances.

use std::fmt;

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Camelot number indexed by root (0 = C) for major keys (the "B" ring).
const CAMELOT_MAJOR: [u8; 12] = [8, 3, 10, 5, 12, 7, 2, 9, 4, 11, 6, 1];
/// Camelot number indexed by root for minor keys (the "A" ring).
const CAMELOT_MINOR: [u8; 12] = [5, 12, 7, 2, 9, 4, 11, 6, 1, 8, 3, 10];

/// Distance assigned when either key is unknown.
pub const UNKNOWN_DISTANCE: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    /// Semitones above C (0..12).
    pub root: u8,
    pub minor: bool,
}

impl Key {
    pub const fn new(root: u8, minor: bool) -> Self {
        Self {
            root: root % 12,
            minor,
        }
    }

    /// Parse "C Major", "A Minor", "Am", "F#m", "Bb", "Ebmin", or Camelot "8A" / "11B".
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        if let Some(key) = Self::parse_camelot(s) {
            return Some(key);
        }

        let mut chars = s.chars().peekable();
        let base = match chars.next()?.to_ascii_uppercase() {
            'C' => 0u8,
            'D' => 2,
            'E' => 4,
            'F' => 5,
            'G' => 7,
            'A' => 9,
            'B' => 11,
            _ => return None,
        };
        let root = match chars.peek() {
            Some('#') | Some('♯') => {
                chars.next();
                (base + 1) % 12
            }
            Some('b') | Some('♭') => {
                chars.next();
                (base + 11) % 12
            }
            _ => base,
        };

        let mode: String = chars.collect::<String>().trim().to_lowercase();
        let minor = if mode.starts_with("maj") {
            false
        } else {
            mode.starts_with('m') || mode.contains("min")
        };
        Some(Self { root, minor })
    }

    fn parse_camelot(s: &str) -> Option<Self> {
        let upper = s.to_ascii_uppercase();
        let (last, _) = upper.char_indices().last()?;
        let (num, ring) = upper.split_at(last);
        let number: u8 = num.parse().ok()?;
        if !(1..=12).contains(&number) {
            return None;
        }
        let (table, minor) = match ring {
            "A" => (&CAMELOT_MINOR, true),
            "B" => (&CAMELOT_MAJOR, false),
            _ => return None,
        };
        let root = table.iter().position(|&n| n == number)? as u8;
        Some(Self { root, minor })
    }

    /// Relative major of a minor key, or relative minor of a major key.
    pub fn relative(&self) -> Self {
        if self.minor {
            Self::new(self.root + 3, false)
        } else {
            Self::new(self.root + 9, true)
        }
    }

    /// Camelot wheel position: number 1..=12 and ring letter (A = minor, B = major).
    pub fn camelot(&self) -> (u8, char) {
        if self.minor {
            (CAMELOT_MINOR[self.root as usize], 'A')
        } else {
            (CAMELOT_MAJOR[self.root as usize], 'B')
        }
    }

    pub fn is_compatible(&self, other: &Key) -> bool {
        self == other || self.relative() == *other
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.minor { "Minor" } else { "Major" };
        write!(f, "{} {}", NOTE_NAMES[self.root as usize], mode)
    }
}

/// Circular distance on the Camelot wheel, ignoring ring.
/// Relative keys share a number and so sit at distance 0.
/// Unparseable keys count as [`UNKNOWN_DISTANCE`].
pub fn wheel_distance(a: &str, b: &str) -> u8 {
    match (Key::parse(a), Key::parse(b)) {
        (Some(ka), Some(kb)) => {
            let (na, _) = ka.camelot();
            let (nb, _) = kb.camelot();
            let d = na.abs_diff(nb);
            d.min(12 - d)
        }
        _ => UNKNOWN_DISTANCE,
    }
}

/// Signed semitones that move `from` onto `to` by the shortest path, in -6..=6.
///
/// Same or relative keys need no shift. Across modes the target is the
/// relative key of `to`, so a minor key is matched against its relative major.
pub fn semitone_shift(from: &Key, to: &Key) -> i32 {
    if from.is_compatible(to) {
        return 0;
    }
    let target = if from.minor == to.minor {
        to.root
    } else {
        to.relative().root
    };
    let diff = (target as i32 - from.root as i32).rem_euclid(12);
    if diff > 6 { diff - 12 } else { diff }
}

/// Pitch shift that moves track B toward track A. Unknown keys give 0.
pub fn shift_toward(a_key: &str, b_key: &str) -> i32 {
    match (Key::parse(a_key), Key::parse(b_key)) {
        (Some(ka), Some(kb)) => semitone_shift(&kb, &ka),
        _ => 0,
    }
}
