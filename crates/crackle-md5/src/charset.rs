use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
const SPECIAL: &[u8] = b"~!@#$%^&*()_+=-|[]{}`\\;:'\",<>./?";

/// Alphabet a candidate suffix is drawn from. The numeric id travels in the
/// global data record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Charset {
    Alpha,
    Digit,
    #[default]
    Alnum,
    Special,
    #[serde(rename = "all")]
    AlnumSpecial,
}

impl Charset {
    pub const ALL: [Charset; 5] = [
        Charset::Alpha,
        Charset::Digit,
        Charset::Alnum,
        Charset::Special,
        Charset::AlnumSpecial,
    ];

    pub fn id(self) -> u32 {
        match self {
            Charset::Alpha => 0,
            Charset::Digit => 1,
            Charset::Alnum => 2,
            Charset::Special => 3,
            Charset::AlnumSpecial => 4,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.id() == id)
    }

    pub fn name(self) -> &'static str {
        match self {
            Charset::Alpha => "alpha",
            Charset::Digit => "digit",
            Charset::Alnum => "alnum",
            Charset::Special => "special",
            Charset::AlnumSpecial => "all",
        }
    }

    /// Symbols in enumeration order.
    pub fn symbols(self) -> Vec<u8> {
        let parts: &[&[u8]] = match self {
            Charset::Alpha => &[LOWER, UPPER],
            Charset::Digit => &[DIGITS],
            Charset::Alnum => &[LOWER, UPPER, DIGITS],
            Charset::Special => &[SPECIAL],
            Charset::AlnumSpecial => &[LOWER, UPPER, DIGITS, SPECIAL],
        };
        parts.concat()
    }

    pub fn size(self) -> usize {
        match self {
            Charset::Alpha => 52,
            Charset::Digit => 10,
            Charset::Alnum => 62,
            Charset::Special => SPECIAL.len(),
            Charset::AlnumSpecial => 62 + SPECIAL.len(),
        }
    }

    pub fn contains(self, byte: u8) -> bool {
        self.symbols().contains(&byte)
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Charset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.name() == lower)
            .ok_or_else(|| format!("unknown charset `{s}` (expected alpha, digit, alnum, special or all)"))
    }
}
